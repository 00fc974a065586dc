//! Daemon wiring: configuration, filesystem preflight, the default
//! process-lifecycle subscription, and container enrichment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argus_core::{
    event::{field_data, FieldDatum},
    process_tracker::TrackerListener,
    Event, Header, Payload, ProcessTrackerHandle, SensorConfig,
};
use docker_client::DockerClient;
use perf_common::{tracefs, EventSpec, FieldValue, Sample, Subscription};
use tokio::sync::{mpsc, watch};

/// Command-line overrides applied on top of the environment config.
#[derive(Debug, Default)]
pub struct SensorArgs {
    pub cgroups: Vec<String>,
    pub ring_pages: Option<usize>,
    pub no_docker: bool,
}

/// What a tracepoint handler forwards off the ring-reader thread. The
/// handlers must not block, so they only copy the fields the printer
/// needs and hand off through a bounded channel.
struct RawEvent {
    kind: ProbeKind,
    pid: i32,
    cpu: Option<u32>,
    timestamp: u64,
    fields: HashMap<String, FieldValue>,
}

#[derive(Debug, Clone, Copy)]
enum ProbeKind {
    Fork,
    Exec,
    Exit,
}

pub async fn run(args: SensorArgs) -> Result<()> {
    let mut config = SensorConfig::from_env().context("reading sensor configuration")?;
    if !args.cgroups.is_empty() {
        config.cgroup_names = args.cgroups.clone();
    }
    if let Some(ring_pages) = args.ring_pages {
        config.ring_buffer_pages = ring_pages;
    }
    log::info!("argus sensor starting on {}", config.node_name);

    tracefs::check_or_mount_tracing(config.dont_mount_tracing)
        .context("locating the tracing filesystem")?;
    if !config.cgroup_names.is_empty() {
        tracefs::check_or_mount_perf_event_cgroup(config.dont_mount_perf_event)
            .context("locating the perf_event cgroup hierarchy")?;
    }

    let tracker = ProcessTrackerHandle::load_procfs(config.process_info_cache_size)
        .unwrap_or_else(|err| {
            log::warn!("procfs preload failed ({err}), starting with an empty process table");
            ProcessTrackerHandle::new(config.process_info_cache_size)
        });

    let subscription = Arc::new(
        Subscription::new(
            config.subscription_options(),
            vec![Box::new(TrackerListener(tracker.clone()))],
        )
        .context("building the perf subscription")?,
    );

    let (tx_events, rx_events) = mpsc::channel(config.channel_buffer_length);
    for (kind, name) in [
        (ProbeKind::Fork, "sched_process_fork"),
        (ProbeKind::Exec, "sched_process_exec"),
        (ProbeKind::Exit, "sched_process_exit"),
    ] {
        let tx = tx_events.clone();
        subscription
            .register(
                EventSpec::Tracepoint {
                    subsystem: "sched".to_string(),
                    name: name.to_string(),
                },
                Box::new(move |sample: &Sample| {
                    let raw = RawEvent {
                        kind,
                        pid: sample.pid.unwrap_or(0) as i32,
                        cpu: sample.cpu,
                        timestamp: sample.time.unwrap_or(0),
                        fields: sample.fields.clone(),
                    };
                    // A full channel means the consumer is behind; drop
                    // rather than stall the ring reader.
                    if tx.try_send(raw).is_err() {
                        log::debug!("event channel full, dropping sample");
                    }
                }),
            )
            .with_context(|| format!("registering sched/{name}"))?;
    }
    drop(tx_events);

    let docker = if args.no_docker {
        None
    } else {
        match DockerClient::unix(config.docker_socket.clone()) {
            Ok(client) => Some(client),
            Err(err) => {
                log::warn!("container enrichment disabled: {err}");
                None
            }
        }
    };
    if let Some(client) = docker.clone() {
        let buffer = config.channel_buffer_length;
        tokio::spawn(async move { follow_container_events(client, buffer).await });
    }

    let printer = tokio::spawn(print_events(rx_events, tracker, docker));

    let (tx_shutdown, rx_shutdown) = watch::channel(());
    let stats_sub = Arc::clone(&subscription);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        tick.tick().await;
        loop {
            tick.tick().await;
            let stats = stats_sub.stats();
            log::debug!(
                "stats: dispatched={} lost={} corrupt={} unattributed={}",
                stats.samples_dispatched,
                stats.samples_lost,
                stats.samples_corrupt,
                stats.samples_unattributed,
            );
        }
    });

    let runner = {
        let subscription = Arc::clone(&subscription);
        tokio::spawn(async move { subscription.run(rx_shutdown).await })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    log::info!("shutting down");
    let _ = tx_shutdown.send(());
    runner.await.context("joining the reader runner")??;
    subscription.close();
    printer.abort();

    let stats = subscription.stats();
    log::info!(
        "final stats: dispatched={} lost={} corrupt={} unattributed={}",
        stats.samples_dispatched,
        stats.samples_lost,
        stats.samples_corrupt,
        stats.samples_unattributed,
    );
    Ok(())
}

/// Consumes raw events, attributes them to processes and containers, and
/// prints them.
async fn print_events(
    mut rx: mpsc::Receiver<RawEvent>,
    tracker: ProcessTrackerHandle,
    docker: Option<DockerClient>,
) {
    let mut image_cache: HashMap<String, String> = HashMap::new();
    while let Some(raw) = rx.recv().await {
        let (comm, ppid, container_id) = match tracker.get(raw.pid, raw.timestamp).await {
            Ok(info) => (info.comm, info.ppid, info.container_id),
            Err(_) => (String::new(), 0, None),
        };

        if let (Some(id), Some(client)) = (&container_id, &docker) {
            if !image_cache.contains_key(id) {
                let image = match client.inspect_container(id).await {
                    Ok(info) => info.config.image,
                    Err(err) => {
                        log::debug!("inspecting container {id}: {err}");
                        String::new()
                    }
                };
                if !image.is_empty() {
                    log::info!("container {} runs image {image}", &id[..12.min(id.len())]);
                }
                image_cache.insert(id.clone(), image);
            }
        }

        let payload = payload_for(&raw);
        let event = Event::new(
            Header {
                pid: raw.pid,
                parent_pid: ppid,
                comm,
                container_id,
                cpu: raw.cpu,
                timestamp: raw.timestamp,
            },
            payload,
        );
        println!("{event}");
    }
}

fn payload_for(raw: &RawEvent) -> Payload {
    let signed = |name: &str| match raw.fields.get(name) {
        Some(FieldValue::Signed(v)) => Some(*v as i32),
        _ => None,
    };
    let text = |name: &str| match raw.fields.get(name) {
        Some(FieldValue::Str(v)) => Some(v.clone()),
        _ => None,
    };

    match raw.kind {
        ProbeKind::Fork => match signed("child_pid") {
            Some(child_pid) => Payload::ProcessFork { child_pid },
            None => fallback_payload("sched/sched_process_fork", raw),
        },
        ProbeKind::Exec => match text("filename") {
            Some(filename) => Payload::ProcessExec { filename },
            None => fallback_payload("sched/sched_process_exec", raw),
        },
        ProbeKind::Exit => Payload::ProcessExit,
    }
}

fn fallback_payload(name: &str, raw: &RawEvent) -> Payload {
    Payload::Tracepoint {
        name: name.to_string(),
        fields: field_data(raw.fields.iter()),
    }
}

/// Logs container lifecycle transitions from the engine's event stream.
async fn follow_container_events(client: DockerClient, buffer: usize) {
    let mut stream = match client.events(buffer).await {
        Ok(stream) => stream,
        Err(err) => {
            log::warn!("container event stream unavailable: {err}");
            return;
        }
    };
    while let Some(event) = stream.next().await {
        if event.kind == "container" {
            log::info!(
                "container {} {}",
                &event.actor.id[..12.min(event.actor.id.len())],
                event.action,
            );
        }
    }
    log::debug!("container event stream ended");
}
