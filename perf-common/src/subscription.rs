//! The public façade over the perf core.
//!
//! A [`Subscription`] compiles a set of desired event sources into per-CPU
//! group registrations, owns the lookup tables that attribute samples back
//! to handlers, and drives one ring reader per CPU until cancelled.

use std::{
    collections::HashMap,
    os::unix::io::RawFd,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use nix::poll::{poll, PollFd, PollFlags};
use tokio::sync::watch;

use crate::{
    attr::{
        AttrFlags, EventAttr, SampleFormat, Sampling, Wakeup, PERF_TYPE_BREAKPOINT,
        PERF_TYPE_HARDWARE, PERF_TYPE_SOFTWARE, PERF_TYPE_TRACEPOINT,
    },
    demux::{CounterSnapshot, EventState, Handler, ProcessListener, RegisteredEvent, SampleDemux},
    group::{GroupLeader, MonitorTarget, PerfGroupManager},
    maps::SnapshotMap,
    sys::{online_cpus, KernelBackend, PerfBackend, PerfError},
    tracefs::{TraceFormat, TraceFormatCache},
};

pub const RING_PAGES_DEFAULT: usize = 8;

/// An event source to subscribe to.
#[derive(Debug, Clone)]
pub enum EventSpec {
    Tracepoint {
        subsystem: String,
        name: String,
    },
    Kprobe {
        name: String,
        symbol: String,
        on_return: bool,
    },
    Uprobe {
        name: String,
        path: String,
        offset: u64,
        on_return: bool,
    },
    Hardware {
        config: u64,
        period: u64,
    },
    Software {
        config: u64,
        period: u64,
    },
    Breakpoint {
        bp_type: u32,
        addr: u64,
        len: u64,
    },
}

impl EventSpec {
    fn label(&self) -> String {
        match self {
            EventSpec::Tracepoint { subsystem, name } => format!("{subsystem}/{name}"),
            EventSpec::Kprobe { name, symbol, .. } => format!("kprobe:{name}@{symbol}"),
            EventSpec::Uprobe { name, path, .. } => format!("uprobe:{name}@{path}"),
            EventSpec::Hardware { config, .. } => format!("hardware:{config}"),
            EventSpec::Software { config, .. } => format!("software:{config}"),
            EventSpec::Breakpoint { addr, .. } => format!("breakpoint:{addr:#x}"),
        }
    }
}

/// Subscription-wide settings, handed in by the daemon at startup.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Data pages per ring buffer; must be a power of two.
    pub ring_pages: usize,
    /// Cgroup names to scope monitoring to. Empty, `""` or `"/"` entries
    /// mean the whole system.
    pub cgroups: Vec<String>,
    /// Override the CPU set (tests); defaults to every online CPU.
    pub cpus: Option<Vec<i32>>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            ring_pages: RING_PAGES_DEFAULT,
            cgroups: Vec::new(),
            cpus: None,
        }
    }
}

/// Handle returned by [`Subscription::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

enum Probe {
    Kprobe(String),
    Uprobe(String),
}

struct Registration {
    event: Arc<RegisteredEvent>,
    event_ids: Vec<u64>,
    fds: Vec<RawFd>,
    probe: Option<Probe>,
}

pub struct Subscription<B: PerfBackend = KernelBackend> {
    formats: Arc<TraceFormatCache>,
    groups: Arc<PerfGroupManager<B>>,
    demux: Arc<SampleDemux>,
    /// id -> attr, mirroring the registered-event table.
    attrs: SnapshotMap<u64, EventAttr>,
    registry: Mutex<HashMap<Token, Registration>>,
    next_token: AtomicU64,
    running: AtomicBool,
}

impl Subscription<KernelBackend> {
    /// Builds a subscription against the running kernel. The tracing
    /// filesystem must already be mounted (see
    /// [`crate::tracefs::check_or_mount_tracing`]).
    pub fn new(
        options: SubscriptionOptions,
        listeners: Vec<Box<dyn ProcessListener>>,
    ) -> Result<Self, PerfError> {
        let formats = Arc::new(TraceFormatCache::from_mounted()?);
        let targets = cgroup_targets(&options.cgroups)?;
        Self::with_backend(Arc::new(KernelBackend), formats, targets, options, listeners)
    }
}

fn cgroup_targets(cgroups: &[String]) -> Result<Vec<MonitorTarget>, PerfError> {
    let mut targets = Vec::new();
    for name in cgroups {
        if name.is_empty() || name == "/" {
            targets.push(MonitorTarget::SystemWide);
            continue;
        }
        let path = std::path::Path::new("/sys/fs/cgroup/perf_event").join(name.trim_start_matches('/'));
        let fd = nix::fcntl::open(
            &path,
            nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_DIRECTORY,
            nix::sys::stat::Mode::empty(),
        )
        .map_err(|source| PerfError::Open {
            name: format!("cgroup {}", path.display()),
            source,
        })?;
        targets.push(MonitorTarget::Cgroup { path, fd });
    }
    if targets.is_empty() {
        targets.push(MonitorTarget::SystemWide);
    }
    Ok(targets)
}

impl<B: PerfBackend> Subscription<B> {
    pub fn with_backend(
        backend: Arc<B>,
        formats: Arc<TraceFormatCache>,
        targets: Vec<MonitorTarget>,
        options: SubscriptionOptions,
        listeners: Vec<Box<dyn ProcessListener>>,
    ) -> Result<Self, PerfError> {
        let mut ring_pages = options.ring_pages;
        if ring_pages == 0 || !ring_pages.is_power_of_two() {
            log::warn!(
                "ring_buffer_pages={ring_pages} is not a power of two, using {RING_PAGES_DEFAULT}"
            );
            ring_pages = RING_PAGES_DEFAULT;
        }
        let cpus = options.cpus.unwrap_or_else(online_cpus);
        let groups = Arc::new(PerfGroupManager::new(
            backend,
            targets,
            cpus,
            ring_pages.trailing_zeros() as usize,
        ));
        Ok(Self {
            formats,
            groups,
            demux: Arc::new(SampleDemux::new(listeners)),
            attrs: SnapshotMap::new(),
            registry: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// Compiles `spec` into an event attr, attaches it to every CPU's
    /// group, and publishes the handler. The returned token drives every
    /// later per-event operation.
    pub fn register(&self, spec: EventSpec, handler: Handler) -> Result<Token, PerfError> {
        let label = spec.label();
        let (attr, format, probe) = self.build_attr(&spec)?;

        let attachment = match self.groups.attach(&attr, &label) {
            Ok(attachment) => attachment,
            Err(err) => {
                // The probe was installed before the attach; take it back
                // out so a failed registration leaves no trace.
                self.remove_probe(&probe);
                return Err(err);
            }
        };

        let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst) + 1);
        let event = Arc::new(RegisteredEvent::new(
            token.0,
            label,
            attr,
            format,
            None,
            handler,
        ));
        if self.running.load(Ordering::SeqCst) {
            event.set_state(EventState::Active);
        }

        self.attrs
            .update(attachment.event_ids.iter().map(|id| (*id, attr)));
        self.demux.publish(&attachment.event_ids, &event);
        self.registry.lock().unwrap().insert(
            token,
            Registration {
                event,
                event_ids: attachment.event_ids,
                fds: attachment.fds,
                probe,
            },
        );
        Ok(token)
    }

    /// Applies a kernel-side filter expression to every fd bound to the
    /// token.
    pub fn set_filter(&self, token: Token, filter: &str) -> Result<(), PerfError> {
        let registry = self.registry.lock().unwrap();
        let registration = registry.get(&token).ok_or(PerfError::Closed)?;
        self.groups.set_filter(&registration.fds, filter)
    }

    pub fn enable(&self, token: Token) -> Result<(), PerfError> {
        let registry = self.registry.lock().unwrap();
        let registration = registry.get(&token).ok_or(PerfError::Closed)?;
        self.groups.enable_fds(&registration.fds)?;
        registration.event.set_state(EventState::Active);
        Ok(())
    }

    pub fn disable(&self, token: Token) -> Result<(), PerfError> {
        let registry = self.registry.lock().unwrap();
        let registration = registry.get(&token).ok_or(PerfError::Closed)?;
        registration.event.set_state(EventState::Disabling);
        self.groups.disable_fds(&registration.fds)
    }

    /// Tears the registration down: marks it removed, retires its map
    /// entries under the writer lock, closes its fds. In-flight samples
    /// may still be delivered until the snapshot publication retires.
    pub fn unregister(&self, token: Token) -> Result<(), PerfError> {
        let registration = self
            .registry
            .lock()
            .unwrap()
            .remove(&token)
            .ok_or(PerfError::Closed)?;
        registration.event.set_state(EventState::Removed);
        self.demux.retire(&registration.event_ids);
        self.attrs.remove_all(&registration.event_ids);
        self.groups.detach(&registration.fds, &registration.event_ids);
        self.remove_probe(&registration.probe);
        Ok(())
    }

    /// Observability counters. Losses show up here, never as errors.
    pub fn stats(&self) -> CounterSnapshot {
        self.demux.counters().snapshot()
    }

    /// Lost-sample count for one stream id.
    pub fn lost_for_stream(&self, stream_id: u64) -> u64 {
        self.demux.lost_for_stream(stream_id)
    }

    /// Enables every group and starts delivering to handlers.
    pub fn start(&self) -> Result<(), PerfError> {
        self.groups.enable_all()?;
        self.running.store(true, Ordering::SeqCst);
        for registration in self.registry.lock().unwrap().values() {
            if registration.event.state() == EventState::Pending {
                registration.event.set_state(EventState::Active);
            }
        }
        Ok(())
    }

    /// Drives one reader per CPU until `shutdown` fires (a send or a
    /// dropped sender). Returns once every reader has drained its rings
    /// and exited; only catastrophic ring loss ends it early.
    pub async fn run(&self, shutdown: watch::Receiver<()>) -> Result<(), PerfError> {
        self.start()?;

        let mut handles = Vec::new();
        for &cpu in self.groups.cpus() {
            let leaders = self.groups.leaders_for_cpu(cpu);
            if leaders.is_empty() {
                continue;
            }
            let demux = Arc::clone(&self.demux);
            let rx = shutdown.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ring-reader-{cpu}"))
                .spawn(move || reader_loop(leaders, demux, rx))
                .expect("spawning ring reader thread");
            handles.push(handle);
        }

        if handles.is_empty() {
            // Nothing registered yet; still honour the cancellation
            // contract instead of returning immediately.
            let mut shutdown = shutdown;
            let _ = shutdown.changed().await;
            self.running.store(false, Ordering::SeqCst);
            return self.groups.disable_all();
        }
        drop(shutdown);

        let results = tokio::task::spawn_blocking(move || {
            handles
                .into_iter()
                .map(|handle| handle.join().expect("ring reader panicked"))
                .collect::<Vec<_>>()
        })
        .await
        .expect("joining ring readers");

        self.running.store(false, Ordering::SeqCst);
        self.groups.disable_all()?;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Closes every fd and unmaps every ring. Only valid after [`run`]
    /// (and thus every reader) has returned.
    pub fn close(&self) {
        let tokens: Vec<Token> = self.registry.lock().unwrap().keys().copied().collect();
        for token in tokens {
            let _ = self.unregister(token);
        }
        self.groups.close_all();
    }

    fn remove_probe(&self, probe: &Option<Probe>) {
        match probe {
            Some(Probe::Kprobe(name)) => {
                if let Err(err) = self.formats.remove_kprobe(name) {
                    log::warn!("leaving kprobe {name} installed: {err}");
                }
            }
            Some(Probe::Uprobe(name)) => {
                if let Err(err) = self.formats.remove_uprobe(name) {
                    log::warn!("leaving uprobe {name} installed: {err}");
                }
            }
            None => {}
        }
    }

    fn build_attr(
        &self,
        spec: &EventSpec,
    ) -> Result<(EventAttr, Option<Arc<TraceFormat>>, Option<Probe>), PerfError> {
        let mut attr = EventAttr {
            flags: AttrFlags::DISABLED,
            wakeup: Wakeup::Events(1),
            ..Default::default()
        };
        let tracepoint_samples = SampleFormat::TID
            | SampleFormat::TIME
            | SampleFormat::ID
            | SampleFormat::RAW;

        match spec {
            EventSpec::Tracepoint { subsystem, name } => {
                let (id, format) = self.formats.resolve(subsystem, name)?;
                attr.ty = PERF_TYPE_TRACEPOINT;
                attr.config = u64::from(id);
                attr.sampling = Sampling::Period(1);
                attr.sample_type = tracepoint_samples;
                Ok((attr, Some(format), None))
            }
            EventSpec::Kprobe {
                name,
                symbol,
                on_return,
            } => {
                let (id, format) = self.formats.add_kprobe(name, symbol, *on_return)?;
                attr.ty = PERF_TYPE_TRACEPOINT;
                attr.config = u64::from(id);
                attr.sampling = Sampling::Period(1);
                attr.sample_type = tracepoint_samples;
                Ok((attr, Some(format), Some(Probe::Kprobe(name.clone()))))
            }
            EventSpec::Uprobe {
                name,
                path,
                offset,
                on_return,
            } => {
                let (id, format) = self.formats.add_uprobe(name, path, *offset, *on_return)?;
                attr.ty = PERF_TYPE_TRACEPOINT;
                attr.config = u64::from(id);
                attr.sampling = Sampling::Period(1);
                attr.sample_type = tracepoint_samples;
                Ok((attr, Some(format), Some(Probe::Uprobe(name.clone()))))
            }
            EventSpec::Hardware { config, period } => {
                attr.ty = PERF_TYPE_HARDWARE;
                attr.config = *config;
                attr.sampling = Sampling::Period(*period);
                attr.sample_type = SampleFormat::IP
                    | SampleFormat::TID
                    | SampleFormat::TIME
                    | SampleFormat::ID
                    | SampleFormat::CPU
                    | SampleFormat::PERIOD;
                Ok((attr, None, None))
            }
            EventSpec::Software { config, period } => {
                attr.ty = PERF_TYPE_SOFTWARE;
                attr.config = *config;
                attr.sampling = Sampling::Period(*period);
                attr.sample_type = SampleFormat::IP
                    | SampleFormat::TID
                    | SampleFormat::TIME
                    | SampleFormat::ID
                    | SampleFormat::CPU;
                Ok((attr, None, None))
            }
            EventSpec::Breakpoint { bp_type, addr, len } => {
                attr.ty = PERF_TYPE_BREAKPOINT;
                attr.bp_type = *bp_type;
                attr.config1 = *addr;
                attr.config2 = *len;
                attr.sampling = Sampling::Period(1);
                attr.sample_type = SampleFormat::IP
                    | SampleFormat::TID
                    | SampleFormat::TIME
                    | SampleFormat::ID
                    | SampleFormat::ADDR;
                Ok((attr, None, None))
            }
        }
    }
}

/// One per CPU: waits for ring readiness, drains every available record,
/// observes cancellation between records. Skipped malformed records are
/// counted and reading continues; only unrecoverable ring corruption ends
/// the loop.
fn reader_loop(
    leaders: Vec<Arc<GroupLeader>>,
    demux: Arc<SampleDemux>,
    shutdown: watch::Receiver<()>,
) -> Result<(), PerfError> {
    let drain = |leader: &GroupLeader| -> Result<(), PerfError> {
        let read = leader
            .ring
            .read_pending(|header, body| demux.dispatch(&leader.attr, header, body))?;
        demux.note_skipped_records(read.skipped as u64);
        Ok(())
    };

    loop {
        if shutdown.has_changed().map_or(true, |changed| changed) {
            break;
        }
        let mut poll_fds: Vec<PollFd> = leaders
            .iter()
            .map(|leader| PollFd::new(leader.fd, PollFlags::POLLIN))
            .collect();
        match poll(&mut poll_fds, 100) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(source) => return Err(PerfError::Poll(source)),
        }
        for leader in &leaders {
            drain(leader)?;
        }
    }

    // Final drain so nothing already in the rings is dropped on shutdown.
    for leader in &leaders {
        drain(leader)?;
    }
    Ok(())
}
