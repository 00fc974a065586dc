//! Fan-out of decoded records to their subscribers.
//!
//! Each ring reader hands raw frames here. Samples are decoded against the
//! owning group's attr, attributed to a [`RegisteredEvent`] through the
//! wait-free id table, and delivered to the registered handler. Control
//! records (fork, exit, comm, mmap) feed a fixed set of internal process
//! listeners instead of user handlers. Within one group records are
//! delivered in ring order; nothing is promised across CPUs.
//!
//! Handlers borrow the sample for the duration of the call, must not
//! block, and must not re-enter the subscription API on their thread.

use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc,
};

use crate::{
    attr::EventAttr,
    decode::{self, CommRecord, MmapRecord, Record, RecordHeader, Sample, TaskRecord},
    maps::{CounterMap, SnapshotMap},
    tracefs::TraceFormat,
};

pub type Handler = Box<dyn Fn(&Sample) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventState {
    /// Registered but its group has not been enabled yet.
    Pending = 0,
    Active = 1,
    Disabling = 2,
    Removed = 3,
}

impl EventState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EventState::Pending,
            1 => EventState::Active,
            2 => EventState::Disabling,
            _ => EventState::Removed,
        }
    }
}

/// Binds a kernel event source to user intent. Immutable after creation
/// except for `state`.
pub struct RegisteredEvent {
    /// The subscription token this event was registered under.
    pub source_id: u64,
    /// Human-readable label, e.g. `sched/sched_process_exec`.
    pub name: String,
    pub attr: EventAttr,
    /// Payload format, for tracepoint-backed sources.
    pub format: Option<Arc<TraceFormat>>,
    /// Kernel-side filter expression the event was registered with.
    pub filter: Option<String>,
    handler: Handler,
    state: AtomicU8,
}

impl RegisteredEvent {
    pub fn new(
        source_id: u64,
        name: String,
        attr: EventAttr,
        format: Option<Arc<TraceFormat>>,
        filter: Option<String>,
        handler: Handler,
    ) -> Self {
        Self {
            source_id,
            name,
            attr,
            format,
            filter,
            handler,
            state: AtomicU8::new(EventState::Pending as u8),
        }
    }

    pub fn state(&self) -> EventState {
        EventState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: EventState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Record counters exposed through `stats()`. Losses are reported here,
/// never as errors.
#[derive(Default)]
pub struct Counters {
    samples_dispatched: AtomicU64,
    samples_lost: AtomicU64,
    samples_corrupt: AtomicU64,
    samples_unattributed: AtomicU64,
    samples_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub samples_dispatched: u64,
    pub samples_lost: u64,
    pub samples_corrupt: u64,
    pub samples_unattributed: u64,
    pub samples_dropped: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            samples_dispatched: self.samples_dispatched.load(Ordering::Relaxed),
            samples_lost: self.samples_lost.load(Ordering::Relaxed),
            samples_corrupt: self.samples_corrupt.load(Ordering::Relaxed),
            samples_unattributed: self.samples_unattributed.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Internal consumers of process-lifecycle control records.
pub trait ProcessListener: Send + Sync {
    fn on_fork(&self, _task: &TaskRecord) {}
    fn on_exit(&self, _task: &TaskRecord) {}
    fn on_comm(&self, _comm: &CommRecord) {}
    fn on_mmap(&self, _mmap: &MmapRecord) {}
}

pub type RegisteredEventMap = SnapshotMap<u64, Arc<RegisteredEvent>>;

pub struct SampleDemux {
    events: RegisteredEventMap,
    counters: Arc<Counters>,
    lost_by_stream: CounterMap,
    listeners: Vec<Box<dyn ProcessListener>>,
}

impl SampleDemux {
    pub fn new(listeners: Vec<Box<dyn ProcessListener>>) -> Self {
        Self {
            events: SnapshotMap::new(),
            counters: Arc::new(Counters::default()),
            lost_by_stream: CounterMap::new(),
            listeners,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Lost-sample counts per stream id.
    pub fn lost_for_stream(&self, stream_id: u64) -> u64 {
        self.lost_by_stream.lookup(&stream_id).unwrap_or(0)
    }

    /// Accounts records a ring reader skipped while resyncing past a
    /// malformed frame.
    pub fn note_skipped_records(&self, count: u64) {
        if count > 0 {
            self.counters.samples_corrupt.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Publishes `event` under every kernel id it was attached as.
    /// Establishes happens-before with subsequent samples on those ids.
    pub fn publish(&self, ids: &[u64], event: &Arc<RegisteredEvent>) {
        self.events
            .update(ids.iter().map(|id| (*id, Arc::clone(event))));
    }

    /// Removes the given ids under the writer lock. In-flight samples may
    /// still be delivered until the snapshot publication retires.
    pub fn retire(&self, ids: &[u64]) {
        self.events.remove_all(ids);
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<RegisteredEvent>> {
        self.events.lookup(&id)
    }

    /// Decodes one frame and routes it. Decoder-local failures are
    /// contained: the record is skipped and a counter incremented.
    pub fn dispatch(&self, group_attr: &EventAttr, header: RecordHeader, body: &[u8]) {
        match decode::decode_record(group_attr, header, body) {
            Ok(Record::Sample(sample)) => self.dispatch_sample(sample),
            Ok(Record::Lost { id, count }) => {
                self.counters.samples_lost.fetch_add(count, Ordering::Relaxed);
                self.lost_by_stream.add(id, count);
                log::warn!("kernel lost {count} samples on stream {id}");
            }
            Ok(Record::Fork(task)) => {
                for listener in &self.listeners {
                    listener.on_fork(&task);
                }
            }
            Ok(Record::Exit(task)) => {
                for listener in &self.listeners {
                    listener.on_exit(&task);
                }
            }
            Ok(Record::Comm(comm)) => {
                for listener in &self.listeners {
                    listener.on_comm(&comm);
                }
            }
            Ok(Record::Mmap(mmap)) => {
                for listener in &self.listeners {
                    listener.on_mmap(&mmap);
                }
            }
            Ok(Record::Throttle(t)) => log::debug!("stream {} throttled", t.stream_id),
            Ok(Record::Unthrottle(t)) => log::debug!("stream {} unthrottled", t.stream_id),
            Err(err) => {
                self.counters.samples_corrupt.fetch_add(1, Ordering::Relaxed);
                log::debug!("skipping corrupt record: {err}");
            }
        }
    }

    fn dispatch_sample(&self, mut sample: Sample) {
        let Some(event) = self.events.lookup(&sample.id) else {
            self.counters
                .samples_unattributed
                .fetch_add(1, Ordering::Relaxed);
            return;
        };
        match event.state() {
            EventState::Active => {
                if let (Some(raw), Some(format)) = (&sample.raw, &event.format) {
                    match decode::decode_raw_fields(format, raw) {
                        Ok(fields) => sample.fields = fields,
                        Err(_) => {
                            self.counters.samples_corrupt.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    }
                }
                (event.handler)(&sample);
                self.counters
                    .samples_dispatched
                    .fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.counters.samples_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use super::*;
    use crate::attr::{SampleFormat, Sampling, PERF_TYPE_TRACEPOINT};
    use crate::decode::{PERF_RECORD_EXIT, PERF_RECORD_FORK};
    use crate::testutil::{lost_record, sample_record, task_record, SampleSpec};

    fn group_attr() -> EventAttr {
        EventAttr {
            ty: PERF_TYPE_TRACEPOINT,
            sampling: Sampling::Period(1),
            sample_type: SampleFormat::TID
                | SampleFormat::TIME
                | SampleFormat::ID
                | SampleFormat::RAW,
            ..Default::default()
        }
    }

    fn dispatch_bytes(demux: &SampleDemux, record: &[u8]) {
        let mut cursor = record;
        let header = RecordHeader::parse(&mut cursor).unwrap();
        demux.dispatch(&group_attr(), header, cursor);
    }

    fn registered(id: u64, hits: Arc<AtomicUsize>) -> Arc<RegisteredEvent> {
        let event = Arc::new(RegisteredEvent::new(
            1,
            "sched/test".to_string(),
            group_attr(),
            None,
            None,
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        event.set_state(EventState::Active);
        event
    }

    #[test]
    fn sample_reaches_handler_exactly_once() {
        let demux = SampleDemux::new(Vec::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let event = registered(42, Arc::clone(&hits));
        demux.publish(&[42], &event);

        let record = sample_record(&SampleSpec {
            pid: 10,
            tid: 10,
            time: 5,
            id: 42,
            raw: vec![0; 4],
        });
        dispatch_bytes(&demux, &record);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(demux.counters().snapshot().samples_dispatched, 1);
        assert_eq!(demux.counters().snapshot().samples_unattributed, 0);

        // After retiring id 42, the same frame is unattributed.
        demux.retire(&[42]);
        dispatch_bytes(&demux, &record);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(demux.counters().snapshot().samples_unattributed, 1);
    }

    #[test]
    fn inactive_states_drop_samples() {
        let demux = SampleDemux::new(Vec::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let event = registered(42, Arc::clone(&hits));
        demux.publish(&[42], &event);

        let record = sample_record(&SampleSpec {
            pid: 1,
            tid: 1,
            time: 1,
            id: 42,
            raw: vec![0; 4],
        });
        for state in [EventState::Pending, EventState::Disabling, EventState::Removed] {
            event.set_state(state);
            dispatch_bytes(&demux, &record);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(demux.counters().snapshot().samples_dropped, 3);
    }

    #[test]
    fn lost_records_accumulate_per_stream() {
        let demux = SampleDemux::new(Vec::new());
        dispatch_bytes(&demux, &lost_record(9, 17));
        dispatch_bytes(&demux, &lost_record(9, 3));
        dispatch_bytes(&demux, &lost_record(8, 1));
        let stats = demux.counters().snapshot();
        assert_eq!(stats.samples_lost, 21);
        assert_eq!(demux.lost_for_stream(9), 20);
        assert_eq!(demux.lost_for_stream(8), 1);
    }

    #[test]
    fn corrupt_record_increments_counter_and_continues() {
        let demux = SampleDemux::new(Vec::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let event = registered(42, Arc::clone(&hits));
        demux.publish(&[42], &event);

        // Truncated sample body.
        let header = RecordHeader {
            ty: crate::decode::PERF_RECORD_SAMPLE,
            misc: 0,
            size: 12,
        };
        demux.dispatch(&group_attr(), header, &[0u8; 4]);
        assert_eq!(demux.counters().snapshot().samples_corrupt, 1);

        // The stream keeps flowing afterwards.
        let record = sample_record(&SampleSpec {
            pid: 1,
            tid: 1,
            time: 1,
            id: 42,
            raw: vec![0; 4],
        });
        dispatch_bytes(&demux, &record);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    struct Recorder {
        forks: Mutex<Vec<u32>>,
        exits: Mutex<Vec<u32>>,
    }

    impl ProcessListener for Recorder {
        fn on_fork(&self, task: &TaskRecord) {
            self.forks.lock().unwrap().push(task.pid);
        }
        fn on_exit(&self, task: &TaskRecord) {
            self.exits.lock().unwrap().push(task.pid);
        }
    }

    #[test]
    fn control_records_feed_listeners_not_handlers() {
        let recorder = Arc::new(Recorder {
            forks: Mutex::new(Vec::new()),
            exits: Mutex::new(Vec::new()),
        });

        struct Fwd(Arc<Recorder>);
        impl ProcessListener for Fwd {
            fn on_fork(&self, task: &TaskRecord) {
                self.0.on_fork(task)
            }
            fn on_exit(&self, task: &TaskRecord) {
                self.0.on_exit(task)
            }
        }

        let demux = SampleDemux::new(vec![Box::new(Fwd(Arc::clone(&recorder)))]);
        let hits = Arc::new(AtomicUsize::new(0));
        let event = registered(42, Arc::clone(&hits));
        demux.publish(&[42], &event);

        dispatch_bytes(&demux, &task_record(PERF_RECORD_FORK, 100, 1, 50));
        dispatch_bytes(&demux, &task_record(PERF_RECORD_EXIT, 100, 1, 60));

        assert_eq!(*recorder.forks.lock().unwrap(), vec![100]);
        assert_eq!(*recorder.exits.lock().unwrap(), vec![100]);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "handlers see no control records");
    }
}
