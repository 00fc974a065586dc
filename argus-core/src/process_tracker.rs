//! Process context tracking.
//!
//! The tracker is an actor fed by the perf core's control-record listeners
//! (fork, exec/comm, exit) and queried when a sample needs to be attributed
//! to a process. Because samples and lifecycle records race across CPUs, a
//! lookup for a process that has not been forked yet is parked briefly and
//! answered when the fork arrives.

use std::collections::HashMap;

use perf_common::{
    decode::{CommRecord, TaskRecord},
    parsing::procfs,
    ProcessListener,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time,
};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("process not found")]
    ProcessNotFound,
    #[error("process started later")]
    ProcessNotStartedYet,
    #[error("process exited")]
    ProcessExited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub comm: String,
    pub ppid: i32,
    pub container_id: Option<String>,
    pub fork_time: u64,
}

#[derive(Clone)]
pub struct ProcessTrackerHandle {
    tx: mpsc::UnboundedSender<TrackerRequest>,
}

enum TrackerRequest {
    GetProcessInfo(InfoRequest),
    Fork {
        pid: i32,
        ppid: i32,
        timestamp: u64,
    },
    Comm {
        pid: i32,
        comm: String,
        timestamp: u64,
    },
    Exit {
        pid: i32,
        timestamp: u64,
    },
}

struct InfoRequest {
    pid: i32,
    timestamp: u64,
    tx_reply: oneshot::Sender<Result<ProcessInfo, TrackerError>>,
}

/// How long an exited process stays queryable, in nanoseconds.
const CLEANUP_TIMEOUT_NS: u64 = 5_000_000_000;

/// How long a lookup for an unknown pid is parked before giving up.
const PENDING_REQUEST_TIMEOUT: time::Duration = time::Duration::from_millis(100);

impl ProcessTrackerHandle {
    pub fn new(cache_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tracker = ProcessTracker::new(rx, cache_size);
        tokio::spawn(async move { tracker.run().await });
        Self { tx }
    }

    /// Creates a tracker pre-seeded with every currently running process.
    pub fn load_procfs(cache_size: usize) -> Result<Self, procfs::ProcfsError> {
        let handle = Self::new(cache_size);
        let mut pids = procfs::running_processes()?;
        pids.sort();
        for pid in pids {
            // A process may exit while we scan; skip it rather than fail.
            let Ok(stat) = procfs::stat(pid) else { continue };
            handle.send(TrackerRequest::Fork {
                pid: stat.pid,
                ppid: stat.ppid(),
                timestamp: 0,
            });
            handle.send(TrackerRequest::Comm {
                pid: stat.pid,
                comm: stat.comm,
                timestamp: 0,
            });
        }
        Ok(handle)
    }

    pub async fn get(&self, pid: i32, timestamp: u64) -> Result<ProcessInfo, TrackerError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.send(TrackerRequest::GetProcessInfo(InfoRequest {
            pid,
            timestamp,
            tx_reply,
        }));
        // The tracker outlives every handle, so the reply always comes.
        rx_reply.await.unwrap_or(Err(TrackerError::ProcessNotFound))
    }

    pub fn fork(&self, pid: i32, ppid: i32, timestamp: u64) {
        self.send(TrackerRequest::Fork {
            pid,
            ppid,
            timestamp,
        });
    }

    pub fn comm(&self, pid: i32, comm: String, timestamp: u64) {
        self.send(TrackerRequest::Comm {
            pid,
            comm,
            timestamp,
        });
    }

    pub fn exit(&self, pid: i32, timestamp: u64) {
        self.send(TrackerRequest::Exit { pid, timestamp });
    }

    fn send(&self, request: TrackerRequest) {
        // Fails only when the runtime is shutting down.
        let _ = self.tx.send(request);
    }
}

/// Bridges the perf core's control-record fan-in to the tracker. Handlers
/// run on the ring-reader threads and must not block; unbounded sends fit.
pub struct TrackerListener(pub ProcessTrackerHandle);

impl ProcessListener for TrackerListener {
    fn on_fork(&self, task: &TaskRecord) {
        self.0.fork(task.pid as i32, task.ppid as i32, task.time);
    }

    fn on_exit(&self, task: &TaskRecord) {
        self.0.exit(task.pid as i32, task.time);
    }

    fn on_comm(&self, comm: &CommRecord) {
        // The kernel emits COMM on exec and on prctl(PR_SET_NAME); both
        // update the name from that point in time on.
        self.0.comm(comm.pid as i32, comm.comm.clone(), 0);
    }
}

struct ProcessData {
    ppid: i32,
    container_id: Option<String>,
    fork_time: u64,
    exit_time: Option<u64>,
    original_comm: String,
    /// Name changes over time, sorted by timestamp.
    comm_changes: Vec<(u64, String)>,
}

struct ProcessTracker {
    rx: mpsc::UnboundedReceiver<TrackerRequest>,
    data: HashMap<i32, ProcessData>,
    cache_size: usize,
    next_cleanup: u64,
    latest_timestamp: u64,
    pending_requests: Vec<(time::Instant, InfoRequest)>,
}

impl ProcessTracker {
    fn new(rx: mpsc::UnboundedReceiver<TrackerRequest>, cache_size: usize) -> Self {
        Self {
            rx,
            data: HashMap::new(),
            cache_size,
            next_cleanup: CLEANUP_TIMEOUT_NS,
            latest_timestamp: 0,
            pending_requests: Vec::new(),
        }
    }

    async fn run(&mut self) {
        loop {
            let timeout = async {
                match self.pending_requests.first() {
                    Some((deadline, _)) => time::sleep_until(*deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => {
                        self.handle_message(message);
                        self.cleanup();
                        // Pending lookups can only be answered once new
                        // lifecycle records arrive, so check them here.
                        self.check_pending_requests();
                    }
                    None => break,
                },
                () = timeout => self.cancel_timed_out_requests(),
            }
        }
    }

    fn handle_message(&mut self, request: TrackerRequest) {
        match request {
            TrackerRequest::Fork {
                pid,
                ppid,
                timestamp,
            } => {
                self.latest_timestamp = self.latest_timestamp.max(timestamp);
                let container_id = procfs::container_id(perf_common::Pid::from_raw(pid))
                    .unwrap_or(None)
                    .or_else(|| {
                        self.data
                            .get(&ppid)
                            .and_then(|parent| parent.container_id.clone())
                    });
                let inherited_comm = self.comm_at(ppid, timestamp);
                self.data.insert(
                    pid,
                    ProcessData {
                        ppid,
                        container_id,
                        fork_time: timestamp,
                        exit_time: None,
                        original_comm: inherited_comm,
                        comm_changes: Vec::new(),
                    },
                );
                self.enforce_cache_bound();
            }
            TrackerRequest::Comm {
                pid,
                comm,
                timestamp,
            } => {
                self.latest_timestamp = self.latest_timestamp.max(timestamp);
                if let Some(process) = self.data.get_mut(&pid) {
                    process.comm_changes.push((timestamp, comm));
                    process.comm_changes.sort_by_key(|(ts, _)| *ts);
                } else {
                    log::debug!("comm for unknown process {pid}");
                }
            }
            TrackerRequest::Exit { pid, timestamp } => {
                self.latest_timestamp = self.latest_timestamp.max(timestamp);
                if let Some(process) = self.data.get_mut(&pid) {
                    process.exit_time = Some(timestamp);
                } else {
                    log::debug!("exit for unknown process {pid}");
                }
            }
            TrackerRequest::GetProcessInfo(request) => {
                match self.get_info(request.pid, request.timestamp) {
                    Err(TrackerError::ProcessNotFound) => {
                        // The fork record may still be in flight on another
                        // CPU; park the request and retry on new data.
                        let deadline = time::Instant::now() + PENDING_REQUEST_TIMEOUT;
                        self.pending_requests.push((deadline, request));
                    }
                    reply => {
                        let _ = request.tx_reply.send(reply);
                    }
                }
            }
        }
    }

    fn get_info(&self, pid: i32, timestamp: u64) -> Result<ProcessInfo, TrackerError> {
        let process = self.data.get(&pid).ok_or(TrackerError::ProcessNotFound)?;
        if timestamp < process.fork_time {
            return Err(TrackerError::ProcessNotStartedYet);
        }
        if let Some(exit_time) = process.exit_time {
            if exit_time < timestamp {
                return Err(TrackerError::ProcessExited);
            }
        }
        Ok(ProcessInfo {
            comm: self.comm_at(pid, timestamp),
            ppid: process.ppid,
            container_id: process.container_id.clone(),
            fork_time: process.fork_time,
        })
    }

    /// The process name as of a point in time.
    fn comm_at(&self, pid: i32, timestamp: u64) -> String {
        match self.data.get(&pid) {
            Some(process) => process
                .comm_changes
                .iter()
                .rev()
                .find_map(|(ts, comm)| (*ts <= timestamp).then_some(comm))
                .unwrap_or(&process.original_comm)
                .clone(),
            None => String::new(),
        }
    }

    /// Drops processes that exited more than the cleanup timeout ago.
    fn cleanup(&mut self) {
        if self.latest_timestamp <= self.next_cleanup {
            return;
        }
        let horizon = self.latest_timestamp.saturating_sub(CLEANUP_TIMEOUT_NS);
        self.data
            .retain(|_, process| process.exit_time.map_or(true, |exit| exit > horizon));
        self.next_cleanup = self.latest_timestamp + CLEANUP_TIMEOUT_NS;
    }

    /// Keeps the table under the configured bound, preferring to evict
    /// exited processes.
    fn enforce_cache_bound(&mut self) {
        if self.data.len() <= self.cache_size {
            return;
        }
        if let Some((&victim, _)) = self
            .data
            .iter()
            .filter(|(_, p)| p.exit_time.is_some())
            .min_by_key(|(_, p)| p.exit_time)
        {
            self.data.remove(&victim);
        } else {
            log::warn!(
                "process table exceeds cache size {} with no exited entries",
                self.cache_size
            );
        }
    }

    fn check_pending_requests(&mut self) {
        let mut pending = Vec::new();
        std::mem::swap(&mut self.pending_requests, &mut pending);
        for (deadline, request) in pending {
            match self.get_info(request.pid, request.timestamp) {
                Err(TrackerError::ProcessNotFound) => {
                    self.pending_requests.push((deadline, request));
                }
                reply => {
                    let _ = request.tx_reply.send(reply);
                }
            }
        }
    }

    fn cancel_timed_out_requests(&mut self) {
        let now = time::Instant::now();
        let mut pending = Vec::new();
        std::mem::swap(&mut self.pending_requests, &mut pending);
        for (deadline, request) in pending {
            if now >= deadline {
                let _ = request.tx_reply.send(Err(TrackerError::ProcessNotFound));
            } else {
                self.pending_requests.push((deadline, request));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_tracker_knows_nothing() {
        let tracker = ProcessTrackerHandle::new(1024);
        assert!(matches!(
            tracker.get(42, 0).await,
            Err(TrackerError::ProcessNotFound)
        ));
    }

    #[tokio::test]
    async fn lifecycle_is_time_aware() {
        let tracker = ProcessTrackerHandle::new(1024);
        tracker.fork(43, 42, 10);
        tracker.comm(43, "worker".to_string(), 15);
        tracker.exit(43, 100);
        time::sleep(time::Duration::from_millis(10)).await;

        assert!(matches!(
            tracker.get(43, 5).await,
            Err(TrackerError::ProcessNotStartedYet)
        ));
        let at_fork = tracker.get(43, 10).await.unwrap();
        assert_eq!(at_fork.ppid, 42);
        assert_eq!(at_fork.comm, "");
        let after_comm = tracker.get(43, 20).await.unwrap();
        assert_eq!(after_comm.comm, "worker");
        assert!(matches!(
            tracker.get(43, 101).await,
            Err(TrackerError::ProcessExited)
        ));
    }

    #[tokio::test]
    async fn lookup_parks_until_fork_arrives() {
        let tracker = ProcessTrackerHandle::new(1024);
        let lookup = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.get(7, 50).await })
        };
        time::sleep(time::Duration::from_millis(10)).await;
        tracker.fork(7, 1, 40);
        let info = lookup.await.unwrap().unwrap();
        assert_eq!(info.ppid, 1);
        assert_eq!(info.fork_time, 40);
    }

    #[tokio::test]
    async fn parked_lookup_times_out() {
        let tracker = ProcessTrackerHandle::new(1024);
        let started = time::Instant::now();
        assert!(matches!(
            tracker.get(9999, 0).await,
            Err(TrackerError::ProcessNotFound)
        ));
        assert!(started.elapsed() >= PENDING_REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn children_inherit_container_and_comm() {
        let tracker = ProcessTrackerHandle::new(1024);
        tracker.fork(100, 1, 10);
        tracker.comm(100, "engine".to_string(), 11);
        tracker.fork(101, 100, 20);
        time::sleep(time::Duration::from_millis(10)).await;

        let child = tracker.get(101, 25).await.unwrap();
        assert_eq!(child.comm, "engine", "child starts with the parent's name");
        assert_eq!(child.ppid, 100);
    }

    #[tokio::test]
    async fn exited_processes_are_evicted_when_full() {
        let tracker = ProcessTrackerHandle::new(2);
        tracker.fork(1, 0, 1);
        tracker.fork(2, 0, 2);
        tracker.exit(1, 3);
        tracker.fork(3, 0, 4);
        time::sleep(time::Duration::from_millis(10)).await;

        assert!(matches!(
            tracker.get(1, 2).await,
            Err(TrackerError::ProcessNotFound)
        ));
        assert!(tracker.get(2, 5).await.is_ok());
        assert!(tracker.get(3, 5).await.is_ok());
    }
}
