//! Builders for synthetic perf records and a mock kernel backend, shared by
//! the tests across this crate. No real kernel is required anywhere.

use std::{
    collections::HashMap,
    os::unix::io::RawFd,
    sync::{
        atomic::{AtomicI32, AtomicU64, Ordering},
        Mutex,
    },
};

use crate::{
    attr::EventAttr,
    decode::{PERF_RECORD_LOST, PERF_RECORD_SAMPLE},
    ring::RingBuffer,
    sys::{PerfBackend, PerfError},
};

/// Inputs for a synthetic `PERF_RECORD_SAMPLE` with
/// `sample_type = TID | TIME | ID | RAW`, the layout used by the
/// tracepoint attrs these tests build.
pub(crate) struct SampleSpec {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub id: u64,
    pub raw: Vec<u8>,
}

fn finish(ty: u32, mut body: Vec<u8>) -> Vec<u8> {
    // Records are 8-byte aligned in the ring.
    while (body.len() + 8) % 8 != 0 {
        body.push(0);
    }
    let size = (8 + body.len()) as u16;
    let mut record = Vec::with_capacity(size as usize);
    record.extend_from_slice(&ty.to_le_bytes());
    record.extend_from_slice(&0u16.to_le_bytes()); // misc
    record.extend_from_slice(&size.to_le_bytes());
    record.extend_from_slice(&body);
    record
}

pub(crate) fn sample_record(spec: &SampleSpec) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&spec.pid.to_le_bytes());
    body.extend_from_slice(&spec.tid.to_le_bytes());
    body.extend_from_slice(&spec.time.to_le_bytes());
    body.extend_from_slice(&spec.id.to_le_bytes());
    body.extend_from_slice(&(spec.raw.len() as u32).to_le_bytes());
    body.extend_from_slice(&spec.raw);
    finish(PERF_RECORD_SAMPLE, body)
}

pub(crate) fn lost_record(id: u64, count: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&id.to_le_bytes());
    body.extend_from_slice(&count.to_le_bytes());
    finish(PERF_RECORD_LOST, body)
}

pub(crate) fn task_record(ty: u32, pid: u32, ppid: u32, time: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&pid.to_le_bytes());
    body.extend_from_slice(&ppid.to_le_bytes());
    body.extend_from_slice(&pid.to_le_bytes()); // tid
    body.extend_from_slice(&ppid.to_le_bytes()); // ptid
    body.extend_from_slice(&time.to_le_bytes());
    finish(ty, body)
}

/// A call observed by [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MockCall {
    Open {
        fd: RawFd,
        pid: i32,
        cpu: i32,
        group_fd: RawFd,
        flags: u64,
    },
    Enable {
        fd: RawFd,
        group: bool,
    },
    Disable {
        fd: RawFd,
        group: bool,
    },
    SetFilter {
        fd: RawFd,
        filter: String,
    },
    SetOutput {
        fd: RawFd,
        leader_fd: RawFd,
    },
    Close {
        fd: RawFd,
    },
}

/// In-memory stand-in for the perf_event kernel interface. Hands out fds
/// and event ids from counters, maps synthetic rings, and can be told to
/// fail the n-th open to exercise rollback.
pub(crate) struct MockBackend {
    next_fd: AtomicI32,
    next_id: AtomicU64,
    opens: AtomicU64,
    /// When set, the n-th open (1-based) fails with EMFILE.
    fail_open_at: Option<u64>,
    pub calls: Mutex<Vec<MockCall>>,
    ids: Mutex<HashMap<RawFd, u64>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::failing_at(None)
    }

    pub fn failing_at(fail_open_at: Option<u64>) -> Self {
        Self {
            next_fd: AtomicI32::new(100),
            next_id: AtomicU64::new(1000),
            opens: AtomicU64::new(0),
            fail_open_at,
            calls: Mutex::new(Vec::new()),
            ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Fds opened and not yet closed.
    pub fn open_fds(&self) -> Vec<RawFd> {
        let mut open = Vec::new();
        for call in self.calls().iter() {
            match call {
                MockCall::Open { fd, .. } => open.push(*fd),
                MockCall::Close { fd } => open.retain(|o| o != fd),
                _ => {}
            }
        }
        open
    }
}

impl PerfBackend for MockBackend {
    fn open(
        &self,
        _attr: &EventAttr,
        name: &str,
        pid: i32,
        cpu: i32,
        group_fd: RawFd,
        flags: u64,
    ) -> Result<RawFd, PerfError> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_open_at == Some(n) {
            return Err(PerfError::Open {
                name: name.to_string(),
                source: nix::errno::Errno::EMFILE,
            });
        }
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.ids.lock().unwrap().insert(fd, id);
        self.calls.lock().unwrap().push(MockCall::Open {
            fd,
            pid,
            cpu,
            group_fd,
            flags,
        });
        Ok(fd)
    }

    fn enable(&self, fd: RawFd, group: bool) -> Result<(), PerfError> {
        self.calls
            .lock()
            .unwrap()
            .push(MockCall::Enable { fd, group });
        Ok(())
    }

    fn disable(&self, fd: RawFd, group: bool) -> Result<(), PerfError> {
        self.calls
            .lock()
            .unwrap()
            .push(MockCall::Disable { fd, group });
        Ok(())
    }

    fn set_filter(&self, fd: RawFd, filter: &str) -> Result<(), PerfError> {
        self.calls.lock().unwrap().push(MockCall::SetFilter {
            fd,
            filter: filter.to_string(),
        });
        Ok(())
    }

    fn set_output(&self, fd: RawFd, leader_fd: RawFd) -> Result<(), PerfError> {
        self.calls
            .lock()
            .unwrap()
            .push(MockCall::SetOutput { fd, leader_fd });
        Ok(())
    }

    fn event_id(&self, fd: RawFd) -> Result<u64, PerfError> {
        self.ids
            .lock()
            .unwrap()
            .get(&fd)
            .copied()
            .ok_or(PerfError::Closed)
    }

    fn map_ring(&self, _fd: RawFd, ring_pages: usize) -> Result<RingBuffer, PerfError> {
        Ok(RingBuffer::synthetic(ring_pages))
    }

    fn close(&self, fd: RawFd) {
        self.ids.lock().unwrap().remove(&fd);
        self.calls.lock().unwrap().push(MockCall::Close { fd });
    }
}
