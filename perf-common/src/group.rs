//! Per-CPU perf event groups.
//!
//! The first event attached for a CPU (and monitoring target) becomes that
//! CPU's group leader: it owns the memory-mapped ring buffer, and every
//! later event passes the leader's fd as `group_fd` so samples from
//! different sources arrive time-ordered within the group. Followers have
//! their sampling output redirected into the leader's ring.
//!
//! File descriptors and ring mappings are owned here; nothing else closes
//! or unmaps them.

use std::{
    collections::{HashMap, HashSet},
    os::unix::io::RawFd,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    attr::EventAttr,
    maps::SnapshotMap,
    ring::RingBuffer,
    sys::{PerfBackend, PerfError, PERF_FLAG_FD_CLOEXEC, PERF_FLAG_PID_CGROUP},
};

/// What a subscription is scoped to.
#[derive(Debug)]
pub enum MonitorTarget {
    /// All processes: `pid = -1, cpu = c`.
    SystemWide,
    /// One cgroup: `pid = cgroup_fd, cpu = c, flags |= PERF_FLAG_PID_CGROUP`.
    Cgroup { path: PathBuf, fd: RawFd },
}

/// Per-CPU anchor of a perf event group.
pub struct GroupLeader {
    pub cpu: i32,
    pub fd: RawFd,
    /// Kernel event id of the leader; doubles as the group's stream id.
    pub id: u64,
    /// The attr the leader was opened with. The first attached attr
    /// determines group semantics, including the sample layout of every
    /// record in the ring.
    pub attr: EventAttr,
    pub ring: RingBuffer,
    enabled: AtomicBool,
    members: Mutex<HashSet<u64>>,
}

impl GroupLeader {
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn member_ids(&self) -> Vec<u64> {
        self.members.lock().unwrap().iter().copied().collect()
    }
}

/// Result of attaching one event across every CPU and target: the kernel
/// event ids and fds, index-aligned.
#[derive(Debug, Default)]
pub struct Attachment {
    pub event_ids: Vec<u64>,
    pub fds: Vec<RawFd>,
}

pub type GroupLeaderMap = SnapshotMap<u64, Arc<GroupLeader>>;

pub struct PerfGroupManager<B: PerfBackend> {
    backend: Arc<B>,
    targets: Vec<MonitorTarget>,
    cpus: Vec<i32>,
    /// Ring size exponent: each leader maps `1 + 2^ring_pages` pages.
    ring_pages: usize,
    by_slot: Mutex<HashMap<(usize, i32), Arc<GroupLeader>>>,
    leaders: GroupLeaderMap,
    enabled: AtomicBool,
}

impl<B: PerfBackend> PerfGroupManager<B> {
    pub fn new(backend: Arc<B>, targets: Vec<MonitorTarget>, cpus: Vec<i32>, ring_pages: usize) -> Self {
        Self {
            backend,
            targets,
            cpus,
            ring_pages,
            by_slot: Mutex::new(HashMap::new()),
            leaders: SnapshotMap::new(),
            enabled: AtomicBool::new(false),
        }
    }

    pub fn cpus(&self) -> &[i32] {
        &self.cpus
    }

    /// Wait-free lookup of a group leader by its kernel event id.
    pub fn leader(&self, id: u64) -> Option<Arc<GroupLeader>> {
        self.leaders.lookup(&id)
    }

    /// Every leader reading on the given CPU, across targets.
    pub fn leaders_for_cpu(&self, cpu: i32) -> Vec<Arc<GroupLeader>> {
        let slots = self.by_slot.lock().unwrap();
        self.targets
            .iter()
            .enumerate()
            .filter_map(|(t, _)| slots.get(&(t, cpu)).cloned())
            .collect()
    }

    /// Opens `attr` on every CPU of every target. The event becomes the
    /// group leader wherever none exists yet; otherwise it joins the
    /// existing group and its output is redirected into the leader's ring.
    ///
    /// On any failure the partial state is rolled back: every fd opened by
    /// this call is closed and any leader it created is retired.
    pub fn attach(&self, attr: &EventAttr, name: &str) -> Result<Attachment, PerfError> {
        let mut slots = self.by_slot.lock().unwrap();
        let mut opened: Vec<RawFd> = Vec::new();
        let mut new_slots: Vec<(usize, i32)> = Vec::new();
        let mut new_leader_ids: Vec<u64> = Vec::new();
        let mut joined: Vec<(Arc<GroupLeader>, u64)> = Vec::new();
        let mut attachment = Attachment::default();

        let result = (|| -> Result<(), PerfError> {
            for (t, target) in self.targets.iter().enumerate() {
                let (pid, flags) = match target {
                    MonitorTarget::SystemWide => (-1, PERF_FLAG_FD_CLOEXEC),
                    MonitorTarget::Cgroup { fd, .. } => {
                        (*fd, PERF_FLAG_FD_CLOEXEC | PERF_FLAG_PID_CGROUP)
                    }
                };
                for &cpu in &self.cpus {
                    match slots.get(&(t, cpu)) {
                        Some(leader) => {
                            let fd = self.backend.open(attr, name, pid, cpu, leader.fd, flags)?;
                            opened.push(fd);
                            self.backend.set_output(fd, leader.fd)?;
                            let id = self.backend.event_id(fd)?;
                            leader.members.lock().unwrap().insert(id);
                            joined.push((Arc::clone(leader), id));
                            if self.enabled.load(Ordering::Relaxed) {
                                self.backend.enable(fd, false)?;
                            }
                            attachment.event_ids.push(id);
                            attachment.fds.push(fd);
                        }
                        None => {
                            let fd = self.backend.open(attr, name, pid, cpu, -1, flags)?;
                            opened.push(fd);
                            let ring = self.backend.map_ring(fd, self.ring_pages)?;
                            let id = self.backend.event_id(fd)?;
                            let leader = Arc::new(GroupLeader {
                                cpu,
                                fd,
                                id,
                                attr: *attr,
                                ring,
                                enabled: AtomicBool::new(false),
                                members: Mutex::new(HashSet::from([id])),
                            });
                            slots.insert((t, cpu), Arc::clone(&leader));
                            self.leaders.insert(id, leader);
                            new_slots.push((t, cpu));
                            new_leader_ids.push(id);
                            if self.enabled.load(Ordering::Relaxed) {
                                self.backend.enable(fd, true)?;
                            }
                            attachment.event_ids.push(id);
                            attachment.fds.push(fd);
                        }
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(attachment),
            Err(err) => {
                for fd in opened {
                    self.backend.close(fd);
                }
                for (leader, id) in joined {
                    leader.members.lock().unwrap().remove(&id);
                }
                for slot in new_slots {
                    slots.remove(&slot);
                }
                self.leaders.remove_all(&new_leader_ids);
                Err(err)
            }
        }
    }

    /// Detaches a previously attached event: follower fds are closed and
    /// every id leaves its group's member set. A leader fd stays open (it
    /// anchors the ring other members sample into) until
    /// [`close_all`](Self::close_all).
    pub fn detach(&self, fds: &[RawFd], ids: &[u64]) {
        let leader_ids = self.leaders.snapshot();
        for (fd, id) in fds.iter().zip(ids) {
            if let Some(leader) = self.by_slot.lock().unwrap().values().find(|l| {
                l.members.lock().unwrap().contains(id)
            }) {
                leader.members.lock().unwrap().remove(id);
            }
            if !leader_ids.contains_key(id) {
                self.backend.close(*fd);
            }
        }
    }

    /// Enables every group, leader-wide, exactly once per leader.
    pub fn enable_all(&self) -> Result<(), PerfError> {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for leader in self.by_slot.lock().unwrap().values() {
            self.backend.enable(leader.fd, true)?;
            leader.enabled.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn disable_all(&self) -> Result<(), PerfError> {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for leader in self.by_slot.lock().unwrap().values() {
            self.backend.disable(leader.fd, true)?;
            leader.enabled.store(false, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn enable_fds(&self, fds: &[RawFd]) -> Result<(), PerfError> {
        for &fd in fds {
            self.backend.enable(fd, false)?;
        }
        Ok(())
    }

    pub fn disable_fds(&self, fds: &[RawFd]) -> Result<(), PerfError> {
        for &fd in fds {
            self.backend.disable(fd, false)?;
        }
        Ok(())
    }

    pub fn set_filter(&self, fds: &[RawFd], filter: &str) -> Result<(), PerfError> {
        for &fd in fds {
            self.backend.set_filter(fd, filter)?;
        }
        Ok(())
    }

    /// Tears the whole manager down: disables groups, closes leader and
    /// cgroup fds, unmaps rings. Must only run after every ring reader has
    /// exited; the readers hold `Arc<GroupLeader>` references, and the
    /// last drop unmaps the ring.
    pub fn close_all(&self) {
        let _ = self.disable_all();
        let mut slots = self.by_slot.lock().unwrap();
        for leader in slots.values() {
            self.backend.close(leader.fd);
        }
        slots.clear();
        let ids: Vec<u64> = self.leaders.snapshot().keys().copied().collect();
        self.leaders.remove_all(&ids);
        for target in &self.targets {
            if let MonitorTarget::Cgroup { fd, .. } = target {
                self.backend.close(*fd);
            }
        }
    }
}
