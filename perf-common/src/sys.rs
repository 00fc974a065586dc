//! The `perf_event_open(2)` syscall surface.
//!
//! All kernel interaction goes through the [`PerfBackend`] trait so the
//! group manager and the subscription façade can be exercised against a
//! mock in tests. [`KernelBackend`] is the real thing.

use std::{ffi::CString, os::unix::io::RawFd};

use nix::errno::Errno;
use thiserror::Error;

use crate::{attr::EventAttr, ring::RingBuffer, tracefs::TracefsError};

pub const PERF_FLAG_PID_CGROUP: u64 = 1 << 2;
pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

// _IO('$', n) ioctl numbers from the perf_event uapi header.
pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
pub const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;
pub const PERF_EVENT_IOC_SET_OUTPUT: libc::c_ulong = 0x2405;
/// `_IOW('$', 6, char *)`
pub const PERF_EVENT_IOC_SET_FILTER: libc::c_ulong = 0x4008_2406;
/// `_IOR('$', 7, u64 *)`
pub const PERF_EVENT_IOC_ID: libc::c_ulong = 0x8008_2407;

/// Makes ENABLE/DISABLE apply to the whole group of the target fd.
pub const PERF_IOC_FLAG_GROUP: libc::c_ulong = 1;

#[derive(Error, Debug)]
pub enum PerfError {
    #[error("opening {name}: permission denied (CAP_PERFMON or CAP_SYS_ADMIN required)")]
    Permission { name: String },

    #[error("perf_event_open({name}) failed: {source}")]
    Open {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("{op} ioctl on fd {fd} failed: {source}")]
    Ioctl {
        op: &'static str,
        fd: RawFd,
        #[source]
        source: Errno,
    },

    #[error("mapping {len} bytes of ring buffer failed: {source}")]
    Mmap {
        len: usize,
        #[source]
        source: Errno,
    },

    #[error("ring buffer corrupt: {0}")]
    RingCorrupt(String),

    #[error("polling ring readiness: {0}")]
    Poll(#[source] Errno),

    #[error("event was unregistered")]
    Closed,

    #[error(transparent)]
    Tracefs(#[from] TracefsError),
}

/// The kernel interactions the perf core needs, as a seam for testing.
pub trait PerfBackend: Send + Sync + 'static {
    /// `perf_event_open(attr, pid, cpu, group_fd, flags)`. `name` is the
    /// human-readable event label carried into error values.
    fn open(
        &self,
        attr: &EventAttr,
        name: &str,
        pid: i32,
        cpu: i32,
        group_fd: RawFd,
        flags: u64,
    ) -> Result<RawFd, PerfError>;

    fn enable(&self, fd: RawFd, group: bool) -> Result<(), PerfError>;
    fn disable(&self, fd: RawFd, group: bool) -> Result<(), PerfError>;
    fn set_filter(&self, fd: RawFd, filter: &str) -> Result<(), PerfError>;
    /// Redirects sampling output of `fd` into the ring of `leader_fd`.
    fn set_output(&self, fd: RawFd, leader_fd: RawFd) -> Result<(), PerfError>;
    /// The kernel-assigned event id, as it appears in sample `id` fields.
    fn event_id(&self, fd: RawFd) -> Result<u64, PerfError>;
    /// Maps the metadata page plus `2^ring_pages` data pages.
    fn map_ring(&self, fd: RawFd, ring_pages: usize) -> Result<RingBuffer, PerfError>;
    fn close(&self, fd: RawFd);
}

/// [`PerfBackend`] backed by the running kernel.
pub struct KernelBackend;

impl PerfBackend for KernelBackend {
    fn open(
        &self,
        attr: &EventAttr,
        name: &str,
        pid: i32,
        cpu: i32,
        group_fd: RawFd,
        flags: u64,
    ) -> Result<RawFd, PerfError> {
        let bytes = attr.to_bytes();
        let rc = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                bytes.as_ptr(),
                pid as libc::c_long,
                cpu as libc::c_long,
                group_fd as libc::c_long,
                flags as libc::c_long,
            )
        };
        if rc < 0 {
            let errno = Errno::last();
            return Err(match errno {
                Errno::EPERM | Errno::EACCES => PerfError::Permission {
                    name: name.to_string(),
                },
                source => PerfError::Open {
                    name: name.to_string(),
                    source,
                },
            });
        }
        Ok(rc as RawFd)
    }

    fn enable(&self, fd: RawFd, group: bool) -> Result<(), PerfError> {
        let arg = if group { PERF_IOC_FLAG_GROUP } else { 0 };
        ioctl(fd, PERF_EVENT_IOC_ENABLE, arg, "PERF_EVENT_IOC_ENABLE")
    }

    fn disable(&self, fd: RawFd, group: bool) -> Result<(), PerfError> {
        let arg = if group { PERF_IOC_FLAG_GROUP } else { 0 };
        ioctl(fd, PERF_EVENT_IOC_DISABLE, arg, "PERF_EVENT_IOC_DISABLE")
    }

    fn set_filter(&self, fd: RawFd, filter: &str) -> Result<(), PerfError> {
        let filter = CString::new(filter).map_err(|_| PerfError::Ioctl {
            op: "PERF_EVENT_IOC_SET_FILTER",
            fd,
            source: Errno::EINVAL,
        })?;
        let rc = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_SET_FILTER, filter.as_ptr()) };
        check_ioctl(rc, fd, "PERF_EVENT_IOC_SET_FILTER")
    }

    fn set_output(&self, fd: RawFd, leader_fd: RawFd) -> Result<(), PerfError> {
        let rc = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_SET_OUTPUT, leader_fd as libc::c_ulong) };
        check_ioctl(rc, fd, "PERF_EVENT_IOC_SET_OUTPUT")
    }

    fn event_id(&self, fd: RawFd) -> Result<u64, PerfError> {
        let mut id: u64 = 0;
        let rc = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ID, &mut id) };
        check_ioctl(rc, fd, "PERF_EVENT_IOC_ID")?;
        Ok(id)
    }

    fn map_ring(&self, fd: RawFd, ring_pages: usize) -> Result<RingBuffer, PerfError> {
        let page_size = page_size();
        let len = (1 + (1usize << ring_pages)) * page_size;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(PerfError::Mmap {
                len,
                source: Errno::last(),
            });
        }
        Ok(unsafe { RingBuffer::from_mapped(base as *mut u8, len, page_size) })
    }

    fn close(&self, fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }
}

fn ioctl(fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong, op: &'static str) -> Result<(), PerfError> {
    let rc = unsafe { libc::ioctl(fd, request, arg) };
    check_ioctl(rc, fd, op)
}

fn check_ioctl(rc: libc::c_int, fd: RawFd, op: &'static str) -> Result<(), PerfError> {
    if rc < 0 {
        return Err(PerfError::Ioctl {
            op,
            fd,
            source: Errno::last(),
        });
    }
    Ok(())
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// The set of online CPU ids, from `/sys/devices/system/cpu/online`
/// (e.g. `0-3,5`), falling back to `0..nproc`.
pub fn online_cpus() -> Vec<i32> {
    if let Ok(contents) = std::fs::read_to_string("/sys/devices/system/cpu/online") {
        if let Some(cpus) = parse_cpu_list(contents.trim()) {
            return cpus;
        }
    }
    let nproc = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    (0..nproc.max(1) as i32).collect()
}

fn parse_cpu_list(list: &str) -> Option<Vec<i32>> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: i32 = lo.trim().parse().ok()?;
                let hi: i32 = hi.trim().parse().ok()?;
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().ok()?),
        }
    }
    if cpus.is_empty() {
        None
    } else {
        Some(cpus)
    }
}
