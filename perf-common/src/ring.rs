//! The memory-mapped perf ring buffer.
//!
//! Layout per the kernel ABI: the first page is `struct
//! perf_event_mmap_page` with the `data_head`/`data_tail` cursors at fixed
//! offsets, followed by `2^n` data pages the kernel writes records into.
//! The kernel advances `data_head`; the single reader copies complete
//! records out (stitching the two halves of a record that wraps at the ring
//! boundary) and advances `data_tail` after each record is dispatched.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{decode::RecordHeader, sys::PerfError};

// Offsets of the cursors inside perf_event_mmap_page.
const DATA_HEAD: usize = 1024;
const DATA_TAIL: usize = 1032;

/// Page size used for synthetic (test) rings.
#[cfg(any(test, feature = "test-utils"))]
const SYNTHETIC_PAGE: usize = 4096;

/// Outcome of one drain pass over a ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingRead {
    /// Records handed to the dispatch callback.
    pub dispatched: usize,
    /// Malformed records skipped by resyncing to `data_head`.
    pub skipped: usize,
}

pub struct RingBuffer {
    base: *mut u8,
    /// Total mapping length, metadata page included.
    len: usize,
    data: *mut u8,
    data_size: u64,
    mapped: bool,
    /// Keeps synthetic rings alive; mapped rings own their pages via munmap.
    _backing: Option<Box<[u8]>>,
}

// The ring is written by the kernel and drained by exactly one reader
// task; the cursors are accessed atomically.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Wraps a region returned by `mmap` on a perf event fd.
    ///
    /// # Safety
    ///
    /// `base` must point to a live mapping of `len` bytes laid out as one
    /// metadata page of `page_size` bytes followed by the data pages. The
    /// mapping is unmapped on drop.
    pub(crate) unsafe fn from_mapped(base: *mut u8, len: usize, page_size: usize) -> Self {
        Self {
            base,
            len,
            data: base.add(page_size),
            data_size: (len - page_size) as u64,
            mapped: true,
            _backing: None,
        }
    }

    /// An in-memory ring with the kernel layout, for tests. The "kernel"
    /// side is driven with [`push_record`](Self::push_record) or
    /// [`write_at`](Self::write_at)/[`force_cursors`](Self::force_cursors).
    #[cfg(any(test, feature = "test-utils"))]
    pub fn synthetic(ring_pages: usize) -> Self {
        let len = (1 + (1usize << ring_pages)) * SYNTHETIC_PAGE;
        let mut backing = vec![0u8; len].into_boxed_slice();
        let base = backing.as_mut_ptr();
        Self {
            base,
            len,
            data: unsafe { base.add(SYNTHETIC_PAGE) },
            data_size: (len - SYNTHETIC_PAGE) as u64,
            mapped: false,
            _backing: Some(backing),
        }
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    fn head(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(DATA_HEAD) as *const AtomicU64) }
    }

    fn tail(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(DATA_TAIL) as *const AtomicU64) }
    }

    /// Copies `out.len()` bytes starting at stream position `pos`,
    /// stitching across the ring boundary when the range wraps.
    fn copy_at(&self, pos: u64, out: &mut [u8]) {
        let start = (pos % self.data_size) as usize;
        let len = out.len();
        let size = self.data_size as usize;
        if start + len <= size {
            unsafe {
                std::ptr::copy_nonoverlapping(self.data.add(start), out.as_mut_ptr(), len);
            }
        } else {
            let first = size - start;
            unsafe {
                std::ptr::copy_nonoverlapping(self.data.add(start), out.as_mut_ptr(), first);
                std::ptr::copy_nonoverlapping(
                    self.data,
                    out.as_mut_ptr().add(first),
                    len - first,
                );
            }
        }
    }

    /// Drains every complete record currently in the ring, invoking
    /// `dispatch` for each and advancing `data_tail` afterwards.
    ///
    /// A record with an impossible declared length poisons the framing of
    /// everything behind it, so the reader resyncs `data_tail` to
    /// `data_head` and reports the skip in [`RingRead::skipped`]; reading
    /// continues on the next pass. Only `data_head` behind `data_tail` is
    /// unrecoverable and returned as an error.
    pub fn read_pending<F>(&self, mut dispatch: F) -> Result<RingRead, PerfError>
    where
        F: FnMut(RecordHeader, &[u8]),
    {
        let head = self.head().load(Ordering::Acquire);
        let mut tail = self.tail().load(Ordering::Relaxed);
        if head < tail {
            return Err(PerfError::RingCorrupt(format!(
                "data_head {head} behind data_tail {tail}"
            )));
        }

        let mut read = RingRead::default();
        let mut frame = Vec::new();
        while tail < head {
            let mut header_bytes = [0u8; RecordHeader::SIZE];
            self.copy_at(tail, &mut header_bytes);
            let header = RecordHeader {
                ty: u32::from_le_bytes(header_bytes[0..4].try_into().unwrap()),
                misc: u16::from_le_bytes(header_bytes[4..6].try_into().unwrap()),
                size: u16::from_le_bytes(header_bytes[6..8].try_into().unwrap()),
            };
            let size = header.size as u64;
            if size < RecordHeader::SIZE as u64 || size > self.data_size || tail + size > head {
                log::debug!(
                    "skipping record of impossible length {size} at tail {tail}, resyncing to head"
                );
                read.skipped += 1;
                tail = head;
                self.tail().store(tail, Ordering::Release);
                break;
            }

            frame.resize(size as usize - RecordHeader::SIZE, 0);
            self.copy_at(tail + RecordHeader::SIZE as u64, &mut frame);
            dispatch(header, &frame);

            tail += size;
            self.tail().store(tail, Ordering::Release);
            read.dispatched += 1;
        }
        Ok(read)
    }

    /// Appends a full record (header included) at `data_head`, the way the
    /// kernel would.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn push_record(&self, record: &[u8]) {
        let head = self.head().load(Ordering::Relaxed);
        self.write_at(head, record);
        self.head().store(head + record.len() as u64, Ordering::Release);
    }

    /// Writes raw bytes at an absolute stream position, wrapping at the
    /// ring boundary. Does not move any cursor.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn write_at(&self, pos: u64, bytes: &[u8]) {
        let start = (pos % self.data_size) as usize;
        let size = self.data_size as usize;
        let len = bytes.len();
        assert!(len <= size, "record larger than the ring");
        if start + len <= size {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(start), len);
            }
        } else {
            let first = size - start;
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(start), first);
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    self.data,
                    len - first,
                );
            }
        }
    }

    /// Sets both cursors directly.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn force_cursors(&self, head: u64, tail: u64) {
        self.head().store(head, Ordering::Release);
        self.tail().store(tail, Ordering::Release);
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if self.mapped {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }
}
