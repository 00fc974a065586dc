//! The kernel event descriptor and its binary codec.
//!
//! [`EventAttr`] mirrors `struct perf_event_attr` with the unions lifted
//! into enums. [`EventAttr::encode`] emits the exact `PERF_ATTR_SIZE_VER5`
//! layout `perf_event_open(2)` accepts; the field subset selected in
//! `sample_type` fully determines the layout of every sample record, so the
//! decoder in [`crate::decode`] and the kernel must agree bit for bit.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::decode::CodecError;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;
pub const PERF_TYPE_BREAKPOINT: u32 = 5;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

/// `PERF_ATTR_SIZE_VER5`: the attr layout this codec targets, through
/// `aux_watermark` and `sample_max_stack`.
pub const ATTR_SIZE_VER5: u32 = 112;

bitflags! {
    /// `sample_type`: selects which optional fields appear in each
    /// `PERF_RECORD_SAMPLE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SampleFormat: u64 {
        const IP = 1 << 0;
        const TID = 1 << 1;
        const TIME = 1 << 2;
        const ADDR = 1 << 3;
        const READ = 1 << 4;
        const CALLCHAIN = 1 << 5;
        const ID = 1 << 6;
        const CPU = 1 << 7;
        const PERIOD = 1 << 8;
        const STREAM_ID = 1 << 9;
        const RAW = 1 << 10;
        const BRANCH_STACK = 1 << 11;
        const REGS_USER = 1 << 12;
        const STACK_USER = 1 << 13;
        const WEIGHT = 1 << 14;
        const DATA_SRC = 1 << 15;
        const IDENTIFIER = 1 << 16;
        const TRANSACTION = 1 << 17;
    }
}

bitflags! {
    /// `read_format`: layout of values returned by `read(2)` on the fd and
    /// of the `READ` section of a sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadFormat: u64 {
        const TOTAL_TIME_ENABLED = 1 << 0;
        const TOTAL_TIME_RUNNING = 1 << 1;
        const ID = 1 << 2;
        const GROUP = 1 << 3;
    }
}

bitflags! {
    /// The boolean attr flags, at their kernel bit positions. `freq`,
    /// `watermark` and the two `precise_ip` bits are not represented here;
    /// they are derived from [`Sampling`], [`Wakeup`] and
    /// [`EventAttr::precise_ip`] when the flag word is packed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrFlags: u64 {
        const DISABLED = 1 << 0;
        const INHERIT = 1 << 1;
        const PINNED = 1 << 2;
        const EXCLUSIVE = 1 << 3;
        const EXCLUDE_USER = 1 << 4;
        const EXCLUDE_KERNEL = 1 << 5;
        const EXCLUDE_HV = 1 << 6;
        const EXCLUDE_IDLE = 1 << 7;
        const MMAP = 1 << 8;
        const COMM = 1 << 9;
        const INHERIT_STAT = 1 << 11;
        const ENABLE_ON_EXEC = 1 << 12;
        const TASK = 1 << 13;
        const MMAP_DATA = 1 << 17;
        const SAMPLE_ID_ALL = 1 << 18;
        const EXCLUDE_HOST = 1 << 19;
        const EXCLUDE_GUEST = 1 << 20;
        const EXCLUDE_CALLCHAIN_KERNEL = 1 << 21;
        const EXCLUDE_CALLCHAIN_USER = 1 << 22;
        const MMAP2 = 1 << 23;
        const COMM_EXEC = 1 << 24;
        const USE_CLOCKID = 1 << 25;
        const CONTEXT_SWITCH = 1 << 26;
        const WRITE_BACKWARD = 1 << 27;
        const NAMESPACES = 1 << 28;
        const KSYMBOL = 1 << 29;
        const BPF_EVENT = 1 << 30;
        const AUX_OUTPUT = 1 << 31;
        const CGROUP = 1 << 32;
        const TEXT_POKE = 1 << 33;
    }
}

const FLAG_FREQ: u64 = 1 << 10;
const FLAG_WATERMARK: u64 = 1 << 14;
const PRECISE_IP_SHIFT: u32 = 15;
const PRECISE_IP_MASK: u64 = 0b11 << PRECISE_IP_SHIFT;

/// The `sample_period`/`sample_freq` union, disambiguated by the `freq`
/// flag bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Period(u64),
    Frequency(u64),
}

impl Default for Sampling {
    fn default() -> Self {
        Sampling::Period(0)
    }
}

/// The `wakeup_events`/`wakeup_watermark` union, disambiguated by the
/// `watermark` flag bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// Wake the reader every N sample records.
    Events(u32),
    /// Wake the reader every N ring-buffer bytes.
    Watermark(u32),
}

impl Default for Wakeup {
    fn default() -> Self {
        Wakeup::Events(0)
    }
}

/// A `perf_event_attr` with the unions lifted into enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventAttr {
    /// `PERF_TYPE_*`, or a dynamic PMU id.
    pub ty: u32,
    pub config: u64,
    pub sampling: Sampling,
    pub sample_type: SampleFormat,
    pub read_format: ReadFormat,
    pub flags: AttrFlags,
    /// Instruction-pointer skid constraint, 0..=3.
    pub precise_ip: u8,
    pub wakeup: Wakeup,
    pub bp_type: u32,
    /// `bp_addr` / `kprobe_func` / `config1`.
    pub config1: u64,
    /// `bp_len` / `kprobe_addr` / `config2`.
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
}

impl EventAttr {
    fn pack_flags(&self) -> u64 {
        let mut word = self.flags.bits();
        if matches!(self.sampling, Sampling::Frequency(_)) {
            word |= FLAG_FREQ;
        }
        if matches!(self.wakeup, Wakeup::Watermark(_)) {
            word |= FLAG_WATERMARK;
        }
        word | (u64::from(self.precise_ip & 0b11) << PRECISE_IP_SHIFT)
    }

    /// Serialises the attr into the `PERF_ATTR_SIZE_VER5` binary layout.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.ty);
        buf.put_u32_le(ATTR_SIZE_VER5);
        buf.put_u64_le(self.config);
        buf.put_u64_le(match self.sampling {
            Sampling::Period(n) | Sampling::Frequency(n) => n,
        });
        buf.put_u64_le(self.sample_type.bits());
        buf.put_u64_le(self.read_format.bits());
        buf.put_u64_le(self.pack_flags());
        buf.put_u32_le(match self.wakeup {
            Wakeup::Events(n) | Wakeup::Watermark(n) => n,
        });
        buf.put_u32_le(self.bp_type);
        buf.put_u64_le(self.config1);
        buf.put_u64_le(self.config2);
        buf.put_u64_le(self.branch_sample_type);
        buf.put_u64_le(self.sample_regs_user);
        buf.put_u32_le(self.sample_stack_user);
        buf.put_i32_le(self.clockid);
        buf.put_u64_le(self.sample_regs_intr);
        buf.put_u32_le(self.aux_watermark);
        buf.put_u16_le(self.sample_max_stack);
        buf.put_u16_le(0); // __reserved_2
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ATTR_SIZE_VER5 as usize);
        self.encode(&mut buf);
        buf
    }

    /// Decodes an attr previously produced by [`encode`](Self::encode).
    /// Shorter (older) layouts are accepted as long as the declared size
    /// covers the fixed header.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        if buf.remaining() < 8 {
            return Err(CodecError::Truncated("perf_event_attr header"));
        }
        let ty = buf.get_u32_le();
        let size = buf.get_u32_le();
        if size < 64 || buf.remaining() < size as usize - 8 {
            return Err(CodecError::BadAttrSize(size));
        }
        let mut body = buf.copy_to_bytes(size as usize - 8);

        let config = body.get_u64_le();
        let period_or_freq = body.get_u64_le();
        let sample_type = SampleFormat::from_bits_truncate(body.get_u64_le());
        let read_format = ReadFormat::from_bits_truncate(body.get_u64_le());
        let word = body.get_u64_le();
        let wakeup_value = body.get_u32_le();
        let bp_type = body.get_u32_le();

        let mut attr = EventAttr {
            ty,
            config,
            sampling: if word & FLAG_FREQ != 0 {
                Sampling::Frequency(period_or_freq)
            } else {
                Sampling::Period(period_or_freq)
            },
            sample_type,
            read_format,
            flags: AttrFlags::from_bits_truncate(
                word & !(FLAG_FREQ | FLAG_WATERMARK | PRECISE_IP_MASK),
            ),
            precise_ip: ((word & PRECISE_IP_MASK) >> PRECISE_IP_SHIFT) as u8,
            wakeup: if word & FLAG_WATERMARK != 0 {
                Wakeup::Watermark(wakeup_value)
            } else {
                Wakeup::Events(wakeup_value)
            },
            bp_type,
            ..Default::default()
        };

        // Extension fields are present only when the declared size says so.
        if body.remaining() >= 8 {
            attr.config1 = body.get_u64_le();
        }
        if body.remaining() >= 8 {
            attr.config2 = body.get_u64_le();
        }
        if body.remaining() >= 8 {
            attr.branch_sample_type = body.get_u64_le();
        }
        if body.remaining() >= 8 {
            attr.sample_regs_user = body.get_u64_le();
        }
        if body.remaining() >= 8 {
            attr.sample_stack_user = body.get_u32_le();
            attr.clockid = body.get_i32_le();
        }
        if body.remaining() >= 8 {
            attr.sample_regs_intr = body.get_u64_le();
        }
        if body.remaining() >= 8 {
            attr.aux_watermark = body.get_u32_le();
            attr.sample_max_stack = body.get_u16_le();
        }
        Ok(attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracepoint_attr() -> EventAttr {
        EventAttr {
            ty: PERF_TYPE_TRACEPOINT,
            config: 310,
            sampling: Sampling::Period(1),
            sample_type: SampleFormat::TID
                | SampleFormat::TIME
                | SampleFormat::ID
                | SampleFormat::CPU
                | SampleFormat::STREAM_ID
                | SampleFormat::RAW,
            read_format: ReadFormat::ID | ReadFormat::GROUP,
            flags: AttrFlags::DISABLED | AttrFlags::EXCLUDE_HV,
            wakeup: Wakeup::Events(1),
            ..Default::default()
        }
    }

    #[test]
    fn encoded_size_matches_ver5() {
        assert_eq!(tracepoint_attr().to_bytes().len(), ATTR_SIZE_VER5 as usize);
    }

    #[test]
    fn roundtrip_tracepoint_attr() {
        let attr = tracepoint_attr();
        let mut bytes = bytes::Bytes::from(attr.to_bytes());
        assert_eq!(EventAttr::decode(&mut bytes).unwrap(), attr);
    }

    #[test]
    fn roundtrip_exercises_unions() {
        let attrs = [
            EventAttr {
                ty: PERF_TYPE_SOFTWARE,
                config: PERF_COUNT_SW_CPU_CLOCK,
                sampling: Sampling::Frequency(1000),
                wakeup: Wakeup::Watermark(4096),
                precise_ip: 2,
                flags: AttrFlags::DISABLED | AttrFlags::INHERIT | AttrFlags::COMM,
                ..Default::default()
            },
            EventAttr {
                ty: PERF_TYPE_BREAKPOINT,
                bp_type: 0x3, // HW_BREAKPOINT_RW
                config1: 0xffff_8000_dead_beef,
                config2: 8,
                sample_type: SampleFormat::IP | SampleFormat::TID,
                ..Default::default()
            },
            EventAttr {
                ty: PERF_TYPE_HARDWARE,
                config: 0,
                sampling: Sampling::Period(100_000),
                branch_sample_type: 0x10,
                sample_regs_user: 0xff,
                sample_stack_user: 8192,
                sample_max_stack: 127,
                ..Default::default()
            },
        ];
        for attr in attrs {
            let mut bytes = bytes::Bytes::from(attr.to_bytes());
            assert_eq!(EventAttr::decode(&mut bytes).unwrap(), attr, "{attr:?}");
        }
    }

    #[test]
    fn flag_word_bit_positions() {
        let attr = EventAttr {
            sampling: Sampling::Frequency(1),
            wakeup: Wakeup::Watermark(1),
            precise_ip: 3,
            flags: AttrFlags::DISABLED,
            ..Default::default()
        };
        let bytes = attr.to_bytes();
        // The flag word lives at byte offset 40.
        let word = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
        assert_eq!(word & 1, 1, "disabled is bit 0");
        assert_ne!(word & FLAG_FREQ, 0, "freq is bit 10");
        assert_ne!(word & FLAG_WATERMARK, 0, "watermark is bit 14");
        assert_eq!((word >> PRECISE_IP_SHIFT) & 0b11, 3, "precise_ip bits 15-16");
    }

    #[test]
    fn truncated_attr_is_rejected() {
        let attr = tracepoint_attr();
        let bytes = attr.to_bytes();
        let mut short = bytes::Bytes::copy_from_slice(&bytes[..40]);
        assert!(EventAttr::decode(&mut short).is_err());
    }
}
