//! Decoding of the binary perf record stream.
//!
//! A frame copied out of a ring buffer is `struct perf_event_header`
//! followed by a type-specific body. `PERF_RECORD_SAMPLE` bodies are walked
//! in the canonical `sample_type` order; the attr that opened the group
//! determines which fields are present, so decoder and kernel agree bit for
//! bit. Raw tracepoint payloads are turned into typed field maps against a
//! parsed [`TraceFormat`]; interpreting their meaning is left to higher
//! layers.

use std::collections::HashMap;

use bytes::Buf;
use thiserror::Error;

use crate::{
    attr::{EventAttr, ReadFormat, SampleFormat},
    tracefs::TraceFormat,
};

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("record truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unknown record type {0}")]
    UnknownRecordType(u32),

    #[error("record declares impossible {what} count {count}")]
    ImpossibleCount { what: &'static str, count: u64 },

    #[error("perf_event_attr declares bad size {0}")]
    BadAttrSize(u32),
}

/// `struct perf_event_header`.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub ty: u32,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    pub fn parse(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::Truncated("perf_event_header"));
        }
        Ok(Self {
            ty: buf.get_u32_le(),
            misc: buf.get_u16_le(),
            size: buf.get_u16_le(),
        })
    }
}

/// One entry of a sample's `READ` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadValue {
    pub value: u64,
    pub id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadValues {
    pub time_enabled: Option<u64>,
    pub time_running: Option<u64>,
    pub values: Vec<ReadValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchEntry {
    pub from: u64,
    pub to: u64,
    pub flags: u64,
}

/// A decoded `PERF_RECORD_SAMPLE`. Optional fields mirror `sample_type`;
/// `id` is always present when decoding multi-event groups (the group attrs
/// carry `PERF_SAMPLE_ID`).
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub ip: Option<u64>,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub time: Option<u64>,
    pub addr: Option<u64>,
    pub id: u64,
    pub stream_id: Option<u64>,
    pub cpu: Option<u32>,
    pub period: Option<u64>,
    pub read: Option<ReadValues>,
    pub callchain: Option<Vec<u64>>,
    /// Raw tracepoint payload, undecoded.
    pub raw: Option<Vec<u8>>,
    /// Payload decoded against the tracepoint format, when one is known.
    pub fields: HashMap<String, FieldValue>,
    pub branch_stack: Option<Vec<BranchEntry>>,
    pub regs_user: Option<Vec<u64>>,
    pub stack_user: Option<Vec<u8>>,
    pub weight: Option<u64>,
    pub data_src: Option<u64>,
    pub transaction: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MmapRecord {
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct CommRecord {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
}

/// Body shared by `PERF_RECORD_FORK` and `PERF_RECORD_EXIT`.
#[derive(Debug, Clone, Copy)]
pub struct TaskRecord {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottleRecord {
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
}

#[derive(Debug, Clone)]
pub enum Record {
    Sample(Sample),
    Mmap(MmapRecord),
    Comm(CommRecord),
    Fork(TaskRecord),
    Exit(TaskRecord),
    Lost { id: u64, count: u64 },
    Throttle(ThrottleRecord),
    Unthrottle(ThrottleRecord),
}

/// Decodes one record body. `attr` is the descriptor of the group leader
/// that owns the originating ring; it fixes the sample layout.
pub fn decode_record(
    attr: &EventAttr,
    header: RecordHeader,
    mut body: &[u8],
) -> Result<Record, CodecError> {
    let buf = &mut body;
    match header.ty {
        PERF_RECORD_SAMPLE => Ok(Record::Sample(decode_sample(attr, buf)?)),
        PERF_RECORD_MMAP => {
            let pid = get_u32(buf, "mmap pid")?;
            let tid = get_u32(buf, "mmap tid")?;
            let addr = get_u64(buf, "mmap addr")?;
            let len = get_u64(buf, "mmap len")?;
            let pgoff = get_u64(buf, "mmap pgoff")?;
            let filename = get_cstring(buf);
            Ok(Record::Mmap(MmapRecord {
                pid,
                tid,
                addr,
                len,
                pgoff,
                filename,
            }))
        }
        PERF_RECORD_MMAP2 => {
            let pid = get_u32(buf, "mmap2 pid")?;
            let tid = get_u32(buf, "mmap2 tid")?;
            let addr = get_u64(buf, "mmap2 addr")?;
            let len = get_u64(buf, "mmap2 len")?;
            let pgoff = get_u64(buf, "mmap2 pgoff")?;
            // maj, min, ino, ino_generation, prot, flags: not propagated.
            for what in ["mmap2 maj/min", "mmap2 ino", "mmap2 ino_generation"] {
                get_u64(buf, what)?;
            }
            get_u64(buf, "mmap2 prot/flags")?;
            let filename = get_cstring(buf);
            Ok(Record::Mmap(MmapRecord {
                pid,
                tid,
                addr,
                len,
                pgoff,
                filename,
            }))
        }
        PERF_RECORD_COMM => {
            let pid = get_u32(buf, "comm pid")?;
            let tid = get_u32(buf, "comm tid")?;
            let comm = get_cstring(buf);
            Ok(Record::Comm(CommRecord { pid, tid, comm }))
        }
        PERF_RECORD_FORK | PERF_RECORD_EXIT => {
            let task = TaskRecord {
                pid: get_u32(buf, "task pid")?,
                ppid: get_u32(buf, "task ppid")?,
                tid: get_u32(buf, "task tid")?,
                ptid: get_u32(buf, "task ptid")?,
                time: get_u64(buf, "task time")?,
            };
            Ok(if header.ty == PERF_RECORD_FORK {
                Record::Fork(task)
            } else {
                Record::Exit(task)
            })
        }
        PERF_RECORD_LOST => Ok(Record::Lost {
            id: get_u64(buf, "lost id")?,
            count: get_u64(buf, "lost count")?,
        }),
        PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => {
            let throttle = ThrottleRecord {
                time: get_u64(buf, "throttle time")?,
                id: get_u64(buf, "throttle id")?,
                stream_id: get_u64(buf, "throttle stream id")?,
            };
            Ok(if header.ty == PERF_RECORD_THROTTLE {
                Record::Throttle(throttle)
            } else {
                Record::Unthrottle(throttle)
            })
        }
        other => Err(CodecError::UnknownRecordType(other)),
    }
}

/// Walks the `sample_type` bitset in the canonical order and consumes the
/// matching fields.
pub fn decode_sample(attr: &EventAttr, buf: &mut &[u8]) -> Result<Sample, CodecError> {
    let st = attr.sample_type;
    let mut sample = Sample::default();

    if st.contains(SampleFormat::IDENTIFIER) {
        sample.id = get_u64(buf, "identifier")?;
    }
    if st.contains(SampleFormat::IP) {
        sample.ip = Some(get_u64(buf, "ip")?);
    }
    if st.contains(SampleFormat::TID) {
        sample.pid = Some(get_u32(buf, "pid")?);
        sample.tid = Some(get_u32(buf, "tid")?);
    }
    if st.contains(SampleFormat::TIME) {
        sample.time = Some(get_u64(buf, "time")?);
    }
    if st.contains(SampleFormat::ADDR) {
        sample.addr = Some(get_u64(buf, "addr")?);
    }
    if st.contains(SampleFormat::ID) {
        sample.id = get_u64(buf, "id")?;
    }
    if st.contains(SampleFormat::STREAM_ID) {
        sample.stream_id = Some(get_u64(buf, "stream id")?);
    }
    if st.contains(SampleFormat::CPU) {
        sample.cpu = Some(get_u32(buf, "cpu")?);
        get_u32(buf, "cpu padding")?;
    }
    if st.contains(SampleFormat::PERIOD) {
        sample.period = Some(get_u64(buf, "period")?);
    }
    if st.contains(SampleFormat::READ) {
        sample.read = Some(decode_read_values(attr.read_format, buf)?);
    }
    if st.contains(SampleFormat::CALLCHAIN) {
        let nr = get_u64(buf, "callchain length")?;
        if nr > (buf.remaining() / 8) as u64 {
            return Err(CodecError::ImpossibleCount {
                what: "callchain",
                count: nr,
            });
        }
        let mut chain = Vec::with_capacity(nr as usize);
        for _ in 0..nr {
            chain.push(get_u64(buf, "callchain entry")?);
        }
        sample.callchain = Some(chain);
    }
    if st.contains(SampleFormat::RAW) {
        let size = get_u32(buf, "raw size")? as usize;
        if buf.remaining() < size {
            return Err(CodecError::Truncated("raw payload"));
        }
        let mut payload = vec![0u8; size];
        buf.copy_to_slice(&mut payload);
        sample.raw = Some(payload);
    }
    if st.contains(SampleFormat::BRANCH_STACK) {
        let nr = get_u64(buf, "branch stack length")?;
        if nr > (buf.remaining() / 24) as u64 {
            return Err(CodecError::ImpossibleCount {
                what: "branch stack",
                count: nr,
            });
        }
        let mut entries = Vec::with_capacity(nr as usize);
        for _ in 0..nr {
            entries.push(BranchEntry {
                from: get_u64(buf, "branch from")?,
                to: get_u64(buf, "branch to")?,
                flags: get_u64(buf, "branch flags")?,
            });
        }
        sample.branch_stack = Some(entries);
    }
    if st.contains(SampleFormat::REGS_USER) {
        let abi = get_u64(buf, "regs abi")?;
        if abi != 0 {
            let count = attr.sample_regs_user.count_ones() as usize;
            let mut regs = Vec::with_capacity(count);
            for _ in 0..count {
                regs.push(get_u64(buf, "user register")?);
            }
            sample.regs_user = Some(regs);
        }
    }
    if st.contains(SampleFormat::STACK_USER) {
        let size = get_u64(buf, "stack size")? as usize;
        if buf.remaining() < size {
            return Err(CodecError::Truncated("stack data"));
        }
        let mut stack = vec![0u8; size];
        buf.copy_to_slice(&mut stack);
        if size != 0 {
            let dyn_size = get_u64(buf, "stack dyn size")? as usize;
            stack.truncate(dyn_size.min(size));
        }
        sample.stack_user = Some(stack);
    }
    if st.contains(SampleFormat::WEIGHT) {
        sample.weight = Some(get_u64(buf, "weight")?);
    }
    if st.contains(SampleFormat::DATA_SRC) {
        sample.data_src = Some(get_u64(buf, "data src")?);
    }
    if st.contains(SampleFormat::TRANSACTION) {
        sample.transaction = Some(get_u64(buf, "transaction")?);
    }

    Ok(sample)
}

fn decode_read_values(format: ReadFormat, buf: &mut &[u8]) -> Result<ReadValues, CodecError> {
    let mut read = ReadValues::default();
    if format.contains(ReadFormat::GROUP) {
        let nr = get_u64(buf, "read group length")?;
        if nr > (buf.remaining() / 8) as u64 {
            return Err(CodecError::ImpossibleCount {
                what: "read group",
                count: nr,
            });
        }
        if format.contains(ReadFormat::TOTAL_TIME_ENABLED) {
            read.time_enabled = Some(get_u64(buf, "time enabled")?);
        }
        if format.contains(ReadFormat::TOTAL_TIME_RUNNING) {
            read.time_running = Some(get_u64(buf, "time running")?);
        }
        for _ in 0..nr {
            let value = get_u64(buf, "read value")?;
            let id = if format.contains(ReadFormat::ID) {
                Some(get_u64(buf, "read id")?)
            } else {
                None
            };
            read.values.push(ReadValue { value, id });
        }
    } else {
        let value = get_u64(buf, "read value")?;
        if format.contains(ReadFormat::TOTAL_TIME_ENABLED) {
            read.time_enabled = Some(get_u64(buf, "time enabled")?);
        }
        if format.contains(ReadFormat::TOTAL_TIME_RUNNING) {
            read.time_running = Some(get_u64(buf, "time running")?);
        }
        let id = if format.contains(ReadFormat::ID) {
            Some(get_u64(buf, "read id")?)
        } else {
            None
        };
        read.values.push(ReadValue { value, id });
    }
    Ok(read)
}

/// A single decoded tracepoint payload field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Signed(i64),
    Unsigned(u64),
    Str(String),
    Bytes(Vec<u8>),
    SignedList(Vec<i64>),
    UnsignedList(Vec<u64>),
}

/// Decodes a raw tracepoint payload against its format descriptor.
///
/// Fields whose declared extent falls outside the payload are skipped; the
/// kernel never emits such records, so a mismatch means the format and the
/// payload disagree and the remaining fields cannot be trusted either.
pub fn decode_raw_fields(
    format: &TraceFormat,
    payload: &[u8],
) -> Result<HashMap<String, FieldValue>, CodecError> {
    let mut fields = HashMap::with_capacity(format.fields.len());
    for field in &format.fields {
        if field.offset + field.size > payload.len() {
            return Err(CodecError::Truncated("tracepoint payload field"));
        }
        let data = &payload[field.offset..field.offset + field.size];
        let value = if field.data_loc {
            if data.len() < 4 {
                return Err(CodecError::Truncated("__data_loc locator"));
            }
            let locator = u32::from_le_bytes(data[..4].try_into().unwrap());
            let data_offset = (locator & 0xffff) as usize;
            let data_len = (locator >> 16) as usize;
            if data_offset + data_len > payload.len() {
                return Err(CodecError::Truncated("__data_loc data"));
            }
            let data = &payload[data_offset..data_offset + data_len];
            if field.is_string {
                FieldValue::Str(cstr_lossy(data))
            } else {
                FieldValue::Bytes(data.to_vec())
            }
        } else if let Some(len) = field.array_len {
            if field.is_string {
                FieldValue::Str(cstr_lossy(data))
            } else {
                decode_array(data, len, field.signed)
            }
        } else {
            decode_scalar(data, field.signed)
        };
        fields.insert(field.name.clone(), value);
    }
    Ok(fields)
}

fn decode_scalar(data: &[u8], signed: bool) -> FieldValue {
    if signed {
        let v = match data.len() {
            1 => data[0] as i8 as i64,
            2 => i16::from_le_bytes(data.try_into().unwrap()) as i64,
            4 => i32::from_le_bytes(data.try_into().unwrap()) as i64,
            8 => i64::from_le_bytes(data.try_into().unwrap()),
            _ => return FieldValue::Bytes(data.to_vec()),
        };
        FieldValue::Signed(v)
    } else {
        let v = match data.len() {
            1 => data[0] as u64,
            2 => u16::from_le_bytes(data.try_into().unwrap()) as u64,
            4 => u32::from_le_bytes(data.try_into().unwrap()) as u64,
            8 => u64::from_le_bytes(data.try_into().unwrap()),
            _ => return FieldValue::Bytes(data.to_vec()),
        };
        FieldValue::Unsigned(v)
    }
}

fn decode_array(data: &[u8], len: usize, signed: bool) -> FieldValue {
    if len == 0 || data.len() % len != 0 {
        return FieldValue::Bytes(data.to_vec());
    }
    let elem = data.len() / len;
    let chunks = data.chunks_exact(elem);
    if signed {
        FieldValue::SignedList(
            chunks
                .map(|c| match decode_scalar(c, true) {
                    FieldValue::Signed(v) => v,
                    _ => 0,
                })
                .collect(),
        )
    } else {
        FieldValue::UnsignedList(
            chunks
                .map(|c| match decode_scalar(c, false) {
                    FieldValue::Unsigned(v) => v,
                    _ => 0,
                })
                .collect(),
        )
    }
}

fn cstr_lossy(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn get_u64(buf: &mut &[u8], what: &'static str) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated(what));
    }
    Ok(buf.get_u64_le())
}

fn get_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated(what));
    }
    Ok(buf.get_u32_le())
}

/// Consumes the rest of the body as a NUL-padded string, as the kernel
/// emits for `comm` and `filename` fields of control records.
fn get_cstring(buf: &mut &[u8]) -> String {
    let s = cstr_lossy(buf);
    let len = buf.remaining();
    buf.advance(len);
    s
}
