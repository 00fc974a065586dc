//! The event model the sensor ships to consumers.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use perf_common::FieldValue;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub(crate) header: Header,
    pub(crate) payload: Payload,
}

impl Event {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pid={} comm={}{} {}",
            self.header.timestamp,
            self.header.pid,
            self.header.comm,
            match &self.header.container_id {
                Some(id) => format!(" container={}", &id[..12.min(id.len())]),
                None => String::new(),
            },
            self.payload,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub pid: i32,
    pub parent_pid: i32,
    pub comm: String,
    /// Container the process belongs to, if any.
    pub container_id: Option<String>,
    /// CPU the originating record was taken on.
    pub cpu: Option<u32>,
    /// Nanoseconds on the perf clock.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum Payload {
    ProcessFork {
        child_pid: i32,
    },
    ProcessExec {
        filename: String,
    },
    ProcessExit,
    FileOpened {
        filename: String,
        flags: i32,
    },
    NetworkConnect {
        address: String,
        port: u16,
    },
    SyscallEntered {
        number: i64,
    },
    /// Any tracepoint without a dedicated variant: the decoded payload
    /// fields as delivered by the perf core.
    Tracepoint {
        name: String,
        fields: BTreeMap<String, FieldDatum>,
    },
}

impl Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::ProcessFork { child_pid } => write!(f, "fork child={child_pid}"),
            Payload::ProcessExec { filename } => write!(f, "exec {filename}"),
            Payload::ProcessExit => write!(f, "exit"),
            Payload::FileOpened { filename, flags } => {
                write!(f, "open {filename} flags={flags:#x}")
            }
            Payload::NetworkConnect { address, port } => write!(f, "connect {address}:{port}"),
            Payload::SyscallEntered { number } => write!(f, "syscall {number}"),
            Payload::Tracepoint { name, fields } => {
                write!(f, "{name}")?;
                for (key, value) in fields {
                    write!(f, " {key}={value}")?;
                }
                Ok(())
            }
        }
    }
}

/// Serialisable mirror of [`perf_common::FieldValue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldDatum {
    Signed(i64),
    Unsigned(u64),
    Text(String),
    Bytes(Vec<u8>),
    SignedList(Vec<i64>),
    UnsignedList(Vec<u64>),
}

impl From<&FieldValue> for FieldDatum {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Signed(v) => FieldDatum::Signed(*v),
            FieldValue::Unsigned(v) => FieldDatum::Unsigned(*v),
            FieldValue::Str(v) => FieldDatum::Text(v.clone()),
            FieldValue::Bytes(v) => FieldDatum::Bytes(v.clone()),
            FieldValue::SignedList(v) => FieldDatum::SignedList(v.clone()),
            FieldValue::UnsignedList(v) => FieldDatum::UnsignedList(v.clone()),
        }
    }
}

impl Display for FieldDatum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldDatum::Signed(v) => write!(f, "{v}"),
            FieldDatum::Unsigned(v) => write!(f, "{v}"),
            FieldDatum::Text(v) => write!(f, "{v:?}"),
            FieldDatum::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            FieldDatum::SignedList(v) => write!(f, "{v:?}"),
            FieldDatum::UnsignedList(v) => write!(f, "{v:?}"),
        }
    }
}

/// Collects the perf-core field map into the serialisable form.
pub fn field_data<'a, I>(fields: I) -> BTreeMap<String, FieldDatum>
where
    I: IntoIterator<Item = (&'a String, &'a FieldValue)>,
{
    fields
        .into_iter()
        .map(|(name, value)| (name.clone(), FieldDatum::from(value)))
        .collect()
}
