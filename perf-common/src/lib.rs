//! Kernel perf_event plumbing for the argus sensor.
//!
//! This crate owns the hot path between the kernel and the rest of the
//! sensor: it opens per-CPU event groups through `perf_event_open(2)`,
//! maps and drains their ring buffers, decodes the binary record stream,
//! and fans decoded samples out to registered handlers. The entry point is
//! [`subscription::Subscription`]; everything else backs it.
//!
//! Nothing here interprets what a tracepoint payload *means* — samples are
//! delivered as typed field maps and higher layers classify them.

pub mod attr;
pub mod decode;
pub mod demux;
pub mod group;
pub mod maps;
pub mod parsing;
pub mod ring;
pub mod subscription;
pub mod sys;
pub mod tracefs;

#[cfg(test)]
pub(crate) mod testutil;

pub use attr::{AttrFlags, EventAttr, ReadFormat, SampleFormat, Sampling, Wakeup};
pub use decode::{FieldValue, Record, Sample};
pub use demux::{CounterSnapshot, EventState, Handler, ProcessListener, RegisteredEvent};
pub use subscription::{EventSpec, Subscription, SubscriptionOptions, Token};
pub use sys::{KernelBackend, PerfBackend, PerfError};
pub use tracefs::{TraceFormat, TraceFormatCache, TracefsError};

pub use nix::unistd::Pid;
