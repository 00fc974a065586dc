//! Core types of the argus sensor: the event model shipped to consumers,
//! the process context tracker fed by kernel control records, and the
//! immutable sensor configuration.

pub mod config;
pub mod event;
pub mod process_tracker;

pub use config::SensorConfig;
pub use event::{Event, Header, Payload};
pub use process_tracker::{ProcessInfo, ProcessTrackerHandle, TrackerError};
