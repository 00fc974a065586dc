//! argus is a container-aware kernel telemetry sensor. It taps the
//! `perf_event` subsystem (tracepoints, kprobes) to deliver a live stream
//! of system events attributed to the containers they originate from.
//!
//! The heavy lifting lives in the workspace crates: `perf-common` owns the
//! perf acquisition and decoding hot paths, `argus-core` the event model
//! and process tracking, `docker-client` the container metadata lookups.
//! This crate wires them into the `argusd` daemon.

pub mod sensor;

/// Init logger. We log from info level and above and hide module paths.
/// If RUST_LOG is set, we assume the user wants to debug something and use
/// env_logger default behaviour.
pub fn init_logger(verbose: u8) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
        return;
    }
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::builder()
        .filter_level(level)
        .format_target(false)
        .init();
}
