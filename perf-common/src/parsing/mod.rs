//! Parsers for data the sensor pulls from the filesystem.

pub mod procfs;
