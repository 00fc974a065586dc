//! Sensor configuration.
//!
//! An immutable record read once from `ARGUS_SENSOR_*` environment
//! variables at startup and passed to the components that need it. There
//! is no global configuration object.

use perf_common::subscription::SubscriptionOptions;
use thiserror::Error;

const ENV_PREFIX: &str = "ARGUS_SENSOR_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    /// Node name reported in telemetry; defaults to the hostname.
    pub node_name: String,

    /// Names of cgroups to monitor for events. Each must exist in the
    /// `perf_event` hierarchy. Empty, `""` or `"/"` monitors the whole
    /// system.
    pub cgroup_names: Vec<String>,

    /// Data pages per kernel ring buffer.
    pub ring_buffer_pages: usize,

    /// Buffer length of the internal event channels.
    pub channel_buffer_length: usize,

    /// Upper bound on cached process info entries.
    pub process_info_cache_size: usize,

    /// Seconds an idle telemetry subscription is kept alive.
    pub subscription_timeout_secs: i64,

    /// Ignore a missing tracing filesystem mount instead of mounting it.
    pub dont_mount_tracing: bool,

    /// Ignore a missing perf_event cgroup hierarchy instead of mounting it.
    pub dont_mount_perf_event: bool,

    /// Path of the container engine's unix socket.
    pub docker_socket: String,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            node_name: hostname(),
            cgroup_names: Vec::new(),
            ring_buffer_pages: 8,
            channel_buffer_length: 1024,
            process_info_cache_size: 131_072,
            subscription_timeout_secs: 5,
            dont_mount_tracing: false,
            dont_mount_perf_event: false,
            docker_socket: "/var/run/docker.sock".to_string(),
        }
    }
}

impl SensorConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable
    /// source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let lookup = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = lookup("NODE_NAME") {
            config.node_name = value;
        }
        if let Some(value) = lookup("CGROUP_NAME") {
            config.cgroup_names = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(value) = lookup("RING_BUFFER_PAGES") {
            config.ring_buffer_pages = parse(value, "RING_BUFFER_PAGES")?;
        }
        if let Some(value) = lookup("CHANNEL_BUFFER_LENGTH") {
            config.channel_buffer_length = parse(value, "CHANNEL_BUFFER_LENGTH")?;
        }
        if let Some(value) = lookup("PROCESS_INFO_CACHE_SIZE") {
            config.process_info_cache_size = parse(value, "PROCESS_INFO_CACHE_SIZE")?;
        }
        if let Some(value) = lookup("SUBSCRIPTION_TIMEOUT") {
            config.subscription_timeout_secs = parse(value, "SUBSCRIPTION_TIMEOUT")?;
        }
        if let Some(value) = lookup("DONT_MOUNT_TRACING") {
            config.dont_mount_tracing = parse_bool(value, "DONT_MOUNT_TRACING")?;
        }
        if let Some(value) = lookup("DONT_MOUNT_PERF_EVENT") {
            config.dont_mount_perf_event = parse_bool(value, "DONT_MOUNT_PERF_EVENT")?;
        }
        if let Some(value) = lookup("DOCKER_SOCKET") {
            config.docker_socket = value;
        }
        Ok(config)
    }

    /// The options handed to `Subscription::new`.
    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            ring_pages: self.ring_buffer_pages,
            cgroups: self.cgroup_names.clone(),
            cpus: None,
        }
    }
}

fn parse<T: std::str::FromStr>(value: String, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{key}"),
        value,
    })
}

fn parse_bool(value: String, key: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: format!("{ENV_PREFIX}{key}"),
            value,
        }),
    }
}

fn hostname() -> String {
    nix::sys::utsname::uname()
        .map(|u| u.nodename().to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<SensorConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        SensorConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.ring_buffer_pages, 8);
        assert_eq!(config.channel_buffer_length, 1024);
        assert_eq!(config.process_info_cache_size, 131_072);
        assert_eq!(config.subscription_timeout_secs, 5);
        assert!(config.cgroup_names.is_empty());
        assert!(!config.dont_mount_tracing);
        assert!(!config.dont_mount_perf_event);
        assert_eq!(config.docker_socket, "/var/run/docker.sock");
    }

    #[test]
    fn environment_overrides_apply() {
        let config = config_from(&[
            ("RING_BUFFER_PAGES", "32"),
            ("CGROUP_NAME", "docker, kubepods"),
            ("DONT_MOUNT_TRACING", "true"),
            ("SUBSCRIPTION_TIMEOUT", "30"),
            ("NODE_NAME", "worker-7"),
        ])
        .unwrap();
        assert_eq!(config.ring_buffer_pages, 32);
        assert_eq!(config.cgroup_names, vec!["docker", "kubepods"]);
        assert!(config.dont_mount_tracing);
        assert_eq!(config.subscription_timeout_secs, 30);
        assert_eq!(config.node_name, "worker-7");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(config_from(&[("RING_BUFFER_PAGES", "eight")]).is_err());
        assert!(config_from(&[("DONT_MOUNT_TRACING", "maybe")]).is_err());
    }

    #[test]
    fn subscription_options_carry_scope() {
        let config = config_from(&[("CGROUP_NAME", "docker")]).unwrap();
        let options = config.subscription_options();
        assert_eq!(options.ring_pages, 8);
        assert_eq!(options.cgroups, vec!["docker"]);
    }
}
