//! Configuration structures.
//!
//! Configuration is loaded from a JSON file (or string) and falls back to
//! defaults for every missing section.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Largest frame the 2-byte harbor length prefix can describe.
pub const MAX_HARBOR_FRAME: usize = u16::MAX as usize;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Scheduler and registry configuration.
    #[serde(default)]
    pub kernel: KernelConfig,

    /// Timer wheel configuration.
    #[serde(default)]
    pub timer: TimerConfig,

    /// Liveness monitor configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Cluster routing configuration.
    #[serde(default)]
    pub harbor: HarborConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Initial environment table (GETENV/SETENV).
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Config {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Reject settings the kernel cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.kernel.workers == 0 {
            return Err(Error::config("kernel.workers must be at least 1"));
        }
        if self.timer.tick.is_zero() {
            return Err(Error::config("timer.tick must be non-zero"));
        }
        if self.monitor.interval.is_zero() {
            return Err(Error::config("monitor.interval must be non-zero"));
        }
        if self.harbor.max_frame_bytes > MAX_HARBOR_FRAME {
            return Err(Error::config(format!(
                "harbor.max_frame_bytes {} exceeds the 2-byte length prefix ({})",
                self.harbor.max_frame_bytes, MAX_HARBOR_FRAME
            )));
        }
        if self.kernel.node_id != 0 && self.harbor.coordinator_addr.is_none() {
            return Err(Error::config(format!(
                "node {} needs harbor.coordinator_addr",
                self.kernel.node_id
            )));
        }
        Ok(())
    }
}

/// Scheduler and registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Cluster node id of this process (0 = standalone, no harbor).
    pub node_id: u8,

    /// Number of worker threads draining the ready queue.
    pub workers: usize,

    /// Initial slot count of every mailbox (rounded up to a power of two).
    pub mailbox_initial_capacity: usize,

    /// Initial slot count of the global ready queue.
    pub global_queue_initial_capacity: usize,

    /// Initial handle table size (rounded up to a power of two).
    pub registry_initial_slots: usize,

    /// Mailbox length at which the first overload warning is logged.
    pub mailbox_overload_threshold: usize,

    /// Longest a worker sleeps waiting for a ready mailbox.
    #[serde(with = "humantime_serde")]
    pub idle_sleep: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            workers: 8,
            mailbox_initial_capacity: 64,
            global_queue_initial_capacity: 64,
            registry_initial_slots: 4,
            mailbox_overload_threshold: 1024,
            idle_sleep: Duration::from_millis(10),
        }
    }
}

/// Timer wheel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Wall-clock length of one wheel tick.
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
        }
    }
}

/// Liveness monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,

    /// Sampling interval; a worker inside one callback for a whole interval
    /// is reported as endless.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
        }
    }
}

/// Cluster routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarborConfig {
    /// Address peers connect to for delivering messages to this node.
    pub listen_addr: Option<String>,

    /// Address of the coordinating node.
    pub coordinator_addr: Option<String>,

    /// Run the coordinator inside this process, bound to this address.
    pub coordinator_listen: Option<String>,

    /// Maximum frame size (header + payload), at most 65535.
    pub max_frame_bytes: usize,

    /// Timeout for outbound peer and coordinator connections.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            coordinator_addr: None,
            coordinator_listen: None,
            max_frame_bytes: MAX_HARBOR_FRAME,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timer.tick, Duration::from_millis(10));
        assert_eq!(config.harbor.max_frame_bytes, 65535);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json_str(
            r#"{ "kernel": { "workers": 2 }, "timer": { "tick": "5ms" }, "env": { "start": "main" } }"#,
        )
        .unwrap();
        assert_eq!(config.kernel.workers, 2);
        assert_eq!(config.kernel.mailbox_overload_threshold, 1024);
        assert_eq!(config.timer.tick, Duration::from_millis(5));
        assert_eq!(config.env.get("start").map(String::as_str), Some("main"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = Config::from_json_str(r#"{ "kernel": { "workers": 0 } }"#).unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_rejects_oversized_frames() {
        let err =
            Config::from_json_str(r#"{ "harbor": { "max_frame_bytes": 70000 } }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_cluster_node_needs_coordinator() {
        let err = Config::from_json_str(r#"{ "kernel": { "node_id": 2 } }"#).unwrap_err();
        assert!(err.to_string().contains("coordinator_addr"));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "monitor": {{ "interval": "2s", "enabled": false }} }}"#).unwrap();
        let config = Config::from_json_file(file.path()).unwrap();
        assert!(!config.monitor.enabled);
        assert_eq!(config.monitor.interval, Duration::from_secs(2));
    }
}
