//! rangegrid.toml configuration parser.
//!
//! Failure-detection windows and client retry budgets are tunables, not
//! constants. Durations use the compact `"500ms"`, `"5s"`, `"1m"` syntax.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid duration {value:?} for {field}")]
    Duration { field: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub monitor: MonitorConfig,
    pub coordinator: CoordinatorConfig,
    pub client: ClientConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Period between agent heartbeats.
    pub heartbeat_interval: String,
    /// Silence after which a server becomes SUSPECT.
    pub suspect_after: String,
    /// Lease length: silence after which a server is DEAD.
    pub dead_after: String,
    /// Period of the monitor's liveness scan.
    pub tick_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Timeout for a single open-region call.
    pub open_timeout: String,
    pub backoff_base: String,
    pub backoff_max: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub max_attempts: u32,
    pub attempt_timeout: String,
    pub retry_pause: String,
    pub retry_pause_max: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: "1s".to_string(),
            suspect_after: "3s".to_string(),
            dead_after: "10s".to_string(),
            tick_interval: "500ms".to_string(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            open_timeout: "5s".to_string(),
            backoff_base: "100ms".to_string(),
            backoff_max: "5s".to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            attempt_timeout: "5s".to_string(),
            retry_pause: "200ms".to_string(),
            retry_pause_max: "2s".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/rangegrid"),
        }
    }
}

impl MonitorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration(&self.heartbeat_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn suspect_after(&self) -> Duration {
        parse_duration(&self.suspect_after).unwrap_or(Duration::from_secs(3))
    }

    pub fn dead_after(&self) -> Duration {
        parse_duration(&self.dead_after).unwrap_or(Duration::from_secs(10))
    }

    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_millis(500))
    }
}

impl CoordinatorConfig {
    pub fn open_timeout(&self) -> Duration {
        parse_duration(&self.open_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn backoff_base(&self) -> Duration {
        parse_duration(&self.backoff_base).unwrap_or(Duration::from_millis(100))
    }

    pub fn backoff_max(&self) -> Duration {
        parse_duration(&self.backoff_max).unwrap_or(Duration::from_secs(5))
    }
}

impl ClientConfig {
    pub fn attempt_timeout(&self) -> Duration {
        parse_duration(&self.attempt_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn retry_pause(&self) -> Duration {
        parse_duration(&self.retry_pause).unwrap_or(Duration::from_millis(200))
    }

    pub fn retry_pause_max(&self) -> Duration {
        parse_duration(&self.retry_pause_max).unwrap_or(Duration::from_secs(2))
    }
}

impl ClusterConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every duration parses and the windows are ordered sensibly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("monitor.heartbeat_interval", &self.monitor.heartbeat_interval),
            ("monitor.suspect_after", &self.monitor.suspect_after),
            ("monitor.dead_after", &self.monitor.dead_after),
            ("monitor.tick_interval", &self.monitor.tick_interval),
            ("coordinator.open_timeout", &self.coordinator.open_timeout),
            ("coordinator.backoff_base", &self.coordinator.backoff_base),
            ("coordinator.backoff_max", &self.coordinator.backoff_max),
            ("client.attempt_timeout", &self.client.attempt_timeout),
            ("client.retry_pause", &self.client.retry_pause),
            ("client.retry_pause_max", &self.client.retry_pause_max),
        ];
        for (field, value) in durations {
            match parse_duration(value) {
                Some(d) if !d.is_zero() => {}
                _ => {
                    return Err(ConfigError::Duration {
                        field,
                        value: value.clone(),
                    });
                }
            }
        }

        if self.monitor.dead_after() <= self.monitor.suspect_after() {
            return Err(ConfigError::Invalid(
                "monitor.dead_after must be longer than monitor.suspect_after".to_string(),
            ));
        }
        if self.coordinator.backoff_max() < self.coordinator.backoff_base() {
            return Err(ConfigError::Invalid(
                "coordinator.backoff_max must be at least coordinator.backoff_base".to_string(),
            ));
        }
        if self.client.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "client.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "1m". Bare numbers are seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.parse::<u64>().ok()?;
        mins.checked_mul(60).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
