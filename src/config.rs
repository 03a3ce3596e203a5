use crate::sequencer::SequencerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the shutdown marker file.
pub const SHUTDOWN_FILE_ENV: &str = "WEBJOBS_SHUTDOWN_FILE";
/// Environment variable carrying the telemetry connection string.
pub const CONNECTION_STRING_ENV: &str = "APPLICATIONINSIGHTS_CONNECTION_STRING";

/// Top-level configuration loaded from worker.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub work: WorkConfig,
    pub shutdown: ShutdownConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkConfig {
    pub output_dir: PathBuf,
    pub output_file: String,
    pub tick_interval_secs: u64,
    /// Stop after this many iterations; 0 stops before any work runs.
    pub max_iterations: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub shutdown_file: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub heartbeat_count: u32,
    pub heartbeat_interval_secs: u64,
    pub watcher_join_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub connection_string: Option<String>,
}

/// Errors that stop the worker before the loop starts.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    MissingConnectionString,
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::MissingConnectionString => write!(
                f,
                "telemetry connection string is required (set [telemetry] connection_string or {})",
                CONNECTION_STRING_ENV
            ),
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::MissingConnectionString | ConfigError::Invalid { .. } => None,
        }
    }
}

impl WorkerConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Overlay values from the environment. Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = non_empty(SHUTDOWN_FILE_ENV) {
            self.shutdown.shutdown_file = Some(PathBuf::from(path));
        }
        if let Some(conn) = non_empty(CONNECTION_STRING_ENV) {
            self.telemetry.connection_string = Some(conn);
        }
    }

    /// Check everything needed before the worker may start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.telemetry.connection_string {
            Some(s) if !s.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingConnectionString),
        }
        if self.work.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "work.tick_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.shutdown.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "shutdown.poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.work.output_file.is_empty() {
            return Err(ConfigError::Invalid {
                field: "work.output_file",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.work.tick_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.shutdown.poll_interval_secs)
    }

    pub fn sequencer(&self) -> SequencerConfig {
        SequencerConfig {
            heartbeat_count: self.shutdown.heartbeat_count,
            heartbeat_interval: Duration::from_secs(self.shutdown.heartbeat_interval_secs),
            watcher_join_timeout: Duration::from_secs(self.shutdown.watcher_join_timeout_secs),
        }
    }
}

// --- Default implementations ---

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            output_file: "timestamps.txt".to_string(),
            tick_interval_secs: 1,
            max_iterations: None,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            shutdown_file: None,
            poll_interval_secs: 1,
            heartbeat_count: 30,
            heartbeat_interval_secs: 1,
            watcher_join_timeout_secs: 5,
        }
    }
}
