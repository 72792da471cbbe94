//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. "wayline=debug". Overridden by
    /// WAYLINE_LOG in the environment.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Participant registry log location.
    pub log_file_location: PathBuf,
    /// Heartbeat publication period; liveliness lease and deadline match it.
    pub heartbeat_period_ms: u64,
    /// Mirror update tick period.
    pub update_period_ms: u64,
    /// How often idle queries are checked for garbage collection.
    pub query_cleanup_period_ms: u64,
    /// How long a query may sit with zero subscribers before erasure.
    pub query_grace_period_ms: u64,
    /// Conflict detector condvar timeout, bounding shutdown latency.
    pub conflict_wait_ms: u64,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file_location: PathBuf::from(".wayline_schedule.reglog"),
            heartbeat_period_ms: 1000,
            update_period_ms: 10,
            query_cleanup_period_ms: 10_000,
            query_grace_period_ms: 30_000,
            conflict_wait_ms: 100,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms)
    }

    pub fn query_cleanup_period(&self) -> Duration {
        Duration::from_millis(self.query_cleanup_period_ms)
    }

    pub fn query_grace_period(&self) -> Duration {
        Duration::from_millis(self.query_grace_period_ms)
    }

    pub fn conflict_wait(&self) -> Duration {
        Duration::from_millis(self.conflict_wait_ms)
    }
}
