use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced while loading or validating stream configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("configuration field {field} is invalid: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Tuning recognized by the [`EventStream`](crate::stream::EventStream)
/// constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStreamConfig {
    /// Prefix for worker and scheduler thread names.
    pub name: String,
    /// Hash-partitioned executor width.
    pub worker_count: usize,
    /// Bounded replay hand-off depth; caps in-flight replay transactions.
    pub replay_buffer: usize,
    /// Delay before a detected gap triggers a scheduled range replay.
    /// 0 fires on the next scheduler tick.
    pub gap_replay_delay_ms: u64,
    /// Bias subtracted from replay start timestamps to absorb journal clock
    /// skew across nodes.
    pub max_clock_skew_ms: u64,
    /// Per-transaction consumption deadline during replay.
    pub consume_timeout_ms: u64,
    /// Overall replay-drain deadline. `None` waits indefinitely.
    pub max_replay_wait_ms: Option<u64>,
    /// Sequencer buffer bound per stream; 0 leaves it unbounded, relying on
    /// the replay hand-off for back-pressure.
    pub sequence_buffer_limit: usize,
    /// Retained JSON log lines.
    pub log_capacity: usize,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            name: "sequentra".to_string(),
            worker_count: 4,
            replay_buffer: 256,
            gap_replay_delay_ms: 500,
            max_clock_skew_ms: 1_000,
            consume_timeout_ms: 60_000,
            max_replay_wait_ms: None,
            sequence_buffer_limit: 0,
            log_capacity: 1_024,
        }
    }
}

impl EventStreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_count",
                reason: "must be > 0".to_string(),
            });
        }
        if self.replay_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "replay_buffer",
                reason: "must be > 0".to_string(),
            });
        }
        if self.consume_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "consume_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn gap_replay_delay(&self) -> Duration {
        Duration::from_millis(self.gap_replay_delay_ms)
    }

    pub fn consume_timeout(&self) -> Duration {
        Duration::from_millis(self.consume_timeout_ms)
    }

    pub fn max_replay_wait(&self) -> Option<Duration> {
        self.max_replay_wait_ms.map(Duration::from_millis)
    }
}

/// Loads and validates a JSON configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<EventStreamConfig, ConfigError> {
    let path_ref = path.as_ref();
    let payload = fs::read_to_string(path_ref).map_err(|source| ConfigError::ReadError {
        path: path_ref.to_path_buf(),
        source,
    })?;
    let config: EventStreamConfig =
        serde_json::from_str(&payload).map_err(|source| ConfigError::ParseError {
            path: path_ref.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}
