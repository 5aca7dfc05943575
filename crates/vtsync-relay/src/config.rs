//! Relay configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file
//! at all) yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub buffer: BufferConfig,
    pub injector: InjectorConfig,
    pub queue: QueueConfig,
}

/// Session buffer manager settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BufferConfig {
    /// Idle window after the last output chunk before subscribers are notified
    pub debounce_ms: u64,
    /// How often sessions are checked for process exit
    pub liveness_interval_ms: u64,
    /// Pending snapshots per subscriber before updates are dropped
    pub subscriber_capacity: usize,
    /// Poll interval of the stream-log fallback
    pub poll_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            liveness_interval_ms: 5000,
            subscriber_capacity: 10,
            poll_interval_ms: 50,
        }
    }
}

impl BufferConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check the channel capacity and timer periods
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriber_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer.subscriber_capacity must be at least 1".to_string(),
            ));
        }
        if self.liveness_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "buffer intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stream-safe injector settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InjectorConfig {
    /// Output silence after which pending payloads are written directly
    pub idle_threshold_ms: u64,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 50,
        }
    }
}

impl InjectorConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }
}

/// Flow-controlled write queue settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Queued bytes at which the queue pauses
    pub high_watermark: usize,
    /// Queued bytes at which a paused queue resumes
    pub low_watermark: usize,
    /// Entries allowed while paused before new writes are dropped
    pub max_operations: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_watermark: 1024 * 1024,
            low_watermark: 256 * 1024,
            max_operations: 1000,
        }
    }
}

impl QueueConfig {
    /// Check the watermark ordering and limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_watermark >= self.high_watermark {
            return Err(ConfigError::Invalid(format!(
                "queue.low_watermark ({}) must be below queue.high_watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.max_operations == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_operations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl RelayConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Serialize to pretty TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.buffer.validate()?;
        self.queue.validate()
    }
}
