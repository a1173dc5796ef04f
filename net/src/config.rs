//! Reactor configuration.
//!
//! Loaded from a TOML file or built programmatically. Validation rejects
//! values outside the ranges the event loop and write queue rely on.

use serde::Deserialize;
use std::path::Path;

/// Default I/O-to-task time ratio percentage.
const DEFAULT_IO_RATIO: u32 = 50;

/// Consecutive premature selector returns before a rebuild. Zero disables
/// detection; values below this floor are rejected.
const DEFAULT_REBUILD_THRESHOLD: u32 = 512;
const MIN_REBUILD_THRESHOLD: u32 = 3;

/// Per-entry bookkeeping bytes added to a write's payload size when
/// accounting pending outbound bytes.
const DEFAULT_ENTRY_OVERHEAD: usize = 96;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;
const DEFAULT_LOW_WATER_MARK: usize = 32 * 1024;
const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;
const DEFAULT_BACKLOG: u32 = 4096;

/// Configuration for an event loop and the channels it drives.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReactorConfig {
    /// Percentage of loop time reserved for I/O versus queued tasks.
    /// 100 runs tasks uncapped after each I/O pass.
    #[serde(default = "default_io_ratio")]
    pub io_ratio: u32,

    /// Consecutive premature selector wakeups before the selector is
    /// rebuilt. 0 disables busy-spin detection.
    #[serde(default = "default_rebuild_threshold")]
    pub rebuild_threshold: u32,

    /// Bytes of bookkeeping overhead charged per queued write entry.
    #[serde(default = "default_entry_overhead")]
    pub entry_overhead: usize,

    /// Pending outbound bytes above which a channel turns unwritable.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,

    /// Pending outbound bytes below which a channel turns writable again.
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,

    /// Capacity of each buffer allocated for a socket read.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Listen backlog for bound listeners.
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Surface remote write-shutdown as an input-shutdown event instead of
    /// closing the connection.
    #[serde(default)]
    pub allow_half_closure: bool,

    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_io_ratio() -> u32 {
    DEFAULT_IO_RATIO
}

fn default_rebuild_threshold() -> u32 {
    DEFAULT_REBUILD_THRESHOLD
}

fn default_entry_overhead() -> usize {
    DEFAULT_ENTRY_OVERHEAD
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

fn default_low_water_mark() -> usize {
    DEFAULT_LOW_WATER_MARK
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            io_ratio: DEFAULT_IO_RATIO,
            rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
            entry_overhead: DEFAULT_ENTRY_OVERHEAD,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
            allow_half_closure: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl ReactorConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.io_ratio) {
            return Err(ConfigError::Invalid(format!(
                "io_ratio must be in 1..=100, got {}",
                self.io_ratio
            )));
        }
        if self.rebuild_threshold != 0 && self.rebuild_threshold < MIN_REBUILD_THRESHOLD {
            return Err(ConfigError::Invalid(format!(
                "rebuild_threshold must be 0 or >= {}, got {}",
                MIN_REBUILD_THRESHOLD, self.rebuild_threshold
            )));
        }
        if self.low_water_mark > self.high_water_mark {
            return Err(ConfigError::Invalid(format!(
                "low_water_mark {} exceeds high_water_mark {}",
                self.low_water_mark, self.high_water_mark
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in output.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the emitting module target.
    #[serde(default)]
    pub target: bool,

    /// Include thread names (useful with multiple loops).
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
