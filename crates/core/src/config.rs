//! Queue configuration via `queue.toml`
//!
//! A queue directory may carry a `queue.toml` next to its segments. On first
//! open a default file is written; to change settings, edit the file and
//! reopen the queue.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the queue directory.
pub const CONFIG_FILE_NAME: &str = "queue.toml";

/// Padding skipped when no overlap hint is available (32 KiB).
pub const DEFAULT_RECOVERY_PADDING: u32 = 32 << 10;

/// How many bytes header recovery quarantines behind a stuck header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PaddingPolicy {
    /// Half the backing store's overlap size when it exposes one,
    /// otherwise `bytes`.
    Auto {
        /// Fallback size
        bytes: u32,
    },
    /// Always `bytes`, whatever the backing store says.
    Fixed {
        /// Padding size
        bytes: u32,
    },
}

impl Default for PaddingPolicy {
    fn default() -> Self {
        PaddingPolicy::Auto {
            bytes: DEFAULT_RECOVERY_PADDING,
        }
    }
}

impl PaddingPolicy {
    /// Raw padding size before alignment, given the store's overlap hint.
    pub fn padding_for(&self, overlap_size: Option<u64>) -> u64 {
        match *self {
            PaddingPolicy::Auto { bytes } => match overlap_size {
                Some(overlap) => (overlap / 2).min(i32::MAX as u64),
                None => bytes as u64,
            },
            PaddingPolicy::Fixed { bytes } => bytes as u64,
        }
    }
}

/// Header recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Registered strategy name for new segments (default: `"timed"`)
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Recover-and-retry rounds before giving up (default: 16)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Padding sizing
    #[serde(default)]
    pub padding: PaddingPolicy,
}

fn default_strategy() -> String {
    "timed".to_string()
}

fn default_max_attempts() -> u32 {
    16
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            strategy: default_strategy(),
            max_attempts: default_max_attempts(),
            padding: PaddingPolicy::default(),
        }
    }
}

/// Queue configuration loaded from `queue.toml`.
///
/// # Example
///
/// ```toml
/// timeout_ms = 10000
/// read_only = false
///
/// [recovery]
/// strategy = "timed"
/// max_attempts = 16
/// padding = { mode = "auto", bytes = 32768 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Header-write and lock timeout in milliseconds (default: 10000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Open the queue without mutating shared state
    #[serde(default)]
    pub read_only: bool,
    /// Size of each segment file in bytes (default: 16MB)
    #[serde(default = "default_segment_capacity")]
    pub segment_capacity: u64,
    /// Size of the directory listing table file (default: 64KB)
    #[serde(default = "default_table_capacity")]
    pub table_capacity: u64,
    /// Header recovery settings
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_segment_capacity() -> u64 {
    16 * 1024 * 1024
}

fn default_table_capacity() -> u64 {
    64 * 1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            timeout_ms: default_timeout_ms(),
            read_only: false,
            segment_capacity: default_segment_capacity(),
            table_capacity: default_table_capacity(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration for testing (small files, short timeouts).
    pub fn for_testing() -> Self {
        QueueConfig {
            timeout_ms: 50,
            read_only: false,
            segment_capacity: 64 * 1024,
            table_capacity: 8 * 1024,
            recovery: RecoveryConfig {
                padding: PaddingPolicy::Fixed { bytes: 256 },
                ..RecoveryConfig::default()
            },
        }
    }

    /// Set the timeout (builder pattern).
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Mark the queue read-only (builder pattern).
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the segment capacity (builder pattern).
    pub fn with_segment_capacity(mut self, bytes: u64) -> Self {
        self.segment_capacity = bytes;
        self
    }

    /// Set the padding policy (builder pattern).
    pub fn with_padding(mut self, padding: PaddingPolicy) -> Self {
        self.recovery.padding = padding;
        self
    }

    /// Set the recovery retry bound (builder pattern).
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.recovery.max_attempts = attempts;
        self
    }

    /// Timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.segment_capacity < 4096 {
            return Err(ConfigError::SegmentTooSmall(self.segment_capacity));
        }
        if self.table_capacity < 1024 {
            return Err(ConfigError::TableTooSmall(self.table_capacity));
        }
        if self.recovery.max_attempts == 0 {
            return Err(ConfigError::NoRecoveryAttempts);
        }
        if self.recovery.strategy.is_empty() {
            return Err(ConfigError::MissingStrategy);
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Queue configuration
#
# Timeout for header writes and recovery locks, in milliseconds.
timeout_ms = 10000

# Open without mutating the directory listing (monitoring tools).
read_only = false

# Segment file size in bytes.
segment_capacity = 16777216

# Directory listing table size in bytes.
table_capacity = 65536

[recovery]
# Recovery strategy written into new segments.
strategy = "timed"
# Recover-and-retry rounds before a header write gives up.
max_attempts = 16
# "auto" uses half the store's overlap size when known, else `bytes`.
# "fixed" always uses `bytes`.
padding = { mode = "auto", bytes = 32768 }
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: QueueConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| ConfigError::Write {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Load `queue.toml` from `dir`, writing the default first if missing.
    pub fn load_or_create(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        Self::write_default_if_missing(&path)?;
        Self::from_file(&path)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Timeout must be positive
    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,

    /// Segment capacity below the minimum (4KB)
    #[error("segment_capacity {0} is below the 4KB minimum")]
    SegmentTooSmall(u64),

    /// Table capacity below the minimum (1KB)
    #[error("table_capacity {0} is below the 1KB minimum")]
    TableTooSmall(u64),

    /// Recovery needs at least one attempt
    #[error("recovery.max_attempts must be at least 1")]
    NoRecoveryAttempts,

    /// Recovery strategy name is empty
    #[error("recovery.strategy must not be empty")]
    MissingStrategy,

    /// Config file could not be read
    #[error("Failed to read config file '{path}': {reason}")]
    Read {
        /// File path
        path: String,
        /// Underlying error
        reason: String,
    },

    /// Config file could not be parsed
    #[error("Failed to parse config file '{path}': {reason}")]
    Parse {
        /// File path
        path: String,
        /// Underlying error
        reason: String,
    },

    /// Config file could not be written
    #[error("Failed to write config file '{path}': {reason}")]
    Write {
        /// File path
        path: String,
        /// Underlying error
        reason: String,
    },

    /// Config could not be serialized
    #[error("Failed to serialize config: {0}")]
    Serialize(String),
}
