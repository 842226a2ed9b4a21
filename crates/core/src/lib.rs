//! Core types for the Strata queue coordination layer
//!
//! This crate defines the foundational pieces every other crate shares:
//! - Error: Error type and result alias
//! - Header words: the 32-bit control field in front of every framed block
//! - Cycle naming: segment file name <-> cycle number
//! - Clock: wall-clock source used by the self-expiring locks
//! - Warn sinks: injected receivers for recovery warnings
//! - Config: `queue.toml` settings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod cycle;
pub mod error;
pub mod header;
pub mod warn;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    ConfigError, PaddingPolicy, QueueConfig, RecoveryConfig, CONFIG_FILE_NAME,
    DEFAULT_RECOVERY_PADDING,
};
pub use cycle::{
    is_segment_file, CycleNaming, NumberedCycles, SharedCycleNaming, DIRECTORY_LISTING_FILE,
    SEGMENT_SUFFIX, TABLE_SUFFIX,
};
pub use error::{Error, Result};
pub use header::HeaderState;
pub use warn::{tracing_sink, CollectingWarnSink, SharedWarnSink, TracingWarnSink, WarnSink};
