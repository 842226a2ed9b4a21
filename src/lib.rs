//! Strata queue - cross-process coordination for memory-mapped rolling logs
//!
//! Independent processes that share a queue directory coordinate entirely
//! through atomics on memory-mapped files: a shared counter table records
//! which cycles have segments, and header recovery gets writers past blocks
//! claimed by processes that died mid-write.
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_queue::{QueueConfig, QueueDirectory};
//!
//! let queue = QueueDirectory::open("/var/lib/app/queue", QueueConfig::new())?;
//! let segment = queue.acquire_segment(42)?;
//! let recovery = queue.recovery_for(&segment)?;
//! queue.append(&segment, recovery.as_ref(), b"hello", false)?;
//!
//! let listing = queue.listing();
//! println!("cycles {}..={}", listing.min_created_cycle(), listing.max_created_cycle());
//! ```
//!
//! # Architecture
//!
//! - `strata-queue-core`: header words, cycle naming, clocks, warnings, config
//! - `strata-queue-storage`: mapped regions, shared values, the counter table
//!   and segments
//! - `strata-queue-durability`: directory listing, header recovery, and the
//!   queue directory handle

pub use strata_queue_core::{
    header, CollectingWarnSink, Clock, ConfigError, CycleNaming, Error, ManualClock,
    NumberedCycles, PaddingPolicy, QueueConfig, RecoveryConfig, Result, SystemClock,
    TracingWarnSink, WarnSink,
};
pub use strata_queue_durability::{
    DirectoryListing, DirectoryOptions, QueueDirectory, RecoveryContext, RecoveryError,
    RecoveryRegistry, StoreRecovery, TableDirectoryListing, TimedStoreRecovery,
    UNSET_MAX_CYCLE, UNSET_MIN_CYCLE,
};
pub use strata_queue_storage::{
    Block, FramedWriter, HeaderStore, HeaderWriteOutcome, MappedSegment, SegmentOptions,
    SharedCounterTable, SharedValue, TableOptions,
};
