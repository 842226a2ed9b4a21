//! Cross-process coordination for the Strata queue
//!
//! This crate keeps independent processes sharing a queue directory in step:
//!
//! - Listing: lowest/highest created cycle and a modification counter in a
//!   shared table (TableDirectoryListing)
//! - Recovery: getting writers past headers claimed by dead processes, and
//!   rebuilding half-written index pointers (TimedStoreRecovery)
//! - Registry: recovery strategy lookup by the tag stored in each segment
//! - Directory: one handle tying listing, segments and recovery together

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod directory;
pub mod listing;
pub mod recovery;

pub use directory::{DirectoryOptions, QueueDirectory};
pub use listing::{
    DirectoryListing, TableDirectoryListing, HIGHEST_CREATED_CYCLE, LOCK, LOWEST_CREATED_CYCLE,
    MOD_COUNT, UNSET_MAX_CYCLE, UNSET_MIN_CYCLE,
};
pub use recovery::{
    RecoveryContext, RecoveryError, RecoveryFactory, RecoveryRegistry, RecoveryResult,
    StoreRecovery, TimedStoreRecovery, RECOVERY_MARKER,
};
