//! Shared-memory storage for the Strata queue
//!
//! This crate implements the memory-mapped building blocks that independent
//! processes use to coordinate:
//! - MappedRegion: a `MAP_SHARED` mapping of one file
//! - SharedValue / SharedArray: atomically accessed 64-bit slots
//! - ExpiringLock: a lock whose ownership is a deadline in a shared slot
//! - SharedCounterTable: named slots, created lazily under the table lock
//! - MappedSegment: framed blocks with CAS-claimed header words
//!
//! No OS-level locks are involved anywhere; every cross-process guarantee
//! comes from atomics on the mapped memory.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock;
pub mod region;
pub mod segment;
pub mod store;
pub mod table;
pub mod value;

pub use lock::{ExpiringLock, ExpiringLockGuard};
pub use region::MappedRegion;
pub use segment::{Block, BlockIter, MappedSegment, SegmentOptions, DATA_START, SECONDARY_SLOTS};
pub use store::{FramedWriter, HeaderStore, HeaderWriteOutcome};
pub use table::{LockedTable, SharedCounterTable, TableOptions, DEFAULT_LOCK_KEY, MAX_KEY_LEN};
pub use value::{SharedArray, SharedValue, LONG_NOT_COMPLETE, UNINITIALIZED};
