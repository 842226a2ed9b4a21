//! Header recovery
//!
//! - `timed`: the deadline-lock strategy (TimedStoreRecovery)
//! - `registry`: strategy lookup by the tag persisted in each segment
//! - `error`: RecoveryError
//!
//! A writer that times out waiting on a header claimed by a dead process
//! hands the segment to its [`StoreRecovery`], which quarantines the stuck
//! block and retries. Index rebuilds run under the strategy's lock.

pub mod error;
pub mod registry;
pub mod timed;

use std::time::Duration;

use strata_queue_storage::{FramedWriter, HeaderWriteOutcome, SharedArray, SharedValue};

pub use error::{RecoveryError, RecoveryResult};
pub use registry::{RecoveryContext, RecoveryFactory, RecoveryRegistry};
pub use timed::{TimedStoreRecovery, RECOVERY_MARKER};

/// Recovery strategy for one segment.
pub trait StoreRecovery: Send + Sync {
    /// Spin until the recovery lock is held; returns the deadline set.
    fn acquire_lock(&self, timeout: Duration) -> i64;

    /// One attempt at the recovery lock.
    fn try_acquire_lock(&self, timeout: Duration) -> Option<i64>;

    /// Release a lock taken with `deadline`. Warns if it was lost.
    fn release_lock(&self, deadline: i64);

    /// Reset a half-written top-level index pointer and rebuild it with
    /// `action`, under the lock.
    fn recover_index_to_index(
        &self,
        slot: &SharedValue,
        action: &mut dyn FnMut() -> RecoveryResult<i64>,
        timeout: Duration,
    ) -> RecoveryResult<i64>;

    /// Same as [`recover_index_to_index`](Self::recover_index_to_index) for
    /// entry `index` of a secondary index array.
    fn recover_secondary_address(
        &self,
        array: &SharedArray,
        index: usize,
        action: &mut dyn FnMut() -> RecoveryResult<i64>,
        timeout: Duration,
    ) -> RecoveryResult<i64>;

    /// Get past the stuck header at the log's write position and claim a
    /// header for `length` bytes.
    fn recover_and_write_header(
        &self,
        log: &dyn FramedWriter,
        length: u32,
        timeout: Duration,
        last_position: Option<&SharedValue>,
    ) -> RecoveryResult<u64>;

    /// Claim a header, recovering when the slot ahead stays claimed for
    /// longer than `timeout`.
    ///
    /// Returns the offset of the claimed header, or
    /// [`RecoveryError::EndOfData`] when the segment is full.
    fn write_header(
        &self,
        log: &dyn FramedWriter,
        length: u32,
        safe_length: u32,
        timeout: Duration,
        last_position: Option<&SharedValue>,
    ) -> RecoveryResult<u64> {
        match log.write_header(length, safe_length, timeout, last_position) {
            HeaderWriteOutcome::Completed(offset) => Ok(offset),
            HeaderWriteOutcome::EndOfData => Err(RecoveryError::EndOfData {
                offset: log.write_position(),
            }),
            HeaderWriteOutcome::TimedOut => {
                self.recover_and_write_header(log, length, timeout, last_position)
            }
        }
    }
}
