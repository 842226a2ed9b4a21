//! Deadline-lock recovery
//!
//! [`TimedStoreRecovery`] serialises index repairs with an [`ExpiringLock`]
//! stored in the segment header, and gets writers past a header that another
//! process claimed and never finished by turning it into a padding
//! meta-data block.
//!
//! # Quarantine
//!
//! ```text
//! before:  [NOT_COMPLETE | len] [ ...whatever the dead writer left... ]
//! staged:  [NOT_COMPLETE | len] [ marker ][ 0 0 0 ... 0 ]     (cursor unchanged)
//! commit:  [META_DATA | size  ] [ marker ][ 0 0 0 ... 0 ] [next header]
//! ```
//!
//! Staging never moves the write cursor, so a failed CAS leaves this handle
//! exactly where it was. Concurrent recoverers stage identical bytes and only
//! one CAS can win.

use std::time::Duration;
use tracing::debug;

use strata_queue_core::header::{self, HEADER_SIZE, LENGTH_MASK, META_DATA};
use strata_queue_core::{PaddingPolicy, SharedClock, SharedWarnSink};
use strata_queue_storage::{
    ExpiringLock, FramedWriter, HeaderWriteOutcome, SharedArray, SharedValue,
    LONG_NOT_COMPLETE,
};

use super::error::{RecoveryError, RecoveryResult};
use super::StoreRecovery;

/// Text staged at the start of a quarantined block
pub const RECOVERY_MARKER: &[u8] = b"!! recovered due to locked header !!";

const COMPONENT: &str = "recovery";

/// Recovery strategy built on a self-expiring lock.
pub struct TimedStoreRecovery {
    lock: ExpiringLock,
    padding: PaddingPolicy,
    max_attempts: u32,
    warnings: SharedWarnSink,
}

impl TimedStoreRecovery {
    /// Tag persisted in segment headers
    pub const TAG: u32 = 1;
    /// Name used in configuration
    pub const NAME: &'static str = "timed";

    /// Strategy whose lock lives in `timestamp`.
    pub fn new(
        timestamp: SharedValue,
        clock: SharedClock,
        warnings: SharedWarnSink,
        padding: PaddingPolicy,
        max_attempts: u32,
    ) -> Self {
        TimedStoreRecovery {
            lock: ExpiringLock::new(timestamp, clock, warnings.clone(), COMPONENT),
            padding,
            max_attempts: max_attempts.max(1),
            warnings,
        }
    }

    /// The recovery lock
    pub fn lock(&self) -> &ExpiringLock {
        &self.lock
    }

    /// Recover-and-retry rounds allowed per header write
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn warn(&self, message: &str) {
        self.warnings.warn(COMPONENT, message);
    }

    /// Run `action` under the lock after resetting a half-written slot.
    ///
    /// The slot is read only once the lock is held.
    fn rebuild(
        &self,
        what: &str,
        slot: &SharedValue,
        action: &mut dyn FnMut() -> RecoveryResult<i64>,
        timeout: Duration,
    ) -> RecoveryResult<i64> {
        let _guard = self.lock.lock(timeout);
        if slot.load_acquire() == LONG_NOT_COMPLETE {
            self.warn(&format!("Rebuilding the {}, resetting to 0", what));
            slot.store_release(0);
        } else {
            self.warn(&format!(
                "The {} value has changed, assuming it was recovered",
                what
            ));
        }
        action()
    }

    /// Quarantine the stuck header at the cursor, if it is still stuck.
    ///
    /// Returns `Err(EndOfData)` when the segment was closed in the meantime
    /// or the cursor already sits at its end.
    fn quarantine(&self, log: &dyn FramedWriter) -> RecoveryResult<u64> {
        let offset = log.write_position();
        if offset + HEADER_SIZE > log.capacity() {
            return Err(RecoveryError::EndOfData { offset });
        }
        let word = log.read_header_word(offset);
        let prefix = format!(
            "Unable to write a header at header number: {:#x} position: {}",
            log.header_number(),
            offset
        );

        if header::is_not_complete(word) {
            let size = self.padding_size(log, offset);
            self.stage(log, offset, size)?;
            let quarantined = META_DATA | size as u32;
            if log.compare_and_swap_header_word(offset, word, quarantined) {
                self.warn(&format!(
                    "{} switching to a corrupt meta data message",
                    prefix
                ));
                log.write_skip(size + HEADER_SIZE);
            } else {
                let now = log.read_header_word(offset);
                self.warn(&format!("{} already set to {:x}", prefix, now));
            }
        } else if word == header::END_OF_DATA {
            self.warn(&format!("{} but the segment is now closed", prefix));
            return Err(RecoveryError::EndOfData { offset });
        } else if word == header::FREE {
            self.warn(&format!("{} but the header is now free, retrying", prefix));
        } else {
            self.warn(&format!("{} but message now exists", prefix));
        }
        Ok(offset)
    }

    /// True when the padding block at `offset` leaves no room for a
    /// `length` byte block, so the segment has to roll.
    fn padding_fills_segment(&self, log: &dyn FramedWriter, offset: u64, length: u32) -> bool {
        let word = log.read_header_word(offset);
        if !header::is_ready(word) || header::is_data(word) {
            return false;
        }
        header::next_block(offset, word) + HEADER_SIZE + length as u64 > log.capacity()
    }

    /// Bytes of padding for a quarantine block at `offset`.
    fn padding_size(&self, log: &dyn FramedWriter, offset: u64) -> u64 {
        let raw = self.padding.padding_for(log.overlap_size());
        let aligned = header::align4(raw) - (offset & 3);
        let room = log.capacity().saturating_sub(offset + HEADER_SIZE);
        aligned.min(room).min(LENGTH_MASK as u64)
    }

    /// Write the marker and zero fill after the header word at `offset`.
    fn stage(&self, log: &dyn FramedWriter, offset: u64, size: u64) -> RecoveryResult<()> {
        let body = offset + HEADER_SIZE;
        let marker_len = (RECOVERY_MARKER.len() as u64).min(size);
        log.write_bytes_at(body, &RECOVERY_MARKER[..marker_len as usize])?;
        if size > marker_len {
            log.zero_bytes_at(body + marker_len, size - marker_len)?;
        }
        Ok(())
    }
}

impl StoreRecovery for TimedStoreRecovery {
    fn acquire_lock(&self, timeout: Duration) -> i64 {
        self.lock.acquire(timeout)
    }

    fn try_acquire_lock(&self, timeout: Duration) -> Option<i64> {
        self.lock.try_acquire(timeout)
    }

    fn release_lock(&self, deadline: i64) {
        self.lock.release(deadline);
    }

    fn recover_index_to_index(
        &self,
        slot: &SharedValue,
        action: &mut dyn FnMut() -> RecoveryResult<i64>,
        timeout: Duration,
    ) -> RecoveryResult<i64> {
        self.rebuild("index2index", slot, action, timeout)
    }

    fn recover_secondary_address(
        &self,
        array: &SharedArray,
        index: usize,
        action: &mut dyn FnMut() -> RecoveryResult<i64>,
        timeout: Duration,
    ) -> RecoveryResult<i64> {
        let slot = array.get(index).ok_or_else(|| {
            strata_queue_core::Error::invalid(format!(
                "secondary index {} out of range ({} slots)",
                index,
                array.len()
            ))
        })?;
        self.rebuild(&format!("index2index[{}]", index), &slot, action, timeout)
    }

    fn recover_and_write_header(
        &self,
        log: &dyn FramedWriter,
        length: u32,
        timeout: Duration,
        last_position: Option<&SharedValue>,
    ) -> RecoveryResult<u64> {
        for attempt in 1..=self.max_attempts {
            let offset = self.quarantine(log)?;
            match log.write_header(length, length, timeout, last_position) {
                HeaderWriteOutcome::Completed(position) => {
                    debug!(offset, position, attempt, "Header written after recovery");
                    return Ok(position);
                }
                HeaderWriteOutcome::EndOfData => {
                    if self.padding_fills_segment(log, offset, length) {
                        debug!(offset, attempt, "Recovery padding reached the end of the segment");
                        return Err(RecoveryError::EndOfData {
                            offset: log.write_position(),
                        });
                    }
                    return Err(RecoveryError::InvariantViolation { offset });
                }
                HeaderWriteOutcome::TimedOut => {
                    self.warn(&format!(
                        "Timed out again writing header at position {} after recovery",
                        log.write_position()
                    ));
                }
            }
        }
        Err(RecoveryError::RetriesExhausted {
            attempts: self.max_attempts,
        })
    }
}

impl std::fmt::Debug for TimedStoreRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedStoreRecovery")
            .field("padding", &self.padding)
            .field("max_attempts", &self.max_attempts)
            .field("lock", &self.lock.deadline())
            .finish()
    }
}
