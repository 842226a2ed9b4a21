//! Backing-store interfaces for framed headers
//!
//! Header recovery never talks to a concrete file. It needs a store that can
//! read and CAS header words, stage bytes without moving the write cursor,
//! and attempt a header write. [`MappedSegment`](crate::MappedSegment) is the
//! in-tree implementation.

use std::time::Duration;

use strata_queue_core::Result;

use crate::value::SharedValue;

/// Result of one attempt to claim a header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderWriteOutcome {
    /// The slot at this offset is now claimed by the caller
    Completed(u64),
    /// Another writer held the slot for longer than the timeout. The write
    /// cursor is left on the stuck header.
    TimedOut,
    /// No room left in this segment
    EndOfData,
}

/// Positioned access to the header words of a log.
pub trait HeaderStore: Send + Sync {
    /// Where this handle will try to write the next header
    fn write_position(&self) -> u64;

    /// Move the write cursor
    fn set_write_position(&self, position: u64);

    /// Advance the write cursor by `n` bytes
    fn write_skip(&self, n: u64) {
        self.set_write_position(self.write_position() + n);
    }

    /// Volatile read of the header word at `offset`
    fn read_header_word(&self, offset: u64) -> u32;

    /// CAS the header word at `offset`; true on success
    fn compare_and_swap_header_word(&self, offset: u64, expected: u32, new: u32) -> bool;

    /// Write `bytes` at `offset` without touching the write cursor
    fn write_bytes_at(&self, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Zero `len` bytes at `offset` without touching the write cursor
    fn zero_bytes_at(&self, offset: u64, len: u64) -> Result<()>;

    /// End of the writable area
    fn capacity(&self) -> u64;

    /// Size of the region the store keeps mapped beyond the write position,
    /// when the store has such a notion
    fn overlap_size(&self) -> Option<u64> {
        None
    }

    /// Number of data blocks this handle has seen before its cursor
    fn header_number(&self) -> u64;
}

/// A store that can also claim header slots.
pub trait FramedWriter: HeaderStore {
    /// Claim a header for a block of `length` bytes.
    ///
    /// `safe_length` is the space that must remain for the claim to proceed.
    /// `last_position`, when given, is a shared hint of the latest header
    /// written by anyone; the cursor jumps forward to it when it is ahead.
    fn write_header(
        &self,
        length: u32,
        safe_length: u32,
        timeout: Duration,
        last_position: Option<&SharedValue>,
    ) -> HeaderWriteOutcome;
}
