//! Memory-mapped queue segments
//!
//! One segment file holds the framed blocks of a single cycle. Writers in
//! any process claim the next free header word with a CAS, fill in the
//! payload and then CAS the word to its final, complete value.
//!
//! ## File Format (Version 1)
//!
//! ```text
//! @0    [state/magic "SQSG" u32 LE]
//! @4    [recovery strategy tag u32 LE]
//! @8    [recovery lock timestamp i64 LE]
//! @16   [index2index pointer i64 LE]
//! @24   [last header position i64 LE]
//! @32   [version u32 LE]
//! @40   [secondary index addresses: 27 x i64 LE]
//! @256  [blocks: header word u32 LE, payload, padded to 4 bytes]
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use strata_queue_core::header::{
    self, HeaderState, END_OF_DATA, FREE, HEADER_SIZE, LENGTH_MASK,
};
use strata_queue_core::{Error, Result};

use crate::region::MappedRegion;
use crate::store::{FramedWriter, HeaderStore, HeaderWriteOutcome};
use crate::value::{SharedArray, SharedValue};

/// Magic identifying a formatted segment
const MAGIC: u32 = u32::from_le_bytes(*b"SQSG");
/// Current format version
const VERSION: u32 = 1;
const STATE_OFFSET: usize = 0;
const RECOVERY_TAG_OFFSET: usize = 4;
const RECOVERY_TIMESTAMP_OFFSET: usize = 8;
const INDEX_TO_INDEX_OFFSET: usize = 16;
const LAST_POSITION_OFFSET: usize = 24;
const VERSION_OFFSET: usize = 32;
const SECONDARY_OFFSET: usize = 40;

/// Number of secondary index address slots in the segment header
pub const SECONDARY_SLOTS: usize = 27;

/// First byte of block data
pub const DATA_START: u64 = 256;

/// Options for opening a [`MappedSegment`].
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    /// File size in bytes (default: 16MB)
    pub capacity: u64,
    /// Overlap hint reported to recovery, if any
    pub overlap_size: Option<u64>,
    /// Recovery strategy tag written when the file is formatted
    pub recovery_tag: u32,
    /// How long to wait for another process to finish formatting
    pub format_timeout: Duration,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        SegmentOptions {
            capacity: 16 * 1024 * 1024,
            overlap_size: None,
            recovery_tag: 1,
            format_timeout: Duration::from_secs(10),
        }
    }
}

impl SegmentOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the file size (builder pattern).
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the overlap hint (builder pattern).
    pub fn with_overlap_size(mut self, overlap: Option<u64>) -> Self {
        self.overlap_size = overlap;
        self
    }

    /// Set the recovery strategy tag (builder pattern).
    pub fn with_recovery_tag(mut self, tag: u32) -> Self {
        self.recovery_tag = tag;
        self
    }
}

/// A finished block read back from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Offset of the header word
    pub offset: u64,
    /// Decoded header
    pub state: HeaderState,
    /// Payload of a complete block, empty otherwise
    pub payload: Vec<u8>,
}

impl Block {
    /// True for a complete meta-data block
    pub fn is_metadata(&self) -> bool {
        matches!(self.state, HeaderState::Complete { metadata: true, .. })
    }
}

/// One memory-mapped segment file.
///
/// Each handle has its own write cursor, like each process in a shared
/// deployment; header words and header slots are shared.
pub struct MappedSegment {
    region: Arc<MappedRegion>,
    write_position: AtomicU64,
    header_number: AtomicU64,
    overlap_size: Option<u64>,
    recovery_tag: u32,
}

impl MappedSegment {
    /// Open the segment at `path`, creating and formatting it if needed.
    pub fn open(path: &Path, options: SegmentOptions) -> Result<Self> {
        let region = Arc::new(MappedRegion::open(path, options.capacity)?);
        if (region.len() as u64) < DATA_START + HEADER_SIZE {
            return Err(Error::invalid(format!(
                "segment {} is too small ({} bytes)",
                path.display(),
                region.len()
            )));
        }

        let tag = options.recovery_tag;
        region.initialize_once(STATE_OFFSET, MAGIC, options.format_timeout, |r| {
            r.atomic_u32(RECOVERY_TAG_OFFSET).store(tag, Ordering::Release);
            r.atomic_u32(VERSION_OFFSET).store(VERSION, Ordering::Release);
            r.atomic_i64(LAST_POSITION_OFFSET)
                .store(DATA_START as i64, Ordering::Release);
            Ok(())
        })?;

        let version = region.atomic_u32(VERSION_OFFSET).load(Ordering::Acquire);
        if version != VERSION {
            return Err(Error::corruption(format!(
                "unsupported segment version {} in {}",
                version,
                path.display()
            )));
        }
        let recovery_tag = region.atomic_u32(RECOVERY_TAG_OFFSET).load(Ordering::Acquire);

        debug!(path = %path.display(), capacity = region.len(), recovery_tag, "Opened segment");

        Ok(MappedSegment {
            region,
            write_position: AtomicU64::new(DATA_START),
            header_number: AtomicU64::new(0),
            overlap_size: options.overlap_size,
            recovery_tag,
        })
    }

    /// Path of the segment file
    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Recovery strategy tag persisted in the header
    pub fn recovery_tag(&self) -> u32 {
        self.recovery_tag
    }

    /// Slot backing the recovery lock
    pub fn recovery_timestamp(&self) -> SharedValue {
        SharedValue::new(Arc::clone(&self.region), RECOVERY_TIMESTAMP_OFFSET)
    }

    /// Slot holding the top-level index pointer
    pub fn index_to_index(&self) -> SharedValue {
        SharedValue::new(Arc::clone(&self.region), INDEX_TO_INDEX_OFFSET)
    }

    /// Shared hint of the latest completed header
    pub fn last_position(&self) -> SharedValue {
        SharedValue::new(Arc::clone(&self.region), LAST_POSITION_OFFSET)
    }

    /// Secondary index address slots
    pub fn secondary_addresses(&self) -> SharedArray {
        SharedArray::new(Arc::clone(&self.region), SECONDARY_OFFSET, SECONDARY_SLOTS)
    }

    /// Finish a header claimed by [`FramedWriter::write_header`].
    ///
    /// Fails with [`Error::Corruption`] when the claim was quarantined by a
    /// recovering writer in the meantime.
    pub fn end_header(&self, offset: u64, length: u32, metadata: bool) -> Result<()> {
        if length > LENGTH_MASK {
            return Err(Error::invalid(format!("block length {} too large", length)));
        }
        if length == 0 && !metadata {
            return Err(Error::invalid("data blocks must not be empty"));
        }
        if offset + HEADER_SIZE + length as u64 > self.capacity() {
            return Err(Error::invalid(format!(
                "block at {} of {} bytes overruns the segment",
                offset, length
            )));
        }
        let claimed = self.read_header_word(offset);
        if !header::is_not_complete(claimed) {
            return Err(Error::corruption(format!(
                "header at {} is not claimed (found {:#010x})",
                offset, claimed
            )));
        }
        let done = header::complete(length, metadata);
        if !self.compare_and_swap_header_word(offset, claimed, done) {
            return Err(Error::corruption(format!(
                "header at {} was recovered by another writer",
                offset
            )));
        }
        if !metadata {
            self.header_number.fetch_add(1, Ordering::AcqRel);
        }
        self.set_write_position(header::next_block(offset, done));
        self.last_position().fetch_max(offset as i64);
        Ok(())
    }

    /// Claim, fill and finish one block.
    pub fn write_document(
        &self,
        payload: &[u8],
        metadata: bool,
        timeout: Duration,
    ) -> Result<HeaderWriteOutcome> {
        if payload.len() > LENGTH_MASK as usize {
            return Err(Error::invalid(format!(
                "payload of {} bytes too large",
                payload.len()
            )));
        }
        if payload.is_empty() && !metadata {
            return Err(Error::invalid("data blocks must not be empty"));
        }
        let length = payload.len() as u32;
        let last = self.last_position();
        let outcome = self.write_header(length, length, timeout, Some(&last));
        if let HeaderWriteOutcome::Completed(offset) = outcome {
            self.write_bytes_at(offset + HEADER_SIZE, payload)?;
            self.end_header(offset, length, metadata)?;
        }
        Ok(outcome)
    }

    /// Write the end-of-data marker at the first free slot.
    ///
    /// Returns false when the slot ahead is claimed but unfinished.
    pub fn mark_end_of_data(&self) -> bool {
        let mut pos = self.write_position();
        while pos + HEADER_SIZE <= self.capacity() {
            if self.compare_and_swap_header_word(pos, FREE, END_OF_DATA) {
                self.set_write_position(pos);
                return true;
            }
            let word = self.read_header_word(pos);
            if word == END_OF_DATA {
                return true;
            }
            if !header::is_ready(word) {
                return false;
            }
            pos = header::next_block(pos, word);
        }
        true
    }

    /// Read the block whose header is at `offset`.
    pub fn read_block(&self, offset: u64) -> Result<Block> {
        if offset + HEADER_SIZE > self.capacity() {
            return Err(Error::invalid(format!("offset {} past end of segment", offset)));
        }
        let word = self.read_header_word(offset);
        let state = HeaderState::decode(word);
        let payload = match state {
            HeaderState::Complete { length, .. } => self
                .region
                .read_bytes((offset + HEADER_SIZE) as usize, length as usize)?,
            _ => Vec::new(),
        };
        Ok(Block {
            offset,
            state,
            payload,
        })
    }

    /// Complete blocks from the start of data, in order. Stops at the first
    /// free, unfinished or end-of-data header.
    pub fn blocks(&self) -> BlockIter<'_> {
        BlockIter {
            segment: self,
            offset: DATA_START,
        }
    }

    /// Flush dirty pages to disk
    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    /// Move from `pos` towards `target`, counting the finished data blocks
    /// passed on the way. A block still in flight ends the walk and the
    /// cursor jumps straight to `target`.
    fn skip_to(&self, mut pos: u64, target: u64) -> u64 {
        while pos < target {
            let word = self.read_header_word(pos);
            if !header::is_ready(word) {
                return target;
            }
            if header::is_data(word) {
                self.header_number.fetch_add(1, Ordering::AcqRel);
            }
            pos = header::next_block(pos, word);
        }
        pos
    }
}

impl HeaderStore for MappedSegment {
    fn write_position(&self) -> u64 {
        self.write_position.load(Ordering::Acquire)
    }

    fn set_write_position(&self, position: u64) {
        self.write_position.store(position, Ordering::Release)
    }

    fn read_header_word(&self, offset: u64) -> u32 {
        self.region
            .atomic_u32(offset as usize)
            .load(Ordering::Acquire)
    }

    fn compare_and_swap_header_word(&self, offset: u64, expected: u32, new: u32) -> bool {
        self.region
            .atomic_u32(offset as usize)
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn write_bytes_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.region.write_bytes(offset as usize, bytes)
    }

    fn zero_bytes_at(&self, offset: u64, len: u64) -> Result<()> {
        self.region.fill(offset as usize, len as usize, 0)
    }

    fn capacity(&self) -> u64 {
        self.region.len() as u64
    }

    fn overlap_size(&self) -> Option<u64> {
        self.overlap_size
    }

    fn header_number(&self) -> u64 {
        self.header_number.load(Ordering::Acquire)
    }
}

impl FramedWriter for MappedSegment {
    fn write_header(
        &self,
        length: u32,
        safe_length: u32,
        timeout: Duration,
        last_position: Option<&SharedValue>,
    ) -> HeaderWriteOutcome {
        let capacity = self.capacity();
        let mut pos = self.write_position();
        if let Some(hint) = last_position.map(SharedValue::load_acquire) {
            if hint > pos as i64 && (hint as u64) < capacity && hint % 4 == 0 {
                pos = self.skip_to(pos, hint as u64);
            }
        }

        let claim = header::not_complete(length);
        let needed = length.max(safe_length) as u64;
        let mut waiting_since = Instant::now();
        loop {
            if pos + HEADER_SIZE + needed > capacity {
                self.set_write_position(pos);
                return HeaderWriteOutcome::EndOfData;
            }
            if self.compare_and_swap_header_word(pos, FREE, claim) {
                self.set_write_position(pos);
                return HeaderWriteOutcome::Completed(pos);
            }
            let word = self.read_header_word(pos);
            if word == END_OF_DATA {
                self.set_write_position(pos);
                return HeaderWriteOutcome::EndOfData;
            }
            if header::is_ready(word) {
                if header::is_data(word) {
                    self.header_number.fetch_add(1, Ordering::AcqRel);
                }
                pos = header::next_block(pos, word);
                waiting_since = Instant::now();
                continue;
            }
            if header::is_not_complete(word) {
                if waiting_since.elapsed() >= timeout {
                    self.set_write_position(pos);
                    return HeaderWriteOutcome::TimedOut;
                }
                std::thread::yield_now();
            }
        }
    }
}

/// Iterator over the complete blocks of a segment.
pub struct BlockIter<'a> {
    segment: &'a MappedSegment,
    offset: u64,
}

impl Iterator for BlockIter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.offset + HEADER_SIZE > self.segment.capacity() {
            return None;
        }
        let word = self.segment.read_header_word(self.offset);
        if !header::is_ready(word) {
            return None;
        }
        let block = self.segment.read_block(self.offset).ok()?;
        self.offset = header::next_block(self.offset, word);
        Some(block)
    }
}

impl std::fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSegment")
            .field("path", &self.region.path())
            .field("write_position", &self.write_position())
            .field("recovery_tag", &self.recovery_tag)
            .finish()
    }
}
