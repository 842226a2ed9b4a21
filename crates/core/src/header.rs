//! Framed block header words
//!
//! Every block in a segment starts with a 32-bit header word:
//!
//! ```text
//! bit 31      NOT_COMPLETE  writer claimed the slot but has not finished
//! bit 30      META_DATA     meta-data block (skipped by readers of data)
//! bits 0..29  LENGTH        payload length in bytes, excluding the word
//! ```
//!
//! A zero word is a free slot. `NOT_COMPLETE | META_DATA` with a zero length
//! marks the end of data in a segment. Blocks are 4-byte aligned: the next
//! block starts at `align4(offset + 4 + length)`.

/// Claimed but unfinished block
pub const NOT_COMPLETE: u32 = 0x8000_0000;
/// Meta-data block
pub const META_DATA: u32 = 0x4000_0000;
/// Mask selecting the payload length
pub const LENGTH_MASK: u32 = 0x3FFF_FFFF;
/// Free slot
pub const FREE: u32 = 0;
/// No further blocks fit in this segment
pub const END_OF_DATA: u32 = NOT_COMPLETE | META_DATA;
/// Size of the header word itself
pub const HEADER_SIZE: u64 = 4;

/// Decoded state of a header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Nothing has been claimed here yet
    Free,
    /// A writer claimed this block and has not finished it
    NotComplete {
        /// Length the writer announced (0 when unknown)
        length: u32,
    },
    /// A finished block
    Complete {
        /// Payload length in bytes
        length: u32,
        /// Whether the block is meta-data
        metadata: bool,
    },
    /// End-of-data marker
    EndOfData,
}

impl HeaderState {
    /// Decode a raw header word
    pub fn decode(word: u32) -> Self {
        if word == FREE {
            HeaderState::Free
        } else if word == END_OF_DATA {
            HeaderState::EndOfData
        } else if word & NOT_COMPLETE != 0 {
            HeaderState::NotComplete {
                length: word & LENGTH_MASK,
            }
        } else {
            HeaderState::Complete {
                length: word & LENGTH_MASK,
                metadata: word & META_DATA != 0,
            }
        }
    }
}

/// True when a writer claimed the block but never finished it.
#[inline]
pub fn is_not_complete(word: u32) -> bool {
    word & NOT_COMPLETE != 0 && word != END_OF_DATA
}

/// True when the block is finished and its length can be trusted.
#[inline]
pub fn is_ready(word: u32) -> bool {
    word != FREE && word & NOT_COMPLETE == 0
}

/// True for finished data (not meta-data) blocks.
#[inline]
pub fn is_data(word: u32) -> bool {
    is_ready(word) && word & META_DATA == 0
}

/// Payload length carried by the word.
#[inline]
pub fn length_of(word: u32) -> u32 {
    word & LENGTH_MASK
}

/// Word a writer CASes into a free slot to claim it.
#[inline]
pub fn not_complete(length: u32) -> u32 {
    NOT_COMPLETE | (length & LENGTH_MASK)
}

/// Word for a finished block.
#[inline]
pub fn complete(length: u32, metadata: bool) -> u32 {
    let word = length & LENGTH_MASK;
    if metadata {
        word | META_DATA
    } else {
        word
    }
}

/// Round `n` up to the next multiple of 4.
#[inline]
pub fn align4(n: u64) -> u64 {
    (n + 3) & !3
}

/// Offset of the block following a finished block at `offset`.
#[inline]
pub fn next_block(offset: u64, word: u32) -> u64 {
    align4(offset + HEADER_SIZE + length_of(word) as u64)
}
