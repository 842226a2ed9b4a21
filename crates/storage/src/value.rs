//! Shared 64-bit values
//!
//! A [`SharedValue`] is a handle to one 8-byte slot of a [`MappedRegion`].
//! The handle exposes exactly six operations; there is no other path to the
//! slot, so every access is either an acquire load, a release store or an
//! atomic read-modify-write that other processes observe coherently.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::region::MappedRegion;

/// Raw value of a slot nobody has written yet
pub const UNINITIALIZED: i64 = i64::MIN;

/// Value of an index pointer a writer started but did not finish
pub const LONG_NOT_COMPLETE: i64 = -1;

/// Handle to a 64-bit slot in shared memory.
#[derive(Clone)]
pub struct SharedValue {
    region: Arc<MappedRegion>,
    offset: usize,
}

impl SharedValue {
    /// Bind a handle to the slot at `offset`.
    ///
    /// # Panics
    ///
    /// If the slot is unaligned or out of bounds.
    pub fn new(region: Arc<MappedRegion>, offset: usize) -> Self {
        // validates alignment and bounds up front
        region.atomic_i64(offset);
        SharedValue { region, offset }
    }

    /// Byte offset of the slot within its region
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Volatile read
    pub fn load_acquire(&self) -> i64 {
        self.region.atomic_i64(self.offset).load(Ordering::Acquire)
    }

    /// Ordered write
    pub fn store_release(&self, value: i64) {
        self.region
            .atomic_i64(self.offset)
            .store(value, Ordering::Release)
    }

    /// Set to `new` if the slot holds `expected`; true on success
    pub fn compare_and_swap(&self, expected: i64, new: i64) -> bool {
        self.region
            .atomic_i64(self.offset)
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Raise the slot to at least `value`; returns the previous value
    pub fn fetch_max(&self, value: i64) -> i64 {
        self.region
            .atomic_i64(self.offset)
            .fetch_max(value, Ordering::AcqRel)
    }

    /// Lower the slot to at most `value`; returns the previous value
    pub fn fetch_min(&self, value: i64) -> i64 {
        self.region
            .atomic_i64(self.offset)
            .fetch_min(value, Ordering::AcqRel)
    }

    /// Add `delta`; returns the previous value
    pub fn fetch_add(&self, delta: i64) -> i64 {
        self.region
            .atomic_i64(self.offset)
            .fetch_add(delta, Ordering::AcqRel)
    }
}

impl fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedValue")
            .field("offset", &self.offset)
            .field("value", &self.load_acquire())
            .finish()
    }
}

/// A contiguous run of shared 64-bit slots.
#[derive(Clone)]
pub struct SharedArray {
    region: Arc<MappedRegion>,
    offset: usize,
    len: usize,
}

impl SharedArray {
    /// Bind `len` consecutive slots starting at `offset`.
    ///
    /// # Panics
    ///
    /// If the first slot is unaligned or the run is out of bounds.
    pub fn new(region: Arc<MappedRegion>, offset: usize, len: usize) -> Self {
        if len > 0 {
            region.atomic_i64(offset + (len - 1) * 8);
        }
        SharedArray {
            region,
            offset,
            len,
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the array has no slots
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle to slot `index`, or `None` past the end
    pub fn get(&self, index: usize) -> Option<SharedValue> {
        if index >= self.len {
            return None;
        }
        Some(SharedValue::new(
            Arc::clone(&self.region),
            self.offset + index * 8,
        ))
    }
}

impl fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<i64> = (0..self.len)
            .filter_map(|i| self.get(i))
            .map(|v| v.load_acquire())
            .collect();
        f.debug_struct("SharedArray")
            .field("offset", &self.offset)
            .field("values", &values)
            .finish()
    }
}
