//! Shared counter table
//!
//! A file of named 64-bit slots shared by every process that maps it. Keys
//! are created lazily and never removed, so a key resolves to the same offset
//! for the whole life of the file.
//!
//! ## File Format (Version 1)
//!
//! ```text
//! [state/magic "SQTB" u32 LE]   0 while unformatted
//! [version u32 LE]
//! [entry count i64 LE]          published with a release store
//! [reserved up to byte 64]
//! [entries: 64 bytes each]
//!     [key length u8][key bytes, at most 55][padding]
//!     [value i64 LE @ +56]
//! ```
//!
//! Entry 0 is written while formatting and holds the table's own exclusive
//! lock, driven by the [`ExpiringLock`] protocol. Every other entry is
//! appended under that lock, so two processes racing to create the same key
//! end up with a single slot. Entries below the published count are
//! immutable apart from their value word.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use strata_queue_core::{
    system_clock, tracing_sink, Error, Result, SharedClock, SharedWarnSink,
};

use crate::lock::ExpiringLock;
use crate::region::MappedRegion;
use crate::value::{SharedValue, UNINITIALIZED};

/// Magic identifying a formatted table file
const MAGIC: u32 = u32::from_le_bytes(*b"SQTB");
/// Current format version
const VERSION: u32 = 1;
/// Offset of the state/magic word
const STATE_OFFSET: usize = 0;
/// Offset of the version word
const VERSION_OFFSET: usize = 4;
/// Offset of the published entry count
const COUNT_OFFSET: usize = 8;
/// First entry
const ENTRIES_OFFSET: usize = 64;
/// Size of one entry
const ENTRY_SIZE: usize = 64;
/// Offset of the value within an entry
const VALUE_IN_ENTRY: usize = 56;

/// Longest key an entry can hold
pub const MAX_KEY_LEN: usize = 55;

/// Lock key used when the opener does not name one
pub const DEFAULT_LOCK_KEY: &str = "table.exclusiveLock";

/// Options for opening a [`SharedCounterTable`].
#[derive(Clone)]
pub struct TableOptions {
    /// File size in bytes (default: 64KB)
    pub capacity: u64,
    /// Key of the slot that serves as the table-wide lock
    pub lock_key: String,
    /// Lock timeout; the lease is half of it (default: 10s)
    pub timeout: Duration,
    /// Clock for lock deadlines
    pub clock: SharedClock,
    /// Receiver for lock warnings
    pub warnings: SharedWarnSink,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            capacity: 64 * 1024,
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            timeout: Duration::from_secs(10),
            clock: system_clock(),
            warnings: tracing_sink(),
        }
    }
}

impl TableOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the file size (builder pattern).
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the lock key (builder pattern).
    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = key.into();
        self
    }

    /// Set the lock timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the clock (builder pattern).
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Set the warning sink (builder pattern).
    pub fn with_warnings(mut self, warnings: SharedWarnSink) -> Self {
        self.warnings = warnings;
        self
    }
}

/// Memory-mapped table of named shared 64-bit values.
pub struct SharedCounterTable {
    region: Arc<MappedRegion>,
    lock: ExpiringLock,
    lock_key: String,
    timeout: Duration,
    max_entries: usize,
    /// key -> entry index, for keys this handle has already resolved
    cache: Mutex<FxHashMap<String, usize>>,
}

impl SharedCounterTable {
    /// Open the table at `path`, creating and formatting it if needed.
    pub fn open(path: &Path, options: TableOptions) -> Result<Self> {
        validate_key(&options.lock_key)?;
        let region = Arc::new(MappedRegion::open(path, options.capacity)?);
        if region.len() < ENTRIES_OFFSET + ENTRY_SIZE {
            return Err(Error::invalid(format!(
                "table {} is too small ({} bytes)",
                path.display(),
                region.len()
            )));
        }
        let max_entries = (region.len() - ENTRIES_OFFSET) / ENTRY_SIZE;

        let lock_key = options.lock_key.clone();
        region.initialize_once(STATE_OFFSET, MAGIC, options.timeout, |r| {
            r.atomic_u32(VERSION_OFFSET)
                .store(VERSION, Ordering::Release);
            write_entry(r, 0, &lock_key, 0)?;
            r.atomic_i64(COUNT_OFFSET).store(1, Ordering::Release);
            Ok(())
        })?;

        let version = region.atomic_u32(VERSION_OFFSET).load(Ordering::Acquire);
        if version != VERSION {
            return Err(Error::corruption(format!(
                "unsupported table version {} in {}",
                version,
                path.display()
            )));
        }
        let existing_lock_key = read_key(&region, 0)?;
        if existing_lock_key != options.lock_key {
            return Err(Error::invalid(format!(
                "table {} is locked through '{}', not '{}'",
                path.display(),
                existing_lock_key,
                options.lock_key
            )));
        }

        let lock = ExpiringLock::new(
            SharedValue::new(Arc::clone(&region), value_offset(0)),
            options.clock,
            options.warnings,
            "table",
        );

        debug!(path = %path.display(), max_entries, "Opened shared counter table");

        let mut cache = FxHashMap::default();
        cache.insert(options.lock_key.clone(), 0);

        Ok(SharedCounterTable {
            region,
            lock,
            lock_key: options.lock_key,
            timeout: options.timeout,
            max_entries,
            cache: Mutex::new(cache),
        })
    }

    /// Slot for `key`, created (holding [`UNINITIALIZED`]) if absent.
    ///
    /// Repeated calls, from this or any other process, return handles to the
    /// same slot.
    pub fn acquire_value(&self, key: &str) -> Result<SharedValue> {
        validate_key(key)?;
        if let Some(index) = self.cached(key) {
            return Ok(self.value_at(index));
        }
        if let Some(index) = self.find(key)? {
            self.remember(key, index);
            return Ok(self.value_at(index));
        }
        self.with_exclusive_lock(|locked| locked.acquire_value(key))
    }

    /// Run `f` while holding the table-wide lock.
    ///
    /// The lock is released on every exit path, including errors and panics.
    pub fn with_exclusive_lock<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&LockedTable<'_>) -> Result<T>,
    {
        let _guard = self.lock.lock(self.timeout);
        f(&LockedTable { table: self })
    }

    /// Key of the lock slot
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Number of keys in the table, including the lock key
    pub fn len(&self) -> usize {
        self.published_count()
    }

    /// Formatted tables always hold the lock key, so this is false once open
    pub fn is_empty(&self) -> bool {
        self.published_count() == 0
    }

    /// Every key with its current value, in creation order
    pub fn entries(&self) -> Result<Vec<(String, i64)>> {
        (0..self.published_count())
            .map(|i| Ok((read_key(&self.region, i)?, self.value_at(i).load_acquire())))
            .collect()
    }

    /// Diagnostic listing, one `key: value` per line
    pub fn dump(&self) -> String {
        match self.entries() {
            Ok(entries) => entries
                .into_iter()
                .map(|(k, v)| format!("{}: {}\n", k, v))
                .collect(),
            Err(e) => format!("<unreadable table: {}>\n", e),
        }
    }

    /// Flush and unmap. Outstanding [`SharedValue`] handles keep the mapping
    /// alive until they are dropped.
    pub fn close(self) -> Result<()> {
        self.region.flush()?;
        debug!(path = %self.region.path().display(), "Closed shared counter table");
        Ok(())
    }

    fn cached(&self, key: &str) -> Option<usize> {
        self.cache.lock().get(key).copied()
    }

    fn remember(&self, key: &str, index: usize) {
        self.cache.lock().insert(key.to_string(), index);
    }

    fn published_count(&self) -> usize {
        let count = self.region.atomic_i64(COUNT_OFFSET).load(Ordering::Acquire);
        (count.max(0) as usize).min(self.max_entries)
    }

    fn find(&self, key: &str) -> Result<Option<usize>> {
        for index in 0..self.published_count() {
            if read_key(&self.region, index)? == key {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn value_at(&self, index: usize) -> SharedValue {
        SharedValue::new(Arc::clone(&self.region), value_offset(index))
    }

    /// Append `key`; caller holds the lock and has checked it is absent.
    fn append(&self, key: &str) -> Result<usize> {
        let index = self.published_count();
        if index >= self.max_entries {
            return Err(Error::invalid(format!(
                "table {} is full ({} entries)",
                self.region.path().display(),
                self.max_entries
            )));
        }
        write_entry(&self.region, index, key, UNINITIALIZED)?;
        self.region
            .atomic_i64(COUNT_OFFSET)
            .store(index as i64 + 1, Ordering::Release);
        debug!(key, index, "Created table slot");
        Ok(index)
    }
}

impl fmt::Display for SharedCounterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

impl fmt::Debug for SharedCounterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCounterTable")
            .field("path", &self.region.path())
            .field("entries", &self.published_count())
            .finish()
    }
}

/// View of a table while its exclusive lock is held.
pub struct LockedTable<'a> {
    table: &'a SharedCounterTable,
}

impl LockedTable<'_> {
    /// Slot for `key`, created if absent. Does not take the lock again.
    pub fn acquire_value(&self, key: &str) -> Result<SharedValue> {
        validate_key(key)?;
        let table = self.table;
        let index = match table.find(key)? {
            Some(index) => index,
            None => table.append(key)?,
        };
        table.remember(key, index);
        Ok(table.value_at(index))
    }

    /// The underlying table
    pub fn table(&self) -> &SharedCounterTable {
        self.table
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid("table keys must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::invalid(format!(
            "table key '{}' is longer than {} bytes",
            key, MAX_KEY_LEN
        )));
    }
    Ok(())
}

fn entry_offset(index: usize) -> usize {
    ENTRIES_OFFSET + index * ENTRY_SIZE
}

fn value_offset(index: usize) -> usize {
    entry_offset(index) + VALUE_IN_ENTRY
}

fn write_entry(region: &MappedRegion, index: usize, key: &str, value: i64) -> Result<()> {
    let offset = entry_offset(index);
    region.write_bytes(offset, &[key.len() as u8])?;
    region.write_bytes(offset + 1, key.as_bytes())?;
    region
        .atomic_i64(value_offset(index))
        .store(value, Ordering::Release);
    Ok(())
}

fn read_key(region: &MappedRegion, index: usize) -> Result<String> {
    let offset = entry_offset(index);
    let len = region.read_bytes(offset, 1)?[0] as usize;
    if len == 0 || len > MAX_KEY_LEN {
        return Err(Error::corruption(format!(
            "table entry {} has key length {}",
            index, len
        )));
    }
    let bytes = region.read_bytes(offset + 1, len)?;
    String::from_utf8(bytes)
        .map_err(|_| Error::corruption(format!("table entry {} has a non-UTF-8 key", index)))
}
