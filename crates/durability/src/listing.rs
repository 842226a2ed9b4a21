//! Cross-process directory listing
//!
//! Tracks the lowest and highest cycle for which a segment file exists, plus
//! a modification counter, in a [`SharedCounterTable`] stored next to the
//! segments. Every process sees updates as soon as they are made, so finding
//! the valid cycle range is a couple of atomic loads instead of a directory
//! scan.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized -> init() -> Initialized -> (refresh | on_file_created)* -> close()
//! ```
//!
//! Bounds only widen through [`DirectoryListing::on_file_created`] (fetch-max
//! and fetch-min), and are overwritten only by a full
//! [`DirectoryListing::refresh`] from the filesystem.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use strata_queue_core::{
    is_segment_file, Error, Result, SharedCycleNaming, SharedWarnSink,
};
use strata_queue_storage::{SharedCounterTable, SharedValue, UNINITIALIZED};

/// Key of the highest created cycle
pub const HIGHEST_CREATED_CYCLE: &str = "listing.highestCycle";
/// Key of the lowest created cycle
pub const LOWEST_CREATED_CYCLE: &str = "listing.lowestCycle";
/// Key of the listing's exclusive lock
pub const LOCK: &str = "listing.exclusiveLock";
/// Key of the modification counter
pub const MOD_COUNT: &str = "listing.modCount";

/// Max cycle before any segment exists
pub const UNSET_MAX_CYCLE: i32 = i32::MIN;
/// Min cycle before any segment exists
pub const UNSET_MIN_CYCLE: i32 = i32::MAX;

/// Cross-process record of which cycles have segment files.
pub trait DirectoryListing: Send + Sync {
    /// Resolve the shared slots. Must run before any other operation.
    fn init(&mut self) -> Result<()>;

    /// Recompute the bounds from the files on disk. No-op when read-only.
    fn refresh(&self) -> Result<()>;

    /// Record that the segment for `cycle` was created. Warns and does
    /// nothing when read-only.
    fn on_file_created(&self, file: &Path, cycle: i32) -> Result<()>;

    /// Highest cycle with a segment, or [`UNSET_MAX_CYCLE`]
    fn max_created_cycle(&self) -> i32;

    /// Lowest cycle with a segment, or [`UNSET_MIN_CYCLE`]
    fn min_created_cycle(&self) -> i32;

    /// Number of segment creations observed
    fn mod_count(&self) -> i64;

    /// Release the backing table
    fn close(self: Box<Self>) -> Result<()>;
}

/// Slots resolved by `init`
struct ListingSlots {
    max_cycle: SharedValue,
    min_cycle: SharedValue,
    lock: SharedValue,
    mod_count: SharedValue,
}

/// [`DirectoryListing`] backed by a [`SharedCounterTable`].
pub struct TableDirectoryListing {
    table: SharedCounterTable,
    queue_path: PathBuf,
    naming: SharedCycleNaming,
    warnings: SharedWarnSink,
    read_only: bool,
    slots: Option<ListingSlots>,
}

impl TableDirectoryListing {
    /// Listing over `table` for the segments in `queue_path`.
    pub fn new(
        table: SharedCounterTable,
        queue_path: impl Into<PathBuf>,
        naming: SharedCycleNaming,
        warnings: SharedWarnSink,
        read_only: bool,
    ) -> Self {
        TableDirectoryListing {
            table,
            queue_path: queue_path.into(),
            naming,
            warnings,
            read_only,
            slots: None,
        }
    }

    /// Whether mutations are ignored
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether `init` has run
    pub fn is_initialized(&self) -> bool {
        self.slots.is_some()
    }

    /// Current value of the listing's lock slot
    pub fn lock_value(&self) -> Option<i64> {
        self.slots.as_ref().map(|s| s.lock.load_acquire())
    }

    /// The backing table
    pub fn table(&self) -> &SharedCounterTable {
        &self.table
    }

    fn slots(&self) -> Result<&ListingSlots> {
        self.slots
            .as_ref()
            .ok_or_else(|| Error::invalid("directory listing used before init()"))
    }

    /// Lowest and highest cycle among the segment files on disk, or `None`
    /// when the directory does not exist.
    fn scan(&self) -> Result<Option<(i32, i32)>> {
        let entries = match std::fs::read_dir(&self.queue_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut min = UNSET_MIN_CYCLE;
        let mut max = UNSET_MAX_CYCLE;
        for entry in entries {
            let path = entry?.path();
            if !is_segment_file(&path) {
                continue;
            }
            match self.naming.cycle_of(&path) {
                Some(cycle) => {
                    min = min.min(cycle);
                    max = max.max(cycle);
                }
                None => self.warnings.warn(
                    "listing",
                    &format!("Ignoring segment with unrecognised name {}", path.display()),
                ),
            }
        }
        Ok(Some((min, max)))
    }
}

impl DirectoryListing for TableDirectoryListing {
    fn init(&mut self) -> Result<()> {
        let slots = self.table.with_exclusive_lock(|ts| {
            let max_cycle = ts.acquire_value(HIGHEST_CREATED_CYCLE)?;
            max_cycle.compare_and_swap(UNINITIALIZED, UNSET_MAX_CYCLE as i64);
            let min_cycle = ts.acquire_value(LOWEST_CREATED_CYCLE)?;
            min_cycle.compare_and_swap(UNINITIALIZED, UNSET_MIN_CYCLE as i64);
            let lock = ts.acquire_value(LOCK)?;
            if lock.load_acquire() == UNINITIALIZED {
                lock.compare_and_swap(UNINITIALIZED, 0);
            }
            let mod_count = ts.acquire_value(MOD_COUNT)?;
            if mod_count.load_acquire() == UNINITIALIZED {
                mod_count.compare_and_swap(UNINITIALIZED, 0);
            }
            Ok(ListingSlots {
                max_cycle,
                min_cycle,
                lock,
                mod_count,
            })
        })?;
        self.slots = Some(slots);
        debug!(path = %self.queue_path.display(), read_only = self.read_only, "Directory listing initialised");
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let slots = self.slots()?;
        if let Some((min, max)) = self.scan()? {
            slots.max_cycle.store_release(max as i64);
            slots.min_cycle.store_release(min as i64);
            info!(path = %self.queue_path.display(), min, max, "Directory listing refreshed");
        }
        Ok(())
    }

    fn on_file_created(&self, file: &Path, cycle: i32) -> Result<()> {
        if self.read_only {
            self.warnings.warn(
                "listing",
                "DirectoryListing is read-only, not updating listing",
            );
            return Ok(());
        }
        let slots = self.slots()?;
        slots.mod_count.fetch_add(1);
        let cycle = cycle as i64;
        if cycle > slots.max_cycle.load_acquire() {
            slots.max_cycle.fetch_max(cycle);
        }
        if cycle < slots.min_cycle.load_acquire() {
            slots.min_cycle.fetch_min(cycle);
        }
        debug!(file = %file.display(), cycle, "Segment created");
        Ok(())
    }

    fn max_created_cycle(&self) -> i32 {
        self.slots
            .as_ref()
            .map(|s| to_cycle(s.max_cycle.load_acquire(), UNSET_MAX_CYCLE))
            .unwrap_or(UNSET_MAX_CYCLE)
    }

    fn min_created_cycle(&self) -> i32 {
        self.slots
            .as_ref()
            .map(|s| to_cycle(s.min_cycle.load_acquire(), UNSET_MIN_CYCLE))
            .unwrap_or(UNSET_MIN_CYCLE)
    }

    fn mod_count(&self) -> i64 {
        self.slots
            .as_ref()
            .map(|s| s.mod_count.load_acquire().max(0))
            .unwrap_or(0)
    }

    fn close(self: Box<Self>) -> Result<()> {
        let TableDirectoryListing { table, slots, .. } = *self;
        drop(slots);
        table.close()
    }
}

impl fmt::Display for TableDirectoryListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table.dump())
    }
}

/// Cycle stored in a slot; values outside `i32` only appear before
/// normalisation and read as `unset`.
fn to_cycle(raw: i64, unset: i32) -> i32 {
    i32::try_from(raw).unwrap_or(unset)
}
