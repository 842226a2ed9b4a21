//! Queue directory handle
//!
//! A queue directory holds one segment file per cycle plus the directory
//! listing table. Opening it brings the listing up to date; creating a
//! segment through [`QueueDirectory::acquire_segment`] keeps the listing in
//! step without another scan.
//!
//! ```text
//! <queue dir>/
//!   queue.toml                  (optional, see `open_default`)
//!   directory-listing.cq4t      (SharedCounterTable)
//!   00000001.cq4                (MappedSegment per cycle)
//!   00000002.cq4
//! ```

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use strata_queue_core::header::HEADER_SIZE;
use strata_queue_core::{
    system_clock, tracing_sink, Error, NumberedCycles, QueueConfig, Result, SharedClock,
    SharedCycleNaming, SharedWarnSink, DIRECTORY_LISTING_FILE,
};
use strata_queue_storage::{
    HeaderStore, MappedSegment, SegmentOptions, SharedCounterTable, TableOptions,
};

use crate::listing::{DirectoryListing, TableDirectoryListing, LOCK};
use crate::recovery::{
    RecoveryContext, RecoveryError, RecoveryRegistry, RecoveryResult, StoreRecovery,
};

/// Pluggable parts of a [`QueueDirectory`].
#[derive(Clone)]
pub struct DirectoryOptions {
    /// File name <-> cycle mapping
    pub naming: SharedCycleNaming,
    /// Clock for lock deadlines
    pub clock: SharedClock,
    /// Receiver of listing and recovery warnings
    pub warnings: SharedWarnSink,
    /// Overlap hint reported to recovery by opened segments
    pub overlap_size: Option<u64>,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        DirectoryOptions {
            naming: Arc::new(NumberedCycles::default()),
            clock: system_clock(),
            warnings: tracing_sink(),
            overlap_size: None,
        }
    }
}

impl DirectoryOptions {
    /// Defaults: numbered cycles, system clock, tracing warnings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the naming scheme (builder pattern).
    pub fn with_naming(mut self, naming: SharedCycleNaming) -> Self {
        self.naming = naming;
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

    /// Set the overlap hint (builder pattern).
    pub fn with_overlap_size(mut self, overlap: Option<u64>) -> Self {
        self.overlap_size = overlap;
        self
    }
}

/// An open queue directory.
pub struct QueueDirectory {
    path: PathBuf,
    config: QueueConfig,
    options: DirectoryOptions,
    registry: RecoveryRegistry,
    recovery_tag: u32,
    listing: TableDirectoryListing,
}

impl QueueDirectory {
    /// Open the queue at `path` with default options.
    pub fn open(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
        Self::open_with(path, config, DirectoryOptions::default(), RecoveryRegistry::with_defaults())
    }

    /// Open the queue at `path` using the `queue.toml` stored there, writing
    /// a default one first if missing.
    pub fn open_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let config = QueueConfig::load_or_create(path).map_err(|e| Error::invalid(e.to_string()))?;
        Self::open(path, config)
    }

    /// Open the queue at `path`.
    ///
    /// Creates the directory when missing, then initialises and refreshes
    /// the directory listing.
    pub fn open_with(
        path: impl AsRef<Path>,
        config: QueueConfig,
        options: DirectoryOptions,
        registry: RecoveryRegistry,
    ) -> Result<Self> {
        config.validate().map_err(|e| Error::invalid(e.to_string()))?;
        let recovery_tag = registry
            .tag_for_name(&config.recovery.strategy)
            .map_err(|e| Error::invalid(e.to_string()))?;

        let path = path.as_ref().to_path_buf();
        if !config.read_only {
            std::fs::create_dir_all(&path)?;
        }

        let table = SharedCounterTable::open(
            &path.join(DIRECTORY_LISTING_FILE),
            TableOptions::new()
                .with_capacity(config.table_capacity)
                .with_lock_key(LOCK)
                .with_timeout(config.timeout())
                .with_clock(Arc::clone(&options.clock))
                .with_warnings(Arc::clone(&options.warnings)),
        )?;
        let mut listing = TableDirectoryListing::new(
            table,
            &path,
            Arc::clone(&options.naming),
            Arc::clone(&options.warnings),
            config.read_only,
        );
        listing.init()?;
        listing.refresh()?;

        info!(
            path = %path.display(),
            read_only = config.read_only,
            min_cycle = listing.min_created_cycle(),
            max_cycle = listing.max_created_cycle(),
            "Opened queue directory"
        );

        Ok(QueueDirectory {
            path,
            config,
            options,
            registry,
            recovery_tag,
            listing,
        })
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Active configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The shared listing
    pub fn listing(&self) -> &TableDirectoryListing {
        &self.listing
    }

    /// Registered recovery strategies
    pub fn registry(&self) -> &RecoveryRegistry {
        &self.registry
    }

    /// Path of the segment for `cycle`
    pub fn segment_path(&self, cycle: i32) -> PathBuf {
        self.path.join(self.options.naming.file_name(cycle))
    }

    /// Re-scan the directory into the listing
    pub fn refresh(&self) -> Result<()> {
        self.listing.refresh()
    }

    /// Open the segment for `cycle`, creating it if absent.
    ///
    /// Exactly one opener, across all processes, sees the file as new and
    /// records it in the listing. Read-only handles never create segments.
    pub fn acquire_segment(&self, cycle: i32) -> Result<MappedSegment> {
        let path = self.segment_path(cycle);
        let created = if self.config.read_only {
            if !path.exists() {
                return Err(Error::invalid(format!(
                    "no segment for cycle {} in read-only queue {}",
                    cycle,
                    self.path.display()
                )));
            }
            false
        } else {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => true,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => false,
                Err(e) => return Err(e.into()),
            }
        };

        let segment = MappedSegment::open(
            &path,
            SegmentOptions {
                capacity: self.config.segment_capacity,
                overlap_size: self.options.overlap_size,
                recovery_tag: self.recovery_tag,
                format_timeout: self.config.timeout(),
            },
        )?;
        if created {
            self.listing.on_file_created(&path, cycle)?;
        }
        debug!(cycle, created, path = %path.display(), "Acquired segment");
        Ok(segment)
    }

    /// Recovery strategy recorded in `segment`
    pub fn recovery_for(&self, segment: &MappedSegment) -> RecoveryResult<Arc<dyn StoreRecovery>> {
        let ctx = RecoveryContext::for_segment(
            segment,
            Arc::clone(&self.options.clock),
            Arc::clone(&self.options.warnings),
            self.config.recovery.clone(),
        );
        self.registry.resolve(segment.recovery_tag(), &ctx)
    }

    /// Append one block to `segment`, recovering stuck headers on the way.
    ///
    /// Returns the offset of the new block, or [`RecoveryError::EndOfData`]
    /// when the segment is full.
    pub fn append(
        &self,
        segment: &MappedSegment,
        recovery: &dyn StoreRecovery,
        payload: &[u8],
        metadata: bool,
    ) -> RecoveryResult<u64> {
        if self.config.read_only {
            return Err(Error::invalid("cannot append to a read-only queue").into());
        }
        if payload.is_empty() && !metadata {
            return Err(Error::invalid("data blocks must not be empty").into());
        }
        let length = u32::try_from(payload.len())
            .map_err(|_| Error::invalid(format!("payload of {} bytes too large", payload.len())))?;
        let last = segment.last_position();
        let offset = recovery.write_header(
            segment,
            length,
            length,
            self.config.timeout(),
            Some(&last),
        )?;
        segment
            .write_bytes_at(offset + HEADER_SIZE, payload)
            .and_then(|_| segment.end_header(offset, length, metadata))
            .map_err(RecoveryError::from)?;
        Ok(offset)
    }

    /// Close the listing table
    pub fn close(self) -> Result<()> {
        Box::new(self.listing).close()
    }
}

impl std::fmt::Debug for QueueDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDirectory")
            .field("path", &self.path)
            .field("read_only", &self.config.read_only)
            .field("recovery_tag", &self.recovery_tag)
            .finish()
    }
}
