//! Directory listing invariants
//!
//! Several `TableDirectoryListing` handles over one table stand in for
//! several processes. These tests verify:
//! - Bounds only widen under concurrent `on_file_created`
//! - The modification counter counts every creation exactly once
//! - A read-only listing never changes shared state
//! - A refresh replaces whatever the incremental updates left behind

use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::thread_rng;
use strata_queue_core::{
    CollectingWarnSink, CycleNaming, NumberedCycles, DIRECTORY_LISTING_FILE,
};
use strata_queue_durability::{
    DirectoryListing, TableDirectoryListing, LOCK, UNSET_MAX_CYCLE, UNSET_MIN_CYCLE,
};
use strata_queue_storage::{SharedCounterTable, TableOptions};
use tempfile::TempDir;

// ============================================================================
// Helper Functions
// ============================================================================

fn listing(dir: &Path, read_only: bool, sink: Arc<CollectingWarnSink>) -> TableDirectoryListing {
    let table = SharedCounterTable::open(
        &dir.join(DIRECTORY_LISTING_FILE),
        TableOptions::new().with_capacity(8192).with_lock_key(LOCK),
    )
    .unwrap();
    let mut listing = TableDirectoryListing::new(
        table,
        dir,
        Arc::new(NumberedCycles::default()),
        sink,
        read_only,
    );
    listing.init().unwrap();
    listing
}

fn writer(dir: &Path) -> TableDirectoryListing {
    listing(dir, false, Arc::new(CollectingWarnSink::new()))
}

fn segment_file(dir: &Path, cycle: i32) -> PathBuf {
    let path = dir.join(NumberedCycles::default().file_name(cycle));
    std::fs::write(&path, b"").unwrap();
    path
}

// ============================================================================
// Monotonicity
// ============================================================================

/// Creations spread over several handles widen the bounds to the extremes.
#[test]
fn test_concurrent_creations_keep_extremes() {
    let dir = TempDir::new().unwrap();
    writer(dir.path());

    let mut cycles: Vec<i32> = (1..=400).collect();
    cycles.shuffle(&mut thread_rng());
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = cycles
        .chunks(cycles.len() / threads)
        .map(|chunk| {
            let chunk = chunk.to_vec();
            let path = dir.path().to_path_buf();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let listing = writer(&path);
                barrier.wait();
                for cycle in chunk {
                    let before = (listing.min_created_cycle(), listing.max_created_cycle());
                    listing
                        .on_file_created(Path::new("unused.cq4"), cycle)
                        .unwrap();
                    assert!(listing.max_created_cycle() >= before.1.max(cycle));
                    assert!(listing.min_created_cycle() <= before.0.min(cycle));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let check = writer(dir.path());
    assert_eq!(check.min_created_cycle(), 1);
    assert_eq!(check.max_created_cycle(), 400);
    assert_eq!(check.mod_count(), 400);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_bounds_are_min_and_max_of_created(cycles in proptest::collection::vec(-1000i32..1000, 1..40)) {
        let dir = TempDir::new().unwrap();
        let listing = writer(dir.path());
        let mut lo = UNSET_MIN_CYCLE;
        let mut hi = UNSET_MAX_CYCLE;
        for (n, cycle) in cycles.iter().enumerate() {
            listing.on_file_created(Path::new("unused.cq4"), *cycle).unwrap();
            lo = lo.min(*cycle);
            hi = hi.max(*cycle);
            prop_assert_eq!(listing.min_created_cycle(), lo);
            prop_assert_eq!(listing.max_created_cycle(), hi);
            prop_assert_eq!(listing.mod_count(), n as i64 + 1);
        }
    }
}

// ============================================================================
// End To End
// ============================================================================

/// Creating cycles 5, 3, 9, 3 leaves min 3, max 9 and four modifications.
#[test]
fn test_creation_sequence() {
    let dir = TempDir::new().unwrap();
    let listing = writer(dir.path());
    for cycle in [5, 3, 9, 3] {
        let file = segment_file(dir.path(), cycle);
        listing.on_file_created(&file, cycle).unwrap();
    }
    assert_eq!(listing.min_created_cycle(), 3);
    assert_eq!(listing.max_created_cycle(), 9);
    assert_eq!(listing.mod_count(), 4);

    let other = writer(dir.path());
    assert_eq!(other.min_created_cycle(), 3);
    assert_eq!(other.max_created_cycle(), 9);
}

/// Refresh over cycles {2, 4, 4, 7} yields 2..7 whatever came before.
#[test]
fn test_refresh_replaces_incremental_state() {
    let dir = TempDir::new().unwrap();
    let listing = writer(dir.path());
    for cycle in [-50, 90] {
        listing.on_file_created(Path::new("ghost.cq4"), cycle).unwrap();
    }
    for cycle in [2, 4, 4, 7] {
        segment_file(dir.path(), cycle);
    }

    writer(dir.path()).refresh().unwrap();
    assert_eq!(listing.min_created_cycle(), 2);
    assert_eq!(listing.max_created_cycle(), 7);
}

// ============================================================================
// Read-Only
// ============================================================================

/// Read-only handles warn and leave the table untouched.
#[test]
fn test_read_only_listing_never_mutates() {
    let dir = TempDir::new().unwrap();
    let rw = writer(dir.path());
    rw.on_file_created(Path::new("a.cq4"), 10).unwrap();
    let before = rw.to_string();

    let sink = Arc::new(CollectingWarnSink::new());
    let ro = listing(dir.path(), true, Arc::clone(&sink));
    segment_file(dir.path(), 1);
    segment_file(dir.path(), 99);
    ro.refresh().unwrap();
    for cycle in [0, 50, 200] {
        ro.on_file_created(Path::new("b.cq4"), cycle).unwrap();
    }

    assert_eq!(rw.to_string(), before);
    assert_eq!(sink.count_containing("read-only"), 3);
}
