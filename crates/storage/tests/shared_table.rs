//! Cross-handle tests for the shared counter table
//!
//! Each `SharedCounterTable::open` maps the file independently, the same way
//! a second process would. These tests verify:
//! - Key uniqueness when many handles create the same keys at once
//! - Values written through one handle are visible through every other
//! - The table lock excludes all other handles while held

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::thread_rng;
use strata_queue_storage::{SharedCounterTable, TableOptions, UNINITIALIZED};
use tempfile::TempDir;

// ============================================================================
// Helper Functions
// ============================================================================

fn open(path: &Path) -> SharedCounterTable {
    SharedCounterTable::open(
        path,
        TableOptions::new()
            .with_capacity(16 * 1024)
            .with_timeout(Duration::from_secs(2)),
    )
    .unwrap()
}

// ============================================================================
// Key Uniqueness
// ============================================================================

/// Many handles racing to create the same keys end up with one entry per key.
#[test]
fn test_concurrent_creation_yields_unique_keys() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("counters.cq4t");
    open(&path);

    let threads = 8;
    let keys: Vec<String> = (0..20).map(|i| format!("counter.{}", i)).collect();
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let path = path.clone();
            let keys = keys.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let table = open(&path);
                barrier.wait();
                let mut order = keys.clone();
                order.shuffle(&mut thread_rng());
                for key in &order {
                    table.acquire_value(key).unwrap();
                }
                for key in &keys {
                    table.acquire_value(key).unwrap().fetch_add(1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let table = open(&path);
    let entries = table.entries().unwrap();
    // lock key plus one per counter
    assert_eq!(entries.len(), keys.len() + 1);
    let unique: HashSet<_> = entries.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(unique.len(), entries.len());
    for key in &keys {
        let value = table.acquire_value(key).unwrap().load_acquire();
        assert_eq!(value, UNINITIALIZED + threads as i64, "key {}", key);
    }
}

/// A slot resolved before another handle appends more keys stays valid.
#[test]
fn test_values_visible_across_handles() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("counters.cq4t");
    let a = open(&path);
    let b = open(&path);

    let slot_a = a.acquire_value("shared").unwrap();
    slot_a.store_release(11);
    for i in 0..50 {
        b.acquire_value(&format!("filler.{}", i)).unwrap();
    }

    let slot_b = b.acquire_value("shared").unwrap();
    assert_eq!(slot_b.load_acquire(), 11);
    assert_eq!(slot_b.offset(), slot_a.offset());
    slot_b.fetch_max(40);
    assert_eq!(slot_a.load_acquire(), 40);
}

// ============================================================================
// Table Lock
// ============================================================================

/// Only one handle at a time runs inside `with_exclusive_lock`.
#[test]
fn test_exclusive_lock_excludes_other_handles() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("counters.cq4t");
    open(&path);

    let inside = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let inside = Arc::clone(&inside);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let table = open(&path);
                for _ in 0..10 {
                    table
                        .with_exclusive_lock(|_| {
                            assert!(!inside.swap(true, Ordering::SeqCst), "two holders");
                            entered.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_micros(200));
                            inside.store(false, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(entered.load(Ordering::SeqCst), 40);
}

/// Reopening with a different lock key is refused.
#[test]
fn test_lock_key_is_fixed_at_format_time() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("counters.cq4t");
    open(&path);
    let result = SharedCounterTable::open(
        &path,
        TableOptions::new()
            .with_capacity(16 * 1024)
            .with_lock_key("other.lock"),
    );
    assert!(result.is_err());
}
