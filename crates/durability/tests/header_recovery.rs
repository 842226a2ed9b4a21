//! Header recovery across handles
//!
//! A header claimed through one `MappedSegment` handle and never finished
//! plays the part of a writer process that died mid-write. These tests
//! verify:
//! - Exactly one padding block is committed however many writers recover
//! - Every recovering writer still gets its block written
//! - The dead writer cannot finish its block afterwards
//! - The recovery lock expires on its own and excludes while held
//! - An index pointer rebuilt by one holder survives the next holder

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use strata_queue_core::header::HeaderState;
use strata_queue_core::{
    system_clock, CollectingWarnSink, Error, ManualClock, PaddingPolicy, RecoveryConfig,
};
use strata_queue_durability::{
    RecoveryContext, RecoveryError, RecoveryRegistry, StoreRecovery, RECOVERY_MARKER,
};
use strata_queue_storage::{
    FramedWriter, HeaderStore, HeaderWriteOutcome, MappedSegment, SegmentOptions, DATA_START,
    LONG_NOT_COMPLETE,
};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_millis(100);
const PADDING: u32 = 128;

// ============================================================================
// Helper Functions
// ============================================================================

fn open(dir: &TempDir) -> MappedSegment {
    MappedSegment::open(
        &dir.path().join("00000001.cq4"),
        SegmentOptions::new().with_capacity(64 * 1024),
    )
    .unwrap()
}

fn recovery_for(
    segment: &MappedSegment,
    sink: Arc<CollectingWarnSink>,
) -> Arc<dyn StoreRecovery> {
    let ctx = RecoveryContext::for_segment(
        segment,
        system_clock(),
        sink,
        RecoveryConfig {
            padding: PaddingPolicy::Fixed { bytes: PADDING },
            ..RecoveryConfig::default()
        },
    );
    RecoveryRegistry::with_defaults()
        .resolve(segment.recovery_tag(), &ctx)
        .unwrap()
}

/// Claim the next header through `segment` and never finish it.
fn abandon_header(segment: &MappedSegment) -> u64 {
    match segment.write_header(16, 16, TIMEOUT, None) {
        HeaderWriteOutcome::Completed(offset) => offset,
        other => panic!("could not claim header: {:?}", other),
    }
}

fn write_block(segment: &MappedSegment, recovery: &dyn StoreRecovery, payload: &[u8]) -> u64 {
    let last = segment.last_position();
    let offset = recovery
        .write_header(segment, payload.len() as u32, payload.len() as u32, TIMEOUT, Some(&last))
        .unwrap();
    segment.write_bytes_at(offset + 4, payload).unwrap();
    segment.end_header(offset, payload.len() as u32, false).unwrap();
    offset
}

// ============================================================================
// Idempotence
// ============================================================================

/// Two writers racing to recover the same stuck header commit one padding
/// block between them and both get their data in.
#[test]
fn test_concurrent_recovery_commits_one_padding_block() {
    let dir = TempDir::new().unwrap();
    let dead = open(&dir);
    let stuck = abandon_header(&dead);
    assert_eq!(stuck, DATA_START);

    let sink = Arc::new(CollectingWarnSink::new());
    let barrier = Arc::new(Barrier::new(2));
    let writers: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|name| {
            let path = dir.path().to_path_buf();
            let sink = Arc::clone(&sink);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let segment = MappedSegment::open(
                    &path.join("00000001.cq4"),
                    SegmentOptions::new().with_capacity(64 * 1024),
                )
                .unwrap();
                let recovery = recovery_for(&segment, sink);
                barrier.wait();
                write_block(&segment, recovery.as_ref(), name.as_bytes())
            })
        })
        .collect();
    let offsets: Vec<u64> = writers.into_iter().map(|h| h.join().unwrap()).collect();
    assert_ne!(offsets[0], offsets[1]);

    let reader = open(&dir);
    let blocks: Vec<_> = reader.blocks().collect();
    let padding: Vec<_> = blocks.iter().filter(|b| b.is_metadata()).collect();
    assert_eq!(padding.len(), 1);
    assert_eq!(padding[0].offset, stuck);
    assert!(padding[0].payload.starts_with(RECOVERY_MARKER));

    let mut data: Vec<_> = blocks
        .iter()
        .filter(|b| !b.is_metadata())
        .map(|b| b.payload.clone())
        .collect();
    data.sort();
    assert_eq!(data, vec![b"left".to_vec(), b"right".to_vec()]);
    assert_eq!(sink.count_containing("switching to a corrupt meta data message"), 1);
}

/// The writer whose header was quarantined finds out when it tries to finish.
#[test]
fn test_dead_writer_cannot_finish_quarantined_header() {
    let dir = TempDir::new().unwrap();
    let dead = open(&dir);
    let stuck = abandon_header(&dead);

    let live = open(&dir);
    let recovery = recovery_for(&live, Arc::new(CollectingWarnSink::new()));
    write_block(&live, recovery.as_ref(), b"payload");

    let err = dead.end_header(stuck, 16, false).unwrap_err();
    assert!(matches!(err, Error::Corruption(_)));
    assert_eq!(
        dead.read_block(stuck).unwrap().state,
        HeaderState::Complete {
            length: PADDING,
            metadata: true
        }
    );
}

/// Recovering a header that another writer already recovered only warns.
#[test]
fn test_late_recovery_reuses_existing_padding() {
    let dir = TempDir::new().unwrap();
    let dead = open(&dir);
    abandon_header(&dead);

    let first = open(&dir);
    let second = open(&dir);
    assert_eq!(second.write_header(8, 8, TIMEOUT, None), HeaderWriteOutcome::TimedOut);

    let sink = Arc::new(CollectingWarnSink::new());
    write_block(&first, recovery_for(&first, Arc::clone(&sink)).as_ref(), b"one");
    let offset = recovery_for(&second, Arc::clone(&sink))
        .recover_and_write_header(&second, 3, TIMEOUT, None)
        .unwrap();

    assert!(offset > DATA_START + 4 + PADDING as u64);
    assert_eq!(sink.count_containing("but message now exists"), 1);
    assert_eq!(second.blocks().filter(|b| b.is_metadata()).count(), 1);
}

// ============================================================================
// Recovery Lock
// ============================================================================

/// A lock left behind by a dead holder becomes available once its deadline
/// has passed.
#[test]
fn test_recovery_lock_expires() {
    let dir = TempDir::new().unwrap();
    let segment = open(&dir);
    let clock = Arc::new(ManualClock::new(10_000));
    let ctx = RecoveryContext::for_segment(
        &segment,
        clock.clone(),
        Arc::new(CollectingWarnSink::new()),
        RecoveryConfig::default(),
    );
    let registry = RecoveryRegistry::with_defaults();
    let dead = registry.resolve(1, &ctx).unwrap();
    let live = registry.resolve(1, &ctx).unwrap();

    let timeout = Duration::from_millis(1_000);
    let abandoned = dead.try_acquire_lock(timeout).unwrap();
    assert_eq!(abandoned, 10_500);
    assert!(live.try_acquire_lock(timeout).is_none());

    clock.advance(501);
    let taken = live.try_acquire_lock(timeout).unwrap();
    assert!(taken > abandoned);
    live.release_lock(taken);
    assert_eq!(segment.recovery_timestamp().load_acquire(), 0);
}

/// Index rebuilds on different handles never overlap.
#[test]
fn test_index_rebuilds_are_serialised() {
    let dir = TempDir::new().unwrap();
    open(&dir);
    let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let path = dir.path().join("00000001.cq4");
            let active = Arc::clone(&active);
            thread::spawn(move || {
                let segment =
                    MappedSegment::open(&path, SegmentOptions::new().with_capacity(64 * 1024))
                        .unwrap();
                let recovery = recovery_for(&segment, Arc::new(CollectingWarnSink::new()));
                let slot = segment.index_to_index();
                for _ in 0..5 {
                    recovery
                        .recover_index_to_index(
                            &slot,
                            &mut || {
                                use std::sync::atomic::Ordering;
                                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                                    return Err(RecoveryError::action("overlapping rebuild"));
                                }
                                thread::sleep(Duration::from_millis(1));
                                active.fetch_sub(1, Ordering::SeqCst);
                                Ok(0)
                            },
                            Duration::from_secs(2),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// A rebuild waiting on the lock checks the slot only once it holds the
/// lock, so the pointer the previous holder rebuilt is kept.
#[test]
fn test_waiting_rebuild_keeps_pointer_rebuilt_by_holder() {
    let dir = TempDir::new().unwrap();
    let holder = open(&dir);
    let sink = Arc::new(CollectingWarnSink::new());
    let recovery = recovery_for(&holder, Arc::clone(&sink));
    let slot = holder.index_to_index();
    slot.store_release(LONG_NOT_COMPLETE);
    let deadline = recovery.try_acquire_lock(Duration::from_secs(10)).unwrap();

    let waiter = {
        let path = dir.path().join("00000001.cq4");
        let sink = Arc::clone(&sink);
        thread::spawn(move || {
            let segment =
                MappedSegment::open(&path, SegmentOptions::new().with_capacity(64 * 1024))
                    .unwrap();
            let recovery = recovery_for(&segment, sink);
            let slot = segment.index_to_index();
            let mut seen = None;
            recovery
                .recover_index_to_index(
                    &slot,
                    &mut || {
                        seen = Some(slot.load_acquire());
                        Ok(0)
                    },
                    Duration::from_secs(10),
                )
                .unwrap();
            seen
        })
    };

    thread::sleep(Duration::from_millis(20));
    slot.store_release(4096);
    recovery.release_lock(deadline);

    assert_eq!(waiter.join().unwrap(), Some(4096));
    assert_eq!(slot.load_acquire(), 4096);
    assert_eq!(sink.count_containing("assuming it was recovered"), 1);
    assert_eq!(sink.count_containing("Rebuilding"), 0);
}

/// A writer that dies in the last bytes of a segment makes the next writer
/// roll instead of failing.
#[test]
fn test_crash_at_segment_tail_rolls() {
    let dir = TempDir::new().unwrap();
    let capacity = 64 * 1024;
    let dead = open(&dir);
    let stuck = capacity - 1024;
    dead.set_write_position(stuck);
    assert_eq!(abandon_header(&dead), stuck);

    let live = open(&dir);
    live.set_write_position(stuck);
    let ctx = RecoveryContext::for_segment(
        &live,
        system_clock(),
        Arc::new(CollectingWarnSink::new()),
        RecoveryConfig::default(),
    );
    let recovery = RecoveryRegistry::with_defaults()
        .resolve(live.recovery_tag(), &ctx)
        .unwrap();
    let err = recovery
        .write_header(&live, 16, 16, TIMEOUT, None)
        .unwrap_err();
    assert!(err.is_end_of_data());
    assert!(live.read_block(stuck).unwrap().is_metadata());
}
