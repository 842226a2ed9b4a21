//! Self-expiring cross-process lock
//!
//! The lock is a single [`SharedValue`] holding `0` when free or the
//! wall-clock millisecond until which the current holder owns it. Acquiring
//! CASes a value that is already in the past to `now + timeout / 2`;
//! releasing CASes that exact deadline back to `0`.
//!
//! A holder that dies simply stops mattering once its deadline passes: any
//! other process whose clock is past the deadline may take the lock. A late
//! release by a holder whose lease already expired fails its CAS and cannot
//! clobber the new holder.

use std::time::{Duration, Instant};

use strata_queue_core::{SharedClock, SharedWarnSink};

use crate::value::SharedValue;

/// Pause between acquisition attempts
const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// A lock whose ownership is a deadline rather than a flag.
#[derive(Clone)]
pub struct ExpiringLock {
    value: SharedValue,
    clock: SharedClock,
    warnings: SharedWarnSink,
    component: &'static str,
}

impl ExpiringLock {
    /// Lock driven by `value`. Warnings are attributed to `component`.
    pub fn new(
        value: SharedValue,
        clock: SharedClock,
        warnings: SharedWarnSink,
        component: &'static str,
    ) -> Self {
        ExpiringLock {
            value,
            clock,
            warnings,
            component,
        }
    }

    /// Current raw lock value: `0` or the holder's deadline
    pub fn deadline(&self) -> i64 {
        self.value.load_acquire()
    }

    /// True when nobody holds an unexpired lease
    pub fn is_free(&self) -> bool {
        self.value.load_acquire() < self.clock.now_millis()
    }

    /// One acquisition attempt. Returns the deadline on success.
    pub fn try_acquire(&self, timeout: Duration) -> Option<i64> {
        let now = self.clock.now_millis();
        let ts = self.value.load_acquire();
        let deadline = now + lease_millis(timeout);
        if ts < now && self.value.compare_and_swap(ts, deadline) {
            Some(deadline)
        } else {
            None
        }
    }

    /// Spin until the lock is obtained; returns the deadline this caller set.
    ///
    /// Each time a full `timeout` passes without success a warning is
    /// reported and the wait continues. There is no upper bound; callers that
    /// cannot wait forever must impose their own deadline.
    pub fn acquire(&self, timeout: Duration) -> i64 {
        let mut window_start = Instant::now();
        loop {
            if let Some(deadline) = self.try_acquire(timeout) {
                return deadline;
            }
            if window_start.elapsed() >= timeout {
                self.warnings.warn(
                    self.component,
                    "Unable to obtain the global lock in time, retrying",
                );
                window_start = Instant::now();
            }
            std::thread::sleep(RETRY_PAUSE);
        }
    }

    /// Give the lock back. Returns false (and warns) when another process
    /// already took over an expired lease.
    pub fn release(&self, deadline: i64) -> bool {
        if self.value.compare_and_swap(deadline, 0) {
            return true;
        }
        self.warnings.warn(
            self.component,
            &format!(
                "Another process obtained the lock (expected deadline {}, found {})",
                deadline,
                self.value.load_acquire()
            ),
        );
        false
    }

    /// Acquire and return a guard that releases on drop.
    pub fn lock(&self, timeout: Duration) -> ExpiringLockGuard<'_> {
        let deadline = self.acquire(timeout);
        ExpiringLockGuard {
            lock: self,
            deadline,
        }
    }
}

/// Holds an [`ExpiringLock`] until dropped, including during unwinding.
pub struct ExpiringLockGuard<'a> {
    lock: &'a ExpiringLock,
    deadline: i64,
}

impl ExpiringLockGuard<'_> {
    /// Deadline this guard holds the lock until
    pub fn deadline(&self) -> i64 {
        self.deadline
    }
}

impl Drop for ExpiringLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.deadline);
    }
}

/// Lease granted for a given timeout: half of it, at least one millisecond.
fn lease_millis(timeout: Duration) -> i64 {
    ((timeout.as_millis() / 2) as i64).max(1)
}
