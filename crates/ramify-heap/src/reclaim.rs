//! Epoch-based deferred reclamation.
//!
//! A safe wrapper around `crossbeam-epoch` pin/unpin semantics so resolution
//! walks can carry a [`HeapGuard`] without exposing raw epoch internals.
//! Retirement marks are deferred through guards: a thread that pinned before
//! the retirement finishes its walk before the mark takes effect.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Guard};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static RAMIFY_HEAP_GUARDS_PINNED_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_HEAP_RETIREMENTS_DEFERRED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of reclamation metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReclaimMetrics {
    pub ramify_heap_guards_pinned_total: u64,
    pub ramify_heap_retirements_deferred_total: u64,
}

/// Read current reclamation metrics.
#[must_use]
pub fn reclaim_metrics() -> ReclaimMetrics {
    ReclaimMetrics {
        ramify_heap_guards_pinned_total: RAMIFY_HEAP_GUARDS_PINNED_TOTAL.load(Ordering::Relaxed),
        ramify_heap_retirements_deferred_total: RAMIFY_HEAP_RETIREMENTS_DEFERRED_TOTAL
            .load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_reclaim_metrics() {
    RAMIFY_HEAP_GUARDS_PINNED_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_HEAP_RETIREMENTS_DEFERRED_TOTAL.store(0, Ordering::Relaxed);
}

pub(crate) fn record_retirement_deferred() {
    RAMIFY_HEAP_RETIREMENTS_DEFERRED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// HeapGuard
// ---------------------------------------------------------------------------

/// A pinned epoch participant.
///
/// Hold one across any walk over handles that a concurrent retirement may
/// target; deferred work scheduled while the guard is live runs only after
/// the guard (and every guard pinned in the same epoch) is dropped.
pub struct HeapGuard {
    guard: Guard,
}

impl HeapGuard {
    /// Pin the current thread into the active epoch.
    #[must_use]
    pub fn pin() -> Self {
        RAMIFY_HEAP_GUARDS_PINNED_TOTAL.fetch_add(1, Ordering::Relaxed);
        Self {
            guard: epoch::pin(),
        }
    }

    /// Schedule `f` to run after the current grace period expires.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        self.guard.defer(f);
    }

    /// Push locally buffered deferred work toward execution.
    pub fn flush(&self) {
        self.guard.flush();
    }
}

impl std::fmt::Debug for HeapGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HeapGuard(pinned)")
    }
}

/// Drive the collector until previously deferred work has run.
///
/// Repeated pin/flush cycles advance the global epoch; a few dozen rounds
/// are far more than any deferred bag needs. Intended for teardown paths
/// and tests, not hot paths.
pub fn quiesce() {
    for _ in 0..64 {
        let guard = HeapGuard::pin();
        guard.flush();
        drop(guard);
        std::thread::yield_now();
    }
}
