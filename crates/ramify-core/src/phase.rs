//! Phase sequencer.
//!
//! A CAS-driven monotonic counter sequencing staged behavior: several
//! threads may race to advance the same object through ordered phases, and
//! the counter only ever moves forward, one step at a time, never past the
//! final marker.
//!
//! The protocol guarantees monotonic progress of the counter, not
//! exactly-once execution of each phase body: multiple threads can observe
//! the same phase before any of them wins the advance, so a body may run
//! redundantly and a slow thread may never dispatch intermediate phases it
//! never observes. Phase bodies are therefore required to be idempotent and
//! skip-safe.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static RAMIFY_PHASE_DISPATCHES_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_PHASE_ADVANCES_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_PHASE_ADVANCE_LOSSES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of phase sequencer metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseMetrics {
    pub ramify_phase_dispatches_total: u64,
    pub ramify_phase_advances_total: u64,
    pub ramify_phase_advance_losses_total: u64,
}

/// Read current phase sequencer metrics.
#[must_use]
pub fn phase_metrics() -> PhaseMetrics {
    PhaseMetrics {
        ramify_phase_dispatches_total: RAMIFY_PHASE_DISPATCHES_TOTAL.load(Ordering::Relaxed),
        ramify_phase_advances_total: RAMIFY_PHASE_ADVANCES_TOTAL.load(Ordering::Relaxed),
        ramify_phase_advance_losses_total: RAMIFY_PHASE_ADVANCE_LOSSES_TOTAL
            .load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_phase_metrics() {
    RAMIFY_PHASE_DISPATCHES_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_PHASE_ADVANCES_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_PHASE_ADVANCE_LOSSES_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// PhaseState
// ---------------------------------------------------------------------------

/// An enumerable, ordered phase domain `[INIT, FINAL]`.
///
/// `from_index` must accept every index in `INIT.index()..=FINAL.index()`;
/// the sequencer never stores anything outside that range.
pub trait PhaseState: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// First phase.
    const INIT: Self;
    /// Terminal marker; no behavior is dispatched for it.
    const FINAL: Self;

    /// Position of this phase in the order.
    fn index(self) -> u64;

    /// Phase at `raw` (clamped to the domain by implementors).
    fn from_index(raw: u64) -> Self;
}

// ---------------------------------------------------------------------------
// PhaseSequencer
// ---------------------------------------------------------------------------

/// Atomic phase counter attached to an entity undergoing staged
/// setup/teardown.
pub struct PhaseSequencer<S: PhaseState> {
    state: AtomicU64,
    _marker: PhantomData<S>,
}

impl<S: PhaseState> PhaseSequencer<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(S::INIT.index()),
            _marker: PhantomData,
        }
    }

    /// Currently observed phase.
    #[must_use]
    pub fn current(&self) -> S {
        S::from_index(self.state.load(Ordering::Acquire))
    }

    /// Whether the counter has reached the final marker.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.current() == S::FINAL
    }

    /// Attempt the step `s -> s+1`.
    ///
    /// If the exchange fails, somebody else got there first — use the
    /// resulting state in any case. A losing thread does not retry its own
    /// dispatch of `s`; it adopts the counter's new value and proceeds.
    fn advance(&self, s: S) -> S {
        let next = s.index() + 1;
        match self
            .state
            .compare_exchange(s.index(), next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                RAMIFY_PHASE_ADVANCES_TOTAL.fetch_add(1, Ordering::Relaxed);
                S::from_index(next)
            }
            Err(actual) => {
                RAMIFY_PHASE_ADVANCE_LOSSES_TOTAL.fetch_add(1, Ordering::Relaxed);
                S::from_index(actual)
            }
        }
    }

    /// Dispatch phase behavior until the counter reaches `FINAL`.
    ///
    /// `dispatch` receives the observed phase; it may run redundantly on
    /// racing threads and must be idempotent. When every `run` call has
    /// returned, the counter equals `FINAL`.
    pub fn run(&self, mut dispatch: impl FnMut(S)) {
        let mut s = self.current();
        while s.index() < S::FINAL.index() {
            RAMIFY_PHASE_DISPATCHES_TOTAL.fetch_add(1, Ordering::Relaxed);
            dispatch(s);
            s = self.advance(s);
        }
    }
}

impl<S: PhaseState> Default for PhaseSequencer<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PhaseState> fmt::Debug for PhaseSequencer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseSequencer")
            .field("current", &self.current())
            .field("is_final", &self.is_final())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Setup {
        Allocate,
        Link,
        Announce,
        Done,
    }

    impl PhaseState for Setup {
        const INIT: Self = Self::Allocate;
        const FINAL: Self = Self::Done;

        fn index(self) -> u64 {
            match self {
                Self::Allocate => 0,
                Self::Link => 1,
                Self::Announce => 2,
                Self::Done => 3,
            }
        }

        fn from_index(raw: u64) -> Self {
            match raw {
                0 => Self::Allocate,
                1 => Self::Link,
                2 => Self::Announce,
                _ => Self::Done,
            }
        }
    }

    #[test]
    fn single_thread_dispatches_each_phase_in_order() {
        let seq: PhaseSequencer<Setup> = PhaseSequencer::new();
        let mut observed = Vec::new();
        seq.run(|s| observed.push(s));
        assert_eq!(observed, vec![Setup::Allocate, Setup::Link, Setup::Announce]);
        assert!(seq.is_final());

        // Running again dispatches nothing: the counter never exceeds FINAL.
        seq.run(|_| panic!("no phase may be dispatched after FINAL"));
        assert_eq!(seq.current(), Setup::Done);
    }

    #[test]
    fn concurrent_runs_reach_final_with_every_phase_covered() {
        const THREADS: usize = 8;
        let seq: Arc<PhaseSequencer<Setup>> = Arc::new(PhaseSequencer::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let per_phase: Arc<[AtomicU64; 3]> =
            Arc::new([AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)]);

        let mut joins = Vec::new();
        for _ in 0..THREADS {
            let seq = Arc::clone(&seq);
            let barrier = Arc::clone(&barrier);
            let per_phase = Arc::clone(&per_phase);
            joins.push(thread::spawn(move || {
                barrier.wait();
                let mut last: Option<u64> = None;
                seq.run(|s| {
                    // Each thread observes a non-decreasing phase sequence.
                    if let Some(prev) = last {
                        assert!(s.index() >= prev, "phase went backwards");
                    }
                    last = Some(s.index());
                    per_phase[s.index() as usize].fetch_add(1, Ordering::Relaxed);
                });
            }));
        }
        for j in joins {
            j.join().unwrap();
        }

        assert_eq!(seq.current(), Setup::Done);
        for (i, counter) in per_phase.iter().enumerate() {
            let runs = counter.load(Ordering::Relaxed);
            assert!(runs >= 1, "phase {i} never dispatched");
        }
    }

    #[test]
    fn observers_never_see_the_counter_decrease() {
        let seq: Arc<PhaseSequencer<Setup>> = Arc::new(PhaseSequencer::new());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observations = Arc::new(Mutex::new(Vec::new()));

        let watcher = {
            let seq = Arc::clone(&seq);
            let stop = Arc::clone(&stop);
            let observations = Arc::clone(&observations);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    observations.lock().unwrap().push(seq.current().index());
                }
            })
        };

        let mut runners = Vec::new();
        for _ in 0..4 {
            let seq = Arc::clone(&seq);
            runners.push(thread::spawn(move || seq.run(|_| {})));
        }
        for r in runners {
            r.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        watcher.join().unwrap();

        let observations = observations.lock().unwrap();
        for pair in observations.windows(2) {
            assert!(pair[1] >= pair[0], "counter decreased: {} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn metrics_account_for_advances() {
        let before = phase_metrics();
        let seq: PhaseSequencer<Setup> = PhaseSequencer::new();
        seq.run(|_| {});
        let after = phase_metrics();
        assert!(after.ramify_phase_advances_total >= before.ramify_phase_advances_total + 3);
        assert!(after.ramify_phase_dispatches_total >= before.ramify_phase_dispatches_total + 3);
    }
}
