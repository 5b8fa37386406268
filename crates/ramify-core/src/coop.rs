//! Cooperative task protocol.
//!
//! A cooperative task is something that has to be done before something else
//! can be done, and any thread that encounters one must assist in finishing
//! it before proceeding. That helping rule is the protocol's non-blocking
//! core: no thread can be perpetually stalled by a slow or preempted peer,
//! because every observer completes the pending work itself.
//!
//! A [`TaskSlot`] holds at most one pending task at any instant. Task bodies
//! get at-least-once semantics — both the installing thread and any number
//! of helpers may run them, possibly more than once if a race allows — so
//! bodies must be idempotent.
//!
//! # Tracing & metrics
//!
//! - DEBUG on `ramify.coop` when a thread helps a foreign task.
//! - Counters: `ramify_coop_installs_total`, `ramify_coop_helped_runs_total`,
//!   `ramify_coop_reentrant_installs_total`, `ramify_coop_remove_races_total`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use ramify_heap::{AtomicSlot, Ref};
use ramify_observability::{now_ns, ProtocolEvent};
use ramify_types::TaskTag;

use crate::space::ManagedSpace;

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static RAMIFY_COOP_INSTALLS_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_COOP_HELPED_RUNS_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_COOP_REENTRANT_INSTALLS_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_COOP_REMOVE_RACES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of cooperative protocol metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoopMetrics {
    pub ramify_coop_installs_total: u64,
    pub ramify_coop_helped_runs_total: u64,
    pub ramify_coop_reentrant_installs_total: u64,
    pub ramify_coop_remove_races_total: u64,
}

/// Read current cooperative protocol metrics.
#[must_use]
pub fn coop_metrics() -> CoopMetrics {
    CoopMetrics {
        ramify_coop_installs_total: RAMIFY_COOP_INSTALLS_TOTAL.load(Ordering::Relaxed),
        ramify_coop_helped_runs_total: RAMIFY_COOP_HELPED_RUNS_TOTAL.load(Ordering::Relaxed),
        ramify_coop_reentrant_installs_total: RAMIFY_COOP_REENTRANT_INSTALLS_TOTAL
            .load(Ordering::Relaxed),
        ramify_coop_remove_races_total: RAMIFY_COOP_REMOVE_RACES_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_coop_metrics() {
    RAMIFY_COOP_INSTALLS_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_COOP_HELPED_RUNS_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_COOP_REENTRANT_INSTALLS_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_COOP_REMOVE_RACES_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// CoopTask
// ---------------------------------------------------------------------------

/// An installable unit of work.
///
/// `run` must be safe to invoke concurrently by the owning thread and any
/// number of helpers, and safe to invoke more than once if a race allows.
pub trait CoopTask: Send + Sync {
    /// Subtype discriminator, for telemetry and debugging only.
    fn tag(&self) -> TaskTag;

    /// Execute the task body.
    fn run(&self, space: &ManagedSpace);
}

/// Handle to a task allocated in the space's task arena.
pub type TaskRef = Ref<Arc<dyn CoopTask>>;

// ---------------------------------------------------------------------------
// TaskSlot
// ---------------------------------------------------------------------------

/// A pending-task site: holds zero or one task reference.
pub struct TaskSlot {
    inner: AtomicSlot<Arc<dyn CoopTask>>,
}

impl TaskSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: AtomicSlot::empty(),
        }
    }

    /// The currently announced pending task, if any.
    #[must_use]
    pub fn pending(&self) -> Option<TaskRef> {
        self.inner.load()
    }

    /// Announce `task` as the pending work at this site.
    ///
    /// If a foreign task is already announced, the calling thread runs it to
    /// completion on its behalf and retries. If the announced task is `task`
    /// itself — a second thread installing the same instance as part of its
    /// execution — this returns immediately; that is a race to install, not
    /// a conflict.
    pub fn install(&self, space: &ManagedSpace, task: TaskRef) {
        let mut contended = false;
        loop {
            match self.inner.try_change(None, Some(task)) {
                Ok(_) => {
                    RAMIFY_COOP_INSTALLS_TOTAL.fetch_add(1, Ordering::Relaxed);
                    space.emit(&ProtocolEvent::TaskInstalled {
                        tag: space.task(task).tag(),
                        contended,
                        timestamp_ns: now_ns(),
                    });
                    return;
                }
                Err(Some(current)) if current == task => {
                    RAMIFY_COOP_REENTRANT_INSTALLS_TOTAL.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(Some(current)) => {
                    // There was already one there: finish it before retrying.
                    contended = true;
                    let tag = space.task(current).tag();
                    RAMIFY_COOP_HELPED_RUNS_TOTAL.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(target: "ramify.coop", %tag, "helping foreign pending task");
                    space.emit(&ProtocolEvent::TaskHelped {
                        tag,
                        timestamp_ns: now_ns(),
                    });
                    self.run_and_remove(space, current);
                }
                Err(None) => {
                    // The slot emptied between the decision point and now.
                }
            }
        }
    }

    /// Execute the task body, then clear the announcement.
    ///
    /// If the clearing exchange fails, another thread already removed the
    /// task (it ran it too, or installed something after completion) — an
    /// accepted, idempotent race needing no retry.
    pub fn run_and_remove(&self, space: &ManagedSpace, task: TaskRef) {
        space.task(task).run(space);
        if self.inner.try_change(Some(task), None).is_err() {
            RAMIFY_COOP_REMOVE_RACES_TOTAL.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// [`install`](Self::install) then [`run_and_remove`](Self::run_and_remove).
    pub fn install_and_run(&self, space: &ManagedSpace, task: TaskRef) {
        self.install(space, task);
        self.run_and_remove(space, task);
    }
}

impl Default for TaskSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pending() {
            Some(t) => write!(f, "TaskSlot(pending {t:?})"),
            None => f.write_str("TaskSlot(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    struct ProbeTask {
        runs: Arc<AtomicU64>,
    }

    impl CoopTask for ProbeTask {
        fn tag(&self) -> TaskTag {
            TaskTag::Probe
        }

        fn run(&self, _space: &ManagedSpace) {
            self.runs.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn probe(space: &ManagedSpace) -> (TaskRef, Arc<AtomicU64>) {
        let runs = Arc::new(AtomicU64::new(0));
        let task = space.spawn_task(Arc::new(ProbeTask {
            runs: Arc::clone(&runs),
        }));
        (task, runs)
    }

    #[test]
    fn install_and_run_executes_once_uncontended() {
        let space = ManagedSpace::new();
        let slot = TaskSlot::new();
        let (task, runs) = probe(&space);

        slot.install_and_run(&space, task);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(slot.pending(), None, "slot must be cleared after the run");
    }

    #[test]
    fn reentrant_install_of_same_instance_returns_immediately() {
        let space = ManagedSpace::new();
        let slot = TaskSlot::new();
        let (task, runs) = probe(&space);

        slot.install(&space, task);
        // Second install of the same instance: a race to install, not a
        // conflict — returns without running anything.
        slot.install(&space, task);
        assert_eq!(runs.load(Ordering::Relaxed), 0);
        assert_eq!(slot.pending(), Some(task));

        slot.run_and_remove(&space, task);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(slot.pending(), None);
    }

    #[test]
    fn installer_helps_foreign_pending_task() {
        let space = ManagedSpace::new();
        let slot = TaskSlot::new();
        let (first, first_runs) = probe(&space);
        let (second, second_runs) = probe(&space);

        // Announce `first` but never run it.
        slot.install(&space, first);

        // The second installer must execute `first` on its behalf before its
        // own installation can succeed.
        slot.install_and_run(&space, second);

        assert!(first_runs.load(Ordering::Relaxed) >= 1, "foreign task was not helped");
        assert_eq!(second_runs.load(Ordering::Relaxed), 1);
        assert_eq!(slot.pending(), None);
    }

    /// N threads race distinct tasks through one slot: every call returns,
    /// every body runs at least once, and the slot ends empty.
    #[test]
    fn concurrent_install_and_run_liveness() {
        const THREADS: usize = 8;
        let space = ManagedSpace::new();
        let slot = Arc::new(TaskSlot::new());
        let barrier = Arc::new(Barrier::new(THREADS));

        let probes: Vec<_> = (0..THREADS).map(|_| probe(&space)).collect();
        let mut joins = Vec::new();
        for (task, _) in &probes {
            let space = Arc::clone(&space);
            let slot = Arc::clone(&slot);
            let barrier = Arc::clone(&barrier);
            let task = *task;
            joins.push(thread::spawn(move || {
                barrier.wait();
                slot.install_and_run(&space, task);
            }));
        }
        for j in joins {
            j.join().unwrap();
        }

        for (i, (_, runs)) in probes.iter().enumerate() {
            assert!(
                runs.load(Ordering::Relaxed) >= 1,
                "task {i} never executed"
            );
        }
        assert_eq!(slot.pending(), None, "slot must end empty");
    }

    #[test]
    fn metrics_count_installs_and_helps() {
        let space = ManagedSpace::new();
        let slot = TaskSlot::new();
        let before = coop_metrics();

        let (first, _) = probe(&space);
        let (second, _) = probe(&space);
        slot.install(&space, first);
        slot.install_and_run(&space, second);

        let after = coop_metrics();
        assert!(after.ramify_coop_installs_total >= before.ramify_coop_installs_total + 2);
        assert!(after.ramify_coop_helped_runs_total >= before.ramify_coop_helped_runs_total + 1);

        let json = serde_json::to_string(&after).unwrap();
        assert!(json.contains("ramify_coop_installs_total"));
    }
}
