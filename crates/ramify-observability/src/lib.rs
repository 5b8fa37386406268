//! Protocol observability infrastructure.
//!
//! Provides the shared event types and observer hooks through which the
//! branch/merge machinery and the cooperative task protocol report what they
//! did, for diagnostics and tests.
//!
//! # Design principles
//!
//! - **Zero-cost when unused:** observation is opt-in via the [`Observer`]
//!   trait; with no observer registered, emission is a `None` check.
//! - **Non-blocking:** observers MUST NOT take protocol-level slots or block
//!   writers. Event emission is purely diagnostic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use ramify_types::{BranchId, FieldKey, TaskTag};

// ---------------------------------------------------------------------------
// Event clock
// ---------------------------------------------------------------------------

/// Monotonic nanosecond timestamp relative to process start.
///
/// A single epoch is used for all events in this process so event streams
/// from different subsystems interleave consistently.
#[must_use]
pub fn now_ns() -> u64 {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    #[allow(clippy::cast_possible_truncation)] // clamped to u64::MAX
    {
        epoch.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64
    }
}

// ---------------------------------------------------------------------------
// ProtocolEvent
// ---------------------------------------------------------------------------

/// A single event emitted by the versioning/concurrency layer.
///
/// Each variant carries enough context to reconstruct what happened without
/// access to internal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProtocolEvent {
    /// A cooperative task was installed into a pending slot.
    TaskInstalled {
        /// Subtype discriminator (telemetry only).
        tag: TaskTag,
        /// Whether the installer first had to help foreign tasks.
        contended: bool,
        /// Monotonic event timestamp.
        timestamp_ns: u64,
    },

    /// A thread executed a foreign pending task before proceeding.
    TaskHelped {
        tag: TaskTag,
        timestamp_ns: u64,
    },

    /// A branch was forked from a parent.
    BranchForked {
        parent: BranchId,
        child: BranchId,
        timestamp_ns: u64,
    },

    /// A branch completed staged teardown.
    BranchRetired {
        branch: BranchId,
        timestamp_ns: u64,
    },

    /// A merge detected a divergent write on one slot.
    MergeConflictDetected {
        key: FieldKey,
        source: BranchId,
        target: BranchId,
        timestamp_ns: u64,
    },

    /// A merge completed without conflicts.
    MergeCompleted {
        source: BranchId,
        target: BranchId,
        /// Number of slots whose changed value was applied to the target.
        applied: usize,
        timestamp_ns: u64,
    },
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Callback interface for protocol events.
///
/// Implementations must be non-blocking with respect to the protocol: never
/// install tasks, never touch pending slots, never wait on other threads.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &ProtocolEvent);
}

/// Optional observer handle. When `None`, no callback overhead.
pub type SharedObserver = Option<Arc<dyn Observer>>;

/// Emit to the observer if one is registered.
#[inline]
pub fn emit(observer: &SharedObserver, event: &ProtocolEvent) {
    if let Some(obs) = observer {
        obs.on_event(event);
    }
}

/// Observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

impl Observer for NoOpObserver {
    fn on_event(&self, _event: &ProtocolEvent) {}
}

/// Observer that buffers events for later inspection (tests, diagnostics).
#[derive(Debug)]
pub struct CapturingObserver {
    events: Mutex<Vec<ProtocolEvent>>,
    dropped: AtomicU64,
    capacity: usize,
}

impl CapturingObserver {
    /// Unbounded capture buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Capture at most `capacity` events, counting the overflow.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
            capacity,
        }
    }

    /// Snapshot of the captured events.
    #[must_use]
    pub fn events(&self) -> Vec<ProtocolEvent> {
        self.events.lock().clone()
    }

    /// Number of captured events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Events that did not fit the capture capacity.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Observer for CapturingObserver {
    fn on_event(&self, event: &ProtocolEvent) {
        let mut events = self.events.lock();
        if events.len() < self.capacity {
            events.push(event.clone());
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ns_is_monotone() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a, "event clock went backwards: {a} -> {b}");
    }

    #[test]
    fn capturing_observer_buffers_events() {
        let obs = CapturingObserver::new();
        obs.on_event(&ProtocolEvent::BranchForked {
            parent: BranchId::ROOT,
            child: BranchId::new(2).unwrap(),
            timestamp_ns: now_ns(),
        });
        obs.on_event(&ProtocolEvent::TaskHelped {
            tag: TaskTag::Probe,
            timestamp_ns: now_ns(),
        });
        assert_eq!(obs.len(), 2);
        assert_eq!(obs.dropped(), 0);

        let events = obs.events();
        assert!(matches!(events[0], ProtocolEvent::BranchForked { .. }));
        assert!(matches!(
            events[1],
            ProtocolEvent::TaskHelped {
                tag: TaskTag::Probe,
                ..
            }
        ));
    }

    #[test]
    fn capacity_overflow_is_counted() {
        let obs = CapturingObserver::with_capacity(1);
        for _ in 0..3 {
            obs.on_event(&ProtocolEvent::TaskHelped {
                tag: TaskTag::Probe,
                timestamp_ns: now_ns(),
            });
        }
        assert_eq!(obs.len(), 1);
        assert_eq!(obs.dropped(), 2);
    }

    #[test]
    fn events_serialize() {
        let event = ProtocolEvent::MergeConflictDetected {
            key: FieldKey::new(7, 0),
            source: BranchId::new(2).unwrap(),
            target: BranchId::new(3).unwrap(),
            timestamp_ns: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("MergeConflictDetected"));

        emit(&None, &event);
        emit(&Some(Arc::new(NoOpObserver)), &event);
    }
}
