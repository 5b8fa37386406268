//! Conflict detection and merge.
//!
//! `merge` walks both lineages back to their nearest common ancestor and
//! compares, for every slot touched by either side since the fork, the two
//! branches' newest provenance-tagged values against the ancestor's value
//! at the divergence point. One-sided and identical changes are applied to
//! the target; divergent changes are reported, never silently resolved.
//!
//! Detection runs before application: a merge that finds any conflict
//! installs nothing, records the conflicts on the owning composites, and
//! fails with an unmergeable-context error for the caller to resolve
//! externally before retrying.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use ramify_error::{RamifyError, Result};
use ramify_heap::Ref;
use ramify_observability::{now_ns, ProtocolEvent};
use ramify_types::{BranchId, FieldKey, Timestamp, ViewType};

use crate::history::{CompositeOwner, FieldHistory};
use crate::space::ManagedSpace;
use crate::value::TaggedValue;

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static RAMIFY_MERGES_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_MERGES_FAILED_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_MERGE_CONFLICTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_MERGE_APPLIED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of merge metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeMetrics {
    pub ramify_merges_total: u64,
    pub ramify_merges_failed_total: u64,
    pub ramify_merge_conflicts_total: u64,
    pub ramify_merge_applied_total: u64,
}

/// Read current merge metrics.
#[must_use]
pub fn merge_metrics() -> MergeMetrics {
    MergeMetrics {
        ramify_merges_total: RAMIFY_MERGES_TOTAL.load(Ordering::Relaxed),
        ramify_merges_failed_total: RAMIFY_MERGES_FAILED_TOTAL.load(Ordering::Relaxed),
        ramify_merge_conflicts_total: RAMIFY_MERGE_CONFLICTS_TOTAL.load(Ordering::Relaxed),
        ramify_merge_applied_total: RAMIFY_MERGE_APPLIED_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_merge_metrics() {
    RAMIFY_MERGES_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_MERGES_FAILED_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_MERGE_CONFLICTS_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_MERGE_APPLIED_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Conflict / MergeReport
// ---------------------------------------------------------------------------

/// A divergent write found during a merge attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conflict {
    /// The contested slot.
    pub key: FieldKey,
    /// The value both sides diverged from.
    pub ancestor: TaggedValue,
    /// The source branch's newest value.
    pub source: TaggedValue,
    /// The target branch's newest value.
    pub target: TaggedValue,
}

/// Outcome of a successful merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MergeReport {
    /// Slots compared (touched by either side since the ancestor).
    pub fields_examined: usize,
    /// Slots whose changed value was installed on the target.
    pub applied: usize,
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

/// Merge `source` into `target`.
///
/// On success the one-sided changes are installed on `target` (keeping each
/// value's original producing branch) and a report is returned. On any
/// divergence the conflicts are appended to the owning composites' conflict
/// lists and the whole merge fails with
/// [`RamifyError::UnmergeableContext`]; nothing is installed.
pub fn merge(space: &ManagedSpace, source: BranchId, target: BranchId) -> Result<MergeReport> {
    RAMIFY_MERGES_TOTAL.fetch_add(1, Ordering::Relaxed);
    if source == target {
        return Ok(MergeReport::default());
    }

    let tree = space.branches();
    let ancestor = tree.nearest_common_ancestor(source, target);
    // The ancestor's state at the moment the source lineage split off: the
    // base both sides are compared against.
    let base_bound = tree.divergence_bound(source, ancestor);

    let mut keys: BTreeSet<FieldKey> = BTreeSet::new();
    for side in [source, target] {
        for branch in tree.path_above(side, ancestor) {
            keys.extend(tree.get(branch).touched());
        }
    }

    let mut pending: Vec<(Ref<FieldHistory>, FieldKey, TaggedValue)> = Vec::new();
    let mut conflicts: Vec<(Ref<FieldHistory>, Conflict)> = Vec::new();

    for key in &keys {
        let Some(history_ref) = space.field_history(*key) else {
            continue;
        };
        let history = space
            .histories()
            .get(history_ref)
            .expect("history handle was issued by this space");

        let base = history.resolve(space, ancestor, ViewType::Snapshot, base_bound);
        let src = history.resolve(space, source, ViewType::Live, Timestamp::MOST_RECENT);
        let tgt = history.resolve(space, target, ViewType::Live, Timestamp::MOST_RECENT);

        if src.same_value_as(&base) {
            continue; // source did not change this slot
        }
        if tgt.same_value_as(&base) {
            pending.push((history_ref, *key, src)); // only the source changed
            continue;
        }
        if src.same_value_as(&tgt) {
            continue; // both changed identically
        }
        conflicts.push((
            history_ref,
            Conflict {
                key: *key,
                ancestor: base,
                source: src,
                target: tgt,
            },
        ));
    }

    if !conflicts.is_empty() {
        let count = conflicts.len();
        for (history_ref, conflict) in conflicts {
            let history = space
                .histories()
                .get(history_ref)
                .expect("history handle was issued by this space");
            match history.owner() {
                CompositeOwner::Record(r) => space
                    .records()
                    .get(r)
                    .expect("record handle was issued by this space")
                    .push_conflict(conflict),
                CompositeOwner::Namespace(n) => space
                    .namespaces()
                    .get(n)
                    .expect("namespace handle was issued by this space")
                    .push_conflict(conflict),
            }
            space.emit(&ProtocolEvent::MergeConflictDetected {
                key: conflict.key,
                source,
                target,
                timestamp_ns: now_ns(),
            });
        }
        RAMIFY_MERGES_FAILED_TOTAL.fetch_add(1, Ordering::Relaxed);
        RAMIFY_MERGE_CONFLICTS_TOTAL.fetch_add(count as u64, Ordering::Relaxed);
        tracing::warn!(
            target: "ramify.merge",
            %source,
            %target,
            %ancestor,
            conflicts = count,
            "merge_unmergeable"
        );
        return Err(RamifyError::UnmergeableContext { conflicts: count });
    }

    let applied = pending.len();
    let target_branch = tree.get(target);
    for (history_ref, key, value) in pending {
        let history = space
            .histories()
            .get(history_ref)
            .expect("history handle was issued by this space");
        // The value keeps its original producing branch; only the hosting
        // history entry belongs to the target.
        history.push(space, value, target, target_branch.tick());
        target_branch.note_touched(key);
    }

    RAMIFY_MERGE_APPLIED_TOTAL.fetch_add(applied as u64, Ordering::Relaxed);
    space.emit(&ProtocolEvent::MergeCompleted {
        source,
        target,
        applied,
        timestamp_ns: now_ns(),
    });
    tracing::debug!(
        target: "ramify.merge",
        %source,
        %target,
        %ancestor,
        fields = keys.len(),
        applied,
        "merge_completed"
    );

    Ok(MergeReport {
        fields_examined: keys.len(),
        applied,
    })
}
