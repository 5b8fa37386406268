//! Per-slot write histories.
//!
//! Every versioned slot owns a lock-free chain of immutable history nodes;
//! the head is an atomic reference slot pushed via compare-and-swap retry.
//! A replaced value is never mutated in place — each write allocates a new
//! node, preserving prior lineage information for conflict detection until
//! it is reclaimed.
//!
//! Installation of the very first history structure for a record field goes
//! through the cooperative task protocol: several threads may race to
//! initialize the same field, and whichever loses the install helps the
//! winner finish before proceeding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use ramify_heap::{AtomicSlot, HeapGuard, Ref};
use ramify_types::{BranchId, FieldId, FieldKey, Kind, TaskTag, Timestamp, ViewType};

use crate::coop::CoopTask;
use crate::namespace::Namespace;
use crate::record::ManagedRecord;
use crate::space::ManagedSpace;
use crate::value::TaggedValue;

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static RAMIFY_HISTORY_PUSH_RETRIES_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_HISTORY_RESOLVES_TOTAL: AtomicU64 = AtomicU64::new(0);
static RAMIFY_HISTORY_NODES_WALKED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of history metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryMetrics {
    pub ramify_history_push_retries_total: u64,
    pub ramify_history_resolves_total: u64,
    pub ramify_history_nodes_walked_total: u64,
}

/// Read current history metrics.
#[must_use]
pub fn history_metrics() -> HistoryMetrics {
    HistoryMetrics {
        ramify_history_push_retries_total: RAMIFY_HISTORY_PUSH_RETRIES_TOTAL
            .load(Ordering::Relaxed),
        ramify_history_resolves_total: RAMIFY_HISTORY_RESOLVES_TOTAL.load(Ordering::Relaxed),
        ramify_history_nodes_walked_total: RAMIFY_HISTORY_NODES_WALKED_TOTAL
            .load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_history_metrics() {
    RAMIFY_HISTORY_PUSH_RETRIES_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_HISTORY_RESOLVES_TOTAL.store(0, Ordering::Relaxed);
    RAMIFY_HISTORY_NODES_WALKED_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// HistoryNode
// ---------------------------------------------------------------------------

/// Handle to a history node.
pub type NodeRef = Ref<HistoryNode>;

/// One immutable write record.
#[derive(Debug, Clone, Copy)]
pub struct HistoryNode {
    /// The slot this entry belongs to.
    pub key: FieldKey,
    /// The provenance-tagged value written.
    pub value: TaggedValue,
    /// The branch whose history this entry extends. For ordinary writes this
    /// equals the value's producing branch; for merge-applied values it is
    /// the merge target while the value keeps its original producer.
    pub branch: BranchId,
    /// Position in `branch`'s local order.
    pub ts: Timestamp,
    /// Next-older entry in the chain.
    pub prev: Option<NodeRef>,
}

// ---------------------------------------------------------------------------
// FieldHistory
// ---------------------------------------------------------------------------

/// The composite that owns a versioned slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOwner {
    Record(Ref<ManagedRecord>),
    Namespace(Ref<Namespace>),
}

/// The write history of one logical slot.
pub struct FieldHistory {
    key: FieldKey,
    owner: CompositeOwner,
    kind: Kind,
    head: AtomicSlot<HistoryNode>,
}

impl FieldHistory {
    #[must_use]
    pub fn new(key: FieldKey, owner: CompositeOwner, kind: Kind) -> Self {
        Self {
            key,
            owner,
            kind,
            head: AtomicSlot::empty(),
        }
    }

    #[must_use]
    pub fn key(&self) -> FieldKey {
        self.key
    }

    #[must_use]
    pub fn owner(&self) -> CompositeOwner {
        self.owner
    }

    /// The kind fixed at slot creation; it never changes afterwards.
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Newest entry, across all branches.
    #[must_use]
    pub fn head(&self) -> Option<NodeRef> {
        self.head.load()
    }

    /// Append a new entry for `branch` at `ts`.
    ///
    /// Ownership of the new node transfers into the chain on the successful
    /// exchange; a lost exchange re-reads the head and retries with a fresh
    /// node linked to the new prior.
    pub fn push(
        &self,
        space: &ManagedSpace,
        value: TaggedValue,
        branch: BranchId,
        ts: Timestamp,
    ) -> NodeRef {
        loop {
            let prior = self.head.load();
            let node = space.nodes().alloc(HistoryNode {
                key: self.key,
                value,
                branch,
                ts,
                prev: prior,
            });
            match self.head.try_change(prior, Some(node)) {
                Ok(_) => {
                    tracing::trace!(
                        target: "ramify.branch",
                        key = %self.key,
                        %branch,
                        %ts,
                        "history_push"
                    );
                    return node;
                }
                Err(_) => {
                    RAMIFY_HISTORY_PUSH_RETRIES_TOTAL.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Resolve the value visible at `(branch, view, bound)`.
    ///
    /// Walks the queried branch's writes back to the bound; on a local miss
    /// the resolution delegates to the parent branch's own presentation,
    /// recursing to the root. Delegation into a parent is bounded by the
    /// child's fork tick, so a branch's view of its ancestors is stable.
    /// `Parent` views skip local writes entirely — what this branch would
    /// see if it had never written.
    #[must_use]
    pub fn resolve(
        &self,
        space: &ManagedSpace,
        branch: BranchId,
        view: ViewType,
        bound: Timestamp,
    ) -> TaggedValue {
        let _guard = HeapGuard::pin();
        RAMIFY_HISTORY_RESOLVES_TOTAL.fetch_add(1, Ordering::Relaxed);
        let mut walked = 0u64;
        let out = match view {
            ViewType::Live => self.resolve_on(space, branch, Timestamp::MOST_RECENT, &mut walked),
            ViewType::Snapshot => self.resolve_on(space, branch, bound, &mut walked),
            ViewType::Parent => self.resolve_above(space, branch, &mut walked),
        };
        RAMIFY_HISTORY_NODES_WALKED_TOTAL.fetch_add(walked, Ordering::Relaxed);
        out
    }

    fn resolve_on(
        &self,
        space: &ManagedSpace,
        branch: BranchId,
        bound: Timestamp,
        walked: &mut u64,
    ) -> TaggedValue {
        match self.local_newest(space, branch, bound, walked) {
            Some(value) => value,
            None => self.resolve_above(space, branch, walked),
        }
    }

    fn resolve_above(
        &self,
        space: &ManagedSpace,
        branch: BranchId,
        walked: &mut u64,
    ) -> TaggedValue {
        let br = space.branches().get(branch);
        match br.parent() {
            Some(parent) => self.resolve_on(space, parent, br.fork_ts(), walked),
            None => TaggedValue::absent(),
        }
    }

    /// Newest entry on `branch` with `ts <= bound`.
    ///
    /// The chain is scanned in full rather than stopping at the first match:
    /// two writers on one branch may win their head exchanges out of tick
    /// order, so chain position does not imply tick order.
    fn local_newest(
        &self,
        space: &ManagedSpace,
        branch: BranchId,
        bound: Timestamp,
        walked: &mut u64,
    ) -> Option<TaggedValue> {
        let mut best: Option<(Timestamp, TaggedValue)> = None;
        let mut cursor = self.head.load();
        while let Some(r) = cursor {
            *walked += 1;
            let node = space
                .nodes()
                .get(r)
                .expect("history node handle was issued by this space");
            if node.branch == branch && node.ts <= bound {
                match best {
                    Some((best_ts, _)) if best_ts >= node.ts => {}
                    _ => best = Some((node.ts, node.value)),
                }
            }
            cursor = node.prev;
        }
        best.map(|(_, value)| value)
    }
}

impl std::fmt::Debug for FieldHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldHistory")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("head", &self.head())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// First-write installation
// ---------------------------------------------------------------------------

/// Cooperative task installing a record field's history structure.
///
/// At-least-once body: a helper may run it after the owning thread already
/// finished, so it re-checks the slot and lets a lost exchange stand.
pub(crate) struct InitFieldHistoryTask {
    record: Ref<ManagedRecord>,
    field: FieldId,
    kind: Kind,
}

impl CoopTask for InitFieldHistoryTask {
    fn tag(&self) -> TaskTag {
        TaskTag::FieldHistoryInit
    }

    fn run(&self, space: &ManagedSpace) {
        let record = space
            .records()
            .get(self.record)
            .expect("record handle was issued by this space");
        let slot = record
            .field_slot(self.field)
            .expect("field id validated before the task was spawned");
        if slot.history().load().is_some() {
            return; // already installed — duplicate run of the body
        }
        let key = FieldKey::new(self.record.raw(), u64::from(self.field.get()));
        let history = space.histories().alloc(FieldHistory::new(
            key,
            CompositeOwner::Record(self.record),
            self.kind,
        ));
        if slot.history().try_change(None, Some(history)).is_ok() {
            space.register_field_history(key, history);
        }
        // On a lost exchange the winner's structure stands; the loser's
        // allocation stays unreferenced until swept.
    }
}

/// Get or cooperatively install the history for a record field.
pub(crate) fn ensure_record_history(
    space: &ManagedSpace,
    record: Ref<ManagedRecord>,
    field: FieldId,
    kind: Kind,
) -> Ref<FieldHistory> {
    let rec = space
        .records()
        .get(record)
        .expect("record handle was issued by this space");
    let slot = rec
        .field_slot(field)
        .expect("field id checked against the record type by the caller");
    if let Some(history) = slot.history().load() {
        return history;
    }
    let task = space.spawn_task(Arc::new(InitFieldHistoryTask {
        record,
        field,
        kind,
    }));
    slot.pending().install_and_run(space, task);
    slot.history()
        .load()
        .expect("history installed by the cooperative task")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    use ramify_types::ModType;

    use crate::context::IsoContext;
    use crate::record::RecordRef;
    use crate::value::Value;

    fn counter_space() -> (Arc<ManagedSpace>, RecordRef, FieldId) {
        let space = ManagedSpace::new();
        let ty = space.declare_record_type("counter", None);
        let field = space.add_record_field(ty, "value", Kind::I64).unwrap();
        let record = space.new_record(ty).unwrap();
        (space, record, field)
    }

    fn chain_len(space: &ManagedSpace, history: &FieldHistory) -> usize {
        let mut len = 0;
        let mut cursor = history.head();
        while let Some(r) = cursor {
            len += 1;
            cursor = space.nodes().get(r).unwrap().prev;
        }
        len
    }

    /// Racing first writes must install exactly one history structure and
    /// lose none of the writes.
    #[test]
    fn racing_first_writes_install_one_history() {
        const THREADS: usize = 8;
        let (space, record, field) = counter_space();
        let ctx = Arc::new(IsoContext::global(Arc::clone(&space)));
        let barrier = Arc::new(Barrier::new(THREADS));

        let mut joins = Vec::new();
        for t in 0..THREADS {
            let ctx = Arc::clone(&ctx);
            let barrier = Arc::clone(&barrier);
            joins.push(thread::spawn(move || {
                barrier.wait();
                ctx.write_field(record, field, Value::I64(t as i64)).unwrap();
            }));
        }
        for j in joins {
            j.join().unwrap();
        }

        let rec = space.records().get(record).unwrap();
        let slot = rec.field_slot(field).unwrap();
        let history_ref = slot.history().load().expect("history must be installed");
        let history = space.histories().get(history_ref).unwrap();

        assert_eq!(chain_len(&space, history), THREADS, "writes were lost");
        assert!(
            space.field_history(history.key()).is_some(),
            "install task must register the history"
        );
        assert_eq!(slot.pending().pending(), None, "no task may stay announced");

        let resolved = history.resolve(&space, ctx.branch(), ViewType::Live, Timestamp::MOST_RECENT);
        assert!(resolved.value().is_some());
        assert_eq!(resolved.on_branch(), Some(ctx.branch()));
    }

    #[test]
    fn snapshot_bounds_select_by_tick() {
        let (space, record, field) = counter_space();
        let ctx = IsoContext::global(Arc::clone(&space));
        for v in 1..=5i64 {
            ctx.write_field(record, field, Value::I64(v)).unwrap();
        }

        let history_ref = space
            .field_history(FieldKey::new(record.raw(), u64::from(field.get())))
            .unwrap();
        let history = space.histories().get(history_ref).unwrap();
        let branch = ctx.branch();

        for bound in 1..=5u64 {
            let got = history.resolve(&space, branch, ViewType::Snapshot, Timestamp::new(bound));
            assert_eq!(got.value(), Some(Value::I64(bound as i64)));
        }
        assert!(history
            .resolve(&space, branch, ViewType::Snapshot, Timestamp::ZERO)
            .is_absent());
        assert_eq!(
            history
                .resolve(&space, branch, ViewType::Live, Timestamp::MOST_RECENT)
                .value(),
            Some(Value::I64(5))
        );
    }

    /// A parent view resolves what the branch would see had it never
    /// written: the parent's state at the fork point.
    #[test]
    fn parent_view_skips_local_writes() {
        let (space, record, field) = counter_space();
        let root = IsoContext::global(Arc::clone(&space));
        root.write_field(record, field, Value::I64(1)).unwrap();

        let child = root.nested(ViewType::Live, ModType::ReadWrite);
        child.write_field(record, field, Value::I64(2)).unwrap();

        let history_ref = space
            .field_history(FieldKey::new(record.raw(), u64::from(field.get())))
            .unwrap();
        let history = space.histories().get(history_ref).unwrap();

        let through_parent =
            history.resolve(&space, child.branch(), ViewType::Parent, Timestamp::MOST_RECENT);
        assert_eq!(through_parent.value(), Some(Value::I64(1)));
        assert_eq!(through_parent.on_branch(), Some(root.branch()));

        let live = history.resolve(&space, child.branch(), ViewType::Live, Timestamp::MOST_RECENT);
        assert_eq!(live.value(), Some(Value::I64(2)));

        // A parent write made after the fork stays invisible to the child.
        root.write_field(record, field, Value::I64(3)).unwrap();
        let after =
            history.resolve(&space, child.branch(), ViewType::Parent, Timestamp::MOST_RECENT);
        assert_eq!(after.value(), Some(Value::I64(1)));
    }

    #[test]
    fn metrics_count_resolves() {
        let (space, record, field) = counter_space();
        let ctx = IsoContext::global(Arc::clone(&space));
        ctx.write_field(record, field, Value::I64(1)).unwrap();

        let before = history_metrics();
        let _ = ctx.read_field(record, field).unwrap();
        let after = history_metrics();
        assert!(after.ramify_history_resolves_total > before.ramify_history_resolves_total);
        assert!(after.ramify_history_nodes_walked_total > before.ramify_history_nodes_walked_total);
    }
}
