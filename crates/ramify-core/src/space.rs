//! The managed space.
//!
//! One `ManagedSpace` owns every arena, the branch tree, the interning
//! table, and the record-type registry; all handles circulating above are
//! valid only against the space that issued them. The space also registers
//! each managed type's descriptor so an external trace pass can walk the
//! object graph generically.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use ramify_error::{RamifyError, Result};
use ramify_heap::{Arena, DescriptorRegistry, HeapGuard, Ref};
use ramify_observability::{now_ns, Observer, ProtocolEvent, SharedObserver};
use ramify_types::{BranchId, FieldId, FieldKey, Kind, RecordTypeId};

use crate::branch::{BranchPhase, BranchTree};
use crate::coop::{CoopTask, TaskRef};
use crate::history::{FieldHistory, HistoryNode};
use crate::merge::{self, MergeReport};
use crate::namespace::{Binding, Namespace, NsRef};
use crate::record::{ManagedRecord, RecordRef, RecordTypeRegistry};
use crate::strings::{StrRef, StringTable};
use crate::value::Value;

/// The shared heap of branch-versioned managed objects.
pub struct ManagedSpace {
    branches: BranchTree,
    records: Arena<ManagedRecord>,
    histories: Arena<FieldHistory>,
    nodes: Arena<HistoryNode>,
    tasks: Arena<Arc<dyn CoopTask>>,
    bindings: Arena<Binding>,
    namespaces: Arena<Namespace>,
    strings: StringTable,
    record_types: RecordTypeRegistry,
    /// Every installed history by slot identity; merge walks read it.
    field_index: RwLock<HashMap<FieldKey, Ref<FieldHistory>>>,
    descriptors: DescriptorRegistry,
    observer: RwLock<SharedObserver>,
}

impl ManagedSpace {
    /// Create a space holding only the root branch.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let space = Self {
            branches: BranchTree::new(),
            records: Arena::new(),
            histories: Arena::new(),
            nodes: Arena::new(),
            tasks: Arena::new(),
            bindings: Arena::new(),
            namespaces: Arena::new(),
            strings: StringTable::new(),
            record_types: RecordTypeRegistry::new(),
            field_index: RwLock::new(HashMap::new()),
            descriptors: DescriptorRegistry::new(),
            observer: RwLock::new(None),
        };
        for name in [
            "branch",
            "record",
            "field-history",
            "history-node",
            "task",
            "binding",
            "namespace",
            "interned-string",
        ] {
            space.descriptors.register(name);
        }
        Arc::new(space)
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    /// Install (or clear) the protocol observer.
    pub fn set_observer(&self, observer: Option<Arc<dyn Observer>>) {
        *self.observer.write() = observer;
    }

    pub(crate) fn emit(&self, event: &ProtocolEvent) {
        ramify_observability::emit(&self.observer.read(), event);
    }

    /// The registered type descriptors, for external scanners.
    #[must_use]
    pub fn descriptors(&self) -> &DescriptorRegistry {
        &self.descriptors
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn branches(&self) -> &BranchTree {
        &self.branches
    }

    /// Fork `parent`, announcing the new lineage to the observer.
    pub fn fork_branch(&self, parent: BranchId, mergeable: bool) -> BranchId {
        let child = self.branches.fork(parent, mergeable);
        self.emit(&ProtocolEvent::BranchForked {
            parent,
            child,
            timestamp_ns: now_ns(),
        });
        child
    }

    /// Drive `branch` through staged teardown.
    ///
    /// Any number of threads may call this concurrently; the phase sequencer
    /// guarantees the counter reaches the terminal state exactly once while
    /// each phase body — written idempotent — may run on several of them.
    /// Retiring marks the branch's history entries dead after the current
    /// grace period; it does not delete them while anything can still reach
    /// them.
    pub fn retire_branch(&self, branch: BranchId) {
        let b = self.branches.get(branch);
        b.phase().run(|phase| match phase {
            BranchPhase::Live => {
                tracing::info!(target: "ramify.branch", %branch, "branch_sealing");
            }
            BranchPhase::Sealing => {
                let guard = HeapGuard::pin();
                for key in b.touched() {
                    let Some(history_ref) = self.field_history(key) else {
                        continue;
                    };
                    let history = self
                        .histories
                        .get(history_ref)
                        .expect("history handle was issued by this space");
                    let mut cursor = history.head();
                    while let Some(node_ref) = cursor {
                        let node = self
                            .nodes
                            .get(node_ref)
                            .expect("history node handle was issued by this space");
                        if node.branch == branch {
                            self.nodes.retire(node_ref, &guard);
                        }
                        cursor = node.prev;
                    }
                }
                self.emit(&ProtocolEvent::BranchRetired {
                    branch,
                    timestamp_ns: now_ns(),
                });
                tracing::info!(target: "ramify.branch", %branch, "branch_retired");
            }
            BranchPhase::Retired => {}
        });
    }

    /// Merge `source` into `target` (see [`merge::merge`]).
    pub fn merge(&self, source: BranchId, target: BranchId) -> Result<MergeReport> {
        merge::merge(self, source, target)
    }

    // -----------------------------------------------------------------------
    // Record types & records
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn record_types(&self) -> &RecordTypeRegistry {
        &self.record_types
    }

    /// Declare a record type by name, optionally extending a super-type.
    pub fn declare_record_type(
        &self,
        name: &str,
        super_ty: Option<RecordTypeId>,
    ) -> RecordTypeId {
        self.record_types.declare(self.strings.intern(name), super_ty)
    }

    /// Add a field to an unsealed record type.
    pub fn add_record_field(&self, ty: RecordTypeId, name: &str, kind: Kind) -> Result<FieldId> {
        self.record_types
            .add_field(&self.strings, ty, self.strings.intern(name), kind)
    }

    /// Seal a type (and its ancestors), returning the canonical created
    /// type for its name.
    pub fn ensure_record_type(&self, ty: RecordTypeId) -> Result<RecordTypeId> {
        self.record_types.ensure_created(&self.strings, ty)
    }

    /// Field position by name on a declared type.
    #[must_use]
    pub fn record_field(&self, ty: RecordTypeId, name: &str) -> Option<FieldId> {
        self.record_types.field_id(ty, self.strings.intern(name))
    }

    /// Allocate a record of `ty`, creating the type first if needed.
    pub fn new_record(&self, ty: RecordTypeId) -> Result<RecordRef> {
        let canonical = self.ensure_record_type(ty)?;
        if !self.record_types.chain_created(canonical) {
            let ty_obj = self.record_types.get(canonical);
            let required = ty_obj
                .super_ty()
                .map_or_else(String::new, |s| {
                    self.strings.resolve(self.record_types.get(s).name()).to_string()
                });
            return Err(RamifyError::IncompatibleSuperclass {
                name: self.strings.resolve(ty_obj.name()).to_string(),
                required,
            });
        }
        let field_count = self.record_types.get(canonical).field_count();
        Ok(self.records.alloc(ManagedRecord::new(canonical, field_count)))
    }

    /// Conflicts accumulated on a record by failed merges.
    #[must_use]
    pub fn record_conflicts(&self, record: RecordRef) -> Vec<merge::Conflict> {
        self.records
            .get(record)
            .expect("record handle was issued by this space")
            .conflicts()
    }

    /// Clear a record's conflict list so a re-merge can be attempted.
    pub fn clear_record_conflicts(&self, record: RecordRef) {
        self.records
            .get(record)
            .expect("record handle was issued by this space")
            .clear_conflicts();
    }

    // -----------------------------------------------------------------------
    // Namespaces & bindings
    // -----------------------------------------------------------------------

    /// Allocate an empty namespace.
    #[must_use]
    pub fn new_namespace(&self) -> NsRef {
        self.namespaces.alloc(Namespace::new())
    }

    /// Conflicts accumulated on a namespace by failed merges.
    #[must_use]
    pub fn namespace_conflicts(&self, ns: NsRef) -> Vec<merge::Conflict> {
        self.namespaces
            .get(ns)
            .expect("namespace handle was issued by this space")
            .conflicts()
    }

    /// Allocate a first-class binding value.
    #[must_use]
    pub fn new_binding(&self, name: &str, value: Value) -> Ref<Binding> {
        self.bindings.alloc(Binding {
            name: self.strings.intern(name),
            value,
        })
    }

    // -----------------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// Intern `text` in the space's string table.
    #[must_use]
    pub fn intern(&self, text: &str) -> StrRef {
        self.strings.intern(text)
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Allocate a cooperative task, returning the handle installs use.
    #[must_use]
    pub fn spawn_task(&self, task: Arc<dyn CoopTask>) -> TaskRef {
        self.tasks.alloc(task)
    }

    /// Resolve a task handle.
    ///
    /// # Panics
    ///
    /// Panics on a handle this space never issued.
    #[must_use]
    pub fn task(&self, task: TaskRef) -> &Arc<dyn CoopTask> {
        self.tasks
            .get(task)
            .expect("task handle was issued by this space")
    }

    // -----------------------------------------------------------------------
    // Field histories
    // -----------------------------------------------------------------------

    /// The installed history for a slot identity, if any.
    #[must_use]
    pub fn field_history(&self, key: FieldKey) -> Option<Ref<FieldHistory>> {
        self.field_index.read().get(&key).copied()
    }

    pub(crate) fn register_field_history(&self, key: FieldKey, history: Ref<FieldHistory>) {
        self.field_index.write().insert(key, history);
    }

    /// Resolve one slot directly, outside any context (the raw view
    /// resolution the record/array layers build on).
    pub fn resolve_field(
        &self,
        record: RecordRef,
        field: FieldId,
        branch: BranchId,
        view: ramify_types::ViewType,
        bound: ramify_types::Timestamp,
    ) -> Result<crate::value::TaggedValue> {
        let rec = self
            .records
            .get(record)
            .expect("record handle was issued by this space");
        let slot = rec.field_slot(field).ok_or_else(|| RamifyError::UnboundName {
            name: format!("{field} of record {record:?}"),
        })?;
        Ok(match slot.history().load() {
            Some(h) => self
                .histories
                .get(h)
                .expect("history handle was issued by this space")
                .resolve(self, branch, view, bound),
            None => crate::value::TaggedValue::absent(),
        })
    }

    // -----------------------------------------------------------------------
    // Tracing support
    // -----------------------------------------------------------------------

    /// Enumerate every reachable handle for an external trace pass: records,
    /// their installed histories, every history node, and the managed
    /// references inside stored values.
    pub fn trace(&self, mut visit: impl FnMut(u64)) {
        for (r, _) in self.records.iter() {
            visit(r.raw());
        }
        for (ns, _) in self.namespaces.iter() {
            visit(ns.raw());
        }
        let index = self.field_index.read();
        for history_ref in index.values() {
            visit(history_ref.raw());
            let history = self
                .histories
                .get(*history_ref)
                .expect("history handle was issued by this space");
            let mut cursor = history.head();
            while let Some(node_ref) = cursor {
                visit(node_ref.raw());
                let node = self
                    .nodes
                    .get(node_ref)
                    .expect("history node handle was issued by this space");
                match node.value.value() {
                    Some(Value::String(s)) => visit(s.raw()),
                    Some(Value::Record(r)) => visit(r.raw()),
                    Some(Value::Binding(b)) => visit(b.raw()),
                    Some(Value::Array(a)) => visit(a.get()),
                    _ => {}
                }
                cursor = node.prev;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal arena access
    // -----------------------------------------------------------------------

    pub(crate) fn nodes(&self) -> &Arena<HistoryNode> {
        &self.nodes
    }

    pub(crate) fn histories(&self) -> &Arena<FieldHistory> {
        &self.histories
    }

    pub(crate) fn records(&self) -> &Arena<ManagedRecord> {
        &self.records
    }

    pub(crate) fn namespaces(&self) -> &Arena<Namespace> {
        &self.namespaces
    }
}

impl fmt::Debug for ManagedSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSpace")
            .field("branches", &self.branches.len())
            .field("records", &self.records.len())
            .field("nodes", &self.nodes.len())
            .field("strings", &self.strings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    use ramify_heap::reclaim;
    use ramify_observability::CapturingObserver;
    use ramify_types::{ModType, Timestamp, ViewType};

    use crate::context::IsoContext;
    use crate::record::RecordRef;

    fn setup() -> (Arc<ManagedSpace>, IsoContext, RecordRef, FieldId) {
        let space = ManagedSpace::new();
        let ty = space.declare_record_type("entry", None);
        let field = space.add_record_field(ty, "total", Kind::I64).unwrap();
        let record = space.new_record(ty).unwrap();
        let ctx = IsoContext::global(Arc::clone(&space));
        (space, ctx, record, field)
    }

    /// Concurrent retirement drives the phase counter to the terminal state
    /// exactly once while every phase body runs at least once, and the
    /// branch's history entries read as retired after the grace period.
    #[test]
    fn concurrent_retire_reaches_terminal_state() {
        const THREADS: usize = 6;
        let (space, root, record, field) = setup();
        let child = root.nested(ViewType::Live, ModType::ReadWrite);
        for v in 0..3 {
            child.write_field(record, field, Value::I64(v)).unwrap();
        }
        let branch = child.branch();

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut joins = Vec::new();
        for _ in 0..THREADS {
            let space = Arc::clone(&space);
            let barrier = Arc::clone(&barrier);
            joins.push(thread::spawn(move || {
                barrier.wait();
                space.retire_branch(branch);
            }));
        }
        for j in joins {
            j.join().unwrap();
        }

        assert!(!space.branches().get(branch).is_live());
        reclaim::quiesce();

        // Every node the child wrote is marked.
        let key = FieldKey::new(record.raw(), u64::from(field.get()));
        let history_ref = space.field_history(key).unwrap();
        let history = space.histories().get(history_ref).unwrap();
        let mut cursor = history.head();
        let mut child_nodes = 0;
        while let Some(node_ref) = cursor {
            let node = space.nodes().get(node_ref).unwrap();
            if node.branch == branch {
                assert!(space.nodes().is_retired(node_ref));
                child_nodes += 1;
            }
            cursor = node.prev;
        }
        assert_eq!(child_nodes, 3);
    }

    #[test]
    fn observer_sees_the_protocol_lifecycle() {
        let (space, root, record, field) = setup();
        let observer = Arc::new(CapturingObserver::new());
        space.set_observer(Some(Arc::<CapturingObserver>::clone(&observer)));

        let child = root.nested(ViewType::Live, ModType::ReadWrite);
        child.write_field(record, field, Value::I64(1)).unwrap();
        child.publish().unwrap();

        let events = observer.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ProtocolEvent::BranchForked { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProtocolEvent::TaskInstalled { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProtocolEvent::MergeCompleted { applied: 1, .. })));

        space.set_observer(None);
    }

    #[test]
    fn trace_enumerates_reachable_handles() {
        let (space, root, record, field) = setup();
        root.write_field(record, field, Value::I64(1)).unwrap();
        let name = space.intern("payload");
        let ty = space.declare_record_type("tagged", None);
        let sf = space.add_record_field(ty, "label", Kind::String).unwrap();
        let tagged = space.new_record(ty).unwrap();
        root.write_field(tagged, sf, Value::String(name)).unwrap();

        let mut seen: HashSet<u64> = HashSet::new();
        space.trace(|h| {
            seen.insert(h);
        });

        assert!(seen.contains(&record.raw()));
        assert!(seen.contains(&tagged.raw()));
        assert!(seen.contains(&name.raw()), "stored string refs must be traced");
        let key = FieldKey::new(record.raw(), u64::from(field.get()));
        assert!(seen.contains(&space.field_history(key).unwrap().raw()));
    }

    #[test]
    fn descriptors_cover_every_managed_type() {
        let (space, _root, _record, _field) = setup();
        let descriptors = space.descriptors().descriptors();
        assert_eq!(descriptors.len(), 8);
        assert!(descriptors.iter().any(|d| d.name == "record"));
        assert!(descriptors.iter().any(|d| d.name == "history-node"));
    }

    #[test]
    fn instantiation_seals_the_type() {
        let (space, _root, _record, _field) = setup();
        let ty = space.declare_record_type("sealed-on-use", None);
        space.add_record_field(ty, "a", Kind::Bool).unwrap();
        let _ = space.new_record(ty).unwrap();

        let err = space.add_record_field(ty, "b", Kind::Bool).unwrap_err();
        assert!(matches!(err, RamifyError::UnmodifiableRecordType { .. }));
    }

    #[test]
    fn resolve_field_is_the_raw_boundary() {
        let (space, root, record, field) = setup();
        root.write_field(record, field, Value::I64(4)).unwrap();

        let got = space
            .resolve_field(
                record,
                field,
                root.branch(),
                ViewType::Live,
                Timestamp::MOST_RECENT,
            )
            .unwrap();
        assert_eq!(got.value(), Some(Value::I64(4)));

        let err = space
            .resolve_field(
                record,
                FieldId::new(7),
                root.branch(),
                ViewType::Live,
                Timestamp::MOST_RECENT,
            )
            .unwrap_err();
        assert!(matches!(err, RamifyError::UnboundName { .. }));
    }
}
