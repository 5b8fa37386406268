//! Isolation contexts.
//!
//! An isolation context is the capability object through which one logical
//! operation reads and writes managed state. It pins a (branch, view,
//! mutability mode) triple for its lifetime: reads route through view
//! resolution on the pinned branch, writes append provenance-tagged values
//! to that branch's histories, and `publish` merges the branch back into
//! its parent's.
//!
//! Contexts form a tree: `global` binds the root branch; `nested` forks a
//! child branch for writable modes and shares the branch for read-only
//! ones. Detached children fork a private branch that can never be linked
//! back into the source.

use std::fmt;
use std::sync::Arc;

use ramify_error::{RamifyError, Result};
use ramify_types::{BranchId, FieldId, ModType, Timestamp, ViewType};

use crate::history::ensure_record_history;
use crate::merge::{self, MergeReport};
use crate::namespace::{self, NsRef};
use crate::record::RecordRef;
use crate::space::ManagedSpace;
use crate::value::{TaggedValue, Value};

/// The bound (branch, view, mode) handle for one logical operation.
pub struct IsoContext {
    space: Arc<ManagedSpace>,
    branch: BranchId,
    parent_branch: Option<BranchId>,
    view: ViewType,
    mode: ModType,
    /// Branch-local bound for snapshot views.
    frozen_at: Timestamp,
}

impl IsoContext {
    /// The root context: live view, read-write, bound to the root branch.
    #[must_use]
    pub fn global(space: Arc<ManagedSpace>) -> Self {
        let branch = space.branches().root();
        Self {
            space,
            branch,
            parent_branch: None,
            view: ViewType::Live,
            mode: ModType::ReadWrite,
            frozen_at: Timestamp::MOST_RECENT,
        }
    }

    /// Open a child context.
    ///
    /// Writable modes fork a child branch (detached children fork one that
    /// can never publish); read-only contexts share this context's branch.
    /// Snapshot views freeze at the chosen branch's current tick.
    #[must_use]
    pub fn nested(&self, view: ViewType, mode: ModType) -> Self {
        let (branch, parent_branch) = match mode {
            ModType::ReadWrite => (
                self.space.fork_branch(self.branch, true),
                Some(self.branch),
            ),
            ModType::Detached => (
                self.space.fork_branch(self.branch, false),
                Some(self.branch),
            ),
            ModType::ReadOnly => (self.branch, None),
        };
        let frozen_at = match view {
            ViewType::Snapshot => self.space.branches().get(branch).now(),
            ViewType::Live | ViewType::Parent => Timestamp::MOST_RECENT,
        };
        tracing::debug!(
            target: "ramify.context",
            %branch,
            %view,
            %mode,
            "context_opened"
        );
        Self {
            space: Arc::clone(&self.space),
            branch,
            parent_branch,
            view,
            mode,
            frozen_at,
        }
    }

    #[must_use]
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    #[must_use]
    pub fn view(&self) -> ViewType {
        self.view
    }

    #[must_use]
    pub fn mode(&self) -> ModType {
        self.mode
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.mode.is_read_only()
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.view == ViewType::Snapshot
    }

    /// Whether `publish` can ever succeed for this context.
    #[must_use]
    pub fn is_mergeable(&self) -> bool {
        self.mode == ModType::ReadWrite
            && self.parent_branch.is_some()
            && self.space.branches().get(self.branch).mergeable()
    }

    #[must_use]
    pub fn space(&self) -> &Arc<ManagedSpace> {
        &self.space
    }

    fn bound(&self) -> Timestamp {
        match self.view {
            ViewType::Snapshot => self.frozen_at,
            ViewType::Live | ViewType::Parent => Timestamp::MOST_RECENT,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The provenance-tagged value of `field` visible through this context.
    pub fn read_field(&self, record: RecordRef, field: FieldId) -> Result<TaggedValue> {
        let rec = self
            .space
            .records()
            .get(record)
            .expect("record handle was issued by this space");
        self.field_kind(record, field)?;
        let slot = rec
            .field_slot(field)
            .expect("field id is in range once the kind lookup succeeded");
        Ok(match slot.history().load() {
            Some(h) => self
                .space
                .histories()
                .get(h)
                .expect("history handle was issued by this space")
                .resolve(&self.space, self.branch, self.view, self.bound()),
            None => TaggedValue::absent(),
        })
    }

    /// Like [`read_field`](Self::read_field), projected to the bare value.
    pub fn read_value(&self, record: RecordRef, field: FieldId) -> Result<Option<Value>> {
        Ok(self.read_field(record, field)?.value())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Write `value` to `field`, recording this context's branch as the
    /// value's producer.
    ///
    /// Fails with a read-only-context error in read-only mode (and on a
    /// retired branch), leaving the history untouched. The first write to a
    /// field installs its history through the cooperative task protocol.
    pub fn write_field(&self, record: RecordRef, field: FieldId, value: Value) -> Result<()> {
        self.writable()?;
        let kind = self.field_kind(record, field)?;
        value.expect_kind(kind)?;

        let history_ref = ensure_record_history(&self.space, record, field, kind);
        let history = self
            .space
            .histories()
            .get(history_ref)
            .expect("history handle was issued by this space");
        let branch = self.space.branches().get(self.branch);
        let ts = branch.tick();
        history.push(
            &self.space,
            TaggedValue::new(value, self.branch),
            self.branch,
            ts,
        );
        branch.note_touched(history.key());
        tracing::trace!(
            target: "ramify.context",
            branch = %self.branch,
            key = %history.key(),
            %ts,
            "field_written"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Namespaces
    // -----------------------------------------------------------------------

    /// Bind `name` to `value` in `ns` on this context's branch.
    pub fn bind(&self, ns: NsRef, name: &str, value: Value) -> Result<()> {
        self.writable()?;
        let name_ref = self.space.intern(name);
        let history_ref = namespace::ensure_entry(&self.space, ns, name_ref, value.kind())?;
        let history = self
            .space
            .histories()
            .get(history_ref)
            .expect("history handle was issued by this space");
        let branch = self.space.branches().get(self.branch);
        let ts = branch.tick();
        history.push(
            &self.space,
            TaggedValue::new(value, self.branch),
            self.branch,
            ts,
        );
        branch.note_touched(history.key());
        Ok(())
    }

    /// Resolve `name` in `ns` through this context's view.
    pub fn lookup(&self, ns: NsRef, name: &str) -> Result<Value> {
        let name_ref = self.space.intern(name);
        let namespace = self
            .space
            .namespaces()
            .get(ns)
            .expect("namespace handle was issued by this space");
        let unbound = || RamifyError::UnboundName { name: name.into() };
        let history_ref = namespace.entry(name_ref).ok_or_else(unbound)?;
        let history = self
            .space
            .histories()
            .get(history_ref)
            .expect("history handle was issued by this space");
        history
            .resolve(&self.space, self.branch, self.view, self.bound())
            .value()
            .ok_or_else(unbound)
    }

    /// Resolve `name` to a record whose type extends `expected`.
    pub fn lookup_record(
        &self,
        ns: NsRef,
        name: &str,
        expected: ramify_types::RecordTypeId,
    ) -> Result<RecordRef> {
        let value = self.lookup(ns, name)?;
        let Value::Record(record) = value else {
            return Err(RamifyError::IncompatibleType {
                expected: ramify_types::Kind::Record,
                actual: value.kind(),
            });
        };
        let actual_ty = self
            .space
            .records()
            .get(record)
            .expect("record handle was issued by this space")
            .type_id();
        let types = self.space.record_types();
        if types.is_subtype(actual_ty, expected) {
            Ok(record)
        } else {
            let strings = self.space.strings();
            Err(RamifyError::IncompatibleRecordType {
                expected: strings.resolve(types.get(expected).name()).to_string(),
                actual: strings.resolve(types.get(actual_ty).name()).to_string(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Merge this context's branch into its parent's.
    ///
    /// A no-op for the global context and for read-only children (they have
    /// nothing of their own to publish). Detached contexts fail: their
    /// writes never link back into the source branch.
    pub fn publish(&self) -> Result<MergeReport> {
        let Some(parent) = self.parent_branch else {
            return Ok(MergeReport::default());
        };
        if !self.is_mergeable() {
            return Err(RamifyError::UnmergeableContext { conflicts: 0 });
        }
        merge::merge(&self.space, self.branch, parent)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn writable(&self) -> Result<()> {
        if self.mode.is_read_only() {
            return Err(RamifyError::ReadOnlyContext);
        }
        // A retired branch no longer accepts writes.
        if !self.space.branches().get(self.branch).is_live() {
            return Err(RamifyError::ReadOnlyContext);
        }
        Ok(())
    }

    fn field_kind(&self, record: RecordRef, field: FieldId) -> Result<ramify_types::Kind> {
        let ty = self
            .space
            .records()
            .get(record)
            .expect("record handle was issued by this space")
            .type_id();
        let types = self.space.record_types();
        types.field_kind(ty, field).ok_or_else(|| {
            let name = self.space.strings().resolve(types.get(ty).name());
            RamifyError::UnboundName {
                name: format!("{field} of record type '{name}'"),
            }
        })
    }
}

impl fmt::Debug for IsoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsoContext")
            .field("branch", &self.branch)
            .field("view", &self.view)
            .field("mode", &self.mode)
            .field("frozen_at", &self.frozen_at)
            .finish()
    }
}
