//! Namespaces and bindings.
//!
//! A namespace maps interned names to versioned slots; bindings resolve
//! through the calling context's branch and view like any composite field,
//! so a name bound on one branch is invisible to its siblings until merged.

use std::collections::HashMap;
use std::fmt;

use parking_lot::{Mutex, RwLock};

use ramify_error::{RamifyError, Result};
use ramify_heap::Ref;
use ramify_types::{FieldKey, Kind};

use crate::history::{CompositeOwner, FieldHistory};
use crate::merge::Conflict;
use crate::space::ManagedSpace;
use crate::strings::StrRef;
use crate::value::Value;

/// Handle to a namespace.
pub type NsRef = Ref<Namespace>;

/// A binding as a first-class managed value (kind `binding`).
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub name: StrRef,
    pub value: Value,
}

/// A branch-versioned name table.
pub struct Namespace {
    entries: RwLock<HashMap<StrRef, Ref<FieldHistory>>>,
    conflicts: Mutex<Vec<Conflict>>,
}

impl Namespace {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            conflicts: Mutex::new(Vec::new()),
        }
    }

    /// The versioned slot for `name`, if any branch ever bound it.
    #[must_use]
    pub fn entry(&self, name: StrRef) -> Option<Ref<FieldHistory>> {
        self.entries.read().get(&name).copied()
    }

    /// Names with at least one binding on some branch.
    #[must_use]
    pub fn names(&self) -> Vec<StrRef> {
        self.entries.read().keys().copied().collect()
    }

    /// Conflicts accumulated by failed merges into this namespace.
    #[must_use]
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.lock().clone()
    }

    /// Discard recorded conflicts so a re-merge can be attempted.
    pub fn clear_conflicts(&self) {
        self.conflicts.lock().clear();
    }

    pub(crate) fn push_conflict(&self, conflict: Conflict) {
        self.conflicts.lock().push(conflict);
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("names", &self.entries.read().len())
            .field("conflicts", &self.conflicts.lock().len())
            .finish()
    }
}

/// Get or create the versioned slot for `name`, fixing its kind on first
/// use. A later bind with a different kind fails: the kind tag of a slot
/// never changes after creation.
pub(crate) fn ensure_entry(
    space: &ManagedSpace,
    ns: NsRef,
    name: StrRef,
    kind: Kind,
) -> Result<Ref<FieldHistory>> {
    let namespace = space
        .namespaces()
        .get(ns)
        .expect("namespace handle was issued by this space");

    let check_kind = |h: Ref<FieldHistory>| -> Result<Ref<FieldHistory>> {
        let history = space
            .histories()
            .get(h)
            .expect("history handle was issued by this space");
        if history.kind() == kind {
            Ok(h)
        } else {
            Err(RamifyError::IncompatibleType {
                expected: history.kind(),
                actual: kind,
            })
        }
    };

    if let Some(h) = namespace.entry(name) {
        return check_kind(h);
    }

    let mut entries = namespace.entries.write();
    // A racing binder may have created the slot between the locks.
    if let Some(&h) = entries.get(&name) {
        drop(entries);
        return check_kind(h);
    }
    let key = FieldKey::new(ns.raw(), name.raw());
    let h = space
        .histories()
        .alloc(FieldHistory::new(key, CompositeOwner::Namespace(ns), kind));
    entries.insert(name, h);
    drop(entries);
    space.register_field_history(key, h);
    Ok(h)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ramify_error::RamifyError;
    use ramify_types::{Kind, ModType, ViewType};

    use crate::context::IsoContext;
    use crate::space::ManagedSpace;
    use crate::value::Value;

    /// A name's kind is fixed by its first binding.
    #[test]
    fn binding_kind_never_changes() {
        let space = ManagedSpace::new();
        let ctx = IsoContext::global(Arc::clone(&space));
        let ns = space.new_namespace();

        ctx.bind(ns, "limit", Value::I64(10)).unwrap();
        ctx.bind(ns, "limit", Value::I64(20)).unwrap();
        assert_eq!(ctx.lookup(ns, "limit").unwrap(), Value::I64(20));

        let err = ctx.bind(ns, "limit", Value::Bool(true)).unwrap_err();
        assert_eq!(
            err,
            RamifyError::IncompatibleType {
                expected: Kind::I64,
                actual: Kind::Bool,
            }
        );
    }

    #[test]
    fn sibling_bindings_conflict_on_merge() {
        let space = ManagedSpace::new();
        let root = IsoContext::global(Arc::clone(&space));
        let ns = space.new_namespace();

        let c1 = root.nested(ViewType::Live, ModType::ReadWrite);
        let c2 = root.nested(ViewType::Live, ModType::ReadWrite);
        c1.bind(ns, "owner", Value::I64(1)).unwrap();
        c2.bind(ns, "owner", Value::I64(2)).unwrap();

        c1.publish().unwrap();
        let err = c2.publish().unwrap_err();
        assert_eq!(err, RamifyError::UnmergeableContext { conflicts: 1 });

        let conflicts = space.namespace_conflicts(ns);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].source.value(), Some(Value::I64(2)));
        assert_eq!(conflicts[0].target.value(), Some(Value::I64(1)));
    }

    #[test]
    fn names_enumerates_entries() {
        let space = ManagedSpace::new();
        let ctx = IsoContext::global(Arc::clone(&space));
        let ns = space.new_namespace();
        ctx.bind(ns, "a", Value::I64(1)).unwrap();
        ctx.bind(ns, "b", Value::I64(2)).unwrap();

        let namespace = space.namespaces().get(ns).unwrap();
        assert_eq!(namespace.names().len(), 2);
    }
}
