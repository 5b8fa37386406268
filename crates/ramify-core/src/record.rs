//! Record types and managed records.
//!
//! A record type is declared by interned name with an optional super-type,
//! grows fields until it is created (sealed), and is immutable afterwards.
//! `ensure_created` is idempotent and canonicalizing: creating a name twice
//! yields the first sealed type, and a redeclaration with a different shape
//! is rejected. Managed records carry their type and one versioned slot per
//! field.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use ramify_error::{RamifyError, Result};
use ramify_heap::{AtomicSlot, Ref};
use ramify_types::{FieldId, Kind, RecordTypeId, ValidityCell};

use crate::coop::TaskSlot;
use crate::history::FieldHistory;
use crate::merge::Conflict;
use crate::strings::{StrRef, StringTable};

/// Handle to a managed record.
pub type RecordRef = Ref<ManagedRecord>;

// ---------------------------------------------------------------------------
// FieldDef / RecordType
// ---------------------------------------------------------------------------

/// One declared field: interned name plus kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: StrRef,
    pub kind: Kind,
}

/// A declared record type.
pub struct RecordType {
    name: StrRef,
    super_ty: Option<RecordTypeId>,
    fields: RwLock<SmallVec<[FieldDef; 8]>>,
    sealed: AtomicBool,
    /// Memo: the whole super chain is created. Checked once per type.
    chain_ok: ValidityCell,
}

impl RecordType {
    #[must_use]
    pub fn name(&self) -> StrRef {
        self.name
    }

    #[must_use]
    pub fn super_ty(&self) -> Option<RecordTypeId> {
        self.super_ty
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.read().len()
    }

    /// Snapshot of the declared fields, in declaration order.
    #[must_use]
    pub fn fields(&self) -> Vec<FieldDef> {
        self.fields.read().iter().copied().collect()
    }
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordType")
            .field("name", &self.name)
            .field("super_ty", &self.super_ty)
            .field("fields", &self.field_count())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RecordTypeRegistry
// ---------------------------------------------------------------------------

/// Registry of declared record types, keyed by interned name once created.
pub struct RecordTypeRegistry {
    types: RwLock<Vec<Arc<RecordType>>>,
    /// Canonical created type per name.
    created: RwLock<HashMap<StrRef, RecordTypeId>>,
}

impl RecordTypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: RwLock::new(Vec::new()),
            created: RwLock::new(HashMap::new()),
        }
    }

    /// Declare a new (unsealed) type.
    pub fn declare(&self, name: StrRef, super_ty: Option<RecordTypeId>) -> RecordTypeId {
        let mut types = self.types.write();
        types.push(Arc::new(RecordType {
            name,
            super_ty,
            fields: RwLock::new(SmallVec::new()),
            sealed: AtomicBool::new(false),
            chain_ok: ValidityCell::new(),
        }));
        RecordTypeId::from_index(types.len() - 1)
    }

    /// Look up a type.
    ///
    /// # Panics
    ///
    /// Panics on an id this registry never issued.
    #[must_use]
    pub fn get(&self, id: RecordTypeId) -> Arc<RecordType> {
        self.types
            .read()
            .get(id.index())
            .cloned()
            .expect("record type id was issued by this registry")
    }

    /// Add a field to an unsealed type.
    ///
    /// Idempotent per `(name, kind)`: re-adding an existing field returns
    /// its id; re-adding with a different kind is an incompatible-type
    /// error, because a field's kind never changes after creation.
    pub fn add_field(
        &self,
        strings: &StringTable,
        id: RecordTypeId,
        name: StrRef,
        kind: Kind,
    ) -> Result<FieldId> {
        let ty = self.get(id);
        let mut fields = ty.fields.write();
        if ty.is_sealed() {
            return Err(RamifyError::UnmodifiableRecordType {
                name: strings.resolve(ty.name).to_string(),
            });
        }
        if let Some(pos) = fields.iter().position(|f| f.name == name) {
            let existing = fields[pos];
            return if existing.kind == kind {
                Ok(field_id_at(pos))
            } else {
                Err(RamifyError::IncompatibleType {
                    expected: existing.kind,
                    actual: kind,
                })
            };
        }
        fields.push(FieldDef { name, kind });
        Ok(field_id_at(fields.len() - 1))
    }

    /// Seal `id` (and its ancestors) and return the canonical created type
    /// for its name.
    ///
    /// A second creation under the same name returns the first type when the
    /// shapes match and fails with an incompatible-record-type error when
    /// they differ.
    pub fn ensure_created(
        &self,
        strings: &StringTable,
        id: RecordTypeId,
    ) -> Result<RecordTypeId> {
        // Seal the whole chain; using a type requires its ancestors created.
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let ty = self.get(current);
            {
                let _fields = ty.fields.write(); // serialize with add_field
                ty.sealed.store(true, Ordering::Release);
            }
            cursor = ty.super_ty();
        }

        let ty = self.get(id);
        let mut created = self.created.write();
        match created.get(&ty.name) {
            Some(&canonical) if canonical == id => Ok(id),
            Some(&canonical) => {
                let canon = self.get(canonical);
                if same_shape(&ty, &canon) {
                    Ok(canonical)
                } else {
                    let name = strings.resolve(ty.name).to_string();
                    Err(RamifyError::IncompatibleRecordType {
                        expected: name.clone(),
                        actual: format!("{name} (redeclared with a different shape)"),
                    })
                }
            }
            None => {
                created.insert(ty.name, id);
                Ok(id)
            }
        }
    }

    /// Field position by name.
    #[must_use]
    pub fn field_id(&self, id: RecordTypeId, name: StrRef) -> Option<FieldId> {
        self.get(id)
            .fields
            .read()
            .iter()
            .position(|f| f.name == name)
            .map(field_id_at)
    }

    /// Kind of a field, if the id is in range.
    #[must_use]
    pub fn field_kind(&self, id: RecordTypeId, field: FieldId) -> Option<Kind> {
        self.get(id).fields.read().get(field.index()).map(|f| f.kind)
    }

    /// Whether `sub`'s super chain contains `sup` (every type is its own
    /// subtype).
    #[must_use]
    pub fn is_subtype(&self, sub: RecordTypeId, sup: RecordTypeId) -> bool {
        let mut cursor = Some(sub);
        while let Some(current) = cursor {
            if current == sup {
                return true;
            }
            cursor = self.get(current).super_ty();
        }
        false
    }

    /// Fail with an incompatible-superclass error unless `sub` extends
    /// `sup`.
    pub fn ensure_superclass(
        &self,
        strings: &StringTable,
        sub: RecordTypeId,
        sup: RecordTypeId,
    ) -> Result<()> {
        if self.is_subtype(sub, sup) {
            Ok(())
        } else {
            Err(RamifyError::IncompatibleSuperclass {
                name: strings.resolve(self.get(sub).name).to_string(),
                required: strings.resolve(self.get(sup).name).to_string(),
            })
        }
    }

    /// Whether the whole super chain of `id` is created. Memoized per type;
    /// the predicate is idempotent and only queried for instantiation, which
    /// runs after `ensure_created` sealed the chain.
    #[must_use]
    pub fn chain_created(&self, id: RecordTypeId) -> bool {
        let ty = self.get(id);
        ty.chain_ok.check(|| {
            let mut cursor = Some(id);
            while let Some(current) = cursor {
                let t = self.get(current);
                if !t.is_sealed() {
                    return false;
                }
                cursor = t.super_ty();
            }
            true
        })
    }

    /// Number of declared types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

impl Default for RecordTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordTypeRegistry")
            .field("len", &self.len())
            .finish()
    }
}

fn field_id_at(pos: usize) -> FieldId {
    FieldId::new(u16::try_from(pos).expect("field table overflows u16"))
}

fn same_shape(a: &RecordType, b: &RecordType) -> bool {
    a.super_ty() == b.super_ty() && *a.fields.read() == *b.fields.read()
}

// ---------------------------------------------------------------------------
// ManagedRecord
// ---------------------------------------------------------------------------

/// Per-field storage of a record: the installed history plus the pending
/// slot first writes race through.
pub struct FieldSlot {
    history: AtomicSlot<FieldHistory>,
    pending: TaskSlot,
}

impl FieldSlot {
    pub(crate) const fn new() -> Self {
        Self {
            history: AtomicSlot::empty(),
            pending: TaskSlot::new(),
        }
    }

    /// The installed history structure, if any write has happened.
    #[must_use]
    pub fn history(&self) -> &AtomicSlot<FieldHistory> {
        &self.history
    }

    pub(crate) fn pending(&self) -> &TaskSlot {
        &self.pending
    }
}

impl fmt::Debug for FieldSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSlot")
            .field("history", &self.history)
            .finish()
    }
}

/// An instance of a created record type.
pub struct ManagedRecord {
    ty: RecordTypeId,
    fields: Box<[FieldSlot]>,
    conflicts: Mutex<Vec<Conflict>>,
}

impl ManagedRecord {
    pub(crate) fn new(ty: RecordTypeId, field_count: usize) -> Self {
        Self {
            ty,
            fields: (0..field_count).map(|_| FieldSlot::new()).collect(),
            conflicts: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn type_id(&self) -> RecordTypeId {
        self.ty
    }

    #[must_use]
    pub fn field_slot(&self, field: FieldId) -> Option<&FieldSlot> {
        self.fields.get(field.index())
    }

    /// Conflicts accumulated by failed merges into this record.
    #[must_use]
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.lock().clone()
    }

    /// Discard recorded conflicts so a re-merge can be attempted after
    /// external resolution.
    pub fn clear_conflicts(&self) {
        self.conflicts.lock().clear();
    }

    pub(crate) fn push_conflict(&self, conflict: Conflict) {
        self.conflicts.lock().push(conflict);
    }
}

impl fmt::Debug for ManagedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedRecord")
            .field("ty", &self.ty)
            .field("fields", &self.fields.len())
            .field("conflicts", &self.conflicts.lock().len())
            .finish()
    }
}
