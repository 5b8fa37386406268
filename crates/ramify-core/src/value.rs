//! Per-kind value storage and branch provenance.
//!
//! Arithmetic kinds are stored inline; string/record/binding kinds are
//! shared managed references; array internals belong to the external
//! container layer and appear here only as opaque handles. Composite slots
//! hold [`TaggedValue`]s — a value paired with the branch that produced it —
//! so reads can tell which lineage a value came from.

use std::fmt;
use std::num::NonZeroU64;

use ramify_error::{RamifyError, Result};
use ramify_heap::Ref;
use ramify_types::{BranchId, Kind};

use crate::namespace::Binding;
use crate::record::ManagedRecord;
use crate::strings::InternedStr;

/// Opaque handle to an object owned by an external layer (arrays).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExternalRef(NonZeroU64);

impl ExternalRef {
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A storable value, tagged by [`Kind`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(Ref<InternedStr>),
    Record(Ref<ManagedRecord>),
    Binding(Ref<Binding>),
    Array(ExternalRef),
}

impl Value {
    /// The kind tag of this value.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Bool(_) => Kind::Bool,
            Self::I8(_) => Kind::I8,
            Self::U8(_) => Kind::U8,
            Self::I16(_) => Kind::I16,
            Self::U16(_) => Kind::U16,
            Self::I32(_) => Kind::I32,
            Self::U32(_) => Kind::U32,
            Self::I64(_) => Kind::I64,
            Self::U64(_) => Kind::U64,
            Self::F32(_) => Kind::F32,
            Self::F64(_) => Kind::F64,
            Self::String(_) => Kind::String,
            Self::Record(_) => Kind::Record,
            Self::Binding(_) => Kind::Binding,
            Self::Array(_) => Kind::Array,
        }
    }

    /// Fail with [`RamifyError::IncompatibleType`] unless this value has
    /// kind `expected`.
    pub fn expect_kind(&self, expected: Kind) -> Result<()> {
        let actual = self.kind();
        if actual == expected {
            Ok(())
        } else {
            Err(RamifyError::IncompatibleType { expected, actual })
        }
    }

    /// Identity comparison for merge divergence checks.
    ///
    /// Like `==` except floats compare by bit pattern, so NaN writes on two
    /// branches count as "changed identically" rather than always
    /// conflicting.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::F32(a), Self::F32(b)) => a.to_bits() == b.to_bits(),
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::String(r) => write!(f, "str:{}", r.index()),
            Self::Record(r) => write!(f, "rec:{}", r.index()),
            Self::Binding(r) => write!(f, "bnd:{}", r.index()),
            Self::Array(r) => write!(f, "arr:{}", r.get()),
        }
    }
}

// ---------------------------------------------------------------------------
// TaggedValue
// ---------------------------------------------------------------------------

/// A provenance-tagged value: "this slot currently holds `value`, written
/// while resolving branch `on_branch`".
///
/// The representation makes the provenance invariant structural: the value
/// is absent exactly when the producing branch is absent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TaggedValue {
    inner: Option<(Value, BranchId)>,
}

impl TaggedValue {
    /// The absent slot state (no value, no producing branch).
    #[must_use]
    pub const fn absent() -> Self {
        Self { inner: None }
    }

    /// A present value produced while resolving `on_branch`.
    #[must_use]
    pub const fn new(value: Value, on_branch: BranchId) -> Self {
        Self {
            inner: Some((value, on_branch)),
        }
    }

    #[must_use]
    pub fn value(&self) -> Option<Value> {
        self.inner.map(|(v, _)| v)
    }

    #[must_use]
    pub fn on_branch(&self) -> Option<BranchId> {
        self.inner.map(|(_, b)| b)
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.inner.is_none()
    }

    /// Whether two tagged values carry the same value content, ignoring
    /// provenance. This is the comparison merge divergence detection uses:
    /// two branches that wrote the same value did not diverge.
    #[must_use]
    pub fn same_value_as(&self, other: &Self) -> bool {
        match (self.value(), other.value()) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_as(&b),
            _ => false,
        }
    }
}

impl fmt::Display for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Some((v, b)) => write!(f, "{v}{{{b}}}"),
            None => f.write_str("absent"),
        }
    }
}
