//! Foundation types for the ramify branch-versioned object model.
//!
//! This crate defines (or re-exports) the cross-cutting types referenced
//! throughout the workspace: the closed [`Kind`] tag, identifier newtypes
//! (timestamps, branch ids, field identities), view/mutability enums, and
//! the tri-state [`ValidityCell`] memo.
//!
//! Runtime machinery (branches, histories, contexts) lives in `ramify-core`;
//! this crate builds only the vocabulary.

pub mod glossary;
pub mod validity;

pub use glossary::{
    BranchId, FieldId, FieldKey, ModType, RecordTypeId, TaskTag, Timestamp, ViewType,
};
pub use validity::{Validity, ValidityCell};

use std::fmt;

/// The closed tag over every storable value kind.
///
/// The kind determines storage representation: arithmetic kinds are stored
/// by value, string/record/binding/array kinds as shared managed references,
/// and branch-dependent composite kinds as provenance-tagged values.
///
/// The kind tag of a field never changes after the field is created.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Kind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Record,
    Binding,
    Array,
}

/// Number of kinds in the closed tag.
pub const N_KINDS: usize = 15;

impl Kind {
    /// Whether values of this kind are stored inline by value.
    #[must_use]
    pub const fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::I8
                | Self::U8
                | Self::I16
                | Self::U16
                | Self::I32
                | Self::U32
                | Self::I64
                | Self::U64
                | Self::F32
                | Self::F64
        )
    }

    /// Whether values of this kind are stored as shared managed references.
    #[must_use]
    pub const fn is_reference(self) -> bool {
        !self.is_arithmetic()
    }

    /// Whether this kind is a branch-dependent composite (multiple
    /// named/indexed slots whose content depends on the viewing branch).
    #[must_use]
    pub const fn is_composite(self) -> bool {
        matches!(self, Self::Record | Self::Array)
    }

    /// Stable lowercase name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::String => "string",
            Self::Record => "record",
            Self::Binding => "binding",
            Self::Array => "array",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
