//! Error taxonomy for ramify operations.
//!
//! Every variant is reported synchronously to the immediate caller and never
//! retried automatically: each one indicates a caller logic error or a
//! genuine semantic conflict requiring caller-level resolution, not a
//! transient race. Compare-and-swap losses inside the cooperative task
//! protocol and the phase sequencer are absorbed internally and never
//! surface here.

use thiserror::Error;

use ramify_types::Kind;

/// Primary error type for ramify operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RamifyError {
    // === Type errors ===
    /// A value's kind does not match the slot it is being bound to.
    #[error("incompatible kind: slot expects {expected}, got {actual}")]
    IncompatibleType { expected: Kind, actual: Kind },

    /// A record type's declared super chain does not contain the required
    /// ancestor.
    #[error("record type '{name}' is not a subtype of '{required}'")]
    IncompatibleSuperclass { name: String, required: String },

    /// An attempt to alter a record type definition after it was sealed.
    #[error("record type '{name}' is sealed and cannot be modified")]
    UnmodifiableRecordType { name: String },

    /// A value's runtime record type does not match the expected schema.
    #[error("incompatible record type: expected '{expected}', got '{actual}'")]
    IncompatibleRecordType { expected: String, actual: String },

    // === Naming errors ===
    /// Lookup of a name with no matching binding.
    #[error("unbound name: '{name}'")]
    UnboundName { name: String },

    // === Context errors ===
    /// A write attempted through a context opened in read-only mode (or
    /// against a retired branch, which is equivalent).
    #[error("write attempted through a read-only context")]
    ReadOnlyContext,

    /// A merge whose conflict list came out non-empty; the caller must
    /// resolve the recorded conflicts externally before retrying.
    #[error("merge produced {conflicts} unresolved conflict(s)")]
    UnmergeableContext { conflicts: usize },
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, RamifyError>;
