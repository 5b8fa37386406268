//! Identifier newtypes and mode enums.
//!
//! Every identifier is a `repr(transparent)` wrapper over a machine word so
//! it can travel through atomic slots and serialize as a bare integer.

use std::fmt;
use std::num::NonZeroU32;

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// A branch-local logical timestamp.
///
/// Each branch owns a monotone clock; writes on one branch are totally
/// ordered by it. Timestamps from different branches are not comparable as
/// wall-clock instants, only as positions in their own branch's history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The beginning of every branch's history (before any write).
    pub const ZERO: Self = Self(0);

    /// A query bound that admits every write ever made.
    pub const MOST_RECENT: Self = Self(u64::MAX);

    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The next tick, saturating at [`MOST_RECENT`](Self::MOST_RECENT).
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == u64::MAX {
            f.write_str("ts#latest")
        } else {
            write!(f, "ts#{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// BranchId
// ---------------------------------------------------------------------------

/// Identifier of a branch in the lineage tree.
///
/// Branch ids are arena ordinals starting at 1 (the root branch). A branch
/// is never relocated, so its id is stable for the life of the tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct BranchId(NonZeroU32);

impl BranchId {
    /// The root branch every tree starts with.
    pub const ROOT: Self = Self(NonZeroU32::MIN);

    /// Construct from a raw 1-based id. Returns `None` for 0.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Construct from a 0-based arena index.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not fit the 32-bit id space.
    #[inline]
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        let raw = u32::try_from(index + 1).expect("branch index overflows u32");
        Self(NonZeroU32::new(raw).expect("branch index + 1 is nonzero"))
    }

    /// The raw 1-based id.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// The 0-based arena index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "br#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// FieldId / RecordTypeId
// ---------------------------------------------------------------------------

/// Position of a field within its record type's field table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct FieldId(u16);

impl FieldId {
    #[inline]
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fld#{}", self.0)
    }
}

/// Identifier of a declared record type in the type registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RecordTypeId(NonZeroU32);

impl RecordTypeId {
    /// Construct from a raw 1-based id. Returns `None` for 0.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Construct from a 0-based registry index.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not fit the 32-bit id space.
    #[inline]
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        let raw = u32::try_from(index + 1).expect("record type index overflows u32");
        Self(NonZeroU32::new(raw).expect("record type index + 1 is nonzero"))
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl fmt::Display for RecordTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rty#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// FieldKey
// ---------------------------------------------------------------------------

/// Stable identity of one logical versioned slot.
///
/// `owner` is the raw handle of the composite holding the slot (record or
/// namespace); `slot` distinguishes the slot within the owner (field index
/// for records, interned-name handle for namespaces).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct FieldKey {
    pub owner: u64,
    pub slot: u64,
}

impl FieldKey {
    #[inline]
    #[must_use]
    pub const fn new(owner: u64, slot: u64) -> Self {
        Self { owner, slot }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f@{}:{}", self.owner, self.slot)
    }
}

// ---------------------------------------------------------------------------
// TaskTag
// ---------------------------------------------------------------------------

/// Discriminator for cooperative task subtypes.
///
/// The tag exists for telemetry and debugging only; dispatch goes through
/// the task trait, never through this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TaskTag {
    /// First-write installation of a field's history structure.
    FieldHistoryInit,
    /// Staged branch teardown.
    BranchTeardown,
    /// Synthetic task used by tests and benchmarks.
    Probe,
}

impl TaskTag {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FieldHistoryInit => "field_history_init",
            Self::BranchTeardown => "branch_teardown",
            Self::Probe => "probe",
        }
    }
}

impl fmt::Display for TaskTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ViewType / ModType
// ---------------------------------------------------------------------------

/// How a context resolves values on its branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ViewType {
    /// The mutable current head of the branch.
    Live,
    /// An immutable view frozen at a specific timestamp.
    Snapshot,
    /// Resolves against what the parent branch would present at the fork
    /// point, skipping local writes. Merge logic uses this to look through
    /// the parent uniformly at every level of the tree.
    Parent,
}

impl fmt::Display for ViewType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::Snapshot => "snapshot",
            Self::Parent => "parent",
        })
    }
}

/// Mutability mode of an isolation context, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModType {
    /// Writes go to the context's branch and may later be published.
    ReadWrite,
    /// Writes are local to a private branch and never link back into the
    /// source branch.
    Detached,
    /// Writes are rejected.
    ReadOnly,
}

impl ModType {
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

impl fmt::Display for ModType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadWrite => "read-write",
            Self::Detached => "detached",
            Self::ReadOnly => "read-only",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_id_round_trips_index() {
        let id = BranchId::from_index(41);
        assert_eq!(id.get(), 42);
        assert_eq!(id.index(), 41);
        assert_eq!(BranchId::ROOT.index(), 0);
        assert!(BranchId::new(0).is_none());
    }

    #[test]
    fn timestamp_ordering_and_saturation() {
        assert!(Timestamp::ZERO < Timestamp::new(1));
        assert!(Timestamp::new(1) < Timestamp::MOST_RECENT);
        assert_eq!(Timestamp::MOST_RECENT.next(), Timestamp::MOST_RECENT);
        assert_eq!(Timestamp::new(7).to_string(), "ts#7");
        assert_eq!(Timestamp::MOST_RECENT.to_string(), "ts#latest");
    }

    #[test]
    fn field_key_display() {
        let key = FieldKey::new(3, 9);
        assert_eq!(key.to_string(), "f@3:9");
    }

    #[test]
    fn mode_flags() {
        assert!(ModType::ReadOnly.is_read_only());
        assert!(!ModType::ReadWrite.is_read_only());
        assert!(!ModType::Detached.is_read_only());
    }
}
