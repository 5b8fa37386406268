//! Branch-versioned managed object model.
//!
//! A heap of interconnected objects that can be forked into independent,
//! mergeable lineages, read through isolated point-in-time or live views,
//! and synchronized across threads by cooperative completion instead of
//! locks: any thread that discovers a pending unit of work executes it
//! itself before proceeding, so no thread is ever stalled behind a peer's
//! unfinished installation step.
//!
//! Layering, leaves first:
//!
//! - [`coop`] — the install/help/remove protocol over pending-task slots.
//! - [`phase`] — CAS-driven monotonic counters for staged setup/teardown.
//! - [`value`] — per-kind storage and provenance-tagged values.
//! - [`branch`] — the lineage tree with per-branch clocks.
//! - [`history`] — lock-free per-slot version chains.
//! - [`context`] — the (branch, view, mode) capability for reads/writes.
//! - [`merge`] — divergence detection and conflict reporting.
//! - [`record`], [`namespace`], [`strings`] — the typed surface on top.
//! - [`space`] — the owning heap all handles resolve against.

pub mod branch;
pub mod context;
pub mod coop;
pub mod history;
pub mod merge;
pub mod namespace;
pub mod phase;
pub mod record;
pub mod space;
pub mod strings;
pub mod value;

pub use branch::{Branch, BranchPhase, BranchTree};
pub use context::IsoContext;
pub use coop::{coop_metrics, reset_coop_metrics, CoopMetrics, CoopTask, TaskRef, TaskSlot};
pub use history::{
    history_metrics, reset_history_metrics, CompositeOwner, FieldHistory, HistoryMetrics,
    HistoryNode, NodeRef,
};
pub use merge::{
    merge, merge_metrics, reset_merge_metrics, Conflict, MergeMetrics, MergeReport,
};
pub use namespace::{Binding, Namespace, NsRef};
pub use phase::{
    phase_metrics, reset_phase_metrics, PhaseMetrics, PhaseSequencer, PhaseState,
};
pub use record::{
    FieldDef, FieldSlot, ManagedRecord, RecordRef, RecordType, RecordTypeRegistry,
};
pub use space::ManagedSpace;
pub use strings::{InternedStr, StrRef, StringTable};
pub use value::{ExternalRef, TaggedValue, Value};
