//! Managed-memory substrate for the ramify object model.
//!
//! The layers above this crate never hold raw pointers: managed objects are
//! identified by stable [`Ref`] handles into chunked [`Arena`]s, and the only
//! shared-mutable primitive exposed upward is the [`AtomicSlot`] — a
//! compare-and-swap cell over an optional handle that preserves the exact
//! "read prior value on failure" contract the cooperative protocol depends
//! on.
//!
//! Allocation, retirement, and descriptor-based scanning are substrate
//! concerns: `alloc` may briefly lock to grow a chunk, retirement is
//! deferred through epoch guards, and an external trace pass can enumerate
//! registered type descriptors. Nothing here defines a tracing or sweeping
//! algorithm; objects stay readable until explicitly retired and
//! unreachable.

pub mod arena;
pub mod descriptor;
pub mod reclaim;
pub mod slot;

pub use arena::{Arena, Ref, ARENA_CAPACITY};
pub use descriptor::{DescriptorId, DescriptorRegistry, TypeDescriptor};
pub use reclaim::{quiesce, reclaim_metrics, reset_reclaim_metrics, HeapGuard, ReclaimMetrics};
pub use slot::AtomicSlot;
