//! Chunked handle arena.
//!
//! Objects are allocated into fixed-size chunks and identified by stable
//! [`Ref`] handles (1-based ordinals packed into a `NonZeroU64` so an
//! optional handle fits one atomic word). Slots are write-once: replacing a
//! value means allocating a new object and swinging a slot, never mutating
//! in place. Handles are never re-issued.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::reclaim::{record_retirement_deferred, HeapGuard};

/// Objects per chunk.
const CHUNK: usize = 1024;

/// Chunks per arena.
const MAX_CHUNKS: usize = 1024;

/// Total objects one arena can hold.
pub const ARENA_CAPACITY: usize = CHUNK * MAX_CHUNKS;

// ---------------------------------------------------------------------------
// Ref
// ---------------------------------------------------------------------------

/// A stable typed handle to an arena object.
///
/// Internally a 1-based ordinal, so `Option<Ref<T>>` packs into a single
/// `u64` word with 0 meaning empty — the representation [`AtomicSlot`]
/// relies on.
///
/// [`AtomicSlot`]: crate::slot::AtomicSlot
pub struct Ref<T> {
    raw: NonZeroU64,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls: `Ref<T>` is an index, never a `T`, so no bounds on `T`.
impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Ref<T> {}
impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T> Eq for Ref<T> {}
impl<T> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}
impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref#{}", self.index())
    }
}

impl<T> Ref<T> {
    /// Construct from a 0-based arena index.
    ///
    /// # Panics
    ///
    /// Panics if `index + 1` overflows (never reachable for arena indices).
    #[must_use]
    pub fn from_index(index: u64) -> Self {
        let raw = NonZeroU64::new(index.wrapping_add(1)).expect("arena index overflow");
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Reconstruct from a raw word previously obtained via [`raw`](Self::raw).
    /// Returns `None` for the empty word 0.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(|raw| Self {
            raw,
            _marker: PhantomData,
        })
    }

    /// The 0-based arena index.
    #[inline]
    #[must_use]
    pub fn index(self) -> u64 {
        self.raw.get() - 1
    }

    /// The raw nonzero word (for atomic slots and field keys).
    #[inline]
    #[must_use]
    pub fn raw(self) -> u64 {
        self.raw.get()
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Concurrent chunked arena with stable handles.
///
/// `alloc` reserves an ordinal with one `fetch_add` and initializes the
/// chunk lazily; `get` is lock-free (chunk table and slots are `OnceLock`).
/// Retirement only marks: storage is reclaimed when the arena is dropped,
/// which keeps retired objects readable for as long as anything still holds
/// a handle — the substrate contract the model layers assume.
pub struct Arena<T> {
    chunks: Box<[OnceLock<Box<[OnceLock<T>]>>]>,
    next: AtomicU64,
    retired: Arc<Mutex<HashSet<u64>>>,
}

impl<T> Arena<T> {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
            next: AtomicU64::new(0),
            retired: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Allocate a slot for `value`, returning its handle.
    ///
    /// # Panics
    ///
    /// Panics if the arena capacity ([`ARENA_CAPACITY`]) is exhausted.
    pub fn alloc(&self, value: T) -> Ref<T> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        let chunk_idx = usize::try_from(index).expect("arena index overflows usize") / CHUNK;
        let chunk = self
            .chunks
            .get(chunk_idx)
            .expect("arena capacity exhausted");
        let chunk = chunk.get_or_init(|| (0..CHUNK).map(|_| OnceLock::new()).collect());

        let offset = usize::try_from(index).expect("arena index overflows usize") % CHUNK;
        let installed = chunk[offset].set(value).is_ok();
        assert!(installed, "arena slot {index} double-initialized");
        Ref::from_index(index)
    }

    /// Look up an object by handle. Returns `None` for never-allocated
    /// handles; retired objects remain readable.
    #[must_use]
    pub fn get(&self, r: Ref<T>) -> Option<&T> {
        let index = usize::try_from(r.index()).ok()?;
        self.chunks.get(index / CHUNK)?.get()?.get(index % CHUNK)?.get()
    }

    /// Visit every allocated object, in allocation order. Slots whose
    /// initialization is still in flight are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (Ref<T>, &T)> + '_ {
        (0..self.len()).filter_map(move |i| {
            let r = Ref::from_index(i);
            self.get(r).map(|v| (r, v))
        })
    }

    /// Number of objects ever allocated.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `r` dead once the current grace period expires.
    ///
    /// The mark is deferred through `guard` so threads that already hold the
    /// handle finish their walks before the object reads as retired.
    pub fn retire(&self, r: Ref<T>, guard: &HeapGuard) {
        let retired = Arc::clone(&self.retired);
        let raw = r.raw();
        guard.defer(move || {
            retired.lock().insert(raw);
        });
        record_retirement_deferred();
        tracing::trace!(target: "ramify.heap", handle = raw, "retire_deferred");
    }

    /// Whether `r` has been marked retired (after its grace period).
    #[must_use]
    pub fn is_retired(&self, r: Ref<T>) -> bool {
        self.retired.lock().contains(&r.raw())
    }

    /// Number of handles whose retirement has taken effect.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len())
            .field("retired", &self.retired_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn alloc_get_round_trip() {
        let arena: Arena<String> = Arena::new();
        let a = arena.alloc("alpha".to_string());
        let b = arena.alloc("beta".to_string());
        assert_ne!(a, b);
        assert_eq!(arena.get(a).unwrap(), "alpha");
        assert_eq!(arena.get(b).unwrap(), "beta");
        assert_eq!(arena.len(), 2);
        assert!(arena.get(Ref::from_index(99)).is_none());
    }

    #[test]
    fn handles_are_stable_across_chunk_growth() {
        let arena: Arena<usize> = Arena::new();
        let handles: Vec<_> = (0..(CHUNK * 3)).map(|i| arena.alloc(i)).collect();
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(*arena.get(*h).unwrap(), i);
        }
    }

    #[test]
    fn concurrent_alloc_yields_distinct_handles() {
        let arena: Arc<Arena<u64>> = Arc::new(Arena::new());
        let barrier = Arc::new(Barrier::new(4));
        let mut joins = Vec::new();
        for t in 0..4u64 {
            let arena = Arc::clone(&arena);
            let barrier = Arc::clone(&barrier);
            joins.push(thread::spawn(move || {
                barrier.wait();
                (0..500).map(|i| arena.alloc(t * 1000 + i)).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for j in joins {
            for h in j.join().unwrap() {
                assert!(seen.insert(h.raw()), "duplicate handle {h:?}");
            }
        }
        assert_eq!(seen.len(), 2000);
        assert_eq!(arena.len(), 2000);
    }

    #[test]
    fn retirement_takes_effect_after_grace_period() {
        let arena: Arena<u32> = Arena::new();
        let r = arena.alloc(7);
        {
            let guard = HeapGuard::pin();
            arena.retire(r, &guard);
            assert!(!arena.is_retired(r), "retirement must be deferred");
        }
        reclaim::quiesce();
        assert!(arena.is_retired(r));
        // Retired objects stay readable until unreachable.
        assert_eq!(*arena.get(r).unwrap(), 7);
        assert_eq!(arena.retired_count(), 1);
    }

    #[test]
    fn ref_raw_round_trip() {
        let r: Ref<u8> = Ref::from_index(41);
        assert_eq!(r.raw(), 42);
        assert_eq!(Ref::<u8>::from_raw(42), Some(r));
        assert_eq!(Ref::<u8>::from_raw(0), None);
    }
}
