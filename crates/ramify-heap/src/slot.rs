//! Atomically-updatable reference slot.
//!
//! The single shared-mutable primitive the protocol layers are allowed to
//! touch: a word-sized cell holding an optional handle, mutated exclusively
//! through compare-and-exchange. On failure the caller gets the prior value
//! back — the cooperative helping protocol depends on inspecting the
//! loser's prior value, so the contract is preserved exactly.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::Ref;

/// An atomic cell holding at most one handle.
pub struct AtomicSlot<T> {
    bits: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AtomicSlot<T> {
    /// An empty slot.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            bits: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// A slot holding `value`.
    #[must_use]
    pub fn new(value: Option<Ref<T>>) -> Self {
        Self {
            bits: AtomicU64::new(pack(value)),
            _marker: PhantomData,
        }
    }

    /// Current contents.
    #[must_use]
    pub fn load(&self) -> Option<Ref<T>> {
        Ref::from_raw(self.bits.load(Ordering::Acquire))
    }

    /// Unconditionally replace the contents.
    pub fn store(&self, value: Option<Ref<T>>) {
        self.bits.store(pack(value), Ordering::Release);
    }

    /// Replace the contents, returning what was there.
    pub fn swap(&self, value: Option<Ref<T>>) -> Option<Ref<T>> {
        Ref::from_raw(self.bits.swap(pack(value), Ordering::AcqRel))
    }

    /// Attempt to change `expected` into `new`.
    ///
    /// Returns `Ok(prior)` when the exchange won (`prior == expected`) and
    /// `Err(prior)` when it lost, where `prior` is whatever the slot held at
    /// the decision point. Callers inspect the prior value on failure; they
    /// never spin blindly.
    pub fn try_change(
        &self,
        expected: Option<Ref<T>>,
        new: Option<Ref<T>>,
    ) -> Result<Option<Ref<T>>, Option<Ref<T>>> {
        match self.bits.compare_exchange(
            pack(expected),
            pack(new),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prior) => Ok(Ref::from_raw(prior)),
            Err(prior) => Err(Ref::from_raw(prior)),
        }
    }
}

fn pack<T>(value: Option<Ref<T>>) -> u64 {
    value.map_or(0, Ref::raw)
}

impl<T> Default for AtomicSlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for AtomicSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.load() {
            Some(r) => write!(f, "AtomicSlot({r:?})"),
            None => f.write_str("AtomicSlot(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn empty_load_store_swap() {
        let slot: AtomicSlot<u8> = AtomicSlot::empty();
        assert_eq!(slot.load(), None);

        let r = Ref::from_index(0);
        slot.store(Some(r));
        assert_eq!(slot.load(), Some(r));
        assert_eq!(slot.swap(None), Some(r));
        assert_eq!(slot.load(), None);
    }

    #[test]
    fn try_change_returns_prior_on_failure() {
        let slot: AtomicSlot<u8> = AtomicSlot::empty();
        let a = Ref::from_index(10);
        let b = Ref::from_index(11);

        assert_eq!(slot.try_change(None, Some(a)), Ok(None));
        // Expected empty, but `a` is there: lose and learn the prior value.
        assert_eq!(slot.try_change(None, Some(b)), Err(Some(a)));
        // Expected `a`: win.
        assert_eq!(slot.try_change(Some(a), Some(b)), Ok(Some(a)));
        assert_eq!(slot.load(), Some(b));
    }

    /// Under racing installers, exactly one CAS from empty wins and every
    /// loser observes the winner's value as the prior.
    #[test]
    fn exactly_one_installer_wins() {
        let slot: Arc<AtomicSlot<u64>> = Arc::new(AtomicSlot::empty());
        let barrier = Arc::new(Barrier::new(8));
        let mut joins = Vec::new();
        for t in 0..8u64 {
            let slot = Arc::clone(&slot);
            let barrier = Arc::clone(&barrier);
            joins.push(thread::spawn(move || {
                barrier.wait();
                slot.try_change(None, Some(Ref::from_index(t)))
            }));
        }

        let outcomes: Vec<_> = joins.into_iter().map(|j| j.join().unwrap()).collect();
        let winner = slot.load().expect("someone must have installed");

        let mut wins = 0;
        for outcome in outcomes {
            match outcome {
                Ok(prior) => {
                    assert_eq!(prior, None);
                    wins += 1;
                }
                Err(prior) => assert_eq!(prior, Some(winner), "loser saw a stale prior"),
            }
        }
        assert_eq!(wins, 1, "exactly one installer may win");
    }
}
