//! Tri-state validity memo.
//!
//! Guards an expensive idempotent predicate so it is evaluated at most once
//! per cell: the first completed check stores the verdict and every later
//! call reads the memo.

use std::sync::atomic::{AtomicU8, Ordering};

/// The three states of a validity memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Validity {
    Unchecked,
    Valid,
    Invalid,
}

const UNCHECKED: u8 = 0;
const VALID: u8 = 1;
const INVALID: u8 = 2;

/// An atomic tri-state memo cell.
///
/// Concurrent first checks may both evaluate the predicate (it is required
/// to be idempotent); exactly one verdict is stored and all subsequent
/// checks return it without re-evaluating.
#[derive(Debug)]
pub struct ValidityCell(AtomicU8);

impl ValidityCell {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(UNCHECKED))
    }

    /// Current state without evaluating anything.
    #[must_use]
    pub fn get(&self) -> Validity {
        match self.0.load(Ordering::Acquire) {
            VALID => Validity::Valid,
            INVALID => Validity::Invalid,
            _ => Validity::Unchecked,
        }
    }

    /// Return whether the guarded predicate holds, evaluating it only if the
    /// cell is still unchecked.
    pub fn check(&self, predicate: impl FnOnce() -> bool) -> bool {
        match self.get() {
            Validity::Valid => true,
            Validity::Invalid => false,
            Validity::Unchecked => {
                let verdict = if predicate() { VALID } else { INVALID };
                // A concurrent checker may have stored first; its verdict is
                // identical because the predicate is idempotent.
                let _ = self.0.compare_exchange(
                    UNCHECKED,
                    verdict,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.0.load(Ordering::Acquire) == VALID
            }
        }
    }
}

impl Default for ValidityCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn check_memoizes_first_verdict() {
        let cell = ValidityCell::new();
        let evaluations = AtomicU32::new(0);
        assert_eq!(cell.get(), Validity::Unchecked);

        let tally = || {
            evaluations.fetch_add(1, Ordering::Relaxed);
            true
        };
        assert!(cell.check(tally));
        assert_eq!(cell.get(), Validity::Valid);

        // Second check must not re-evaluate.
        assert!(cell.check(|| {
            evaluations.fetch_add(1, Ordering::Relaxed);
            false
        }));
        assert_eq!(evaluations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn invalid_verdict_sticks() {
        let cell = ValidityCell::new();
        assert!(!cell.check(|| false));
        assert_eq!(cell.get(), Validity::Invalid);
        assert!(!cell.check(|| true));
    }
}
