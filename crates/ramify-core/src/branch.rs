//! Branch lineage tree.
//!
//! Branches are arena-indexed nodes with explicit parent indices: every
//! branch except the root has exactly one parent, branches are never
//! relocated, and a retired branch stays in the tree while anything still
//! references it. Each branch owns a monotone local clock; writes on one
//! branch are totally ordered by it, writes across branches are unordered
//! until merge.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use ramify_heap::{Arena, Ref};
use ramify_types::{BranchId, FieldKey, Timestamp};

use crate::phase::{PhaseSequencer, PhaseState};

// ---------------------------------------------------------------------------
// BranchPhase
// ---------------------------------------------------------------------------

/// Staged branch teardown states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPhase {
    /// Accepting writes and forks.
    Live,
    /// Teardown announced; superseded history entries are being retired.
    Sealing,
    /// Teardown complete.
    Retired,
}

impl PhaseState for BranchPhase {
    const INIT: Self = Self::Live;
    const FINAL: Self = Self::Retired;

    fn index(self) -> u64 {
        match self {
            Self::Live => 0,
            Self::Sealing => 1,
            Self::Retired => 2,
        }
    }

    fn from_index(raw: u64) -> Self {
        match raw {
            0 => Self::Live,
            1 => Self::Sealing,
            _ => Self::Retired,
        }
    }
}

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

/// One lineage node.
pub struct Branch {
    parent: Option<BranchId>,
    /// Parent's clock value at fork time; delegated resolution into the
    /// parent is bounded by it so a branch's view of its parent is stable.
    fork_ts: Timestamp,
    /// Detached lineages are never linked back into their source branch.
    mergeable: bool,
    clock: AtomicU64,
    phase: PhaseSequencer<BranchPhase>,
    /// Slots written on this branch directly; merge walks read it.
    touched: Mutex<HashSet<FieldKey>>,
}

impl Branch {
    fn new(parent: Option<BranchId>, fork_ts: Timestamp, mergeable: bool) -> Self {
        Self {
            parent,
            fork_ts,
            mergeable,
            clock: AtomicU64::new(0),
            phase: PhaseSequencer::new(),
            touched: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<BranchId> {
        self.parent
    }

    #[must_use]
    pub fn fork_ts(&self) -> Timestamp {
        self.fork_ts
    }

    #[must_use]
    pub fn mergeable(&self) -> bool {
        self.mergeable
    }

    /// Whether the branch still accepts writes and forks.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.phase.current() == BranchPhase::Live
    }

    /// Current clock value.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        Timestamp::new(self.clock.load(Ordering::Acquire))
    }

    /// Advance the clock, returning the new tick.
    pub fn tick(&self) -> Timestamp {
        Timestamp::new(self.clock.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub(crate) fn phase(&self) -> &PhaseSequencer<BranchPhase> {
        &self.phase
    }

    pub(crate) fn note_touched(&self, key: FieldKey) {
        self.touched.lock().insert(key);
    }

    /// Slots this branch has written directly.
    #[must_use]
    pub fn touched(&self) -> Vec<FieldKey> {
        self.touched.lock().iter().copied().collect()
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("parent", &self.parent)
            .field("fork_ts", &self.fork_ts)
            .field("clock", &self.now())
            .field("phase", &self.phase.current())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BranchTree
// ---------------------------------------------------------------------------

/// The tree of lineages, rooted at [`BranchId::ROOT`].
pub struct BranchTree {
    arena: Arena<Branch>,
}

fn branch_ref(id: BranchId) -> Ref<Branch> {
    Ref::from_index(id.index() as u64)
}

impl BranchTree {
    /// Create a tree holding only the root branch.
    #[must_use]
    pub fn new() -> Self {
        let tree = Self {
            arena: Arena::new(),
        };
        let root = tree
            .arena
            .alloc(Branch::new(None, Timestamp::ZERO, true));
        assert_eq!(root.index(), BranchId::ROOT.index() as u64);
        tree
    }

    #[must_use]
    pub fn root(&self) -> BranchId {
        BranchId::ROOT
    }

    /// Look up a branch.
    ///
    /// # Panics
    ///
    /// Panics on an id this tree never issued.
    #[must_use]
    pub fn get(&self, id: BranchId) -> &Branch {
        self.arena
            .get(branch_ref(id))
            .expect("branch id was issued by this tree")
    }

    #[must_use]
    pub fn contains(&self, id: BranchId) -> bool {
        self.arena.get(branch_ref(id)).is_some()
    }

    /// Fork `parent`, producing a child whose ancestor chain is parent plus
    /// parent's ancestors. The child starts with a fresh clock and sees the
    /// parent as of this moment.
    pub fn fork(&self, parent: BranchId, mergeable: bool) -> BranchId {
        let p = self.get(parent);
        let fork_ts = p.now();
        let r = self
            .arena
            .alloc(Branch::new(Some(parent), fork_ts, mergeable));
        let child = BranchId::from_index(
            usize::try_from(r.index()).expect("branch index fits usize"),
        );
        tracing::info!(target: "ramify.branch", %parent, %child, %fork_ts, "branch_forked");
        child
    }

    /// Self-inclusive ancestor chain, nearest first, ending at the root.
    #[must_use]
    pub fn ancestors(&self, id: BranchId) -> Vec<BranchId> {
        let mut chain = vec![id];
        let mut cursor = id;
        while let Some(parent) = self.get(cursor).parent() {
            chain.push(parent);
            cursor = parent;
        }
        chain
    }

    #[must_use]
    pub fn is_ancestor(&self, ancestor: BranchId, descendant: BranchId) -> bool {
        self.ancestors(descendant).contains(&ancestor)
    }

    /// Nearest common ancestor of two branches in the same tree.
    #[must_use]
    pub fn nearest_common_ancestor(&self, a: BranchId, b: BranchId) -> BranchId {
        let a_chain: HashSet<BranchId> = self.ancestors(a).into_iter().collect();
        let mut cursor = b;
        loop {
            if a_chain.contains(&cursor) {
                return cursor;
            }
            cursor = self
                .get(cursor)
                .parent()
                .expect("two branches of one tree share at least the root");
        }
    }

    /// Branches on the path `from ..= child-of-ancestor`, i.e. `from`'s side
    /// of the divergence. Empty when `from == ancestor`.
    #[must_use]
    pub fn path_above(&self, from: BranchId, ancestor: BranchId) -> Vec<BranchId> {
        let mut path = Vec::new();
        let mut cursor = from;
        while cursor != ancestor {
            path.push(cursor);
            cursor = self
                .get(cursor)
                .parent()
                .expect("`ancestor` must be on `from`'s ancestor chain");
        }
        path
    }

    /// The ancestor-local timestamp at which `from`'s lineage diverged from
    /// `ancestor`: the fork tick of `from`'s side's child of `ancestor`, or
    /// `MOST_RECENT` when `from` is the ancestor itself.
    #[must_use]
    pub fn divergence_bound(&self, from: BranchId, ancestor: BranchId) -> Timestamp {
        match self.path_above(from, ancestor).last() {
            Some(child_of_ancestor) => self.get(*child_of_ancestor).fork_ts(),
            None => Timestamp::MOST_RECENT,
        }
    }

    /// Number of branches ever created.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.arena.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false // the root always exists
    }
}

impl Default for BranchTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BranchTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchTree").field("len", &self.len()).finish()
    }
}
