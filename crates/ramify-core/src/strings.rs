//! Interned string table.
//!
//! Process-wide interning of immutable strings: identical text interns to
//! the identical handle, which is what namespaces and record types key on.
//! Storage is sharded by xxh3 hash; the shard locks are substrate-grade
//! internals, only handle identity is part of the model.

use std::collections::HashMap;

use parking_lot::RwLock;
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use ramify_heap::{Arena, Ref};

/// Number of table segments.
const N_SHARDS: usize = 2;

/// Initial capacity across the whole table.
const INITIAL_TABLE_CAPACITY: usize = 10_000;

/// Handle to an interned string.
pub type StrRef = Ref<InternedStr>;

/// One interned string plus its cached hash.
#[derive(Debug)]
pub struct InternedStr {
    text: Box<str>,
    hash: u64,
}

impl InternedStr {
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The xxh3 hash of the text, cached at interning time.
    #[must_use]
    pub fn hash64(&self) -> u64 {
        self.hash
    }
}

/// Sharded interning table.
pub struct StringTable {
    arena: Arena<InternedStr>,
    shards: [RwLock<HashMap<u64, SmallVec<[StrRef; 1]>>>; N_SHARDS],
}

impl StringTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            shards: std::array::from_fn(|_| {
                RwLock::new(HashMap::with_capacity(INITIAL_TABLE_CAPACITY / N_SHARDS))
            }),
        }
    }

    /// Intern `text`, returning the canonical handle for it.
    pub fn intern(&self, text: &str) -> StrRef {
        let hash = xxh3_64(text.as_bytes());
        #[allow(clippy::cast_possible_truncation)]
        let shard = &self.shards[(hash % N_SHARDS as u64) as usize];

        if let Some(existing) = self.find(&shard.read(), hash, text) {
            return existing;
        }

        let mut map = shard.write();
        // A racing interner may have won between the read and write locks.
        if let Some(existing) = self.find(&map, hash, text) {
            return existing;
        }
        let r = self.arena.alloc(InternedStr {
            text: text.into(),
            hash,
        });
        map.entry(hash).or_default().push(r);
        r
    }

    fn find(
        &self,
        map: &HashMap<u64, SmallVec<[StrRef; 1]>>,
        hash: u64,
        text: &str,
    ) -> Option<StrRef> {
        let bucket = map.get(&hash)?;
        bucket
            .iter()
            .copied()
            .find(|r| self.arena.get(*r).is_some_and(|s| s.text() == text))
    }

    /// Look up an interned string by handle.
    #[must_use]
    pub fn get(&self, r: StrRef) -> Option<&InternedStr> {
        self.arena.get(r)
    }

    /// The text behind a handle issued by this table.
    ///
    /// # Panics
    ///
    /// Panics on a handle this table never issued.
    #[must_use]
    pub fn resolve(&self, r: StrRef) -> &str {
        self.arena
            .get(r)
            .expect("string handle was issued by this table")
            .text()
    }

    /// Number of distinct strings interned.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.arena.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StringTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringTable")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn equal_text_interns_to_identical_handle() {
        let table = StringTable::new();
        let a = table.intern("inventory");
        let b = table.intern("inventory");
        let c = table.intern("Inventory");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.resolve(a), "inventory");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn hash_is_cached() {
        let table = StringTable::new();
        let r = table.intern("abc");
        let s = table.get(r).unwrap();
        assert_eq!(s.hash64(), xxh3_64(b"abc"));
    }

    #[test]
    fn concurrent_interning_agrees_on_handles() {
        let table = Arc::new(StringTable::new());
        let barrier = Arc::new(Barrier::new(8));
        let names: Vec<String> = (0..32).map(|i| format!("name-{i}")).collect();

        let mut joins = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            let names = names.clone();
            joins.push(thread::spawn(move || {
                barrier.wait();
                names.iter().map(|n| table.intern(n)).collect::<Vec<_>>()
            }));
        }

        let results: Vec<Vec<StrRef>> = joins.into_iter().map(|j| j.join().unwrap()).collect();
        for r in &results[1..] {
            assert_eq!(r, &results[0], "all threads must agree on handles");
        }
        assert_eq!(table.len(), 32);
    }
}
