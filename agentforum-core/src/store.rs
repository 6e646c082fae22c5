use std::collections::BTreeSet;
use std::convert::Infallible;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::Hash;

/// A content-addressed record store with a side table of named aliases.
///
/// Stores operate on raw bytes: encoding, hashing and integrity checks are
/// handled by [`MessageTree`](crate::MessageTree). Records are write-once;
/// aliases are the only mutable state and live apart from the records.
///
/// All methods take `&self` to support stores with internal locking (e.g., RocksDB).
pub trait Store {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Retrieves the record stored under a hash, or None if not present.
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Stores a record unless one is already present under the hash.
    ///
    /// Returns true if this call inserted the record. Concurrent callers
    /// writing the same hash must leave exactly one record behind.
    fn put_if_absent(&self, hash: &Hash, value: &[u8]) -> Result<bool, Self::Error>;

    /// Checks whether a record exists under the hash.
    fn has(&self, hash: &Hash) -> Result<bool, Self::Error>;

    /// Records `child` as a direct successor of `parent`.
    fn link_child(&self, parent: &Hash, child: &Hash) -> Result<(), Self::Error>;

    /// Direct successors of `parent`, in hash order.
    fn children(&self, parent: &Hash) -> Result<Vec<Hash>, Self::Error>;

    /// Looks up a named alias.
    fn alias(&self, name: &str) -> Result<Option<Hash>, Self::Error>;

    /// Points a named alias at `target`, returning the previous target.
    fn set_alias(&self, name: &str, target: &Hash) -> Result<Option<Hash>, Self::Error>;

    /// All aliases, sorted by name.
    fn aliases(&self) -> Result<Vec<(String, Hash)>, Self::Error>;

    /// Number of stored records.
    fn len(&self) -> Result<usize, Self::Error>;
}

/// An in-memory store.
///
/// Inserts go through per-key `DashMap` entries, so concurrent writers only
/// contend when they write the same hash.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<Hash, Vec<u8>>,
    children: DashMap<Hash, BTreeSet<Hash>>,
    aliases: DashMap<String, Hash>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    type Error = Infallible;

    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.records.get(hash).map(|r| r.value().clone()))
    }

    fn put_if_absent(&self, hash: &Hash, value: &[u8]) -> Result<bool, Self::Error> {
        match self.records.entry(*hash) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value.to_vec());
                Ok(true)
            }
        }
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::Error> {
        Ok(self.records.contains_key(hash))
    }

    fn link_child(&self, parent: &Hash, child: &Hash) -> Result<(), Self::Error> {
        self.children.entry(*parent).or_default().insert(*child);
        Ok(())
    }

    fn children(&self, parent: &Hash) -> Result<Vec<Hash>, Self::Error> {
        Ok(self
            .children
            .get(parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn alias(&self, name: &str) -> Result<Option<Hash>, Self::Error> {
        Ok(self.aliases.get(name).map(|h| *h))
    }

    fn set_alias(&self, name: &str, target: &Hash) -> Result<Option<Hash>, Self::Error> {
        Ok(self.aliases.insert(name.to_string(), *target))
    }

    fn aliases(&self) -> Result<Vec<(String, Hash)>, Self::Error> {
        let mut all: Vec<(String, Hash)> = self
            .aliases
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort();
        Ok(all)
    }

    fn len(&self) -> Result<usize, Self::Error> {
        Ok(self.records.len())
    }
}
