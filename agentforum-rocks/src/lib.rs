//! RocksDB-backed store for agentforum.
//!
//! All tables share one keyspace, separated by a one-byte prefix:
//! - `m` + hash: message record bytes
//! - `c` + parent hash + child hash: child index entry (empty value)
//! - `a` + alias name: target hash

use std::hash::{BuildHasher, RandomState};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use agentforum_core::{Hash, Store};
use rocksdb::{DB, Direction, IteratorMode, Options};
use thiserror::Error;

const RECORD: u8 = b'm';
const CHILD: u8 = b'c';
const ALIAS: u8 = b'a';

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Error)]
pub enum RocksError {
    #[error("RocksDB error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("malformed {0} entry in store")]
    Malformed(&'static str),
}

/// A persistent store backed by RocksDB.
pub struct RocksStore {
    db: DB,
    // Check-then-put on one key is serialized by the stripe owning that key.
    stripes: Vec<Mutex<()>>,
    hasher: RandomState,
}

impl RocksStore {
    /// Opens a RocksDB store at the given path.
    ///
    /// Creates the database if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RocksError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        })
    }

    fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let stripe = self.hasher.hash_one(key) as usize % self.stripes.len();
        self.stripes[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Iterates all entries whose key starts with `prefix`.
    fn scan<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>> + 'a {
        self.db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
            .take_while(move |entry| match entry {
                Ok((key, _)) => key.starts_with(prefix),
                Err(_) => true,
            })
    }
}

fn key(table: u8, parts: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![table];
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

impl Store for RocksStore {
    type Error = RocksError;

    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.db.get(key(RECORD, &[hash.as_bytes()]))?)
    }

    fn put_if_absent(&self, hash: &Hash, value: &[u8]) -> Result<bool, Self::Error> {
        let k = key(RECORD, &[hash.as_bytes()]);
        let _guard = self.lock(&k);
        if self.db.get_pinned(&k)?.is_some() {
            return Ok(false);
        }
        self.db.put(&k, value)?;
        Ok(true)
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::Error> {
        Ok(self
            .db
            .get_pinned(key(RECORD, &[hash.as_bytes()]))?
            .is_some())
    }

    fn link_child(&self, parent: &Hash, child: &Hash) -> Result<(), Self::Error> {
        self.db
            .put(key(CHILD, &[parent.as_bytes(), child.as_bytes()]), b"")?;
        Ok(())
    }

    fn children(&self, parent: &Hash) -> Result<Vec<Hash>, Self::Error> {
        let prefix = key(CHILD, &[parent.as_bytes()]);
        let mut out = Vec::new();
        for entry in self.scan(&prefix) {
            let (k, _) = entry?;
            let child = Hash::from_slice(&k[prefix.len()..]).ok_or(RocksError::Malformed("child"))?;
            out.push(child);
        }
        Ok(out)
    }

    fn alias(&self, name: &str) -> Result<Option<Hash>, Self::Error> {
        match self.db.get(key(ALIAS, &[name.as_bytes()]))? {
            Some(bytes) => Hash::from_slice(&bytes)
                .map(Some)
                .ok_or(RocksError::Malformed("alias")),
            None => Ok(None),
        }
    }

    fn set_alias(&self, name: &str, target: &Hash) -> Result<Option<Hash>, Self::Error> {
        let k = key(ALIAS, &[name.as_bytes()]);
        let _guard = self.lock(&k);
        let previous = self.alias(name)?;
        self.db.put(&k, target.as_bytes())?;
        Ok(previous)
    }

    fn aliases(&self) -> Result<Vec<(String, Hash)>, Self::Error> {
        let mut out = Vec::new();
        for entry in self.scan(&[ALIAS]) {
            let (k, v) = entry?;
            let name = String::from_utf8(k[1..].to_vec()).map_err(|_| RocksError::Malformed("alias"))?;
            let target = Hash::from_slice(&v).ok_or(RocksError::Malformed("alias"))?;
            out.push((name, target));
        }
        Ok(out)
    }

    fn len(&self) -> Result<usize, Self::Error> {
        let mut count = 0;
        for entry in self.scan(&[RECORD]) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}
