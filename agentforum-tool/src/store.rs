use std::path::{Path, PathBuf};

use agentforum_core::{Forum, Hash, MemoryStore, MessageTree, Store};
use agentforum_rocks::RocksStore;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnyStoreError {
    #[error("rocks error: {0}")]
    Rocks(#[from] agentforum_rocks::RocksError),

    #[error("cannot create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Memory,
    #[default]
    Rocks,
}

impl std::str::FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreType::Memory),
            "rocks" | "rocksdb" => Ok(StoreType::Rocks),
            _ => Err(format!("unknown store type: {}", s)),
        }
    }
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreType::Memory => write!(f, "memory"),
            StoreType::Rocks => write!(f, "rocks"),
        }
    }
}

pub enum AnyStore {
    Memory(MemoryStore),
    Rocks(RocksStore),
}

impl AnyStore {
    pub fn open(store_type: StoreType, path: impl AsRef<Path>) -> Result<Self, AnyStoreError> {
        match store_type {
            StoreType::Memory => Ok(Self::Memory(MemoryStore::new())),
            StoreType::Rocks => {
                let path = path.as_ref();
                if let Some(parent) = path.parent() {
                    // RocksDB creates the last component only.
                    std::fs::create_dir_all(parent).map_err(|source| AnyStoreError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                Ok(Self::Rocks(RocksStore::open(path)?))
            }
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $call:expr) => {
        match $self {
            AnyStore::Memory($s) => $call.map_err(|e| match e {}),
            AnyStore::Rocks($s) => $call.map_err(Into::into),
        }
    };
}

impl Store for AnyStore {
    type Error = AnyStoreError;

    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, Self::Error> {
        dispatch!(self, s => s.get(hash))
    }

    fn put_if_absent(&self, hash: &Hash, value: &[u8]) -> Result<bool, Self::Error> {
        dispatch!(self, s => s.put_if_absent(hash, value))
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::Error> {
        dispatch!(self, s => s.has(hash))
    }

    fn link_child(&self, parent: &Hash, child: &Hash) -> Result<(), Self::Error> {
        dispatch!(self, s => s.link_child(parent, child))
    }

    fn children(&self, parent: &Hash) -> Result<Vec<Hash>, Self::Error> {
        dispatch!(self, s => s.children(parent))
    }

    fn alias(&self, name: &str) -> Result<Option<Hash>, Self::Error> {
        dispatch!(self, s => s.alias(name))
    }

    fn set_alias(&self, name: &str, target: &Hash) -> Result<Option<Hash>, Self::Error> {
        dispatch!(self, s => s.set_alias(name, target))
    }

    fn aliases(&self) -> Result<Vec<(String, Hash)>, Self::Error> {
        dispatch!(self, s => s.aliases())
    }

    fn len(&self) -> Result<usize, Self::Error> {
        dispatch!(self, s => s.len())
    }
}

pub struct AppContext {
    pub forum: Forum,
}

impl AppContext {
    pub fn open(
        store_type: StoreType,
        store_path: PathBuf,
        persist_cache: bool,
    ) -> Result<Self, AnyStoreError> {
        let store = AnyStore::open(store_type, &store_path)?;
        let tree = MessageTree::new(store);
        let forum = if persist_cache {
            Forum::with_persistent_cache(tree)
        } else {
            Forum::new(tree)
        };
        tracing::debug!(%store_type, path = %store_path.display(), "store opened");

        Ok(Self { forum })
    }
}

pub fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentforum")
        .join("store")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_type_parsing() {
        assert_eq!("memory".parse::<StoreType>(), Ok(StoreType::Memory));
        assert_eq!("RocksDB".parse::<StoreType>(), Ok(StoreType::Rocks));
        assert!("fjall".parse::<StoreType>().is_err());
        assert_eq!(StoreType::default(), StoreType::Rocks);
    }

    #[test]
    fn unusable_store_directory_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = AnyStore::open(StoreType::Rocks, blocker.join("nested").join("store"));
        match result {
            Err(AnyStoreError::CreateDir { path, .. }) => assert_eq!(path, blocker.join("nested")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("store opened under a regular file"),
        }
    }

    #[test]
    fn memory_store_through_any_store() {
        let store = AnyStore::open(StoreType::Memory, "unused").unwrap();
        let hash = Hash::from_data(b"x");
        assert!(store.put_if_absent(&hash, b"x").unwrap());
        assert!(store.has(&hash).unwrap());
        assert_eq!(store.len().unwrap(), 1);
    }
}
