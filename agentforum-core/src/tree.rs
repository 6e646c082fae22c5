use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::ForumError;
use crate::hash::Hash;
use crate::message::Message;
use crate::store::{MemoryStore, Store};

/// Object-safe view of a [`Store`] with errors mapped to [`ForumError`].
trait Backend: Send + Sync {
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, ForumError>;
    fn put_if_absent(&self, hash: &Hash, value: &[u8]) -> Result<bool, ForumError>;
    fn has(&self, hash: &Hash) -> Result<bool, ForumError>;
    fn link_child(&self, parent: &Hash, child: &Hash) -> Result<(), ForumError>;
    fn children(&self, parent: &Hash) -> Result<Vec<Hash>, ForumError>;
    fn alias(&self, name: &str) -> Result<Option<Hash>, ForumError>;
    fn set_alias(&self, name: &str, target: &Hash) -> Result<Option<Hash>, ForumError>;
    fn aliases(&self) -> Result<Vec<(String, Hash)>, ForumError>;
    fn len(&self) -> Result<usize, ForumError>;
}

impl<S: Store + Send + Sync> Backend for S {
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, ForumError> {
        Store::get(self, hash).map_err(ForumError::storage)
    }

    fn put_if_absent(&self, hash: &Hash, value: &[u8]) -> Result<bool, ForumError> {
        Store::put_if_absent(self, hash, value).map_err(ForumError::storage)
    }

    fn has(&self, hash: &Hash) -> Result<bool, ForumError> {
        Store::has(self, hash).map_err(ForumError::storage)
    }

    fn link_child(&self, parent: &Hash, child: &Hash) -> Result<(), ForumError> {
        Store::link_child(self, parent, child).map_err(ForumError::storage)
    }

    fn children(&self, parent: &Hash) -> Result<Vec<Hash>, ForumError> {
        Store::children(self, parent).map_err(ForumError::storage)
    }

    fn alias(&self, name: &str) -> Result<Option<Hash>, ForumError> {
        Store::alias(self, name).map_err(ForumError::storage)
    }

    fn set_alias(&self, name: &str, target: &Hash) -> Result<Option<Hash>, ForumError> {
        Store::set_alias(self, name, target).map_err(ForumError::storage)
    }

    fn aliases(&self) -> Result<Vec<(String, Hash)>, ForumError> {
        Store::aliases(self).map_err(ForumError::storage)
    }

    fn len(&self) -> Result<usize, ForumError> {
        Store::len(self).map_err(ForumError::storage)
    }
}

/// The message tree: a typed, integrity-checked view over a [`Store`].
///
/// Responsibilities:
/// - Deduplication: identical messages share one record and one identity
/// - Forest invariant: a message is only stored once its predecessor is
/// - Integrity: records are re-hashed on the way in and on the way out
/// - Aliases: named pointers at existing messages, kept apart from records
///
/// Cloning is cheap; clones share the underlying store.
#[derive(Clone)]
pub struct MessageTree {
    backend: Arc<dyn Backend>,
}

impl MessageTree {
    pub fn new<S: Store + Send + Sync + 'static>(store: S) -> Self {
        MessageTree {
            backend: Arc::new(store),
        }
    }

    /// A tree over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Stores a message, returning its identity.
    ///
    /// Storing a message that is already present is a no-op. Fails with
    /// `MissingPredecessor` if the message's predecessor is not stored.
    pub fn put(&self, message: &Message) -> Result<Hash, ForumError> {
        let bytes = message.encode();
        let hash = message.identity();

        if let Some(previous) = message.previous() {
            if !self.backend.has(&previous)? {
                return Err(ForumError::MissingPredecessor(previous));
            }
        }

        let inserted = self.backend.put_if_absent(&hash, &bytes)?;
        if let Some(previous) = message.previous() {
            self.backend.link_child(&previous, &hash)?;
        }
        trace!(message = %hash.short(), inserted, "put message");
        Ok(hash)
    }

    /// Stores a record received in encoded form under its claimed identity.
    ///
    /// The record is rejected with `IntegrityViolation` unless it is the
    /// canonical encoding of a message hashing to `claimed`.
    pub fn put_encoded(&self, claimed: Hash, bytes: &[u8]) -> Result<Hash, ForumError> {
        let message = Message::decode_verified(claimed, bytes)?;
        self.put(&message)
    }

    /// Looks up a message. Unknown identities yield `Ok(None)`.
    pub fn get(&self, hash: &Hash) -> Result<Option<Message>, ForumError> {
        match self.backend.get(hash)? {
            Some(bytes) => Message::decode_verified(*hash, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get), but an unknown identity is an error.
    pub fn require(&self, hash: &Hash) -> Result<Message, ForumError> {
        self.get(hash)?.ok_or(ForumError::NotFound(*hash))
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool, ForumError> {
        self.backend.has(hash)
    }

    /// Direct successors of a message across all branches.
    pub fn children(&self, hash: &Hash) -> Result<Vec<Hash>, ForumError> {
        self.backend.children(hash)
    }

    /// Points `alias` at an existing message, returning the previous target.
    ///
    /// The target is loaded and re-hashed first; the message itself is never
    /// touched.
    pub fn forward(&self, alias: &str, target: Hash) -> Result<Option<Hash>, ForumError> {
        self.require(&target)?;
        let previous = self.backend.set_alias(alias, &target)?;
        debug!(alias, target = %target.short(), "forwarded alias");
        Ok(previous)
    }

    pub fn alias(&self, name: &str) -> Result<Option<Hash>, ForumError> {
        self.backend.alias(name)
    }

    pub fn aliases(&self) -> Result<Vec<(String, Hash)>, ForumError> {
        self.backend.aliases()
    }

    /// Resolves a user-facing reference: a 64-character hex identity, or
    /// otherwise an alias name.
    pub fn resolve(&self, reference: &str) -> Result<Option<Hash>, ForumError> {
        match reference.parse::<Hash>() {
            Ok(hash) => Ok(Some(hash)),
            Err(_) => self.alias(reference),
        }
    }

    /// The branch ending at `tip`, root first.
    pub fn history(&self, tip: Hash) -> Result<Vec<Message>, ForumError> {
        let mut chain = Vec::new();
        let mut cursor = Some(tip);
        while let Some(hash) = cursor {
            let message = self.require(&hash)?;
            cursor = message.previous();
            chain.push(message);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Follows relay links from `hash` back to the message first produced
    /// with this content. A message that was never relayed is its own
    /// original.
    pub fn original(&self, hash: Hash) -> Result<Message, ForumError> {
        let mut message = self.require(&hash)?;
        while let Some(source) = message.forwarded_from() {
            message = self.require(&source)?;
        }
        Ok(message)
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize, ForumError> {
        self.backend.len()
    }

    pub fn is_empty(&self) -> Result<bool, ForumError> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for MessageTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTree").finish_non_exhaustive()
    }
}
