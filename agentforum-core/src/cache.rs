use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::ForumError;
use crate::message::Message;
use crate::metadata::Metadata;
use crate::promise::MessagePromise;
use crate::sequence::MessageSequence;
use crate::tree::MessageTree;
use crate::Hash;

/// Alias prefix under which persisted responses are recorded.
pub const CACHE_ALIAS_PREFIX: &str = "cache/";

/// Identifies one invocation: agent, config and resolved input tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(Hash);

#[derive(Serialize)]
struct FingerprintRecord<'a> {
    agent: &'a str,
    config: &'a Metadata,
    tip: Option<Hash>,
}

impl Fingerprint {
    pub fn new(agent: &str, config: &Metadata, tip: Option<Hash>) -> Self {
        Fingerprint(Hash::of(&FingerprintRecord { agent, config, tip }))
    }

    pub fn as_hash(&self) -> Hash {
        self.0
    }

    /// The alias a persisted response is recorded under.
    pub fn alias_name(&self) -> String {
        format!("{CACHE_ALIAS_PREFIX}{}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct CacheInner {
    entries: DashMap<Fingerprint, MessageSequence>,
    persist: Option<MessageTree>,
    watchers: TaskTracker,
}

/// Response cache keyed by [`Fingerprint`].
///
/// Holds in-flight sequences as well as finished ones, so concurrent callers
/// with the same fingerprint share a single invocation. Sequences that fail
/// are evicted once they fail.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<CacheInner>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        ResponseCache {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                persist: None,
                watchers: TaskTracker::new(),
            }),
        }
    }

    /// A cache that also records completed responses as aliases in `tree`
    /// and falls back to those aliases on a miss.
    pub fn with_persistence(tree: MessageTree) -> Self {
        ResponseCache {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                persist: Some(tree),
                watchers: TaskTracker::new(),
            }),
        }
    }

    /// The cached sequence for `fingerprint`, if any. Never invokes.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<MessageSequence> {
        self.inner.entries.get(fingerprint).map(|e| e.value().clone())
    }

    /// Caches `sequence` under `fingerprint`, replacing any earlier entry.
    pub fn store(&self, fingerprint: Fingerprint, sequence: MessageSequence) {
        self.inner.entries.insert(fingerprint, sequence.clone());
        self.watch(fingerprint, sequence);
    }

    /// Returns the cached sequence or creates one with `invoke`.
    ///
    /// `invoke` runs while the fingerprint's entry is locked, so of several
    /// concurrent callers exactly one invokes and the rest share its result.
    /// It must not block or touch this cache.
    pub fn get_or_insert_with(
        &self,
        fingerprint: Fingerprint,
        tip: Option<Hash>,
        invoke: impl FnOnce() -> MessageSequence,
    ) -> MessageSequence {
        match self.inner.entries.entry(fingerprint) {
            Entry::Occupied(entry) => {
                debug!(%fingerprint, "cache hit");
                entry.get().clone()
            }
            Entry::Vacant(slot) => {
                if let Some(sequence) = self.load_persisted(&fingerprint, tip) {
                    debug!(%fingerprint, "cache hit (persisted)");
                    slot.insert(sequence.clone());
                    return sequence;
                }
                debug!(%fingerprint, "cache miss");
                let sequence = invoke();
                slot.insert(sequence.clone());
                self.watch(fingerprint, sequence.clone());
                sequence
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drops all in-memory entries. Persisted aliases are left alone.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Waits until every response handed out so far has finished and been
    /// evicted or persisted.
    pub async fn settle(&self) {
        let watchers = &self.inner.watchers;
        watchers.close();
        watchers.wait().await;
        watchers.reopen();
    }

    fn evict(&self, fingerprint: &Fingerprint, sequence: &MessageSequence) {
        let removed = self
            .inner
            .entries
            .remove_if(fingerprint, |_, cached| cached.same_as(sequence));
        if removed.is_some() {
            debug!(%fingerprint, "evicted failed response");
        }
    }

    /// Follows `sequence` to completion: evicts it on failure, records it on
    /// success when persistence is enabled.
    fn watch(&self, fingerprint: Fingerprint, sequence: MessageSequence) {
        let cache = self.clone();
        self.inner.watchers.spawn(async move {
            match sequence.materialize().await {
                Ok(messages) => cache.persist(&fingerprint, &messages),
                Err(_) => cache.evict(&fingerprint, &sequence),
            }
        });
    }

    fn persist(&self, fingerprint: &Fingerprint, messages: &[Message]) {
        let (Some(tree), Some(last)) = (&self.inner.persist, messages.last()) else {
            return;
        };
        if let Err(e) = tree.forward(&fingerprint.alias_name(), last.identity()) {
            warn!(%fingerprint, error = %e, "failed to persist cached response");
        }
    }

    /// Rebuilds a persisted response by walking back from its last message
    /// to the input tip.
    fn load_persisted(&self, fingerprint: &Fingerprint, tip: Option<Hash>) -> Option<MessageSequence> {
        let tree = self.inner.persist.as_ref()?;
        let last = match tree.alias(&fingerprint.alias_name()) {
            Ok(last) => last?,
            Err(e) => {
                warn!(%fingerprint, error = %e, "failed to read cache alias");
                return None;
            }
        };
        match walk_back(tree, last, tip) {
            Ok(messages) => Some(MessageSequence::completed(
                tip,
                messages.into_iter().map(MessagePromise::resolved).collect(),
            )),
            Err(e) => {
                warn!(%fingerprint, error = %e, "ignoring unusable cache alias");
                None
            }
        }
    }
}

/// Messages from just after `tip` up to and including `last`, in order.
fn walk_back(tree: &MessageTree, last: Hash, tip: Option<Hash>) -> Result<Vec<Message>, ForumError> {
    let mut messages = Vec::new();
    let mut cursor = Some(last);
    while cursor != tip {
        let Some(hash) = cursor else {
            // Reached a root without meeting the tip.
            return Err(ForumError::NotFound(last));
        };
        let message = tree.require(&hash)?;
        cursor = message.previous();
        messages.push(message);
    }
    messages.reverse();
    Ok(messages)
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.inner.entries.len())
            .field("persistent", &self.inner.persist.is_some())
            .finish()
    }
}
