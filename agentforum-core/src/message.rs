use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::ForumError;
use crate::hash::{encode, Hash};
use crate::metadata::{Metadata, FORWARDED_FROM_KEY, IS_ERROR_KEY, SENDER_KEY, USER_ALIAS};

/// An immutable message in the forum tree.
///
/// A message's identity is the hash of its CBOR record
/// `{content, metadata, previous}` and nothing else, so two messages with the
/// same content, metadata and history always share an identity.
///
/// The identity is computed lazily on first access and cached.
#[derive(Clone, Serialize, Deserialize)]
pub struct Message {
    content: String,
    metadata: Metadata,
    previous: Option<Hash>,
    #[serde(skip)]
    identity: OnceLock<Hash>,
}

impl Message {
    pub fn new(content: impl Into<String>, metadata: Metadata, previous: Option<Hash>) -> Self {
        Message {
            content: content.into(),
            metadata,
            previous,
            identity: OnceLock::new(),
        }
    }

    /// A message that starts a new branch.
    pub fn root(content: impl Into<String>, metadata: Metadata) -> Self {
        Self::new(content, metadata, None)
    }

    /// Returns the content-addressed identity, computing it if necessary.
    pub fn identity(&self) -> Hash {
        *self.identity.get_or_init(|| Hash::from_data(&self.encode()))
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Identity of the predecessor, or `None` for a branch root.
    pub fn previous(&self) -> Option<Hash> {
        self.previous
    }

    pub fn is_root(&self) -> bool {
        self.previous.is_none()
    }

    /// The sender alias recorded in metadata, `"USER"` if absent.
    pub fn sender(&self) -> &str {
        self.metadata.get_str(SENDER_KEY).unwrap_or(USER_ALIAS)
    }

    pub fn is_error(&self) -> bool {
        self.metadata
            .get(IS_ERROR_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// For a relayed message, the identity of the message it was copied from.
    ///
    /// A malformed link reads as no link.
    pub fn forwarded_from(&self) -> Option<Hash> {
        self.metadata.get_str(FORWARDED_FROM_KEY)?.parse().ok()
    }

    /// The canonical record bytes this message's identity is computed from.
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// Decodes a record without checking it against any claimed identity.
    pub fn decode(bytes: &[u8]) -> Result<Self, ForumError> {
        ciborium::from_reader(bytes).map_err(|e| ForumError::Decode(e.to_string()))
    }

    /// Decodes a record and checks that it hashes to `claimed`.
    pub fn decode_verified(claimed: Hash, bytes: &[u8]) -> Result<Self, ForumError> {
        let computed = Hash::from_data(bytes);
        if computed != claimed {
            return Err(ForumError::IntegrityViolation { claimed, computed });
        }
        let message = Self::decode(bytes)?;
        // A record that decodes but re-encodes differently is not canonical.
        let canonical = message.identity();
        if canonical != claimed {
            return Err(ForumError::IntegrityViolation {
                claimed,
                computed: canonical,
            });
        }
        Ok(message)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Message {}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("content", &self.content)
            .field("metadata", &self.metadata)
            .field("previous", &self.previous)
            .field("identity", &self.identity.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_pure_function_of_fields() {
        let a = Message::root("hello", Metadata::new());
        let b = Message::root("hello", Metadata::new());
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.identity(), a.identity());
    }

    #[test]
    fn identity_known_answers() {
        let root = Message::root("hello", Metadata::new());
        assert_eq!(
            root.identity().to_string(),
            "fec118e589d496c591c036373c37e7ebc9a0e42578f1bb9693855d9f717905ec"
        );

        let reply = Message::new(
            "world",
            Metadata::new().with(SENDER_KEY, "BOT").with("model", "m1"),
            Some(root.identity()),
        );
        assert_eq!(
            reply.identity().to_string(),
            "19c31ae37c95b916716a5c46291332cbb4391855b45acee69756ff4115fdac14"
        );
    }

    #[test]
    fn history_changes_identity() {
        let root = Message::root("q", Metadata::new());
        let a = Message::new("a", Metadata::new(), Some(root.identity()));
        let detached = Message::root("a", Metadata::new());
        assert_ne!(a.identity(), detached.identity());
    }

    #[test]
    fn metadata_changes_identity() {
        let plain = Message::root("x", Metadata::new());
        let tagged = Message::root("x", Metadata::new().with("role", "user"));
        assert_ne!(plain.identity(), tagged.identity());
    }

    #[test]
    fn decode_verified_accepts_matching_record() {
        let msg = Message::root("hi", Metadata::new().with(SENDER_KEY, "BOT"));
        let back = Message::decode_verified(msg.identity(), &msg.encode()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.sender(), "BOT");
    }

    #[test]
    fn decode_verified_rejects_tampering() {
        let msg = Message::root("hi", Metadata::new());
        let other = Message::root("bye", Metadata::new());
        let err = Message::decode_verified(msg.identity(), &other.encode()).unwrap_err();
        assert!(matches!(err, ForumError::IntegrityViolation { .. }));
    }

    #[test]
    fn forwarded_from_parses_link() {
        let source = Message::root("x", Metadata::new());
        let relayed = Message::root(
            "x",
            Metadata::new().with(FORWARDED_FROM_KEY, source.identity().to_string()),
        );
        assert_eq!(relayed.forwarded_from(), Some(source.identity()));
        assert_eq!(source.forwarded_from(), None);

        let garbled = Message::root("x", Metadata::new().with(FORWARDED_FROM_KEY, "nope"));
        assert_eq!(garbled.forwarded_from(), None);
    }

    #[test]
    fn sender_and_error_flags() {
        let plain = Message::root("x", Metadata::new());
        assert_eq!(plain.sender(), USER_ALIAS);
        assert!(!plain.is_error());

        let err = Message::root("x", Metadata::new().with(IS_ERROR_KEY, true));
        assert!(err.is_error());
    }
}
