use std::sync::Arc;

use crate::Hash;

/// Coarse classification of a [`ForumError`], inspectable without holding the
/// error itself (see `MessagePromise::fail_reason`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProductionFailure,
    NotFound,
    IntegrityViolation,
    Cancelled,
    Storage,
}

/// Error type for message tree, promise and scheduling operations.
///
/// Cloneable: a failed promise hands the same error to every consumer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ForumError {
    #[error("production failed: {0}")]
    ProductionFailure(String),
    #[error("message not found: {0}")]
    NotFound(Hash),
    #[error("integrity violation: record claims {claimed} but hashes to {computed}")]
    IntegrityViolation { claimed: Hash, computed: Hash },
    #[error("predecessor {0} is not stored")]
    MissingPredecessor(Hash),
    #[error("failed to decode message record: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Storage(Arc<dyn std::error::Error + Send + Sync>),
}

impl ForumError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForumError::ProductionFailure(_) => ErrorKind::ProductionFailure,
            ForumError::NotFound(_) => ErrorKind::NotFound,
            ForumError::IntegrityViolation { .. }
            | ForumError::MissingPredecessor(_)
            | ForumError::Decode(_) => ErrorKind::IntegrityViolation,
            ForumError::Cancelled => ErrorKind::Cancelled,
            ForumError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn storage<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        ForumError::Storage(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let h = Hash::from_data(b"x");
        assert_eq!(ForumError::NotFound(h).kind(), ErrorKind::NotFound);
        assert_eq!(ForumError::MissingPredecessor(h).kind(), ErrorKind::IntegrityViolation);
        assert_eq!(ForumError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ForumError::ProductionFailure("boom".into()).kind(),
            ErrorKind::ProductionFailure
        );
    }

    #[test]
    fn display_mentions_both_hashes() {
        let claimed = Hash::from_data(b"a");
        let computed = Hash::from_data(b"b");
        let msg = ForumError::IntegrityViolation { claimed, computed }.to_string();
        assert!(msg.contains(&claimed.to_string()));
        assert!(msg.contains(&computed.to_string()));
    }
}
