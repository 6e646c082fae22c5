use agentforum_core::{ForumError, Hash, ParseHashError};
use thiserror::Error;

use crate::store::AnyStoreError;

#[derive(Debug, Error)]
pub enum AfError {
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] AnyStoreError),

    #[error("Invalid hash: {0}")]
    InvalidHash(#[from] ParseHashError),

    #[error("No message or alias named {0}")]
    UnknownReference(String),

    #[error("Message not found: {0}")]
    MessageNotFound(Hash),

    #[error(transparent)]
    Forum(#[from] ForumError),
}
