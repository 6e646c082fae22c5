//! Agentforum is a content-addressed message tree with streaming agent
//! responses.
//!
//! Core concepts:
//! - **Message**: an immutable record `{content, metadata, previous}` whose
//!   identity is the BLAKE3 hash of its canonical CBOR encoding
//! - **MessageTree**: a forest of messages over any [`Store`], plus named
//!   aliases pointing at branch tips
//! - **MessagePromise**: a message still in production; every consumer sees
//!   the same fragment stream and the same final message
//! - **MessageSequence**: the ordered promises an agent invocation produces
//! - **Forum**: schedules [`Agent`]s on branch tips and caches their responses
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use agentforum_core::{Agent, FnAgent, Forum, InteractionContext, Metadata};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), agentforum_core::ForumError> {
//! let forum = Forum::in_memory();
//! let question = forum.post(None, "ping", Metadata::new())?;
//!
//! let agent: Arc<dyn Agent> = Arc::new(FnAgent::new("PONG", |ctx: &mut InteractionContext| {
//!     ctx.respond("pong")?;
//!     Ok(())
//! }));
//!
//! let reply = forum.invoke(agent, &question, Metadata::new());
//! let messages = reply.materialize().await?;
//! assert_eq!(messages[0].content(), "pong");
//! assert_eq!(messages[0].previous(), Some(question.identity()));
//! # Ok(())
//! # }
//! ```

mod agent;
mod cache;
mod error;
mod forum;
mod hash;
mod message;
mod metadata;
mod promise;
mod replay;
mod sequence;
mod store;
mod tree;

pub use agent::{Agent, FnAgent, InteractionContext};
pub use cache::{Fingerprint, ResponseCache, CACHE_ALIAS_PREFIX};
pub use error::{ErrorKind, ForumError};
pub use forum::{Forum, Input};
pub use hash::{Hash, ParseHashError};
pub use message::Message;
pub use metadata::{
    MetaValue, Metadata, FORWARDED_FROM_KEY, IS_ERROR_KEY, SENDER_KEY, USER_ALIAS,
};
pub use promise::{MessagePromise, MessageWriter, PromiseState};
pub use sequence::{MessageSequence, SequenceCursor, SequenceStatus, SequenceWriter};
pub use store::{MemoryStore, Store};
pub use tree::MessageTree;
