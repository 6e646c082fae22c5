use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{ErrorKind, ForumError};
use crate::message::Message;
use crate::metadata::Metadata;
use crate::replay::{Replay, Step};
use crate::tree::MessageTree;
use crate::Hash;

/// Observable state of a [`MessagePromise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// No fragment produced yet.
    Pending,
    /// At least one fragment produced, not yet finished.
    Streaming,
    Resolved,
    Failed,
}

/// A message that may still be in production.
///
/// Every clone observes the same fragment log: consumers that subscribe late
/// replay all fragments from the first one, and a slow consumer never holds
/// back a fast one. The promise resolves to the stored [`Message`] only after
/// it has been written to the tree.
#[derive(Clone)]
pub struct MessagePromise {
    log: Arc<Replay<String, Message>>,
}

impl MessagePromise {
    /// Creates a pending promise and the writer that produces it.
    ///
    /// `previous` is the predecessor of the message being produced.
    pub fn channel(tree: MessageTree, previous: Option<Hash>) -> (MessagePromise, MessageWriter) {
        Self::channel_with(tree, previous, None)
    }

    pub(crate) fn channel_with(
        tree: MessageTree,
        previous: Option<Hash>,
        cancel: Option<CancellationToken>,
    ) -> (MessagePromise, MessageWriter) {
        let promise = MessagePromise {
            log: Arc::new(Replay::new()),
        };
        let writer = MessageWriter {
            promise: promise.clone(),
            tree,
            previous,
            content: String::new(),
            cancel,
            finished: false,
        };
        (promise, writer)
    }

    /// A promise for a message that already exists. Its content is replayed
    /// as a single fragment.
    pub fn resolved(message: Message) -> Self {
        let fragments = if message.content().is_empty() {
            Vec::new()
        } else {
            vec![message.content().to_string()]
        };
        MessagePromise {
            log: Arc::new(Replay::finished(fragments, Ok(message))),
        }
    }

    /// A promise that has already failed.
    pub fn failed(error: ForumError) -> Self {
        MessagePromise {
            log: Arc::new(Replay::finished(Vec::new(), Err(error))),
        }
    }

    /// Streams the message fragments from the first one.
    ///
    /// The stream ends when the message resolves. If production fails, the
    /// error is yielded once after the fragments that were delivered.
    pub fn tokens(&self) -> BoxStream<'static, Result<String, ForumError>> {
        stream::unfold(
            (self.log.clone(), 0usize, false),
            |(log, index, done)| async move {
                if done {
                    return None;
                }
                match log.next(index).await {
                    Step::Item(fragment) => Some((Ok(fragment), (log, index + 1, false))),
                    Step::End(Ok(_)) => None,
                    Step::End(Err(e)) => Some((Err(e), (log, index, true))),
                }
            },
        )
        .boxed()
    }

    /// Waits until production finishes and returns the stored message.
    pub async fn resolve(&self) -> Result<Message, ForumError> {
        self.log.outcome().await
    }

    /// Returns the failure kind if the promise has failed. Never waits.
    pub fn fail_reason(&self) -> Option<ErrorKind> {
        match self.log.outcome_now() {
            Some(Err(e)) => Some(e.kind()),
            _ => None,
        }
    }

    pub fn state(&self) -> PromiseState {
        match self.log.outcome_now() {
            Some(Ok(_)) => PromiseState::Resolved,
            Some(Err(_)) => PromiseState::Failed,
            None if self.log.len() == 0 => PromiseState::Pending,
            None => PromiseState::Streaming,
        }
    }

    /// The identity of the resolved message, if resolved.
    pub fn identity(&self) -> Option<Hash> {
        self.message().map(|m| m.identity())
    }

    /// The resolved message, if resolved. Never waits.
    pub fn message(&self) -> Option<Message> {
        self.log.outcome_now().and_then(Result::ok)
    }

    /// Concatenation of the fragments produced so far.
    pub fn text_so_far(&self) -> String {
        self.log.items().concat()
    }
}

impl fmt::Debug for MessagePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePromise")
            .field("state", &self.state())
            .field("identity", &self.identity())
            .finish()
    }
}

/// The producing side of a [`MessagePromise`].
///
/// Dropping a writer that was neither completed nor failed fails the promise,
/// with `Cancelled` if its invocation was cancelled and `ProductionFailure`
/// otherwise.
pub struct MessageWriter {
    promise: MessagePromise,
    tree: MessageTree,
    previous: Option<Hash>,
    content: String,
    cancel: Option<CancellationToken>,
    finished: bool,
}

impl MessageWriter {
    /// Appends a fragment. Empty fragments are ignored.
    pub fn push(&mut self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if fragment.is_empty() {
            return;
        }
        trace!(len = fragment.len(), "fragment");
        self.content.push_str(&fragment);
        self.promise.log.push(fragment);
    }

    /// The promise this writer produces.
    pub fn promise(&self) -> &MessagePromise {
        &self.promise
    }

    pub fn previous(&self) -> Option<Hash> {
        self.previous
    }

    /// Stores the message built from all pushed fragments, then resolves.
    ///
    /// A storage failure fails the promise with the same error.
    pub fn complete(mut self, metadata: Metadata) -> Result<Message, ForumError> {
        self.finished = true;
        let content = std::mem::take(&mut self.content);
        let message = Message::new(content, metadata, self.previous);
        match self.tree.put(&message) {
            Ok(_) => {
                self.promise.log.finish(Ok(message.clone()));
                Ok(message)
            }
            Err(e) => {
                self.promise.log.finish(Err(e.clone()));
                Err(e)
            }
        }
    }

    pub fn fail(mut self, error: ForumError) {
        self.finished = true;
        self.promise.log.finish(Err(error));
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = match &self.cancel {
            Some(token) if token.is_cancelled() => ForumError::Cancelled,
            _ => ForumError::ProductionFailure(
                "message producer stopped before completing".to_string(),
            ),
        };
        self.promise.log.finish(Err(error));
    }
}

impl fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageWriter")
            .field("previous", &self.previous)
            .field("len", &self.content.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(promise: &MessagePromise) -> (Vec<String>, Option<ForumError>) {
        let mut tokens = promise.tokens();
        let mut seen = Vec::new();
        while let Some(item) = tokens.next().await {
            match item {
                Ok(t) => seen.push(t),
                Err(e) => return (seen, Some(e)),
            }
        }
        (seen, None)
    }

    #[tokio::test]
    async fn writer_resolves_to_stored_message() {
        let tree = MessageTree::in_memory();
        let (promise, mut writer) = MessagePromise::channel(tree.clone(), None);
        assert_eq!(promise.state(), PromiseState::Pending);

        writer.push("hel");
        writer.push("lo");
        assert_eq!(promise.state(), PromiseState::Streaming);
        assert_eq!(promise.text_so_far(), "hello");

        let message = writer.complete(Metadata::new()).unwrap();
        assert_eq!(promise.state(), PromiseState::Resolved);
        assert_eq!(promise.identity(), Some(message.identity()));
        assert_eq!(promise.resolve().await.unwrap().content(), "hello");
        assert!(tree.contains(&message.identity()).unwrap());
    }

    #[tokio::test]
    async fn late_subscriber_replays_all_fragments() {
        let (promise, mut writer) = MessagePromise::channel(MessageTree::in_memory(), None);
        writer.push("a");
        writer.push("b");
        writer.complete(Metadata::new()).unwrap();

        let (tokens, err) = collect(&promise).await;
        assert_eq!(tokens, vec!["a", "b"]);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn failure_keeps_delivered_fragments() {
        let (promise, mut writer) = MessagePromise::channel(MessageTree::in_memory(), None);
        writer.push("x");
        writer.fail(ForumError::ProductionFailure("boom".into()));

        let (tokens, err) = collect(&promise).await;
        assert_eq!(tokens, vec!["x"]);
        assert!(matches!(err, Some(ForumError::ProductionFailure(_))));
        assert_eq!(promise.fail_reason(), Some(ErrorKind::ProductionFailure));
        assert!(promise.resolve().await.is_err());
        // Resolving again gives the same answer.
        assert!(promise.resolve().await.is_err());
    }

    #[tokio::test]
    async fn dropped_writer_fails_promise() {
        let (promise, writer) = MessagePromise::channel(MessageTree::in_memory(), None);
        drop(writer);
        assert_eq!(promise.state(), PromiseState::Failed);
        assert_eq!(promise.fail_reason(), Some(ErrorKind::ProductionFailure));
    }

    #[tokio::test]
    async fn dropped_writer_after_cancel_reports_cancelled() {
        let token = CancellationToken::new();
        let (promise, writer) =
            MessagePromise::channel_with(MessageTree::in_memory(), None, Some(token.clone()));
        token.cancel();
        drop(writer);
        assert_eq!(promise.fail_reason(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn storage_rejection_fails_promise() {
        let missing = Hash::from_data(b"not stored");
        let (promise, writer) = MessagePromise::channel(MessageTree::in_memory(), Some(missing));
        let err = writer.complete(Metadata::new()).unwrap_err();
        assert!(matches!(err, ForumError::MissingPredecessor(_)));
        assert_eq!(promise.fail_reason(), Some(ErrorKind::IntegrityViolation));
    }

    #[tokio::test]
    async fn resolved_promise_replays_content() {
        let message = Message::root("done", Metadata::new());
        let promise = MessagePromise::resolved(message.clone());
        let (tokens, _) = collect(&promise).await;
        assert_eq!(tokens, vec!["done"]);
        assert_eq!(promise.resolve().await.unwrap(), message);
    }
}
