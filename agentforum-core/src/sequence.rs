use std::fmt;
use std::sync::{Arc, OnceLock};

use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::ForumError;
use crate::message::Message;
use crate::promise::MessagePromise;
use crate::replay::{Replay, Step};
use crate::Hash;

/// Observable state of a [`MessageSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Open,
    Closed,
    Failed,
}

/// An ordered, possibly still growing sequence of message promises.
///
/// Handles are cheap to clone and all observe the same promises from the
/// first one. Once the sequence is closed or failed it stays that way.
#[derive(Clone)]
pub struct MessageSequence {
    log: Arc<Replay<MessagePromise, ()>>,
    cancel: CancellationToken,
    input_tip: Arc<OnceLock<Option<Hash>>>,
}

impl MessageSequence {
    /// Creates an open sequence and its writer.
    pub fn channel() -> (MessageSequence, SequenceWriter) {
        let sequence = MessageSequence {
            log: Arc::new(Replay::new()),
            cancel: CancellationToken::new(),
            input_tip: Arc::new(OnceLock::new()),
        };
        let writer = SequenceWriter {
            sequence: sequence.clone(),
            finished: false,
        };
        (sequence, writer)
    }

    /// An already closed sequence chained onto `tip`.
    pub fn completed(tip: Option<Hash>, promises: Vec<MessagePromise>) -> Self {
        MessageSequence {
            log: Arc::new(Replay::finished(promises, Ok(()))),
            cancel: CancellationToken::new(),
            input_tip: Arc::new(OnceLock::from(tip)),
        }
    }

    /// An already failed sequence with no promises.
    pub fn failed(error: ForumError) -> Self {
        MessageSequence {
            log: Arc::new(Replay::finished(Vec::new(), Err(error))),
            cancel: CancellationToken::new(),
            input_tip: Arc::new(OnceLock::new()),
        }
    }

    /// The branch tip this sequence continues, once the producer knows it.
    ///
    /// `None` both for a sequence that starts a new branch and for one whose
    /// input has not been resolved yet.
    pub fn input_tip(&self) -> Option<Hash> {
        self.input_tip.get().copied().flatten()
    }

    /// Records the input tip. Only the first call has an effect.
    pub(crate) fn set_input_tip(&self, tip: Option<Hash>) {
        let _ = self.input_tip.set(tip);
    }

    /// The tip a follow-up invocation continues from: the last message, or
    /// the input tip when the sequence produced nothing.
    pub async fn branch_tip(&self) -> Result<Option<Hash>, ForumError> {
        match self.last().await? {
            Some(message) => Ok(Some(message.identity())),
            None => Ok(self.input_tip()),
        }
    }

    /// A cursor positioned before the first promise.
    pub fn cursor(&self) -> SequenceCursor {
        SequenceCursor {
            log: self.log.clone(),
            index: 0,
        }
    }

    /// Streams promises as they are produced. A failure is yielded once, last.
    pub fn stream(&self) -> BoxStream<'static, Result<MessagePromise, ForumError>> {
        stream::unfold((self.cursor(), false), |(mut cursor, done)| async move {
            if done {
                return None;
            }
            match cursor.next().await {
                Ok(Some(promise)) => Some((Ok(promise), (cursor, false))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (cursor, true))),
            }
        })
        .boxed()
    }

    /// Resolves every promise in order. Fails on the first failure.
    pub async fn materialize(&self) -> Result<Vec<Message>, ForumError> {
        let mut cursor = self.cursor();
        let mut messages = Vec::new();
        while let Some(promise) = cursor.next().await? {
            messages.push(promise.resolve().await?);
        }
        Ok(messages)
    }

    /// Resolves the whole sequence and returns its final message, if any.
    pub async fn last(&self) -> Result<Option<Message>, ForumError> {
        Ok(self.materialize().await?.pop())
    }

    pub fn status(&self) -> SequenceStatus {
        match self.log.outcome_now() {
            None => SequenceStatus::Open,
            Some(Ok(())) => SequenceStatus::Closed,
            Some(Err(_)) => SequenceStatus::Failed,
        }
    }

    /// The error the sequence failed with, if it failed.
    pub fn error(&self) -> Option<ForumError> {
        self.log.outcome_now().and_then(Result::err)
    }

    /// Promises produced so far. Never waits.
    pub fn promises(&self) -> Vec<MessagePromise> {
        self.log.items()
    }

    /// Requests cancellation of the invocation producing this sequence.
    ///
    /// Has no effect once the sequence is closed or failed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True if both handles refer to the same sequence.
    pub fn same_as(&self, other: &MessageSequence) -> bool {
        Arc::ptr_eq(&self.log, &other.log)
    }
}

impl fmt::Debug for MessageSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSequence")
            .field("input_tip", &self.input_tip())
            .field("status", &self.status())
            .field("len", &self.log.len())
            .finish()
    }
}

/// Reads a [`MessageSequence`] one promise at a time.
pub struct SequenceCursor {
    log: Arc<Replay<MessagePromise, ()>>,
    index: usize,
}

impl SequenceCursor {
    /// Waits for the next promise.
    ///
    /// Returns `Ok(None)` once the sequence is closed and `Err` once it has
    /// failed; both are repeated on every later call.
    pub async fn next(&mut self) -> Result<Option<MessagePromise>, ForumError> {
        match self.log.next(self.index).await {
            Step::Item(promise) => {
                self.index += 1;
                Ok(Some(promise))
            }
            Step::End(Ok(())) => Ok(None),
            Step::End(Err(e)) => Err(e),
        }
    }
}

/// The producing side of a [`MessageSequence`].
///
/// Dropping an unfinished writer fails the sequence.
pub struct SequenceWriter {
    sequence: MessageSequence,
    finished: bool,
}

impl SequenceWriter {
    pub fn push(&self, promise: MessagePromise) {
        self.sequence.log.push(promise);
    }

    pub fn sequence(&self) -> &MessageSequence {
        &self.sequence
    }

    pub fn close(mut self) {
        self.finished = true;
        self.sequence.log.finish(Ok(()));
    }

    pub fn fail(mut self, error: ForumError) {
        self.finished = true;
        self.sequence.log.finish(Err(error));
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.sequence.cancel.clone()
    }
}

impl Drop for SequenceWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = if self.sequence.cancel.is_cancelled() {
            ForumError::Cancelled
        } else {
            ForumError::ProductionFailure("sequence producer stopped before closing".to_string())
        };
        self.sequence.log.finish(Err(error));
    }
}

impl fmt::Debug for SequenceWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceWriter")
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::tree::MessageTree;

    #[tokio::test]
    async fn closed_sequence_repeats_end() {
        let root = Message::root("r", Metadata::new());
        let seq = MessageSequence::completed(None, vec![MessagePromise::resolved(root.clone())]);
        let mut cursor = seq.cursor();

        assert!(cursor.next().await.unwrap().is_some());
        assert!(cursor.next().await.unwrap().is_none());
        assert!(cursor.next().await.unwrap().is_none());
        assert_eq!(seq.status(), SequenceStatus::Closed);
        assert_eq!(seq.last().await.unwrap(), Some(root));
    }

    #[tokio::test]
    async fn failed_sequence_repeats_error() {
        let (seq, writer) = MessageSequence::channel();
        writer.fail(ForumError::Cancelled);

        let mut cursor = seq.cursor();
        assert!(matches!(cursor.next().await, Err(ForumError::Cancelled)));
        assert!(matches!(cursor.next().await, Err(ForumError::Cancelled)));
        assert_eq!(seq.status(), SequenceStatus::Failed);
    }

    #[tokio::test]
    async fn materialize_fails_fast_on_failed_promise() {
        let tree = MessageTree::in_memory();
        let (seq, writer) = MessageSequence::channel();

        let (first, w1) = MessagePromise::channel(tree.clone(), None);
        writer.push(first);
        let ok = w1.complete(Metadata::new()).unwrap();

        let (second, w2) = MessagePromise::channel(tree, Some(ok.identity()));
        writer.push(second);
        w2.fail(ForumError::ProductionFailure("bad".into()));
        writer.close();

        let err = seq.materialize().await.unwrap_err();
        assert!(matches!(err, ForumError::ProductionFailure(_)));
    }

    #[tokio::test]
    async fn every_handle_sees_all_promises() {
        let tree = MessageTree::in_memory();
        let (seq, writer) = MessageSequence::channel();
        let early = seq.clone();

        let (p, w) = MessagePromise::channel(tree, None);
        writer.push(p);
        w.complete(Metadata::new()).unwrap();
        writer.close();

        let late = seq.clone();
        assert_eq!(early.materialize().await.unwrap().len(), 1);
        assert_eq!(late.materialize().await.unwrap().len(), 1);
        assert!(early.same_as(&late));
    }

    #[tokio::test]
    async fn dropped_writer_fails_sequence() {
        let (seq, writer) = MessageSequence::channel();
        drop(writer);
        assert_eq!(seq.status(), SequenceStatus::Failed);

        let (seq, writer) = MessageSequence::channel();
        seq.cancel();
        drop(writer);
        assert!(matches!(seq.error(), Some(ForumError::Cancelled)));
    }

    #[tokio::test]
    async fn empty_sequence_continues_from_input_tip() {
        let root = Message::root("r", Metadata::new());
        let (seq, writer) = MessageSequence::channel();
        writer.sequence().set_input_tip(Some(root.identity()));
        writer.sequence().set_input_tip(None);
        writer.close();

        assert_eq!(seq.input_tip(), Some(root.identity()));
        assert_eq!(seq.branch_tip().await.unwrap(), Some(root.identity()));

        let reply = Message::new("a", Metadata::new(), Some(root.identity()));
        let seq = MessageSequence::completed(
            Some(root.identity()),
            vec![MessagePromise::resolved(reply.clone())],
        );
        assert_eq!(seq.branch_tip().await.unwrap(), Some(reply.identity()));
    }
}
