use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::agent::{Agent, InteractionContext};
use crate::cache::{Fingerprint, ResponseCache};
use crate::error::ForumError;
use crate::message::Message;
use crate::metadata::{Metadata, SENDER_KEY, USER_ALIAS};
use crate::promise::MessagePromise;
use crate::sequence::{MessageSequence, SequenceWriter};
use crate::tree::MessageTree;
use crate::Hash;

/// What an agent is invoked on.
#[derive(Debug, Clone)]
pub enum Input {
    /// A stored branch tip, or `None` for an empty conversation.
    Tip(Option<Hash>),
    /// A message still in production; its identity becomes the tip.
    Promise(MessagePromise),
    /// A response still in production; its last message becomes the tip, or
    /// its own input tip if it produced nothing.
    Sequence(MessageSequence),
}

impl Input {
    async fn resolve_tip(self) -> Result<Option<Hash>, ForumError> {
        match self {
            Input::Tip(tip) => Ok(tip),
            Input::Promise(promise) => Ok(Some(promise.resolve().await?.identity())),
            Input::Sequence(sequence) => sequence.branch_tip().await,
        }
    }
}

impl From<Hash> for Input {
    fn from(tip: Hash) -> Self {
        Input::Tip(Some(tip))
    }
}

impl From<Option<Hash>> for Input {
    fn from(tip: Option<Hash>) -> Self {
        Input::Tip(tip)
    }
}

impl From<&Message> for Input {
    fn from(message: &Message) -> Self {
        Input::Tip(Some(message.identity()))
    }
}

impl From<MessagePromise> for Input {
    fn from(promise: MessagePromise) -> Self {
        Input::Promise(promise)
    }
}

impl From<MessageSequence> for Input {
    fn from(sequence: MessageSequence) -> Self {
        Input::Sequence(sequence)
    }
}

/// A message tree together with the machinery to run agents on it.
///
/// Cloning is cheap; clones share the tree and the response cache.
#[derive(Clone, Debug)]
pub struct Forum {
    tree: MessageTree,
    cache: ResponseCache,
}

impl Forum {
    pub fn new(tree: MessageTree) -> Self {
        let cache = ResponseCache::new();
        Forum { tree, cache }
    }

    /// A forum whose cache records completed responses in the tree's alias
    /// table, so they survive restarts of a durable store.
    pub fn with_persistent_cache(tree: MessageTree) -> Self {
        let cache = ResponseCache::with_persistence(tree.clone());
        Forum { tree, cache }
    }

    pub fn in_memory() -> Self {
        Self::new(MessageTree::in_memory())
    }

    pub fn tree(&self) -> &MessageTree {
        &self.tree
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Stores a single message on top of `tip`. The sender defaults to
    /// `"USER"`.
    pub fn post(
        &self,
        tip: Option<Hash>,
        text: impl Into<String>,
        mut metadata: Metadata,
    ) -> Result<Message, ForumError> {
        if !metadata.contains_key(SENDER_KEY) {
            metadata.insert(SENDER_KEY, USER_ALIAS);
        }
        let message = Message::new(text, metadata, tip);
        self.tree.put(&message)?;
        Ok(message)
    }

    /// Schedules `agent` on `input` and returns its response immediately.
    ///
    /// The agent runs as its own task. Errors, panics and cancellation all
    /// end up as a failed sequence; none of them affect the caller.
    pub fn invoke(
        &self,
        agent: Arc<dyn Agent>,
        input: impl Into<Input>,
        config: Metadata,
    ) -> MessageSequence {
        let (sequence, writer) = MessageSequence::channel();
        let span = info_span!("invoke", agent = %agent.alias());
        debug!(parent: &span, "scheduled");
        tokio::spawn(run_agent(self.clone(), agent, input.into(), config, writer).instrument(span));
        sequence
    }

    /// Like [`invoke`](Self::invoke), but reuses an earlier or in-flight
    /// response for the same agent, config and input tip.
    pub fn invoke_cached(
        &self,
        agent: Arc<dyn Agent>,
        input: impl Into<Input>,
        config: Metadata,
    ) -> MessageSequence {
        match input.into() {
            Input::Tip(tip) => self.cached_on_tip(agent, tip, config),
            pending => {
                let (sequence, writer) = MessageSequence::channel();
                let forum = self.clone();
                let span = info_span!("invoke_cached", agent = %agent.alias());
                tokio::spawn(
                    async move {
                        let cancel = writer.cancellation_token();
                        let tip = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(ForumError::Cancelled),
                            tip = pending.resolve_tip() => tip,
                        };
                        match tip {
                            Ok(tip) => {
                                writer.sequence().set_input_tip(tip);
                                let inner = forum.cached_on_tip(agent, tip, config);
                                pipe(inner, writer, cancel).await;
                            }
                            Err(e) => writer.fail(e),
                        }
                    }
                    .instrument(span),
                );
                sequence
            }
        }
    }

    fn cached_on_tip(
        &self,
        agent: Arc<dyn Agent>,
        tip: Option<Hash>,
        config: Metadata,
    ) -> MessageSequence {
        let fingerprint = Fingerprint::new(agent.alias(), &config, tip);
        self.cache
            .get_or_insert_with(fingerprint, tip, || self.invoke(agent, tip, config))
    }
}

async fn run_agent(
    forum: Forum,
    agent: Arc<dyn Agent>,
    input: Input,
    config: Metadata,
    writer: SequenceWriter,
) {
    let cancel = writer.cancellation_token();
    let tip = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ForumError::Cancelled),
        tip = input.resolve_tip() => tip,
    };
    let tip = match tip {
        Ok(tip) => tip,
        Err(e) => {
            warn!(error = %e, "input failed");
            writer.fail(e);
            return;
        }
    };

    let mut ctx = InteractionContext::new(forum, agent.alias(), tip, config, writer);
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ForumError::Cancelled),
        result = agent.run(&mut ctx) => {
            result.map_err(|e| ForumError::ProductionFailure(format!("{e:#}")))
        }
    };
    match outcome {
        Ok(()) => ctx.finish(),
        Err(e) => ctx.fail(e),
    }
}

/// Copies the promises of `source` into `writer` until either finishes.
async fn pipe(source: MessageSequence, writer: SequenceWriter, cancel: CancellationToken) {
    let mut cursor = source.cursor();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ForumError::Cancelled),
            next = cursor.next() => next,
        };
        match next {
            Ok(Some(promise)) => writer.push(promise),
            Ok(None) => return writer.close(),
            Err(e) => return writer.fail(e),
        }
    }
}
