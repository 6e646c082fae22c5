use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ForumError;
use crate::forum::Forum;
use crate::message::Message;
use crate::metadata::{Metadata, FORWARDED_FROM_KEY, SENDER_KEY};
use crate::promise::{MessagePromise, MessageWriter};
use crate::sequence::{MessageSequence, SequenceWriter};
use crate::Hash;

/// Agent business logic.
///
/// An agent reads its input through the [`InteractionContext`] and emits its
/// response through the same context. Returning an error fails the message in
/// progress and the whole response sequence.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Name used as the default sender of emitted messages and as part of
    /// the cache fingerprint.
    fn alias(&self) -> &str;

    async fn run(&self, ctx: &mut InteractionContext) -> anyhow::Result<()>;
}

/// An agent backed by a synchronous closure.
pub struct FnAgent<F> {
    alias: String,
    func: F,
}

impl<F> FnAgent<F>
where
    F: Fn(&mut InteractionContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(alias: impl Into<String>, func: F) -> Self {
        FnAgent {
            alias: alias.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Agent for FnAgent<F>
where
    F: Fn(&mut InteractionContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn run(&self, ctx: &mut InteractionContext) -> anyhow::Result<()> {
        (self.func)(ctx)
    }
}

/// What an agent sees of one invocation, and where it writes its response.
///
/// Messages emitted here form a chain: the first one follows the input tip,
/// each later one follows the message before it.
pub struct InteractionContext {
    forum: Forum,
    sender: String,
    tip: Option<Hash>,
    config: Metadata,
    sequence: Option<SequenceWriter>,
    current: Option<MessageWriter>,
    last: Option<Hash>,
    cancel: CancellationToken,
}

impl InteractionContext {
    pub(crate) fn new(
        forum: Forum,
        sender: impl Into<String>,
        tip: Option<Hash>,
        config: Metadata,
        sequence: SequenceWriter,
    ) -> Self {
        let cancel = sequence.cancellation_token();
        sequence.sequence().set_input_tip(tip);
        InteractionContext {
            forum,
            sender: sender.into(),
            tip,
            config,
            sequence: Some(sequence),
            current: None,
            last: tip,
            cancel,
        }
    }

    pub fn forum(&self) -> &Forum {
        &self.forum
    }

    /// The input tip the agent was invoked on.
    pub fn tip(&self) -> Option<Hash> {
        self.tip
    }

    pub fn config(&self) -> &Metadata {
        &self.config
    }

    /// The sender alias stamped on emitted messages.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// The message at the input tip, if any.
    pub fn request(&self) -> Result<Option<Message>, ForumError> {
        match self.tip {
            Some(tip) => self.forum.tree().require(&tip).map(Some),
            None => Ok(None),
        }
    }

    /// The input branch, root first.
    pub fn history(&self) -> Result<Vec<Message>, ForumError> {
        match self.tip {
            Some(tip) => self.forum.tree().history(tip),
            None => Ok(Vec::new()),
        }
    }

    /// Token that fires when the consumer cancels this invocation.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn writer(&mut self) -> Result<&mut MessageWriter, ForumError> {
        let Some(sequence) = &self.sequence else {
            return Err(ForumError::ProductionFailure(
                "response sequence already ended".to_string(),
            ));
        };
        let (forum, last, cancel) = (&self.forum, self.last, &self.cancel);
        Ok(self.current.get_or_insert_with(|| {
            let (promise, writer) =
                MessagePromise::channel_with(forum.tree().clone(), last, Some(cancel.clone()));
            sequence.push(promise);
            writer
        }))
    }

    /// Appends a fragment to the message in progress, starting one if needed.
    pub fn emit_fragment(&mut self, piece: impl Into<String>) -> Result<(), ForumError> {
        self.writer()?.push(piece);
        Ok(())
    }

    /// Finalizes the message in progress with `metadata`.
    ///
    /// The sender defaults to the agent alias. If nothing was emitted since
    /// the last message, an empty message is produced.
    pub fn complete_message(&mut self, metadata: Metadata) -> Result<Message, ForumError> {
        self.writer()?;
        let Some(writer) = self.current.take() else {
            return Err(ForumError::ProductionFailure("no message in progress".to_string()));
        };
        let metadata = self.stamp(metadata);
        match writer.complete(metadata) {
            Ok(message) => {
                self.last = Some(message.identity());
                Ok(message)
            }
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    fn stamp(&self, mut metadata: Metadata) -> Metadata {
        if !metadata.contains_key(SENDER_KEY) {
            metadata.insert(SENDER_KEY, self.sender.clone());
        }
        metadata
    }

    /// Emits a whole message in one go.
    pub fn respond(&mut self, text: impl Into<String>) -> Result<Message, ForumError> {
        self.respond_with(text, Metadata::new())
    }

    pub fn respond_with(
        &mut self,
        text: impl Into<String>,
        metadata: Metadata,
    ) -> Result<Message, ForumError> {
        self.emit_fragment(text)?;
        self.complete_message(metadata)
    }

    /// Copies a nested promise into a new message of this response,
    /// forwarding its fragments as they arrive.
    ///
    /// The new message carries the nested message's metadata with the sender
    /// replaced by this agent and [`FORWARDED_FROM_KEY`] set to the nested
    /// identity. A nested failure fails this response with the same error.
    pub async fn relay(&mut self, promise: &MessagePromise) -> Result<Message, ForumError> {
        if self.current.is_some() {
            self.complete_message(Metadata::new())?;
        }
        self.writer()?;

        let mut tokens = promise.tokens();
        while let Some(token) = tokens.next().await {
            match token {
                Ok(fragment) => self.writer()?.push(fragment),
                Err(e) => {
                    self.fail(e.clone());
                    return Err(e);
                }
            }
        }
        let source = match promise.resolve().await {
            Ok(source) => source,
            Err(e) => {
                self.fail(e.clone());
                return Err(e);
            }
        };

        let mut metadata = source.metadata().clone();
        metadata.insert(SENDER_KEY, self.sender.clone());
        metadata.insert(FORWARDED_FROM_KEY, source.identity().to_string());
        self.complete_message(metadata)
    }

    /// Relays every promise of a nested sequence in order.
    pub async fn relay_sequence(
        &mut self,
        sequence: &MessageSequence,
    ) -> Result<Vec<Message>, ForumError> {
        let mut cursor = sequence.cursor();
        let mut relayed = Vec::new();
        loop {
            match cursor.next().await {
                Ok(Some(promise)) => relayed.push(self.relay(&promise).await?),
                Ok(None) => return Ok(relayed),
                Err(e) => {
                    self.fail(e.clone());
                    return Err(e);
                }
            }
        }
    }

    /// Closes the response. A message in progress is completed first.
    pub fn end_sequence(&mut self) -> Result<(), ForumError> {
        if self.current.is_some() {
            self.complete_message(Metadata::new())?;
        }
        if let Some(sequence) = self.sequence.take() {
            debug!(sender = %self.sender, "response closed");
            sequence.close();
        }
        Ok(())
    }

    /// Fails the message in progress and the response.
    pub(crate) fn fail(&mut self, error: ForumError) {
        if let Some(writer) = self.current.take() {
            writer.fail(error.clone());
        }
        if let Some(sequence) = self.sequence.take() {
            warn!(sender = %self.sender, error = %error, "response failed");
            sequence.fail(error);
        }
    }

    /// Called by the scheduler once the agent returns successfully.
    pub(crate) fn finish(&mut self) {
        if let Err(e) = self.end_sequence() {
            self.fail(e);
        }
    }
}
