use std::time::Duration;

use agentforum_core::{Agent, InteractionContext, Metadata};
use async_trait::async_trait;

/// Streams the request back word by word as a single message.
pub struct EchoAgent {
    delay: Duration,
}

impl EchoAgent {
    pub const ALIAS: &'static str = "ECHO";

    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn alias(&self) -> &str {
        Self::ALIAS
    }

    async fn run(&self, ctx: &mut InteractionContext) -> anyhow::Result<()> {
        let Some(request) = ctx.request()? else {
            anyhow::bail!("nothing to echo");
        };

        for word in request.content().split_inclusive(' ') {
            ctx.emit_fragment(word)?;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        ctx.complete_message(Metadata::new().with("echo_of", request.sender()))?;
        Ok(())
    }
}
