//! LLM clients speaking the OpenAI-compatible chat-completions protocol.

mod client;
mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use client::OpenAiCompatClient;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{Message, ModelInfo, Response, ToolDef};

/// Receives text deltas during streaming, in arrival order.
pub type DeltaSink = dyn Fn(&str) + Send + Sync;

/// Interface for LLM interactions. The agent holds one for the conversation
/// and, optionally, a second lightweight one for housekeeping tasks.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one chat-completion request and return the assistant message.
    async fn complete(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<Response>;

    /// As [`complete`](Self::complete), but consume a server-sent-events
    /// stream, forwarding each text delta to `on_delta`. Tool calls emerge
    /// fully assembled in the returned response, never via the sink.
    async fn complete_streaming(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tools: &[ToolDef],
        on_delta: Option<&DeltaSink>,
    ) -> Result<Response>;

    /// List models available on the provider (Ollama-compatible endpoints).
    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ModelInfo>>;
}
