//! Shared test doubles for integration tests.

#![allow(dead_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forge::llm::{DeltaSink, LlmClient};
use forge::types::{Message, ModelInfo, Response, ToolDef};
use forge::{ForgeError, Result};

/// Returns queued assistant messages in order; errors once the script runs
/// out. Streaming forwards the whole content as a single delta.
pub struct ScriptedClient {
    responses: Mutex<Vec<Message>>,
}

impl ScriptedClient {
    pub fn new(mut messages: Vec<Message>) -> Self {
        messages.reverse();
        Self {
            responses: Mutex::new(messages),
        }
    }

    fn next(&self) -> Result<Response> {
        self.responses
            .lock()
            .unwrap()
            .pop()
            .map(|message| Response { message })
            .ok_or_else(|| ForgeError::Stream("no more scripted responses".into()))
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        _messages: &[Message],
        _tools: &[ToolDef],
    ) -> Result<Response> {
        if cancel.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }
        self.next()
    }

    async fn complete_streaming(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tools: &[ToolDef],
        on_delta: Option<&DeltaSink>,
    ) -> Result<Response> {
        let resp = self.complete(cancel, messages, tools).await?;
        if let Some(sink) = on_delta {
            if !resp.message.content.is_empty() {
                sink(&resp.message.content);
            }
        }
        Ok(resp)
    }

    async fn list_models(&self, _cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

/// Replies to the last user message, after an optional delay. Used to observe
/// turn serialization across concurrent callers.
pub struct EchoClient {
    pub delay: std::time::Duration,
}

impl EchoClient {
    pub fn new(delay: std::time::Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl LlmClient for EchoClient {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        _tools: &[ToolDef],
    ) -> Result<Response> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == forge::types::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(Response {
            message: Message::assistant(format!("reply to: {last_user}")),
        })
    }

    async fn complete_streaming(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tools: &[ToolDef],
        on_delta: Option<&DeltaSink>,
    ) -> Result<Response> {
        let resp = self.complete(cancel, messages, tools).await?;
        if let Some(sink) = on_delta {
            sink(&resp.message.content);
        }
        Ok(resp)
    }

    async fn list_models(&self, _cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

/// Streams a partial delta, then blocks until cancelled.
pub struct StallingClient {
    pub partial: String,
}

#[async_trait]
impl LlmClient for StallingClient {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        _messages: &[Message],
        _tools: &[ToolDef],
    ) -> Result<Response> {
        cancel.cancelled().await;
        Err(ForgeError::Cancelled)
    }

    async fn complete_streaming(
        &self,
        cancel: &CancellationToken,
        _messages: &[Message],
        _tools: &[ToolDef],
        on_delta: Option<&DeltaSink>,
    ) -> Result<Response> {
        if let Some(sink) = on_delta {
            sink(&self.partial);
        }
        cancel.cancelled().await;
        Err(ForgeError::Cancelled)
    }

    async fn list_models(&self, _cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

/// Build an assistant message carrying tool calls.
pub fn assistant_with_calls(calls: Vec<(&str, &str, serde_json::Value)>) -> Message {
    Message {
        role: forge::types::Role::Assistant,
        content: String::new(),
        tool_calls: calls
            .into_iter()
            .map(|(id, name, args)| forge::types::ToolCall {
                id: id.into(),
                name: name.into(),
                args: args.as_object().cloned().unwrap_or_default(),
            })
            .collect(),
        tool_call_id: String::new(),
    }
}
