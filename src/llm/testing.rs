//! Scripted LLM client for unit tests.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ForgeError, Result};
use crate::types::{Message, ModelInfo, Response, ToolDef};

use super::{DeltaSink, LlmClient};

/// Returns queued responses in order; errors once the script runs out.
pub(crate) struct ScriptedClient {
    responses: Mutex<Vec<Response>>,
}

impl ScriptedClient {
    pub(crate) fn new(messages: Vec<Message>) -> Self {
        Self {
            responses: Mutex::new(
                messages
                    .into_iter()
                    .rev()
                    .map(|message| Response { message })
                    .collect(),
            ),
        }
    }

    fn next(&self) -> Result<Response> {
        self.responses
            .lock()
            .unwrap()
            .pop()
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
