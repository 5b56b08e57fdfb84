//! SSE streaming for chat completions.
//!
//! Text deltas are forwarded to the sink as they arrive; tool-call fragments
//! are accumulated across chunks and only surface, fully assembled, in the
//! final response.

use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ForgeError, Result};
use crate::types::{Message, Response, Role, ToolCall, ToolDef};

use super::client::{parse_tool_args, OpenAiCompatClient};
use super::DeltaSink;

impl OpenAiCompatClient {
    pub(super) async fn stream_chat(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tools: &[ToolDef],
        on_delta: Option<&DeltaSink>,
    ) -> Result<Response> {
        let body = self.request_body(messages, tools, true);
        debug!(model = %self.model(), messages = messages.len(), "chat completion stream");

        // Stream open is retried on 429; once bytes are flowing, any failure
        // aborts the call.
        let resp = self
            .with_retry(cancel, || self.post_completions(cancel, &body))
            .await?;

        let mut acc = StreamAccumulator::default();
        let stream = resp.bytes_stream();
        futures::pin_mut!(stream);
        let mut buffer = String::new();
        let mut saw_done = false;

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| ForgeError::Stream(format!("reading stream: {e}")))?;

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer.drain(..=line_end);

                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    saw_done = true;
                    continue;
                }
                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(parsed) => {
                        if let Some(delta) = acc.add(parsed) {
                            if let Some(sink) = on_delta {
                                sink(&delta);
                            }
                        }
                    }
                    Err(_) => {} // skip unparseable chunks
                }
            }
        }

        if !saw_done && !acc.finished() {
            return Err(ForgeError::Stream("stream closed before completion".into()));
        }

        acc.into_response()
    }
}

/// Folds stream chunks into one assistant message.
#[derive(Default)]
pub(super) struct StreamAccumulator {
    content: String,
    tool_calls: Vec<PartialToolCall>,
    finish_reason: Option<String>,
    saw_choice: bool,
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    /// Fold one chunk in; returns the text delta to forward, if any.
    pub(super) fn add(&mut self, chunk: StreamChunk) -> Option<String> {
        let choice = chunk.choices.into_iter().next()?;
        self.saw_choice = true;

        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }

        let mut out = None;
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                self.content.push_str(&text);
                out = Some(text);
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            if self.tool_calls.len() <= tc.index {
                self.tool_calls.resize_with(tc.index + 1, Default::default);
            }
            let slot = &mut self.tool_calls[tc.index];
            if let Some(id) = tc.id {
                slot.id.push_str(&id);
            }
            if let Some(function) = tc.function {
                if let Some(name) = function.name {
                    slot.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    slot.arguments.push_str(&arguments);
                }
            }
        }

        out
    }

    pub(super) fn finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub(super) fn into_response(self) -> Result<Response> {
        if !self.saw_choice {
            return Err(ForgeError::EmptyChoices);
        }
        let tool_calls = self
            .tool_calls
            .into_iter()
            .filter(|tc| !tc.id.is_empty() || !tc.name.is_empty())
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.name,
                args: parse_tool_args(&tc.arguments),
            })
            .collect();
        Ok(Response {
            message: Message {
                role: Role::Assistant,
                content: self.content,
                tool_calls,
                tool_call_id: String::new(),
            },
        })
    }
}

// Stream wire types (internal).

#[derive(Deserialize)]
pub(super) struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize, Default)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
