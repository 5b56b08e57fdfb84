//! OpenAI-compatible chat-completions client with rate-limit-aware retry.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ForgeError, Result};
use crate::types::{Message, ModelInfo, Response, Role, ToolArgs, ToolCall, ToolDef};

use super::{DeltaSink, LlmClient};

/// Backoff schedule for HTTP 429 responses; three attempts total.
pub(super) const RETRY_BACKOFF: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(4)];

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
pub(super) fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client")
    })
}

/// Client for any OpenAI-compatible API (Ollama, vLLM, LM Studio, gateways).
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub(super) fn request_body(&self, messages: &[Message], tools: &[ToolDef], stream: bool) -> Value {
        let wire_messages: Vec<Value> = messages.iter().map(message_to_wire).collect();
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
        });
        let obj = body.as_object_mut().unwrap();

        if stream {
            obj.insert("stream".into(), true.into());
        }
        if !tools.is_empty() {
            let defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), defs.into());
        }

        body
    }

    /// POST the request, mapping 429 to a retryable error. The send itself
    /// races the cancellation token.
    pub(super) async fn post_completions(
        &self,
        cancel: &CancellationToken,
        body: &Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = shared_client()
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send();

        let resp = tokio::select! {
            resp = request => resp?,
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
        };

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ForgeError::RateLimited);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ForgeError::Provider {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp)
    }

    /// Run `op` with the 429 backoff schedule, honoring cancellation during
    /// the sleeps.
    pub(super) async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < RETRY_BACKOFF.len() => {
                    let wait = RETRY_BACKOFF[attempt];
                    warn!(model = %self.model, ?wait, "rate limited, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<Response> {
        let body = self.request_body(messages, tools, false);
        debug!(model = %self.model, messages = messages.len(), "chat completion");

        let resp = self
            .with_retry(cancel, || self.post_completions(cancel, &body))
            .await?;

        let data: ChatResponse = resp.json().await?;
        let choice = data
            .choices
            .into_iter()
            .next()
            .ok_or(ForgeError::EmptyChoices)?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                args: parse_tool_args(&tc.function.arguments),
            })
            .collect();

        Ok(Response {
            message: Message {
                role: Role::Assistant,
                content: choice.message.content.unwrap_or_default(),
                tool_calls,
                tool_call_id: String::new(),
            },
        })
    }

    async fn complete_streaming(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tools: &[ToolDef],
        on_delta: Option<&DeltaSink>,
    ) -> Result<Response> {
        self.stream_chat(cancel, messages, tools, on_delta).await
    }

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        // The configured base URL is the OpenAI-compat surface, e.g.
        // "http://host:11434/v1"; the native Ollama API lives one level up.
        let base = self.base_url.strip_suffix("/v1").unwrap_or(&self.base_url);
        let url = format!("{base}/api/tags");

        let request = shared_client().get(&url).send();
        let resp = tokio::select! {
            resp = request => resp?,
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
        };

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ForgeError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        #[derive(Deserialize)]
        struct Tags {
            #[serde(default)]
            models: Vec<TagModel>,
        }
        #[derive(Deserialize)]
        struct TagModel {
            name: String,
            #[serde(default)]
            size: i64,
            #[serde(default)]
            modified_at: String,
        }

        let tags: Tags = resp.json().await?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size: m.size,
                modified_at: m.modified_at,
            })
            .collect())
    }
}

/// Parse provider tool-call arguments, stashing malformed JSON under `_raw`
/// so logs can surface what the model actually produced.
pub(super) fn parse_tool_args(raw: &str) -> ToolArgs {
    match serde_json::from_str::<ToolArgs>(raw) {
        Ok(args) => args,
        Err(_) => {
            let mut args = ToolArgs::new();
            args.insert("_raw".into(), Value::String(raw.to_string()));
            args
        }
    }
}

fn message_to_wire(m: &Message) -> Value {
    match m.role {
        Role::Assistant if !m.tool_calls.is_empty() => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": Value::Object(tc.args.clone()).to_string(),
                        }
                    })
                })
                .collect();
            let content = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id,
            "content": m.content,
        }),
        _ => json!({"role": m.role, "content": m.content}),
    }
}

// Provider wire types (internal).

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}
