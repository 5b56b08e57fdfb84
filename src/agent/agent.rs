//! The conversation agent and its ReAct loop.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ForgeError, Result};
use crate::llm::LlmClient;
use crate::tools::Registry;
use crate::types::{Message, Role, ToolArgs, ToolCall, ToolDef};
use crate::util::truncate_with_marker;

use super::context::{estimate_history_tokens, find_split_point, summarize_messages};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Forge, a helpful AI assistant with access to tools.\n\
When you need information from the system (files, commands, etc.), use the available tools.\n\
Always explain what you're doing and why. After using a tool, interpret the results for the user.";

const DEFAULT_MAX_TOKENS: usize = 6000;
const MAX_TOOL_OUTPUT: usize = 4000;
const SUMMARY_MARKER: &str = "[Prior conversation summary]\n";

/// Callback receiving streamed text deltas.
pub type TextDeltaFn = dyn Fn(&str) + Send + Sync;
/// Callback fired before a tool executes: `(name, args)`.
pub type ToolCallFn = dyn Fn(&str, &ToolArgs) + Send + Sync;
/// Callback fired after a tool executes: `(name, result)`.
pub type ToolResultFn = dyn Fn(&str, &str) + Send + Sync;

/// Holds one conversation and executes the ReAct loop against it.
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    utility_llm: Option<Arc<dyn LlmClient>>,
    registry: Option<Arc<Registry>>,
    history: Vec<Message>,
    tools: Vec<ToolDef>,
    max_iter: usize,
    max_tokens: usize,
    on_text_delta: Option<Arc<TextDeltaFn>>,
    on_tool_call: Option<Arc<ToolCallFn>>,
    on_tool_result: Option<Arc<ToolResultFn>>,
}

impl Agent {
    /// Create an agent. Adopts the registry's tool catalog when it has one,
    /// otherwise falls back to the builtin `shell_exec`.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: Option<Arc<Registry>>,
        max_iterations: usize,
    ) -> Self {
        let tools = match &registry {
            Some(r) if r.has_tools() => r.all_tools(),
            _ => builtin_tools(),
        };
        Self {
            llm,
            utility_llm: None,
            registry,
            history: vec![Message::system(DEFAULT_SYSTEM_PROMPT)],
            tools,
            max_iter: max_iterations,
            max_tokens: DEFAULT_MAX_TOKENS,
            on_text_delta: None,
            on_tool_call: None,
            on_tool_result: None,
        }
    }

    /// Override the default system prompt. An empty prompt is ignored.
    pub fn set_system_prompt(&mut self, prompt: &str) {
        if !prompt.is_empty() {
            self.history[0] = Message::system(prompt);
        }
    }

    /// Restrict available tools to the given names. An empty allowlist is a
    /// no-op.
    pub fn filter_tools(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.tools.retain(|t| names.contains(&t.name));
    }

    /// Set the context-window token budget for history compaction.
    pub fn set_max_tokens(&mut self, max_tokens: usize) {
        if max_tokens > 0 {
            self.max_tokens = max_tokens;
        }
    }

    /// Set a lightweight client for housekeeping tasks like summarization.
    pub fn set_utility_llm(&mut self, client: Arc<dyn LlmClient>) {
        self.utility_llm = Some(client);
    }

    /// Swap the main conversation client (mid-session model switching).
    pub fn set_client(&mut self, client: Arc<dyn LlmClient>) {
        self.llm = client;
    }

    /// Replace the conversation history (used when resuming a session).
    /// An empty list is ignored so the system prompt survives.
    pub fn set_history(&mut self, messages: Vec<Message>) {
        if !messages.is_empty() {
            self.history = messages;
        }
    }

    /// Clear conversation history, keeping the system prompt.
    pub fn reset(&mut self) {
        self.history.truncate(1);
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Conversation as formatted JSON, for display.
    pub fn history_json(&self) -> String {
        serde_json::to_string_pretty(&self.history).unwrap_or_default()
    }

    pub fn set_on_text_delta<F: Fn(&str) + Send + Sync + 'static>(&mut self, f: F) {
        self.on_text_delta = Some(Arc::new(f));
    }

    pub fn set_on_tool_call<F: Fn(&str, &ToolArgs) + Send + Sync + 'static>(&mut self, f: F) {
        self.on_tool_call = Some(Arc::new(f));
    }

    pub fn set_on_tool_result<F: Fn(&str, &str) + Send + Sync + 'static>(&mut self, f: F) {
        self.on_tool_result = Some(Arc::new(f));
    }

    /// Send a user message and run the blocking ReAct loop.
    /// Returns the final assistant text response.
    pub async fn run(&mut self, cancel: &CancellationToken, user_message: &str) -> Result<String> {
        self.compact_history(cancel).await;
        self.history.push(Message::user(user_message));

        for iteration in 0..self.max_iter {
            debug!(iteration, history = self.history.len(), "llm call");
            let resp = self.llm.complete(cancel, &self.history, &self.tools).await?;
            let message = resp.message;
            self.history.push(message.clone());

            if message.tool_calls.is_empty() {
                return Ok(message.content);
            }
            self.execute_tool_calls(cancel, &message.tool_calls).await;
        }

        Err(ForgeError::IterationLimitExceeded(self.max_iter))
    }

    /// Like [`run`](Self::run), but streams text via the text-delta callback.
    pub async fn run_streaming(
        &mut self,
        cancel: &CancellationToken,
        user_message: &str,
    ) -> Result<String> {
        self.compact_history(cancel).await;
        self.history.push(Message::user(user_message));

        for iteration in 0..self.max_iter {
            debug!(iteration, history = self.history.len(), "llm call (streaming)");

            let buffered = Arc::new(Mutex::new(String::new()));
            let buffered_for_sink = buffered.clone();
            let user_sink = self.on_text_delta.clone();
            let sink = move |delta: &str| {
                buffered_for_sink.lock().unwrap().push_str(delta);
                if let Some(cb) = &user_sink {
                    cb(delta);
                }
            };
            let result = self
                .llm
                .complete_streaming(
                    cancel,
                    &self.history,
                    &self.tools,
                    Some(&sink),
                )
                .await;

            let message = match result {
                Ok(resp) => resp.message,
                Err(ForgeError::Cancelled) => {
                    // Keep whatever streamed before the interrupt so the
                    // snapshot stays coherent and the session can resume.
                    let partial = std::mem::take(&mut *buffered.lock().unwrap());
                    if !partial.is_empty() {
                        self.history.push(Message::assistant(partial));
                    }
                    return Err(ForgeError::Cancelled);
                }
                Err(e) => return Err(e),
            };

            self.history.push(message.clone());
            if message.tool_calls.is_empty() {
                return Ok(message.content);
            }
            self.execute_tool_calls(cancel, &message.tool_calls).await;
        }

        Err(ForgeError::IterationLimitExceeded(self.max_iter))
    }

    async fn execute_tool_calls(&mut self, cancel: &CancellationToken, tool_calls: &[ToolCall]) {
        for tc in tool_calls {
            if let Some(cb) = &self.on_tool_call {
                cb(&tc.name, &tc.args);
            }
            let result = self.execute_tool(cancel, tc).await;
            if let Some(cb) = &self.on_tool_result {
                cb(&tc.name, &result);
            }
            self.history.push(Message::tool_result(result, tc.id.clone()));
        }
    }

    /// Dispatch a tool call to the registry or the builtin handler. Failures
    /// become observations so the LLM can react.
    async fn execute_tool(&self, cancel: &CancellationToken, tc: &ToolCall) -> String {
        if let Some(registry) = &self.registry {
            if registry.has_tools() {
                return match registry.call_tool(cancel, &tc.name, &tc.args).await {
                    Ok(result) => result,
                    Err(e) => format!("error: {e}"),
                };
            }
        }

        match tc.name.as_str() {
            "shell_exec" => shell_exec(cancel, &tc.args).await,
            _ => format!("error: unknown tool {:?}", tc.name),
        }
    }

    /// Summarize older messages when history exceeds the token budget.
    /// Runs only before a new user message, never mid-turn.
    async fn compact_history(&mut self, cancel: &CancellationToken) {
        let total = estimate_history_tokens(&self.history);
        if total <= self.max_tokens {
            return;
        }

        // Keep recent messages within 60% of the budget.
        let recent_budget = self.max_tokens * 60 / 100;
        let split_idx = find_split_point(&self.history, recent_budget);
        if split_idx >= self.history.len() || split_idx <= 1 {
            return;
        }

        let summarizer: &dyn LlmClient = match &self.utility_llm {
            Some(utility) => utility.as_ref(),
            None => self.llm.as_ref(),
        };

        match summarize_messages(summarizer, cancel, &self.history[1..split_idx]).await {
            Ok(summary) => {
                let summary_msg = Message::system(format!("{SUMMARY_MARKER}{summary}"));
                let mut new_history = Vec::with_capacity(2 + self.history.len() - split_idx);
                new_history.push(self.history[0].clone());
                new_history.push(summary_msg);
                new_history.extend_from_slice(&self.history[split_idx..]);
                self.history = new_history;
            }
            Err(e) => {
                warn!(error = %e, "summarization failed, trimming history instead");
                self.trim_history(10);
            }
        }
    }

    /// Keep the system prompt plus roughly the last `keep_last` messages,
    /// backing up to a user boundary so a tool-call group is never entered
    /// mid-way.
    fn trim_history(&mut self, keep_last: usize) {
        if self.history.len() <= keep_last + 1 {
            return;
        }
        let mut start = self.history.len() - keep_last;
        while start > 1 && self.history[start].role != Role::User {
            start -= 1;
        }
        if start <= 1 {
            return;
        }
        let mut trimmed = Vec::with_capacity(1 + self.history.len() - start);
        trimmed.push(self.history[0].clone());
        trimmed.extend_from_slice(&self.history[start..]);
        self.history = trimmed;
    }
}

/// Run a shell command and return combined stdout+stderr.
async fn shell_exec(cancel: &CancellationToken, args: &ToolArgs) -> String {
    let Some(command) = args.get("command").and_then(Value::as_str) else {
        return "error: 'command' argument must be a string".into();
    };

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command).kill_on_drop(true);
    if let Some(workdir) = args.get("workdir").and_then(Value::as_str) {
        if !workdir.is_empty() {
            cmd.current_dir(workdir);
        }
    }

    let output = tokio::select! {
        output = cmd.output() => output,
        _ = cancel.cancelled() => return "error: cancelled".into(),
    };

    let mut result = match output {
        Ok(out) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            if !out.status.success() {
                text.push_str(&format!("\nexit error: {}", out.status));
            }
            text
        }
        Err(e) => return format!("error: {e}"),
    };

    truncate_with_marker(&mut result, MAX_TOOL_OUTPUT, "\n... (output truncated)");
    result
}

/// Fallback tool definitions used when no MCP servers are registered.
fn builtin_tools() -> Vec<ToolDef> {
    vec![ToolDef {
        name: "shell_exec".into(),
        description: "Execute a shell command and return the combined stdout and stderr output. \
                      Use this to run system commands, check files, install packages, etc."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute",
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory for the command (optional)",
                },
            },
            "required": ["command"],
        }),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedClient;

    fn agent_with(history: Vec<Message>, client: ScriptedClient, max_tokens: usize) -> Agent {
        let mut agent = Agent::new(Arc::new(client), None, 5);
        agent.set_max_tokens(max_tokens);
        agent.set_history(history);
        agent
    }

    fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            args: args.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn compaction_inserts_summary_after_system_prompt() {
        let client = ScriptedClient::new(vec![Message::assistant(
            "User asked about files. Assistant listed them.",
        )]);
        let mut agent = agent_with(
            vec![
                Message::system("You are helpful."),
                Message::user("list files"),
                Message::assistant("file info ".repeat(50)),
                Message::user("tell me more"),
                Message::assistant("more info ".repeat(50)),
                Message::user("and more"),
                Message::assistant("even more ".repeat(50)),
            ],
            client,
            50,
        );

        let before = estimate_history_tokens(&agent.history);
        agent.compact_history(&CancellationToken::new()).await;

        assert!(agent.history.len() < 7, "history should shrink");
        assert!(
            estimate_history_tokens(&agent.history) <= before,
            "compaction must never grow the estimate"
        );
        assert_eq!(agent.history[0].role, Role::System);
        assert!(
            agent.history[1].content.starts_with(SUMMARY_MARKER),
            "second message should carry the summary marker, got: {}",
            agent.history[1].content
        );
    }

    #[tokio::test]
    async fn compaction_tail_starts_at_a_user_message() {
        let client = ScriptedClient::new(vec![Message::assistant("summary of earlier work")]);
        let mut agent = agent_with(
            vec![
                Message::system("sys"),
                Message::user("question one"),
                Message {
                    role: Role::Assistant,
                    content: "x".repeat(200),
                    tool_calls: vec![tool_call("tc1", "shell_exec", serde_json::json!({"command": "ls"}))],
                    tool_call_id: String::new(),
                },
                Message::tool_result("y".repeat(200), "tc1"),
                Message::assistant("z".repeat(200)),
                Message::user("question two"),
                Message::assistant("final answer"),
            ],
            client,
            50,
        );

        agent.compact_history(&CancellationToken::new()).await;

        assert_eq!(agent.history[0].role, Role::System);
        assert!(agent.history[1].content.starts_with(SUMMARY_MARKER));
        assert_eq!(
            agent.history[2].role,
            Role::User,
            "tail must begin at a user boundary, never a tool or assistant message"
        );
        assert_eq!(agent.history[2].content, "question two");
    }

    #[tokio::test]
    async fn compaction_under_budget_is_a_noop() {
        let client = ScriptedClient::new(Vec::new());
        let mut agent = agent_with(
            vec![
                Message::system("system"),
                Message::user("hi"),
                Message::assistant("hello"),
            ],
            client,
            10_000,
        );

        agent.compact_history(&CancellationToken::new()).await;
        assert_eq!(agent.history.len(), 3);
    }

    #[tokio::test]
    async fn summarization_failure_falls_back_to_trim() {
        // Script is empty, so the summarization call errors.
        let client = ScriptedClient::new(Vec::new());
        let mut history = vec![Message::system("system")];
        for i in 0..6 {
            history.push(Message::user(format!("q{i}")));
            history.push(Message::assistant("a".repeat(200)));
        }
        let original_len = history.len();
        let mut agent = agent_with(history, client, 10);

        agent.compact_history(&CancellationToken::new()).await;

        assert!(agent.history.len() < original_len, "fallback should trim");
        assert!(agent.history.len() <= 11, "system + at most 10 recent");
        assert_eq!(agent.history[0].role, Role::System);
        tool_adjacency_holds(&agent.history);
    }

    #[tokio::test]
    async fn fallback_trim_preserves_tool_adjacency() {
        let client = ScriptedClient::new(Vec::new());
        let mut history = vec![Message::system("system")];
        for i in 0..4 {
            history.push(Message::user(format!("q{i} {}", "pad ".repeat(30))));
            history.push(Message {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: vec![tool_call(
                    &format!("tc{i}"),
                    "shell_exec",
                    serde_json::json!({"command": "ls"}),
                )],
                tool_call_id: String::new(),
            });
            history.push(Message::tool_result("out ".repeat(30), format!("tc{i}")));
            history.push(Message::assistant("done ".repeat(30)));
        }
        let mut agent = agent_with(history, client, 10);

        agent.compact_history(&CancellationToken::new()).await;

        assert_eq!(agent.history[0].role, Role::System);
        assert_eq!(
            agent.history[1].role,
            Role::User,
            "trimmed tail must start at a user message"
        );
        tool_adjacency_holds(&agent.history);
    }

    #[tokio::test]
    async fn run_returns_text_and_appends_messages() {
        let client = ScriptedClient::new(vec![Message::assistant("pong")]);
        let mut agent = Agent::new(Arc::new(client), None, 5);
        agent.set_system_prompt("You are helpful.");

        let out = agent.run(&CancellationToken::new(), "ping").await.unwrap();

        assert_eq!(out, "pong");
        assert_eq!(agent.history().len(), 3);
        assert_eq!(agent.history()[0].role, Role::System);
        assert_eq!(agent.history()[1].content, "ping");
        assert_eq!(agent.history()[2].content, "pong");
    }

    #[tokio::test]
    async fn iteration_limit_is_an_error() {
        // Every response requests another tool call, so the loop never
        // terminates on its own.
        let responses: Vec<Message> = (0..3)
            .map(|i| Message {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: vec![tool_call(
                    &format!("tc{i}"),
                    "missing_tool",
                    serde_json::json!({}),
                )],
                tool_call_id: String::new(),
            })
            .collect();
        let client = ScriptedClient::new(responses);
        let mut agent = Agent::new(Arc::new(client), None, 3);

        let err = agent
            .run(&CancellationToken::new(), "loop forever")
            .await
            .expect_err("should hit the iteration limit");
        assert!(matches!(err, ForgeError::IterationLimitExceeded(3)));
    }

    #[tokio::test]
    async fn unknown_builtin_tool_becomes_observation() {
        let client = ScriptedClient::new(vec![
            Message {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: vec![tool_call("tc1", "no_such_tool", serde_json::json!({}))],
                tool_call_id: String::new(),
            },
            Message::assistant("recovered"),
        ]);
        let mut agent = Agent::new(Arc::new(client), None, 5);

        let out = agent.run(&CancellationToken::new(), "go").await.unwrap();
        assert_eq!(out, "recovered");

        let tool_msg = &agent.history()[3];
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id, "tc1");
        assert!(tool_msg.content.starts_with("error: unknown tool"));
    }

    #[tokio::test]
    async fn filter_tools_empty_is_noop() {
        let client = ScriptedClient::new(Vec::new());
        let mut agent = Agent::new(Arc::new(client), None, 5);
        let before = agent.tools.len();
        agent.filter_tools(&[]);
        assert_eq!(agent.tools.len(), before);

        agent.filter_tools(&["shell_exec".to_string()]);
        assert_eq!(agent.tools.len(), 1);
        assert_eq!(agent.tools[0].name, "shell_exec");

        agent.filter_tools(&["nope".to_string()]);
        assert!(agent.tools.is_empty());
    }

    #[tokio::test]
    async fn reset_keeps_system_prompt() {
        let client = ScriptedClient::new(vec![Message::assistant("hi")]);
        let mut agent = Agent::new(Arc::new(client), None, 5);
        agent.run(&CancellationToken::new(), "hello").await.unwrap();
        assert!(agent.history().len() > 1);

        agent.reset();
        assert_eq!(agent.history().len(), 1);
        assert_eq!(agent.history()[0].role, Role::System);
    }

    #[tokio::test]
    async fn set_history_ignores_empty() {
        let client = ScriptedClient::new(Vec::new());
        let mut agent = Agent::new(Arc::new(client), None, 5);
        agent.set_history(Vec::new());
        assert_eq!(agent.history().len(), 1);
        assert_eq!(agent.history()[0].role, Role::System);
    }

    fn tool_adjacency_holds(history: &[Message]) {
        let mut i = 0;
        while i < history.len() {
            let calls = history[i].tool_calls.clone();
            if !calls.is_empty() {
                for (offset, tc) in calls.iter().enumerate() {
                    let follower = history
                        .get(i + 1 + offset)
                        .unwrap_or_else(|| panic!("missing tool result for {}", tc.id));
                    assert_eq!(follower.role, Role::Tool, "tool result must follow the call");
                    assert_eq!(follower.tool_call_id, tc.id);
                }
                i += 1 + calls.len();
            } else {
                i += 1;
            }
        }
    }
}
