//! Token estimation and history compaction helpers.

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::llm::LlmClient;
use crate::types::{Message, Role};
use crate::util::truncate_with_marker;

const MAX_SUMMARY_CHARS: usize = 4000;

/// Approximate token count for a message: chars/4, rounded up, plus the cost
/// of any tool calls. Minimum 1 per message for role overhead.
pub(super) fn estimate_tokens(m: &Message) -> usize {
    let mut tokens = m.content.len().div_ceil(4);
    for tc in &m.tool_calls {
        tokens += tc.name.len().div_ceil(4);
        if let Ok(args) = serde_json::to_string(&tc.args) {
            tokens += args.len().div_ceil(4);
        }
    }
    tokens.max(1)
}

pub(super) fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_tokens).sum()
}

/// Find a clean boundary splitting history into old and recent sections.
///
/// Works backward from the end until recent messages would exceed the budget,
/// then clamps to the nearest `user` message so a tool-call group is never
/// split. Returns the index where the recent section begins; index 0 (the
/// system prompt) is never included. `messages.len()` means nothing to
/// compact.
pub(super) fn find_split_point(messages: &[Message], recent_budget: usize) -> usize {
    if messages.len() <= 2 {
        return messages.len();
    }

    let mut tokens = 0;
    let mut split_idx = messages.len();
    let mut budget_exceeded = false;
    for i in (1..messages.len()).rev() {
        let msg_tokens = estimate_tokens(&messages[i]);
        if tokens + msg_tokens > recent_budget {
            split_idx = i + 1;
            budget_exceeded = true;
            break;
        }
        tokens += msg_tokens;
    }

    if !budget_exceeded {
        return messages.len();
    }

    // Keep at least the last message.
    if split_idx >= messages.len() {
        split_idx = messages.len() - 1;
    }

    while split_idx > 1 {
        if messages[split_idx].role == Role::User {
            break;
        }
        split_idx -= 1;
    }

    // Must leave the system prompt plus at least one message to summarize.
    if split_idx <= 1 || messages[split_idx].role != Role::User {
        return messages.len();
    }

    split_idx
}

/// Ask the LLM for a concise summary of the given messages.
pub(super) async fn summarize_messages(
    client: &dyn LlmClient,
    cancel: &CancellationToken,
    messages: &[Message],
) -> Result<String> {
    let mut content = String::new();
    for m in messages {
        let prefix = if m.tool_call_id.is_empty() {
            m.role.to_string()
        } else {
            format!("tool_result({})", m.tool_call_id)
        };
        let mut text = m.content.clone();
        for tc in &m.tool_calls {
            let args = serde_json::to_string(&tc.args).unwrap_or_default();
            text.push_str(&format!("\n[tool_call: {}({})]", tc.name, args));
        }
        content.push_str(&format!("[{prefix}]: {text}\n"));
    }

    let prompt = vec![
        Message::system(
            "You are a summarization assistant. Produce a concise summary of the following \
             conversation excerpt. Preserve key facts, decisions, tool results, and context the \
             user or assistant may need later. Be concise but complete. Output only the summary, \
             no preamble.",
        ),
        Message::user(format!("Summarize this conversation:\n\n{content}")),
    ];

    let resp = client.complete(cancel, &prompt, &[]).await?;
    let mut summary = resp.message.content;
    truncate_with_marker(&mut summary, MAX_SUMMARY_CHARS, "\n... (summary truncated)");
    Ok(summary)
}
