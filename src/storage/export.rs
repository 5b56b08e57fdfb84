//! Transcript export formatting.

use serde_json::json;

use crate::error::Result;
use crate::types::{Message, Role};

use super::Session;

/// Render a session and its messages as Markdown.
pub fn export_markdown(session: &Session, messages: &[Message]) -> String {
    let mut out = String::new();
    let title = if session.title.is_empty() {
        "(untitled)"
    } else {
        &session.title
    };
    out.push_str(&format!("# {title}\n\n"));
    out.push_str(&format!(
        "- Session: `{}`\n- Provider: {} | Model: {}\n- Created: {}\n\n",
        session.id,
        session.provider,
        session.model,
        session.created_at.to_rfc3339(),
    ));

    for m in messages {
        match m.role {
            Role::System => continue,
            Role::User => out.push_str(&format!("## You\n\n{}\n\n", m.content)),
            Role::Assistant => {
                if !m.content.is_empty() {
                    out.push_str(&format!("## Forge\n\n{}\n\n", m.content));
                }
                for tc in &m.tool_calls {
                    let args = serde_json::to_string(&tc.args).unwrap_or_default();
                    out.push_str(&format!("> Tool call: `{}({args})`\n\n", tc.name));
                }
            }
            Role::Tool => {
                out.push_str(&format!("```\n{}\n```\n\n", m.content));
            }
        }
    }
    out
}

/// Render a session and its messages as pretty-printed JSON.
pub fn export_json(session: &Session, messages: &[Message]) -> Result<String> {
    let value = json!({
        "session": session,
        "messages": messages,
    });
    Ok(serde_json::to_string_pretty(&value)?)
}
