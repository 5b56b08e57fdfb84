//! WebSocket chat endpoint.
//!
//! Accepts `{type: "message", content}` frames and emits
//! `{type, content?, name?, args?}` with
//! `type ∈ {text_delta, tool_call, tool_result, done, error}`.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ForgeError;
use crate::storage::Session;
use crate::types::ToolArgs;
use crate::util::generate_title;

use super::session_manager::ActiveSession;
use super::AppState;

#[derive(Deserialize)]
struct WsIncoming {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct WsOutgoing {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<ToolArgs>,
}

impl WsOutgoing {
    fn text_delta(content: &str) -> Self {
        Self {
            kind: "text_delta",
            content: Some(content.to_string()),
            name: None,
            args: None,
        }
    }

    fn tool_call(name: &str, args: &ToolArgs) -> Self {
        Self {
            kind: "tool_call",
            content: None,
            name: Some(name.to_string()),
            args: Some(args.clone()),
        }
    }

    fn tool_result(name: &str, content: &str) -> Self {
        Self {
            kind: "tool_result",
            content: Some(content.to_string()),
            name: Some(name.to_string()),
            args: None,
        }
    }

    fn done(content: String) -> Self {
        Self {
            kind: "done",
            content: Some(content),
            name: None,
            args: None,
        }
    }

    fn error(content: impl Into<String>) -> Self {
        Self {
            kind: "error",
            content: Some(content.into()),
            name: None,
            args: None,
        }
    }
}

type FrameSender = mpsc::UnboundedSender<WsOutgoing>;

pub(super) async fn websocket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, id, socket))
}

async fn handle_socket(state: Arc<AppState>, id: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    // Every outbound frame funnels through one writer task; agent callbacks
    // and the read loop never touch the socket directly.
    let (tx, mut rx) = mpsc::unbounded_channel::<WsOutgoing>();
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let Ok(frame) = serde_json::to_string(&out) else {
                continue;
            };
            if sender.send(WsFrame::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    if let Err(e) = drive_session(&state, &id, &tx, &mut receiver).await {
        let _ = tx.send(WsOutgoing::error(e.to_string()));
    }

    drop(tx);
    let _ = writer.await;
}

async fn drive_session(
    state: &Arc<AppState>,
    id: &str,
    tx: &FrameSender,
    receiver: &mut SplitStream<WebSocket>,
) -> Result<(), ForgeError> {
    let mut sess = state.store.get_session(id)?;
    let active = state
        .sessions
        .get_or_create(&sess, &state.cfg, state.store.as_ref(), state.registry.clone())
        .await?;

    let mut pending: VecDeque<String> = VecDeque::new();

    loop {
        let content = match pending.pop_front() {
            Some(content) => content,
            None => match next_user_message(receiver, tx).await {
                Some(content) => content,
                None => break,
            },
        };

        // Run the turn while still watching the socket: a disconnect cancels
        // the in-flight work, and messages arriving mid-turn are queued.
        let turn = process_message(state, &active, &mut sess, &content, tx);
        tokio::pin!(turn);

        let mut client_gone = false;
        loop {
            tokio::select! {
                _ = &mut turn => break,
                frame = receiver.next(), if !client_gone => {
                    match frame {
                        None | Some(Err(_)) | Some(Ok(WsFrame::Close(_))) => {
                            debug!(session = id, "client went away mid-turn, cancelling");
                            active.cancel_turn();
                            client_gone = true;
                        }
                        Some(Ok(WsFrame::Text(text))) => {
                            if let Some(content) = parse_user_message(&text, tx) {
                                pending.push_back(content);
                            }
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        if client_gone {
            break;
        }
    }

    Ok(())
}

/// Read frames until a valid user message arrives; `None` means the client
/// is gone.
async fn next_user_message(
    receiver: &mut SplitStream<WebSocket>,
    tx: &FrameSender,
) -> Option<String> {
    loop {
        match receiver.next().await? {
            Ok(WsFrame::Text(text)) => {
                if let Some(content) = parse_user_message(&text, tx) {
                    return Some(content);
                }
            }
            Ok(WsFrame::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn parse_user_message(text: &str, tx: &FrameSender) -> Option<String> {
    match serde_json::from_str::<WsIncoming>(text) {
        Ok(incoming) if incoming.kind == "message" && !incoming.content.is_empty() => {
            Some(incoming.content)
        }
        _ => {
            let _ = tx.send(WsOutgoing::error("invalid message"));
            None
        }
    }
}

/// One streaming turn: title bookkeeping, callbacks, run, snapshot, outcome.
async fn process_message(
    state: &Arc<AppState>,
    active: &ActiveSession,
    sess: &mut Session,
    content: &str,
    tx: &FrameSender,
) {
    let mut agent = active.agent.lock().await;

    if sess.title.is_empty() {
        sess.title = generate_title(content);
        if let Err(e) = state.store.update_session(sess) {
            warn!(session = %sess.id, error = %e, "failed to update session title");
        }
    }

    let cancel = CancellationToken::new();
    active.set_cancel(cancel.clone());

    let delta_tx = tx.clone();
    agent.set_on_text_delta(move |delta| {
        let _ = delta_tx.send(WsOutgoing::text_delta(delta));
    });
    let call_tx = tx.clone();
    agent.set_on_tool_call(move |name, args| {
        let _ = call_tx.send(WsOutgoing::tool_call(name, args));
    });
    let result_tx = tx.clone();
    agent.set_on_tool_result(move |name, result| {
        let _ = result_tx.send(WsOutgoing::tool_result(name, result));
    });

    let result = agent.run_streaming(&cancel, content).await;

    // Snapshot whatever state the loop reached, success or not, so resume
    // sees a coherent prefix.
    if let Err(e) = state.store.save_messages(&sess.id, agent.history()) {
        error!(session = %sess.id, error = %e, "failed to save messages");
    }

    active.clear_cancel();

    match result {
        Ok(response) => {
            let _ = tx.send(WsOutgoing::done(response));
        }
        Err(ForgeError::Cancelled) => {
            let _ = tx.send(WsOutgoing::error("interrupted"));
        }
        Err(e) => {
            let _ = tx.send(WsOutgoing::error(e.to_string()));
        }
    }
}
