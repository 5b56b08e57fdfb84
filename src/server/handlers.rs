//! REST handlers for the `/api` surface.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use crate::error::ForgeError;
use crate::storage::{Session, SessionListOptions, SessionStatus};
use crate::util::generate_title;

use super::AppState;

/// Maps domain errors onto HTTP responses with a JSON `{"error": ...}` body.
pub(super) struct ApiError(ForgeError);

impl From<ForgeError> for ApiError {
    fn from(e: ForgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ForgeError::NotFound(_) => StatusCode::NOT_FOUND,
            ForgeError::AmbiguousPrefix { .. } | ForgeError::Configuration(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Deserialize, Default)]
pub(super) struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

pub(super) async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Session>>> {
    let status = match query.status.as_deref() {
        Some(s) if !s.is_empty() => Some(s.parse::<SessionStatus>()?),
        _ => None,
    };
    let opts = SessionListOptions {
        status,
        limit: query.limit.unwrap_or(0),
        offset: query.offset.unwrap_or(0),
    };
    Ok(Json(state.store.list_sessions(&opts)?))
}

#[derive(Deserialize, Default)]
pub(super) struct CreateSessionRequest {
    #[serde(default)]
    provider: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    profile: String,
    #[serde(default)]
    title: String,
}

pub(super) async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let provider_name = if req.provider.is_empty() {
        state.cfg.default_provider.clone()
    } else {
        req.provider
    };
    let provider = state.cfg.provider(&provider_name)?;

    let model = if req.model.is_empty() {
        provider.models.get("default").cloned().unwrap_or_default()
    } else {
        req.model
    };

    let mut sess = Session::new(Uuid::new_v4().to_string());
    sess.title = req.title;
    sess.provider = provider_name;
    sess.model = model;
    sess.profile = req.profile;

    state.store.create_session(&mut sess)?;
    Ok((StatusCode::CREATED, Json(sess)))
}

pub(super) async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.store.get_session(&id)?))
}

pub(super) async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    // Drop the in-memory agent first so an in-flight turn is cancelled.
    state.sessions.remove(&id).await;
    state.store.delete_session(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<crate::types::Message>>> {
    Ok(Json(state.store.load_messages(&id)?))
}

#[derive(Deserialize)]
pub(super) struct SendMessageRequest {
    #[serde(default)]
    content: String,
}

/// One blocking (non-streaming) turn over REST.
pub(super) async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.content.is_empty() {
        return Err(ForgeError::Configuration("content is required".into()).into());
    }

    let mut sess = state.store.get_session(&id)?;
    let active = state
        .sessions
        .get_or_create(&sess, &state.cfg, state.store.as_ref(), state.registry.clone())
        .await?;

    // One message at a time per session.
    let mut agent = active.agent.lock().await;

    if sess.title.is_empty() {
        sess.title = generate_title(&req.content);
        if let Err(e) = state.store.update_session(&mut sess) {
            error!(session = %sess.id, error = %e, "failed to update session title");
        }
    }

    let cancel = CancellationToken::new();
    active.set_cancel(cancel.clone());
    let result = agent.run(&cancel, &req.content).await;
    active.clear_cancel();

    // The snapshot happens regardless of how the turn ended.
    if let Err(e) = state.store.save_messages(&sess.id, agent.history()) {
        error!(session = %sess.id, error = %e, "failed to save messages");
    }

    let content = result?;
    Ok(Json(json!({"content": content})))
}

pub(super) async fn list_providers(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<serde_json::Value>> {
    let providers = state
        .cfg
        .providers
        .iter()
        .map(|(name, p)| {
            json!({
                "name": name,
                "models": p.models,
                "is_ollama": p.is_ollama(),
            })
        })
        .collect();
    Json(providers)
}

pub(super) async fn list_models(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
) -> ApiResult<Json<Vec<crate::types::ModelInfo>>> {
    let provider = state
        .cfg
        .provider(&provider_name)
        .map_err(|_| ApiError(ForgeError::NotFound(provider_name.clone())))?;

    // Ollama can be asked live; other providers report what the config says.
    if provider.is_ollama() {
        use crate::llm::{LlmClient, OpenAiCompatClient};
        let client = OpenAiCompatClient::new(&provider.base_url, &provider.api_key, "");
        let models = client.list_models(&CancellationToken::new()).await?;
        return Ok(Json(models));
    }

    let models = provider
        .models
        .iter()
        .map(|(key, name)| crate::types::ModelInfo {
            name: name.clone(),
            size: 0,
            modified_at: key.clone(),
        })
        .collect();
    Ok(Json(models))
}
