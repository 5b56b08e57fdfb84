//! HTTP/WebSocket surface backing the web UI.

mod handlers;
mod session_manager;
mod ws;

pub use session_manager::{ActiveSession, SessionManager};

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::storage::Store;
use crate::tools::Registry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state injected into every handler.
pub struct AppState {
    pub cfg: Config,
    pub store: Arc<dyn Store>,
    pub registry: Option<Arc<Registry>>,
    pub sessions: SessionManager,
}

fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/:id",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route(
            "/sessions/:id/messages",
            get(handlers::get_messages).post(handlers::send_message),
        )
        .route("/sessions/:id/ws", get(ws::websocket))
        .route("/providers", get(handlers::list_providers))
        .route("/models/:provider", get(handlers::list_models));

    Router::new().nest("/api", api).with_state(state)
}

/// Run the server until Ctrl-C. Shutdown cancels every active session and
/// gives in-flight connections a bounded window to drain.
pub async fn serve(
    cfg: Config,
    store: Arc<dyn Store>,
    registry: Option<Arc<Registry>>,
    port: u16,
) -> Result<()> {
    let state = Arc::new(AppState {
        cfg,
        store,
        registry,
        sessions: SessionManager::new(),
    });
    let app = router(state.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "forge server listening");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        });
    }

    let graceful = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await });

    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown.cancelled().await;
            info!("shutting down");
            state.sessions.close_all().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("graceful shutdown timed out, exiting");
        }
    }

    Ok(())
}
