//! Maps session IDs to live in-memory agents.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, Profile};
use crate::config::Config;
use crate::error::Result;
use crate::llm::OpenAiCompatClient;
use crate::storage::{Session, Store};
use crate::tools::Registry;

/// A session with a live agent.
///
/// The agent mutex is held for a whole turn (send, stream, save), enforcing
/// one message at a time per session. The cancel slot carries the in-flight
/// turn's token so disconnects and shutdown can interrupt it without taking
/// the agent mutex.
pub struct ActiveSession {
    pub agent: Mutex<Agent>,
    cancel: StdMutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession").finish_non_exhaustive()
    }
}

impl ActiveSession {
    fn new(agent: Agent) -> Self {
        Self {
            agent: Mutex::new(agent),
            cancel: StdMutex::new(None),
        }
    }

    /// Install the cancel handle for an in-flight turn.
    pub fn set_cancel(&self, token: CancellationToken) {
        *self.cancel.lock().unwrap() = Some(token);
    }

    pub fn clear_cancel(&self) {
        *self.cancel.lock().unwrap() = None;
    }

    /// Cancel the in-flight turn, if any.
    pub fn cancel_turn(&self) {
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
    }
}

/// Tracks which sessions have an active agent in memory.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<ActiveSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<ActiveSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Return the existing active session or construct one: resolve provider
    /// and model, apply the profile, wire the utility client, and load prior
    /// messages from the store. Concurrent calls for the same id return the
    /// same instance.
    pub async fn get_or_create(
        &self,
        sess: &Session,
        cfg: &Config,
        store: &dyn Store,
        registry: Option<Arc<Registry>>,
    ) -> Result<Arc<ActiveSession>> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&sess.id) {
            return Ok(existing.clone());
        }

        let provider_name = if sess.provider.is_empty() {
            cfg.default_provider.clone()
        } else {
            sess.provider.clone()
        };
        let provider = cfg.provider(&provider_name)?;

        let model = if sess.model.is_empty() {
            provider.models.get("default").cloned().unwrap_or_default()
        } else {
            sess.model.clone()
        };

        let profile = if sess.profile.is_empty() {
            None
        } else {
            let path = Path::new(&cfg.agent.profiles_dir).join(format!("{}.yaml", sess.profile));
            Some(Profile::load(&path)?)
        };

        let mut max_iter = cfg.agent.max_iterations;
        if let Some(p) = &profile {
            if p.max_iterations > 0 {
                max_iter = p.max_iterations;
            }
        }

        let client = Arc::new(OpenAiCompatClient::new(
            &provider.base_url,
            &provider.api_key,
            &model,
        ));
        let mut agent = Agent::new(client, registry, max_iter);
        agent.set_max_tokens(cfg.agent.context_max_tokens);

        if let Some(utility_model) = provider.models.get("utility") {
            if !utility_model.is_empty() {
                agent.set_utility_llm(Arc::new(OpenAiCompatClient::new(
                    &provider.base_url,
                    &provider.api_key,
                    utility_model,
                )));
            }
        }

        if let Some(p) = &profile {
            agent.set_system_prompt(&p.system_prompt);
            agent.filter_tools(&p.tools);
        }

        let messages = store.load_messages(&sess.id)?;
        if !messages.is_empty() {
            agent.set_history(messages);
        }

        let active = Arc::new(ActiveSession::new(agent));
        sessions.insert(sess.id.clone(), active.clone());
        Ok(active)
    }

    /// Remove a session, cancelling any in-flight turn.
    pub async fn remove(&self, session_id: &str) {
        if let Some(active) = self.sessions.write().await.remove(session_id) {
            active.cancel_turn();
        }
    }

    /// Cancel and drop every active session.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, active) in sessions.drain() {
            active.cancel_turn();
        }
    }
}
