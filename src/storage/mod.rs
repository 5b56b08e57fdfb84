//! Session persistence.

mod export;
mod sqlite;

pub use export::{export_json, export_markdown};
pub use sqlite::SqliteStore;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};
use crate::types::Message;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(ForgeError::Configuration(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Metadata for a saved conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub status: SessionStatus,
    pub provider: String,
    pub model: String,
    pub profile: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh active session; the store stamps timestamps on insert.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            status: SessionStatus::Active,
            provider: String::new(),
            model: String::new(),
            profile: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filtering and pagination for [`Store::list_sessions`].
#[derive(Debug, Clone, Default)]
pub struct SessionListOptions {
    pub status: Option<SessionStatus>,
    pub limit: i64,
    pub offset: i64,
}

/// Persistence for sessions and their message snapshots.
///
/// Message histories are stored whole and overwritten on every save; these
/// are snapshots, not appends.
pub trait Store: Send + Sync {
    /// Insert a new session. The id must be set; timestamps are stamped here.
    fn create_session(&self, session: &mut Session) -> Result<()>;

    /// Fetch by exact id, falling back to unique-prefix match.
    fn get_session(&self, id: &str) -> Result<Session>;

    /// Sessions ordered by `updated_at` descending.
    fn list_sessions(&self, opts: &SessionListOptions) -> Result<Vec<Session>>;

    /// Update title, status, and `updated_at`.
    fn update_session(&self, session: &mut Session) -> Result<()>;

    /// Remove a session (by id or prefix) and its messages.
    fn delete_session(&self, id: &str) -> Result<()>;

    /// Overwrite the full message history for a session.
    fn save_messages(&self, session_id: &str, messages: &[Message]) -> Result<()>;

    /// Load the message history; empty if none was ever saved.
    fn load_messages(&self, session_id: &str) -> Result<Vec<Message>>;
}
