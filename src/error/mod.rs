//! Error types for Forge.

use thiserror::Error;

/// Primary error type for all Forge operations.
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("profile error: {0}")]
    Profile(String),

    #[error("provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    #[error("rate limited")]
    RateLimited,

    #[error("no choices returned")]
    EmptyChoices,

    #[error("stream error: {0}")]
    Stream(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool server {server}: {message}")]
    ToolExecution { server: String, message: String },

    #[error("agent reached max iterations ({0}) without a final response")]
    IterationLimitExceeded(usize),

    #[error("cancelled")]
    Cancelled,

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("ambiguous session prefix {prefix:?} matches {matches} sessions")]
    AmbiguousPrefix { prefix: String, matches: usize },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ForgeError {
    /// Whether the operation may succeed if simply retried after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ForgeError>;
