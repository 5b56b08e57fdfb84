//! Routes tool calls to the owning MCP server connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ForgeError, Result};
use crate::types::{ToolArgs, ToolDef};

use super::connection::McpConnection;

/// Configuration for one MCP tool server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub binary: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub enabled: bool,
}

/// Holds the live tool-server connections and an index of tool ownership.
///
/// Read-only after initialization except for the per-connection mutexes,
/// which serialize each server's half-duplex stdio.
#[derive(Default)]
pub struct Registry {
    connections: HashMap<String, Mutex<McpConnection>>,
    tool_index: HashMap<String, String>,
    tool_defs: Vec<ToolDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch an MCP server and add its tools to the index. A disabled server
    /// is skipped without error; a launch failure propagates.
    pub async fn register(&mut self, name: &str, cfg: &ToolServerConfig) -> Result<()> {
        if !cfg.enabled {
            return Ok(());
        }

        let conn = McpConnection::launch(name, &cfg.binary, &cfg.env).await?;

        let mut count = 0;
        for tool in conn.tool_names() {
            if let Some(prior) = self.tool_index.insert(tool.to_string(), name.to_string()) {
                warn!(tool, prior_server = %prior, server = name, "tool name collision, last registration wins");
            }
            count += 1;
        }
        self.tool_defs.extend(conn.tool_defs());
        self.connections.insert(name.to_string(), Mutex::new(conn));

        info!(server = name, tools = count, "tool server registered");
        Ok(())
    }

    /// Definitions of every registered tool, order unspecified.
    pub fn all_tools(&self) -> Vec<ToolDef> {
        self.tool_defs.clone()
    }

    pub fn has_tools(&self) -> bool {
        !self.tool_index.is_empty()
    }

    /// Route a tool call to the owning server.
    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: &ToolArgs,
    ) -> Result<String> {
        let server = self
            .tool_index
            .get(name)
            .ok_or_else(|| ForgeError::UnknownTool(name.to_string()))?;
        let conn = self
            .connections
            .get(server)
            .ok_or_else(|| ForgeError::UnknownTool(name.to_string()))?;
        conn.lock().await.call(cancel, name, args).await
    }

    /// Shut down every connection. Idempotent.
    pub async fn close(&self) {
        for conn in self.connections.values() {
            conn.lock().await.close().await;
        }
    }
}
