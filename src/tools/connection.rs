//! A single MCP tool-server subprocess speaking JSON-RPC over stdio.
//!
//! The protocol surface consumed here is `initialize`, `tools/list`, and
//! `tools/call`, plus the `isError` flag and textual `content` parts of call
//! results. Stdio is half-duplex from the parent's perspective; the owning
//! registry serializes requests per connection.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ForgeError, Result};
use crate::types::{ToolArgs, ToolDef};
use crate::util::expand_env;

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLOSE_WAIT: Duration = Duration::from_secs(2);

/// Tool schema as advertised by an MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputSchema {
    #[serde(default, rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: Option<Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl McpTool {
    /// The definition shape the LLM API expects. Only fields present on the
    /// source schema are included.
    fn to_def(&self) -> ToolDef {
        let mut params = serde_json::Map::new();
        params.insert(
            "type".into(),
            Value::String(self.input_schema.schema_type.clone()),
        );
        if let Some(properties) = &self.input_schema.properties {
            params.insert("properties".into(), properties.clone());
        }
        if !self.input_schema.required.is_empty() {
            params.insert("required".into(), json!(self.input_schema.required));
        }
        ToolDef {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: Value::Object(params),
        }
    }
}

/// One launched tool server: the subprocess, its stdio, and the discovered
/// tool catalog.
pub struct McpConnection {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    tools: Vec<McpTool>,
}

impl McpConnection {
    /// Spawn the server binary and complete the protocol handshake.
    ///
    /// The child inherits the current process environment; configured
    /// overrides are applied on top, with `${NAME}` values resolved from the
    /// ambient environment. A handshake failure tears the subprocess down
    /// before returning.
    pub async fn launch(name: &str, binary: &str, env: &HashMap<String, String>) -> Result<Self> {
        let mut cmd = Command::new(binary);
        for (key, value) in env {
            cmd.env(key, expand_env(value));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ForgeError::ToolExecution {
            server: name.to_string(),
            message: format!("starting {binary}: {e}"),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ForgeError::Stream("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForgeError::Stream("child stdout unavailable".into()))?;

        let mut conn = Self {
            name: name.to_string(),
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
            tools: Vec::new(),
        };

        if let Err(e) = conn.handshake().await {
            conn.close().await;
            return Err(e);
        }

        debug!(server = name, tools = conn.tools.len(), "tool server initialized");
        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn handshake(&mut self) -> Result<()> {
        self.request(
            &CancellationToken::new(),
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "forge", "version": env!("CARGO_PKG_VERSION")},
            }),
        )
        .await?;
        self.notify("notifications/initialized", json!({})).await?;

        let result = self
            .request(&CancellationToken::new(), "tools/list", json!({}))
            .await?;

        #[derive(Deserialize)]
        struct ToolList {
            #[serde(default)]
            tools: Vec<McpTool>,
        }
        let list: ToolList = serde_json::from_value(result)?;
        self.tools = list.tools;
        Ok(())
    }

    /// Tool definitions for the discovered catalog.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        self.tools.iter().map(McpTool::to_def).collect()
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }

    /// Invoke a tool and return its textual observation.
    ///
    /// A result flagged `isError` comes back as `Ok` text prefixed with
    /// `error: ` so the LLM can observe the failure and self-correct.
    pub async fn call(
        &mut self,
        cancel: &CancellationToken,
        name: &str,
        args: &ToolArgs,
    ) -> Result<String> {
        let result = self
            .request(cancel, "tools/call", json!({"name": name, "arguments": args}))
            .await?;

        #[derive(Deserialize, Default)]
        struct CallResult {
            #[serde(default)]
            content: Vec<ContentPart>,
            #[serde(default, rename = "isError")]
            is_error: bool,
        }
        #[derive(Deserialize)]
        struct ContentPart {
            #[serde(default, rename = "type")]
            kind: String,
            #[serde(default)]
            text: String,
        }

        let result: CallResult = serde_json::from_value(result)?;
        let text = result
            .content
            .iter()
            .filter(|part| part.kind == "text")
            .map(|part| part.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error {
            return Ok(format!("error: {text}"));
        }
        Ok(text)
    }

    /// Close stdin; the child exits on EOF. Idempotent.
    pub async fn close(&mut self) {
        if self.stdin.take().is_none() {
            return;
        }
        match tokio::time::timeout(CLOSE_WAIT, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(server = %self.name, "tool server did not exit on stdin close, killing");
                let _ = self.child.start_kill();
            }
        }
    }

    async fn request(
        &mut self,
        cancel: &CancellationToken,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        self.write_line(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;

        loop {
            let line = tokio::select! {
                line = self.stdout.next_line() => line,
                _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
            };
            let line =
                line.map_err(|e| self.rpc_error(method, format!("reading response: {e}")))?;
            let Some(line) = line else {
                return Err(self.rpc_error(method, "server closed its stdout".into()));
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply: RpcReply = match serde_json::from_str(&line) {
                Ok(reply) => reply,
                Err(_) => continue, // log noise on stdout
            };
            match reply.id {
                Some(reply_id) if reply_id == id => {
                    if let Some(err) = reply.error {
                        return Err(
                            self.rpc_error(method, format!("{} (code {})", err.message, err.code))
                        );
                    }
                    return Ok(reply.result.unwrap_or(Value::Null));
                }
                // Server notification, or a stale response left behind by a
                // cancelled call; keep reading until our id comes back.
                _ => continue,
            }
        }
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        self.write_line(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await
    }

    async fn write_line(&mut self, msg: &Value) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ForgeError::Stream(format!(
                "tool server {} is closed",
                self.name
            )));
        };
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn rpc_error(&self, method: &str, message: String) -> ForgeError {
        ForgeError::ToolExecution {
            server: self.name.clone(),
            message: format!("{method}: {message}"),
        }
    }
}

#[derive(Deserialize)]
struct RpcReply {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}
