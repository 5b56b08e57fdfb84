//! `forge serve` wiring.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::storage::SqliteStore;
use crate::tools::Registry;

use super::ServeArgs;

pub async fn run(args: ServeArgs) -> Result<()> {
    let cfg = Config::load()?;
    let store = Arc::new(SqliteStore::open(&cfg.storage.db_path)?);

    let mut registry = Registry::new();
    for (name, tool_cfg) in &cfg.tools {
        if let Err(e) = registry.register(name, tool_cfg).await {
            warn!(server = name.as_str(), error = %e, "failed to start tool server");
        }
    }
    if registry.has_tools() {
        info!("tools: MCP servers loaded");
    } else {
        info!("tools: builtin shell_exec");
    }
    let registry = Arc::new(registry);

    let port = args.port.unwrap_or(cfg.server.port);
    let result = crate::server::serve(cfg, store, Some(registry.clone()), port).await;

    registry.close().await;
    result
}
