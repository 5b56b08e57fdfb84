//! Command-line interface.

pub mod chat;
pub mod serve;
pub mod sessions;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "forge", version, about = "Local-first agentic orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat session with an agent
    Chat(ChatArgs),
    /// Run the HTTP/WebSocket server backing the web UI
    Serve(ServeArgs),
    /// Inspect and manage saved sessions
    #[command(alias = "session", alias = "s")]
    Sessions(SessionsArgs),
}

#[derive(Args)]
pub struct ChatArgs {
    /// LLM provider from forge.yaml (e.g. ollama, claude)
    #[arg(long)]
    pub provider: Option<String>,
    /// Model to use (overrides config)
    #[arg(long)]
    pub model: Option<String>,
    /// Agent profile to use (e.g. default, coder)
    #[arg(long)]
    pub profile: Option<String>,
    /// Resume a previous session by ID or prefix
    #[arg(long)]
    pub resume: Option<String>,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on (overrides config)
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Args)]
pub struct SessionsArgs {
    #[command(subcommand)]
    pub command: SessionsCommand,
}

#[derive(Subcommand)]
pub enum SessionsCommand {
    /// List saved sessions
    List {
        /// Filter by status (active, running, completed, failed)
        #[arg(long)]
        status: Option<String>,
        /// Max sessions to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show session details and messages
    Show { id: String },
    /// Delete a session
    Delete {
        id: String,
        /// Skip confirmation
        #[arg(long)]
        force: bool,
    },
    /// Export a session as markdown or JSON
    Export {
        id: String,
        /// Export format: md or json
        #[arg(long, default_value = "md")]
        format: String,
        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<String>,
    },
}
