//! Session housekeeping commands.

use std::io::Write as _;

use chrono::Utc;

use crate::config::Config;
use crate::error::Result;
use crate::storage::{
    export_json, export_markdown, Session, SessionListOptions, SqliteStore, Store,
};
use crate::types::Role;

use super::{SessionsArgs, SessionsCommand};

const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const GRAY: &str = "\x1b[90m";
const RESET: &str = "\x1b[0m";

pub async fn run(args: SessionsArgs) -> Result<()> {
    let cfg = Config::load()?;
    let store = SqliteStore::open(&cfg.storage.db_path)?;

    match args.command {
        SessionsCommand::List { status, limit } => list(&store, status, limit),
        SessionsCommand::Show { id } => show(&store, &id),
        SessionsCommand::Delete { id, force } => delete(&store, &id, force),
        SessionsCommand::Export { id, format, output } => export(&store, &id, &format, output),
    }
}

fn list(store: &SqliteStore, status: Option<String>, limit: i64) -> Result<()> {
    let opts = SessionListOptions {
        status: match status.as_deref() {
            Some(s) if !s.is_empty() => Some(s.parse()?),
            _ => None,
        },
        limit,
        offset: 0,
    };

    let sessions = store.list_sessions(&opts)?;
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:<40} {:<15} {}",
        "ID", "STATUS", "TITLE", "MODEL", "UPDATED"
    );
    println!("{}", "─".repeat(95));

    for s in &sessions {
        let mut title = s.title.clone();
        if title.len() > 38 {
            crate::util::truncate_with_marker(&mut title, 38, "..");
        }
        if title.is_empty() {
            title = "(untitled)".into();
        }
        let mut model = s.model.clone();
        if model.len() > 13 {
            crate::util::truncate_with_marker(&mut model, 13, "..");
        }
        println!(
            "{:<10} {:<12} {:<40} {:<15} {}",
            &s.id[..8.min(s.id.len())],
            s.status,
            title,
            model,
            time_ago(s),
        );
    }
    Ok(())
}

fn show(store: &SqliteStore, id: &str) -> Result<()> {
    let sess = store.get_session(id)?;

    println!("Session:  {}", sess.id);
    println!("Title:    {}", sess.title);
    println!("Status:   {}", sess.status);
    println!("Provider: {}", sess.provider);
    println!("Model:    {}", sess.model);
    if !sess.profile.is_empty() {
        println!("Profile:  {}", sess.profile);
    }
    println!("Created:  {}", sess.created_at.to_rfc3339());
    println!("Updated:  {}", sess.updated_at.to_rfc3339());

    let messages = store.load_messages(&sess.id)?;
    println!("\nMessages: {}", messages.len());
    println!("{}", "─".repeat(60));

    for m in &messages {
        match m.role {
            Role::System => continue,
            Role::User => println!("\n{CYAN}you>{RESET} {}", preview(&m.content, 200)),
            Role::Assistant => {
                if !m.content.is_empty() {
                    println!("\n{GREEN}forge>{RESET} {}", preview(&m.content, 200));
                }
                for tc in &m.tool_calls {
                    println!("  {YELLOW}⚡ {}{RESET}", tc.name);
                }
            }
            Role::Tool => println!("  {GRAY}│ {}{RESET}", preview(&m.content, 100)),
        }
    }
    Ok(())
}

fn delete(store: &SqliteStore, id: &str, force: bool) -> Result<()> {
    let sess = store.get_session(id)?;
    let short_id = &sess.id[..8.min(sess.id.len())];

    if !force {
        let title = if sess.title.is_empty() {
            "(untitled)"
        } else {
            &sess.title
        };
        print!("Delete session {short_id} - {title:?}? [y/N] ");
        let _ = std::io::stdout().flush();
        let mut confirm = String::new();
        std::io::stdin().read_line(&mut confirm)?;
        if confirm.trim().to_lowercase() != "y" {
            println!("Cancelled.");
            return Ok(());
        }
    }

    store.delete_session(&sess.id)?;
    println!("Deleted session {short_id}");
    Ok(())
}

fn export(store: &SqliteStore, id: &str, format: &str, output: Option<String>) -> Result<()> {
    let sess = store.get_session(id)?;
    let messages = store.load_messages(&sess.id)?;

    let rendered = match format {
        "json" => export_json(&sess, &messages)?,
        _ => export_markdown(&sess, &messages),
    };

    match output {
        Some(path) => std::fs::write(path, rendered)?,
        None => print!("{rendered}"),
    }
    Ok(())
}

fn preview(s: &str, max_len: usize) -> String {
    let mut out = s.trim().to_string();
    crate::util::truncate_with_marker(&mut out, max_len, "...");
    out
}

fn time_ago(sess: &Session) -> String {
    let elapsed = Utc::now().signed_duration_since(sess.updated_at);
    if elapsed.num_minutes() < 1 {
        "just now".into()
    } else if elapsed.num_hours() < 1 {
        format!("{}m ago", elapsed.num_minutes())
    } else if elapsed.num_days() < 1 {
        format!("{}h ago", elapsed.num_hours())
    } else {
        format!("{}d ago", elapsed.num_days())
    }
}
