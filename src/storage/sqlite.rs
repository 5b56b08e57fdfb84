//! SQLite-backed session store.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ForgeError, Result};
use crate::types::Message;

use super::{Session, SessionListOptions, SessionStatus, Store};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    title      TEXT NOT NULL DEFAULT '',
    status     TEXT NOT NULL DEFAULT 'active'
               CHECK(status IN ('active','running','completed','failed')),
    provider   TEXT NOT NULL DEFAULT '',
    model      TEXT NOT NULL DEFAULT '',
    profile    TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);

CREATE TABLE IF NOT EXISTS session_messages (
    session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
    messages   TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

const SESSION_COLUMNS: &str = "id, title, status, provider, model, profile, created_at, updated_at";

/// Store backed by a single SQLite database file.
///
/// The connection mutex serializes statements; it is never held across an
/// await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations forward.
    /// Use `:memory:` for an in-memory database (useful for testing).
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(dir) = Path::new(path).parent() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    let current: i64 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    if current >= SCHEMA_VERSION {
        return Ok(());
    }
    if current < 1 {
        conn.execute_batch(SCHEMA_V1)?;
    }

    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn scan_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        status: status.parse().map_err(|e: ForgeError| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        provider: row.get(3)?,
        model: row.get(4)?,
        profile: row.get(5)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl Store for SqliteStore {
    fn create_session(&self, session: &mut Session) -> Result<()> {
        let now = Utc::now();
        session.created_at = now;
        session.updated_at = now;
        let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, title, status, provider, model, profile, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.id,
                session.title,
                session.status.as_str(),
                session.provider,
                session.model,
                session.profile,
                stamp,
                stamp,
            ],
        )?;
        conn.execute(
            "INSERT INTO session_messages (session_id, messages) VALUES (?1, '[]')",
            params![session.id],
        )?;
        Ok(())
    }

    fn get_session(&self, id: &str) -> Result<Session> {
        let conn = self.conn.lock().unwrap();

        let exact = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                scan_session,
            )
            .optional()?;
        if let Some(session) = exact {
            return Ok(session);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id LIKE ?1 || '%'"
        ))?;
        let mut matches = stmt
            .query_map(params![id], scan_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        match matches.len() {
            0 => Err(ForgeError::NotFound(id.to_string())),
            1 => Ok(matches.remove(0)),
            n => Err(ForgeError::AmbiguousPrefix {
                prefix: id.to_string(),
                matches: n,
            }),
        }
    }

    fn list_sessions(&self, opts: &SessionListOptions) -> Result<Vec<Session>> {
        let limit = if opts.limit <= 0 { 50 } else { opts.limit };
        let offset = opts.offset.max(0);

        let conn = self.conn.lock().unwrap();
        let sessions = match opts.status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1
                     ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit, offset], scan_session)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit, offset], scan_session)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(sessions)
    }

    fn update_session(&self, session: &mut Session) -> Result<()> {
        session.updated_at = Utc::now();
        let stamp = session
            .updated_at
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET title = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![session.title, session.status.as_str(), stamp, session.id],
        )?;
        Ok(())
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        // Resolve the prefix first, then delete messages before the session
        // row to satisfy the foreign key.
        let session = self.get_session(id)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM session_messages WHERE session_id = ?1",
            params![session.id],
        )?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session.id])?;
        Ok(())
    }

    fn save_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let data = serde_json::to_string(messages)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO session_messages (session_id, messages, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET messages = excluded.messages, updated_at = excluded.updated_at",
            params![session_id, data, now_rfc3339()],
        )?;
        Ok(())
    }

    fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT messages FROM session_messages WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Ok(Vec::new()),
        }
    }
}
