// ABOUTME: Persistent session storage backed by SQLite.
// ABOUTME: Tracks per-session agent ids, last provider routes, token usage, and send policy.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Session-level gate consulted by `chat.send` before accepting a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPolicy {
    Allow,
    Deny,
}

impl std::fmt::Display for SendPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

impl std::str::FromStr for SendPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            _ => anyhow::bail!("Unknown send policy: {}", s),
        }
    }
}

/// One persisted session document, keyed by session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_key: String,
    pub session_id: String,
    pub provider: Option<String>,
    pub account_id: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub send_policy: SendPolicy,
    pub created_at: String,
    pub updated_at: String,
}

/// One transcript entry, ordered by insertion within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub text: String,
    pub at: String,
}

/// SQLite-backed session store. Treated by the control plane as a simple
/// keyed document store; the connection is shared behind a mutex.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open session db at {}", path.as_ref().display()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory session db")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_key   TEXT PRIMARY KEY,
                session_id    TEXT NOT NULL,
                provider      TEXT,
                account_id    TEXT,
                model         TEXT,
                input_tokens  INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                thinking_level TEXT,
                send_policy   TEXT NOT NULL DEFAULT 'allow',
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_key TEXT NOT NULL,
                role        TEXT NOT NULL,
                text        TEXT NOT NULL,
                at          TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages(session_key, id);",
        )
        .context("Failed to initialize sessions schema")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, session_key: &str) -> Result<Option<SessionRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT session_key, session_id, provider, account_id, model, thinking_level,
                        input_tokens, output_tokens, send_policy, created_at, updated_at
                 FROM sessions WHERE session_key = ?1",
                params![session_key],
                Self::row_to_record,
            )
            .optional()
            .context("Failed to query session")?;
        Ok(record)
    }

    /// Fetch a session, creating a fresh record on first reference.
    pub fn get_or_create(&self, session_key: &str) -> Result<SessionRecord> {
        if let Some(record) = self.get(session_key)? {
            return Ok(record);
        }
        let now = chrono::Utc::now().to_rfc3339();
        let record = SessionRecord {
            session_key: session_key.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            provider: None,
            account_id: None,
            model: None,
            thinking_level: None,
            input_tokens: 0,
            output_tokens: 0,
            send_policy: SendPolicy::Allow,
            created_at: now.clone(),
            updated_at: now,
        };
        self.save(&record)?;
        Ok(record)
    }

    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (session_key, session_id, provider, account_id, model,
                                   thinking_level, input_tokens, output_tokens, send_policy,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(session_key) DO UPDATE SET
                session_id = excluded.session_id,
                provider = excluded.provider,
                account_id = excluded.account_id,
                model = excluded.model,
                thinking_level = excluded.thinking_level,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                send_policy = excluded.send_policy,
                updated_at = excluded.updated_at",
            params![
                record.session_key,
                record.session_id,
                record.provider,
                record.account_id,
                record.model,
                record.thinking_level,
                record.input_tokens as i64,
                record.output_tokens as i64,
                record.send_policy.to_string(),
                record.created_at,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to save session")?;
        Ok(())
    }

    /// Accumulate token usage from a settled run.
    pub fn record_usage(&self, session_key: &str, input_tokens: u64, output_tokens: u64) -> Result<()> {
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE sessions
                 SET input_tokens = input_tokens + ?2,
                     output_tokens = output_tokens + ?3,
                     updated_at = ?4
                 WHERE session_key = ?1",
                params![
                    session_key,
                    input_tokens as i64,
                    output_tokens as i64,
                    chrono::Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to record usage")?;
        if updated == 0 {
            anyhow::bail!("No session with key: {}", session_key);
        }
        Ok(())
    }

    /// Remember the provider/account a session last routed through.
    pub fn set_last_route(&self, session_key: &str, provider: &str, account_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET provider = ?2, account_id = ?3, updated_at = ?4
             WHERE session_key = ?1",
            params![
                session_key,
                provider,
                account_id,
                chrono::Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to update session route")?;
        Ok(())
    }

    pub fn set_send_policy(&self, session_key: &str, policy: SendPolicy) -> Result<()> {
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE sessions SET send_policy = ?2, updated_at = ?3 WHERE session_key = ?1",
                params![
                    session_key,
                    policy.to_string(),
                    chrono::Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to set send policy")?;
        if updated == 0 {
            anyhow::bail!("No session with key: {}", session_key);
        }
        Ok(())
    }

    /// Append one transcript entry. Roles are "user", "agent", or "system".
    pub fn append_message(&self, session_key: &str, role: &str, text: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO messages (session_key, role, text, at) VALUES (?1, ?2, ?3, ?4)",
            params![session_key, role, text, chrono::Utc::now().to_rfc3339()],
        )
        .context("Failed to append message")?;
        Ok(())
    }

    /// Most recent `limit` transcript entries, oldest first.
    pub fn history(&self, session_key: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT role, text, at FROM (
                    SELECT id, role, text, at FROM messages
                    WHERE session_key = ?1 ORDER BY id DESC LIMIT ?2
                 ) ORDER BY id ASC",
            )
            .context("Failed to prepare history query")?;
        let rows = stmt
            .query_map(params![session_key, limit as i64], |row| {
                Ok(ChatMessage {
                    role: row.get(0)?,
                    text: row.get(1)?,
                    at: row.get(2)?,
                })
            })
            .context("Failed to query history")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?);
        }
        Ok(messages)
    }

    pub fn set_thinking_level(&self, session_key: &str, level: Option<&str>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET thinking_level = ?2, updated_at = ?3 WHERE session_key = ?1",
            params![session_key, level, chrono::Utc::now().to_rfc3339()],
        )
        .context("Failed to set thinking level")?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT session_key, session_id, provider, account_id, model, thinking_level,
                        input_tokens, output_tokens, send_policy, created_at, updated_at
                 FROM sessions ORDER BY session_key",
            )
            .context("Failed to prepare session list")?;
        let rows = stmt
            .query_map([], Self::row_to_record)
            .context("Failed to list sessions")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read session row")?);
        }
        Ok(records)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
        let policy: String = row.get(8)?;
        Ok(SessionRecord {
            session_key: row.get(0)?,
            session_id: row.get(1)?,
            provider: row.get(2)?,
            account_id: row.get(3)?,
            model: row.get(4)?,
            thinking_level: row.get(5)?,
            input_tokens: row.get::<_, i64>(6)? as u64,
            output_tokens: row.get::<_, i64>(7)? as u64,
            send_policy: policy.parse().unwrap_or(SendPolicy::Allow),
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}
