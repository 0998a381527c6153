//! Persistent transcript store (`~/.solace/solace.db`).
//!
//! Holds the per-session message log and each session's remote conversation
//! handle. Nothing here knows about the remote service or the pool.

use crate::remote::{Handle, Role};
use crate::{Result, SolaceError};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub content: String,
    pub role: Role,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

/// SQLite-backed transcript store.
pub struct TranscriptStore {
    db_path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl TranscriptStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&db_path)?;
        Self::with_connection(conn, Some(db_path))
    }

    /// A throwaway store, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        let store = Self {
            db_path,
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// `None` for in-memory stores.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SolaceError::Store("connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS schema_migrations (
              version INTEGER PRIMARY KEY,
              applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session
              ON messages(session_id, timestamp);

            CREATE TABLE IF NOT EXISTS session_handles (
              session_id TEXT PRIMARY KEY,
              handle TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            "#,
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES(1, ?1)",
            [now_rfc3339()],
        )?;

        Ok(())
    }

    pub fn append_message(&self, session_id: &str, role: Role, content: &str) -> Result<Message> {
        // Stored at microsecond precision; keep the returned value identical.
        let timestamp = Utc::now().trunc_subsecs(6);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages(session_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, format_ts(&timestamp)],
        )?;

        Ok(Message {
            id: conn.last_insert_rowid(),
            content: content.to_string(),
            role,
            session_id: session_id.to_string(),
            timestamp,
        })
    }

    /// Messages of a session, oldest first.
    pub fn messages_for_session(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, content, role, session_id, timestamp
            FROM messages WHERE session_id = ?1
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;

        let rows = stmt.query_map([session_id], |row| {
            let role: String = row.get(2)?;
            let timestamp: String = row.get(4)?;
            Ok(Message {
                id: row.get(0)?,
                content: row.get(1)?,
                role: Role::parse(&role).map_err(to_sql_err)?,
                session_id: row.get(3)?,
                timestamp: parse_rfc3339(&timestamp).map_err(to_sql_err)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete a session's messages and its handle association.
    ///
    /// Returns the number of messages removed.
    pub fn clear_session(&self, session_id: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM messages WHERE session_id = ?1", [session_id])?;
        tx.execute(
            "DELETE FROM session_handles WHERE session_id = ?1",
            [session_id],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn session_handle(&self, session_id: &str) -> Result<Option<Handle>> {
        let conn = self.conn()?;
        let handle = conn
            .query_row(
                "SELECT handle FROM session_handles WHERE session_id = ?1",
                [session_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(handle.map(Handle))
    }

    pub fn set_session_handle(&self, session_id: &str, handle: &Handle) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO session_handles(session_id, handle, created_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(session_id) DO UPDATE SET
              handle = excluded.handle,
              created_at = excluded.created_at
            "#,
            params![session_id, handle.as_str(), now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn forget_session_handle(&self, session_id: &str) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM session_handles WHERE session_id = ?1",
            [session_id],
        )?;
        Ok(())
    }
}

/// Async handle to a [`TranscriptStore`].
///
/// Every call runs on tokio's blocking pool via `spawn_blocking`, so SQLite
/// I/O never occupies an async worker thread. Cloning shares the store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<TranscriptStore>,
}

impl StoreHandle {
    pub fn new(store: TranscriptStore) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Run `f` against the store on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TranscriptStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| SolaceError::Store(format!("store task failed: {}", e)))?
    }

    pub async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message> {
        let session_id = session_id.to_string();
        let content = content.to_string();
        self.call(move |store| store.append_message(&session_id, role, &content))
            .await
    }

    pub async fn messages_for_session(&self, session_id: &str) -> Result<Vec<Message>> {
        let session_id = session_id.to_string();
        self.call(move |store| store.messages_for_session(&session_id))
            .await
    }

    pub async fn clear_session(&self, session_id: &str) -> Result<usize> {
        let session_id = session_id.to_string();
        self.call(move |store| store.clear_session(&session_id)).await
    }

    pub async fn session_handle(&self, session_id: &str) -> Result<Option<Handle>> {
        let session_id = session_id.to_string();
        self.call(move |store| store.session_handle(&session_id)).await
    }

    pub async fn set_session_handle(&self, session_id: &str, handle: &Handle) -> Result<()> {
        let session_id = session_id.to_string();
        let handle = handle.clone();
        self.call(move |store| store.set_session_handle(&session_id, &handle))
            .await
    }

    pub async fn forget_session_handle(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.call(move |store| store.forget_session_handle(&session_id))
            .await
    }
}

// Fixed-width UTC timestamps sort correctly as text.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_rfc3339() -> String {
    format_ts(&Utc::now())
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SolaceError::Store(format!("invalid timestamp '{}': {}", value, e)))
}

fn to_sql_err(err: SolaceError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}
