//! SQLite persistence for the relay: the durable message log and the
//! presence table.
//!
//! This is the only module that touches storage.  All writes funnel through a
//! single [`MessageStore`] handle, which gives the log its ordering
//! invariant: assigned timestamps are non-decreasing in insertion order, with
//! the SQLite rowid as the tie-break for messages stored in the same
//! millisecond.  Messages are immutable once stored and are never deleted by
//! normal operation.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Message row stored in the durable log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: u64,
}

/// Result of an append: whether a new row was written, and the timestamp
/// under which the message is (or already was) stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppendOutcome {
    pub accepted: bool,
    pub timestamp: u64,
}

/// Durable presence state for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
    /// Never seen by this relay.
    Unknown,
}

/// Presence row stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRow {
    pub agent_id: String,
    pub status: PresenceStatus,
    pub last_seen: u64,
}

/// Current wall-clock time as milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Database file location under the relay's data directory.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("relay.db")
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct MessageStore {
    conn: Connection,
    /// Highest timestamp handed out so far; loaded from the log on open.
    last_timestamp: u64,
}

impl MessageStore {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database, for tests and ephemeral relays.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let mut store = Self {
            conn,
            last_timestamp: 0,
        };
        store.create_schema()?;
        store.last_timestamp = store.conn.query_row(
            "SELECT COALESCE(MAX(timestamp), 0) FROM messages",
            [],
            |row| row.get::<_, i64>(0),
        )? as u64;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                message_id  TEXT PRIMARY KEY,
                sender      TEXT NOT NULL,
                content     TEXT NOT NULL,
                timestamp   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_timestamp
                ON messages(timestamp);

            CREATE TABLE IF NOT EXISTS presence (
                agent_id    TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                last_seen   INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // -- Messages -----------------------------------------------------------

    /// Append a message to the log.
    ///
    /// Duplicate message ids are idempotent: the store is left unchanged and
    /// the outcome carries the original row's timestamp with
    /// `accepted: false`, so the caller can still acknowledge the sender.
    ///
    /// A client-supplied timestamp is honoured only when it keeps the log
    /// monotonic; otherwise the server clock is used, clamped so assigned
    /// timestamps never decrease.
    pub fn append(
        &mut self,
        message_id: &str,
        sender: &str,
        content: &str,
        client_timestamp: Option<u64>,
    ) -> Result<AppendOutcome, StoreError> {
        if let Some(existing) = self.stored_timestamp(message_id)? {
            return Ok(AppendOutcome {
                accepted: false,
                timestamp: existing,
            });
        }

        let assigned = self.next_timestamp(client_timestamp);
        self.conn.execute(
            "INSERT INTO messages (message_id, sender, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, sender, content, assigned as i64],
        )?;
        self.last_timestamp = assigned;

        Ok(AppendOutcome {
            accepted: true,
            timestamp: assigned,
        })
    }

    fn next_timestamp(&self, client_timestamp: Option<u64>) -> u64 {
        let candidate = match client_timestamp {
            Some(ts) if ts >= self.last_timestamp => ts,
            _ => now_millis(),
        };
        candidate.max(self.last_timestamp)
    }

    fn stored_timestamp(&self, message_id: &str) -> Result<Option<u64>, StoreError> {
        let ts = self
            .conn
            .query_row(
                "SELECT timestamp FROM messages WHERE message_id = ?1",
                params![message_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(ts.map(|t| t as u64))
    }

    /// Whether a message with this id is already stored.
    pub fn exists(&self, message_id: &str) -> Result<bool, StoreError> {
        Ok(self.stored_timestamp(message_id)?.is_some())
    }

    /// All messages with timestamp strictly greater than `since` (or the
    /// whole log when `since` is `None`), ordered ascending by timestamp with
    /// insertion order breaking ties.  At most `limit` rows are returned;
    /// callers are expected to log the truncation.
    pub fn query_since(
        &self,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let floor: i64 = match since {
            Some(ts) => ts as i64,
            None => -1,
        };
        let mut stmt = self.conn.prepare(
            "SELECT message_id, sender, content, timestamp
             FROM messages
             WHERE timestamp > ?1
             ORDER BY timestamp ASC, rowid ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![floor, limit as i64], |row| {
            Ok(StoredMessage {
                message_id: row.get(0)?,
                sender: row.get(1)?,
                content: row.get(2)?,
                timestamp: row.get::<_, i64>(3)? as u64,
            })
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Total number of stored messages.
    pub fn message_count(&self) -> Result<u64, StoreError> {
        let count =
            self.conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| {
                    row.get::<_, i64>(0)
                })?;
        Ok(count as u64)
    }

    // -- Presence -----------------------------------------------------------

    /// Record an agent as online, stamping its last-seen time.
    pub fn set_online(&mut self, agent_id: &str, last_seen: u64) -> Result<(), StoreError> {
        self.upsert_presence(agent_id, "online", last_seen)
    }

    /// Record an agent as offline, stamping its last-seen time.
    pub fn set_offline(&mut self, agent_id: &str, last_seen: u64) -> Result<(), StoreError> {
        self.upsert_presence(agent_id, "offline", last_seen)
    }

    fn upsert_presence(
        &mut self,
        agent_id: &str,
        status: &str,
        last_seen: u64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO presence (agent_id, status, last_seen)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id) DO UPDATE SET status = ?2, last_seen = ?3",
            params![agent_id, status, last_seen as i64],
        )?;
        Ok(())
    }

    /// The stored presence row for an agent, if it has ever been seen.
    pub fn presence(&self, agent_id: &str) -> Result<Option<PresenceRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT status, last_seen FROM presence WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? as u64,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(status, last_seen)| PresenceRow {
            agent_id: agent_id.to_string(),
            status: if status == "online" {
                PresenceStatus::Online
            } else {
                PresenceStatus::Offline
            },
            last_seen,
        }))
    }

    /// Presence status for an agent; `Unknown` if never seen.
    pub fn status(&self, agent_id: &str) -> Result<PresenceStatus, StoreError> {
        Ok(self
            .presence(agent_id)?
            .map(|row| row.status)
            .unwrap_or(PresenceStatus::Unknown))
    }

    /// Force every presence row to offline.  Run at startup: rows left
    /// `online` by a crash do not mean the agent is currently connected.
    pub fn mark_all_offline(&mut self) -> Result<usize, StoreError> {
        let changed = self
            .conn
            .execute("UPDATE presence SET status = 'offline'", [])?;
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
