//! Durable snapshot storage for notebook documents.
//!
//! Each notebook persists exactly one value — its encoded CRDT state — under
//! the fixed key [`SNAPSHOT_KEY`]. Rows are keyed `(notebook_id, key)` so a
//! single store file serves every coordinator in the process while keeping
//! their state fully isolated.
//!
//! Writes above [`MAX_SNAPSHOT_BYTES`] are refused and logged rather than
//! silently truncated; the next smaller update persists normally.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

/// The single per-notebook storage key.
pub const SNAPSHOT_KEY: &str = "ydoc.snapshot.v1";

/// Refuse to persist snapshots larger than this.
pub const MAX_SNAPSHOT_BYTES: usize = 2 * 1024 * 1024;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file path; `None` keeps everything in memory (tests).
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self { path: None }
    }
}

/// Storage errors.
#[derive(Debug)]
pub enum StoreError {
    Database(String),
    /// Snapshot exceeded [`MAX_SNAPSHOT_BYTES`].
    SnapshotTooLarge(usize),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::SnapshotTooLarge(size) => write!(
                f,
                "snapshot of {size} bytes exceeds the {MAX_SNAPSHOT_BYTES} byte limit"
            ),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// SQLite-backed snapshot store. Connection access is serialized; callers
/// on async paths go through `spawn_blocking`.
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

impl SnapshotStore {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let conn = match &config.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                 notebook_id TEXT NOT NULL,
                 key         TEXT NOT NULL,
                 value       BLOB NOT NULL,
                 updated_at  INTEGER NOT NULL,
                 PRIMARY KEY (notebook_id, key)
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Load a notebook's snapshot, `None` when nothing was persisted yet.
    pub fn load(&self, notebook_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let value = conn
            .query_row(
                "SELECT value FROM snapshots WHERE notebook_id = ?1 AND key = ?2",
                params![notebook_id, SNAPSHOT_KEY],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Persist a notebook's snapshot, replacing any previous value.
    pub fn save(&self, notebook_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        if snapshot.len() > MAX_SNAPSHOT_BYTES {
            return Err(StoreError::SnapshotTooLarge(snapshot.len()));
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO snapshots (notebook_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (notebook_id, key) DO UPDATE
             SET value = excluded.value, updated_at = excluded.updated_at",
            params![notebook_id, SNAPSHOT_KEY, snapshot, now],
        )?;
        Ok(())
    }

    pub fn delete(&self, notebook_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM snapshots WHERE notebook_id = ?1",
            params![notebook_id],
        )?;
        Ok(())
    }

    /// Notebook ids with a persisted snapshot, most recently written first.
    pub fn list_notebooks(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT notebook_id FROM snapshots WHERE key = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![SNAPSHOT_KEY], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}
