//! SQLite-backed capture store
//!
//! One append-only row per captured exchange. Writes run on tokio's blocking
//! pool and are never awaited by the proxy; failures are logged and dropped.

use super::{CaptureSink, CapturedExchange};
use crate::error::CaptureError;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ordered, named schema migrations.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_create_captures",
        "CREATE TABLE IF NOT EXISTS captures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
    ),
    (
        "0002_index_captures_created_at",
        "CREATE INDEX IF NOT EXISTS idx_captures_created_at ON captures(created_at)",
    ),
];

/// A capture row read back from the store.
#[derive(Debug, Clone)]
pub struct StoredCapture {
    pub id: i64,
    pub exchange: CapturedExchange,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct SqliteCaptureStore {
    db_path: PathBuf,
}

impl SqliteCaptureStore {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let store = Self {
            db_path: path.as_ref().to_path_buf(),
        };
        let conn = store.connection()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        run_migrations(&conn)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connection(&self) -> Result<Connection, CaptureError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Append one exchange synchronously, returning its row id.
    pub fn insert(&self, exchange: &CapturedExchange) -> Result<i64, CaptureError> {
        let payload = serde_json::to_string(exchange)?;
        let conn = self.connection()?;
        conn.execute("INSERT INTO captures (payload) VALUES (?1)", params![payload])?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent captures first.
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredCapture>, CaptureError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, payload, created_at FROM captures ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut captures = Vec::new();
        for row in rows {
            let (id, payload, created_at) = row?;
            captures.push(StoredCapture {
                id,
                exchange: serde_json::from_str(&payload)?,
                created_at,
            });
        }
        Ok(captures)
    }

    pub fn count(&self) -> Result<u64, CaptureError> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl CaptureSink for SqliteCaptureStore {
    fn record(&self, exchange: CapturedExchange) {
        let store = self.clone();
        let write = move || {
            if let Err(e) = store.insert(&exchange) {
                tracing::warn!(error = %e, host = %exchange.host, "Failed to persist capture");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}

fn run_migrations(conn: &Connection) -> Result<(), CaptureError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    for (name, sql) in MIGRATIONS {
        let applied = conn
            .query_row(
                "SELECT name FROM schema_migrations WHERE name = ?1",
                params![name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        if applied.is_some() {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (name) VALUES (?1)",
            params![name],
        )?;
        tx.commit()?;
        tracing::debug!(migration = name, "Applied capture migration");
    }

    Ok(())
}
