//! SQLite-backed [`KeyValueStore`] so spend counters, cached responses and the
//! routing log survive restarts.
//!
//! Scalars live in `kv` with an optional expiry in unix milliseconds; lists
//! live in `kv_lists`, ordered by rowid. Expired scalars are deleted on read
//! and swept on every `set_ex` and prefix scan.

use crate::store::{KeyValueStore, MAX_LIST_LEN};
use async_trait::async_trait;
use chrono::Utc;
use forge_core::{ForgeError, ForgeResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE TABLE IF NOT EXISTS kv_lists (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_kv_lists_key ON kv_lists(key, id);
"#;

fn store_err(e: rusqlite::Error) -> ForgeError {
    ForgeError::Store(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn sweep_expired(conn: &Connection, now: i64) -> ForgeResult<()> {
    conn.execute(
        "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![now],
    )
    .map_err(store_err)?;
    Ok(())
}

/// Live value and expiry at `key`, deleting it first if it has expired.
fn live_entry(conn: &Connection, key: &str, now: i64) -> ForgeResult<Option<(String, Option<i64>)>> {
    conn.execute(
        "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        params![key, now],
    )
    .map_err(store_err)?;
    conn.query_row(
        "SELECT value, expires_at FROM kv WHERE key = ?1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(store_err)
}

/// Durable [`KeyValueStore`] on a single SQLite file. One connection, serialized
/// by a mutex, so increments and list trims are atomic.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file at `path`.
    pub fn open(path: &Path) -> ForgeResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ForgeError::Store(format!("cannot create '{}': {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "Opened SQLite store");
        Ok(store)
    }

    pub fn open_in_memory() -> ForgeResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn with_connection(conn: Connection) -> ForgeResult<Self> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> ForgeResult<Option<String>> {
        let conn = self.conn.lock();
        Ok(live_entry(&conn, key, now_ms())?.map(|(value, _)| value))
    }

    async fn set(&self, key: &str, value: &str) -> ForgeResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, NULL)",
                params![key, value],
            )
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ForgeResult<()> {
        let conn = self.conn.lock();
        let now = now_ms();
        sweep_expired(&conn, now)?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, now.saturating_add(ttl_ms)],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> ForgeResult<f64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;
        let (current, expires_at) = match live_entry(&tx, key, now_ms())? {
            Some((raw, expires_at)) => {
                let value = raw.parse::<f64>().map_err(|e| {
                    ForgeError::Store(format!("value at '{key}' is not a float: {e}"))
                })?;
                (value, expires_at)
            }
            None => (0.0, None),
        };
        let next = current + delta;
        tx.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, next.to_string(), expires_at],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(next)
    }

    async fn push(&self, key: &str, value: &str) -> ForgeResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;
        tx.execute(
            "INSERT INTO kv_lists (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(store_err)?;
        tx.execute(
            "DELETE FROM kv_lists WHERE key = ?1 AND id NOT IN \
             (SELECT id FROM kv_lists WHERE key = ?1 ORDER BY id DESC LIMIT ?2)",
            params![key, MAX_LIST_LEN as i64],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    async fn range(&self, key: &str) -> ForgeResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT value FROM kv_lists WHERE key = ?1 ORDER BY id")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> ForgeResult<Vec<String>> {
        let conn = self.conn.lock();
        sweep_expired(&conn, now_ms())?;
        let mut stmt = conn
            .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
    }
}
