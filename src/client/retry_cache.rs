use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS retry (
    seq   INTEGER PRIMARY KEY AUTOINCREMENT,
    key   TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL
);";

/// One cached delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Insertion order.
    pub seq: i64,
    pub key: String,
    pub value: String,
}

/// Durable, insertion-ordered store of metrics awaiting re-delivery.
///
/// Capacity is enforced by the caller. All statements run on the blocking
/// pool behind one connection.
#[derive(Clone)]
pub struct RetryCache {
    conn: Arc<Mutex<Connection>>,
}

impl RetryCache {
    /// Open the cache file at `path`, or a private in-memory database.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let conn = Connection::open(path)
                    .with_context(|| format!("opening retry cache {}", path.display()))?;
                conn.pragma_update(None, "journal_mode", "WAL")
                    .context("enabling WAL")?;
                conn
            }
            None => Connection::open_in_memory().context("opening in-memory retry cache")?,
        };

        conn.execute_batch(SCHEMA)
            .context("creating retry cache schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .context("retry cache worker panicked")?
    }

    /// Store `value` under `key`. A key already present keeps its position.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO retry (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .context("inserting retry entry")?;
            Ok(())
        })
        .await
    }

    /// Store `value` under `key` unless the cache already holds `capacity`
    /// other entries. Returns whether the entry was stored.
    pub async fn put_bounded(&self, key: &str, value: &str, capacity: usize) -> Result<bool> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("starting retry insert")?;
            let held: i64 = tx
                .query_row("SELECT COUNT(*) FROM retry WHERE key != ?1", params![key], |row| {
                    row.get(0)
                })
                .context("counting retry entries")?;
            if usize::try_from(held).unwrap_or(usize::MAX) >= capacity {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO retry (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .context("inserting retry entry")?;
            tx.commit().context("committing retry insert")?;
            Ok(true)
        })
        .await
    }

    pub async fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM retry", [], |row| row.get(0))
                .context("counting retry entries")?;
            Ok(usize::try_from(n).unwrap_or(0))
        })
        .await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Up to `limit` entries with a sequence number above `after`, oldest first.
    pub async fn entries(&self, after: i64, limit: usize) -> Result<Vec<Entry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT seq, key, value FROM retry WHERE seq > ?1 ORDER BY seq LIMIT ?2")
                .context("preparing retry scan")?;
            let rows = stmt
                .query_map(params![after, limit], |row| {
                    Ok(Entry {
                        seq: row.get(0)?,
                        key: row.get(1)?,
                        value: row.get(2)?,
                    })
                })
                .context("scanning retry entries")?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("reading retry entry")?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT value FROM retry WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .context("reading retry entry")
        })
        .await
    }

    /// Remove `keys` in one transaction, returning how many existed.
    pub async fn delete(&self, keys: Vec<String>) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        self.with_conn(move |conn| {
            let tx = conn.transaction().context("starting retry delete")?;
            let mut removed = 0;
            {
                let mut stmt = tx
                    .prepare_cached("DELETE FROM retry WHERE key = ?1")
                    .context("preparing retry delete")?;
                for key in &keys {
                    removed += stmt.execute(params![key]).context("deleting retry entry")?;
                }
            }
            tx.commit().context("committing retry delete")?;
            Ok(removed)
        })
        .await
    }
}
