//! Namespaced key/value persistence on a single SQLite table.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error};
use rusqlite::{params, Connection, OpenFlags};

use mintling_core::errors::{Error, Result};
use mintling_core::store::LocalStore;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    namespace  TEXT NOT NULL,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    PRIMARY KEY (namespace, key)
);
CREATE INDEX IF NOT EXISTS idx_entries_expiry ON entries (namespace, expires_at);
";

/// Durable local store over one SQLite file.
///
/// Opening never errors: when the database cannot be created the repository
/// degrades to an unavailable no-op store, reported through
/// [`LocalStore::is_available`].
pub struct LocalCacheRepository {
    conn: Option<Mutex<Connection>>,
}

impl LocalCacheRepository {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::open_connection(path) {
            Ok(conn) => {
                debug!("[Storage] Opened local cache at {}", path.display());
                Self {
                    conn: Some(Mutex::new(conn)),
                }
            }
            Err(err) => {
                error!(
                    "[Storage] Could not open local cache at {}; running without durable storage: {}",
                    path.display(),
                    err
                );
                Self { conn: None }
            }
        }
    }

    /// In-memory database; state does not survive the instance.
    pub fn open_in_memory() -> Self {
        match Connection::open_in_memory().and_then(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        }) {
            Ok(conn) => Self {
                conn: Some(Mutex::new(conn)),
            },
            Err(err) => {
                error!("[Storage] Could not open in-memory cache: {}", err);
                Self { conn: None }
            }
        }
    }

    fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    fn lock(&self) -> Option<MutexGuard<'_, Connection>> {
        self.conn
            .as_ref()
            .map(|conn| conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn write(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let Some(conn) = self.lock() else {
            return Ok(());
        };
        let encoded = serde_json::to_string(value)?;
        // Overwrites keep the original created_at so queue order is stable.
        conn.execute(
            "INSERT INTO entries (namespace, key, value, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (namespace, key)
             DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![namespace, key, encoded, now_millis(), expires_at],
        )
        .map_err(storage_err)?;
        Ok(())
    }
}

impl LocalStore for LocalCacheRepository {
    fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    fn put(&self, namespace: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        self.write(namespace, key, value, None)
    }

    fn put_with_ttl(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = now_millis().saturating_add(ttl.as_millis() as i64);
        self.write(namespace, key, value, Some(expires_at))
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let Some(conn) = self.lock() else {
            return Ok(None);
        };
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(storage_err(other)),
            })?;

        let Some((encoded, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at.is_some_and(|at| at <= now_millis()) {
            // Lazy purge of an expired entry.
            conn.execute(
                "DELETE FROM entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .map_err(storage_err)?;
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&encoded)?))
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let Some(conn) = self.lock() else {
            return Ok(());
        };
        conn.execute(
            "DELETE FROM entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn list(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let Some(conn) = self.lock() else {
            return Ok(Vec::new());
        };
        let mut statement = conn
            .prepare(
                "SELECT key, value FROM entries
                 WHERE namespace = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY created_at ASC, rowid ASC",
            )
            .map_err(storage_err)?;
        let rows = statement
            .query_map(params![namespace, now_millis()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(storage_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, encoded) = row.map_err(storage_err)?;
            entries.push((key, serde_json::from_str(&encoded)?));
        }
        Ok(entries)
    }

    fn sweep_expired(&self, namespace: &str) -> Result<usize> {
        let Some(conn) = self.lock() else {
            return Ok(0);
        };
        let removed = conn
            .execute(
                "DELETE FROM entries
                 WHERE namespace = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![namespace, now_millis()],
            )
            .map_err(storage_err)?;
        if removed > 0 {
            debug!("[Storage] Swept {} expired entries from '{}'", removed, namespace);
        }
        Ok(removed)
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        let Some(conn) = self.lock() else {
            return Ok(());
        };
        conn.execute(
            "DELETE FROM entries WHERE namespace = ?1",
            params![namespace],
        )
        .map_err(storage_err)?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::storage(err.to_string())
}
