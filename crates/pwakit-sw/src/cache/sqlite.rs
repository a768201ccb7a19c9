//! SQLite cache backend, for caches that outlive the worker process.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{CacheBackend, CacheEntry, CacheKey};
use crate::{Result, ServiceWorkerError};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Cache backend stored in a SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened cache database");
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let table_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get::<_, i32>(0).map(|count| count > 0),
            )
            .unwrap_or(false);

        let version: i32 = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceWorkerError::CacheError("cache database lock poisoned".to_string()))
    }
}

/// Create initial schema (version 1)
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS caches (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_name TEXT NOT NULL REFERENCES caches(name) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers BLOB NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (cache_name, method, url)
        );
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, chrono::Utc::now().timestamp()],
    )?;

    debug!(version = SCHEMA_VERSION, "Cache schema created");
    Ok(())
}

fn ensure_cache(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, ?)",
        params![name, chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

impl CacheBackend for SqliteBackend {
    fn open(&mut self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        ensure_cache(&conn, name)
    }

    fn has(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM caches WHERE name = ?",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn names(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn delete(&mut self, name: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM caches WHERE name = ?", params![name])?;
        Ok(removed > 0)
    }

    fn get(&self, name: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT status, headers, body, cached_at FROM cache_entries
                 WHERE cache_name = ? AND method = ? AND url = ?",
                params![name, key.method, key.url],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((status, headers, body, cached_at)) => {
                let headers: Vec<(String, Vec<u8>)> = serde_json::from_slice(&headers)
                    .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt headers: {}", e)))?;
                Ok(Some(CacheEntry {
                    key: key.clone(),
                    status,
                    headers,
                    body,
                    cached_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn put_all(&mut self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        ensure_cache(&tx, name)?;
        for entry in &entries {
            let headers = serde_json::to_vec(&entry.headers)
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
            tx.execute(
                "INSERT OR REPLACE INTO cache_entries
                 (cache_name, method, url, status, headers, body, cached_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    name,
                    entry.key.method,
                    entry.key.url,
                    entry.status,
                    headers,
                    entry.body,
                    entry.cached_at
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn keys(&self, name: &str) -> Result<Vec<CacheKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT method, url FROM cache_entries WHERE cache_name = ? ORDER BY method, url",
        )?;
        let keys = stmt
            .query_map(params![name], |row| {
                Ok(CacheKey {
                    method: row.get(0)?,
                    url: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
