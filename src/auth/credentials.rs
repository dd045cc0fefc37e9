// Credential persistence in a SQLite database
// Tokens live in an `auth_kv` table so a session survives restarts.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::store::CredentialStore;
use crate::error::StoreError;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS auth_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// SQLite-backed credential store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the credentials database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create credentials directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(SCHEMA, [])
            .context("Failed to create auth_kv table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("credentials database lock poisoned".to_string()))?;
        f(&*conn).map_err(StoreError::from)
    }

    /// When `key` was last written, as RFC 3339
    pub fn updated_at(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT updated_at FROM auth_kv WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

impl CredentialStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                [key, value, now.as_str()],
            )
            .map(|_| ())
        })
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| conn.execute("DELETE FROM auth_kv", []).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_store_set_get_overwrite() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get("access").unwrap(), None);

        store.set("access", "a1").unwrap();
        store.set("access", "a2").unwrap();
        assert_eq!(store.get("access").unwrap().as_deref(), Some("a2"));
        assert!(store.updated_at("access").unwrap().is_some());
    }

    #[test]
    fn test_sqlite_store_clear() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("access", "a1").unwrap();
        store.set("refresh", "r1").unwrap();

        store.clear().unwrap();
        assert_eq!(store.get("access").unwrap(), None);
        assert_eq!(store.get("refresh").unwrap(), None);
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("portal-creds-{}", uuid::Uuid::new_v4()));
        let path = dir.join("credentials.sqlite3");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("refresh", "r1").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("refresh").unwrap().as_deref(), Some("r1"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
