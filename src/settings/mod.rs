//! Key-value settings store backing the cookie cache and proxy configuration.

use std::sync::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings store: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// Capability a caller depends on to read/write persisted key-value state.
/// Implementations must serialize writes so a single key's value is never
/// torn (spec.md §5: "the settings store ... must provide at-least-atomic
/// single-key writes").
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn get_prefixed(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
    fn delete_prefixed(&self, prefix: &str) -> Result<(), StoreError>;
}

pub(crate) const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
";

/// SQLite-backed implementation shared with the rest of the persistence
/// layer; `Connection` is not `Sync` so access is serialized behind a mutex,
/// matching the single-connection model the migration engine also uses.
pub struct SqliteSettingsStore {
    conn: Mutex<Connection>,
}

impl SqliteSettingsStore {
    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn get_prefixed(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let like = format!("{}%", escape_like(prefix));
        let mut stmt = conn.prepare(
            "SELECT key, value FROM settings WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![like], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete_prefixed(&self, prefix: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let like = format!("{}%", escape_like(prefix));
        conn.execute("DELETE FROM settings WHERE key LIKE ?1 ESCAPE '\\'", params![like])?;
        Ok(())
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// In-memory store for tests and the solver's test-mode constructors.
pub struct InMemorySettingsStore {
    inner: Mutex<std::collections::BTreeMap<String, String>>,
}

impl Default for InMemorySettingsStore {
    fn default() -> Self {
        Self { inner: Mutex::new(std::collections::BTreeMap::new()) }
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }

    fn get_prefixed(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete_prefixed(&self, prefix: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        let store = SqliteSettingsStore::new(conn).unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v1").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v1".to_string()));
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v2".to_string()));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn prefix_get_and_delete() {
        let conn = Connection::open_in_memory().unwrap();
        let store = SqliteSettingsStore::new(conn).unwrap();
        store.set("anubis.cookie.example.com", "c").unwrap();
        store.set("anubis.cookie.example.com.expires", "t").unwrap();
        store.set("anubis.cookie.other.com", "c2").unwrap();

        let prefixed = store.get_prefixed("anubis.cookie.example.com").unwrap();
        assert_eq!(prefixed.len(), 2);

        store.delete_prefixed("anubis.cookie.example.com").unwrap();
        assert!(store.get("anubis.cookie.example.com").unwrap().is_none());
        assert!(store.get("anubis.cookie.other.com").unwrap().is_some());
    }

    #[test]
    fn in_memory_store_behaves_the_same() {
        let store = InMemorySettingsStore::default();
        store.set("a", "1").unwrap();
        store.set("ab", "2").unwrap();
        store.set("b", "3").unwrap();
        assert_eq!(store.get_prefixed("a").unwrap().len(), 2);
        store.delete_prefixed("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), Some("3".to_string()));
    }
}
