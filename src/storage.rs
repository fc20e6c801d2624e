// Key-value storage collaborator
//
// Every subsystem persists through this interface and owns a disjoint set
// of keys. Values are JSON-compatible structured data; writes are
// last-writer-wins, no transactions are assumed.
//
// Two implementations ship: an in-memory map (tests, ephemeral profiles)
// and a sqlite-backed store (one `kv` table, JSON text values).

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;

/// Key-value storage used for all persisted state.
#[async_trait]
pub trait KvStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    async fn clear(&self) -> Result<()>;
}

/// Volatile storage backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.map.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map.lock().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.map.lock().await.clear();
        Ok(())
    }
}

/// Durable storage backed by sqlite.
///
/// A single `kv` table holds JSON-serialized values. Individual values
/// stay small (queue snapshots, bitarray shards, cached state), so one
/// connection behind a mutex is enough; the telemetry tables live in
/// their own database (`telemetry::db`).
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open kv database")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl KvStorage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => {
                let text: String = row.get(0)?;
                let value = serde_json::from_str(&text).context("corrupt kv value")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let text = serde_json::to_string(&value)?;
        let conn = self.conn.lock().await;
        conn.prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")?
            .execute(params![key, text])?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached("DELETE FROM kv WHERE key = ?1")?
            .execute(params![key])?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT key FROM kv")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn exercise(storage: &dyn KvStorage) {
        assert_eq!(storage.get("a").await.unwrap(), None);

        storage.set("a", json!({"n": 1})).await.unwrap();
        storage.set("b", json!([1, 2, 3])).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), Some(json!({"n": 1})));

        // last-writer-wins
        storage.set("a", json!({"n": 2})).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), Some(json!({"n": 2})));

        let mut keys = storage.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        storage.remove("a").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);

        storage.clear().await.unwrap();
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        exercise(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn sqlite_storage_roundtrip() {
        exercise(&SqliteStorage::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn sqlite_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.set("k", json!("v")).await.unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(json!("v")));
    }
}
