// Telemetry tables
//
// Two sqlite tables of identical shape (`tokens`, `keys`) back the
// cached-entry pipelines. The database is the authoritative history;
// the in-memory caches are write-through and periodically persisted.
// Common columns are extracted for the clean-cycle scan, the rest of an
// entry travels as one JSON blob.

use crate::error::{Error, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use tokio::sync::Mutex;

pub const TOKENS_TABLE: &str = "tokens";
pub const KEYS_TABLE: &str = "keys";

/// One persisted pipeline entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DbRow {
    pub hash: String,
    pub created: i64,
    pub last_sent: String,
    pub count: u32,
    pub data: Value,
}

pub struct TelemetryDb {
    conn: Mutex<Connection>,
}

impl TelemetryDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|err| Error::Transient(format!("failed to open telemetry db: {err}")))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::transient)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(Error::transient)?;
        for table in [TOKENS_TABLE, KEYS_TABLE] {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                     hash TEXT PRIMARY KEY,
                     created INTEGER NOT NULL,
                     last_sent TEXT NOT NULL DEFAULT '',
                     count INTEGER NOT NULL DEFAULT 0,
                     data TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS {table}_created ON {table} (created);"
            ))
            .map_err(Error::transient)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Only the two known tables are addressable.
    fn check_table(table: &str) -> Result<()> {
        if table == TOKENS_TABLE || table == KEYS_TABLE {
            Ok(())
        } else {
            Err(Error::BadJob(format!("unknown telemetry table {table:?}")))
        }
    }

    pub async fn get(&self, table: &str, hashes: &[String]) -> Result<Vec<DbRow>> {
        Self::check_table(table)?;
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT hash, created, last_sent, count, data FROM {table} WHERE hash = ?1"
            ))
            .map_err(Error::transient)?;

        let mut rows = Vec::new();
        for hash in hashes {
            let row = stmt
                .query_row(params![hash], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(Error::transient(other)),
                })?;
            if let Some((hash, created, last_sent, count, data)) = row {
                let data = serde_json::from_str(&data).map_err(Error::corruption)?;
                rows.push(DbRow {
                    hash,
                    created,
                    last_sent,
                    count,
                    data,
                });
            }
        }
        Ok(rows)
    }

    pub async fn put(&self, table: &str, rows: &[DbRow]) -> Result<()> {
        Self::check_table(table)?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(Error::transient)?;
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT OR REPLACE INTO {table} (hash, created, last_sent, count, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ))
                .map_err(Error::transient)?;
            for row in rows {
                let data = serde_json::to_string(&row.data).map_err(Error::transient)?;
                stmt.execute(params![row.hash, row.created, row.last_sent, row.count, data])
                    .map_err(Error::transient)?;
            }
        }
        tx.commit().map_err(Error::transient)
    }

    pub async fn delete(&self, table: &str, hashes: &[String]) -> Result<()> {
        Self::check_table(table)?;
        if hashes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(Error::transient)?;
        {
            let mut stmt = tx
                .prepare_cached(&format!("DELETE FROM {table} WHERE hash = ?1"))
                .map_err(Error::transient)?;
            for hash in hashes {
                stmt.execute(params![hash]).map_err(Error::transient)?;
            }
        }
        tx.commit().map_err(Error::transient)
    }

    /// Rows that were not sent today and are older than `created_before`,
    /// oldest first, capped at `limit`.
    pub async fn scan_candidates(
        &self,
        table: &str,
        today: &str,
        created_before: i64,
        limit: usize,
    ) -> Result<Vec<DbRow>> {
        Self::check_table(table)?;
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT hash, created, last_sent, count, data FROM {table}
                 WHERE last_sent != ?1 AND created < ?2
                 ORDER BY created ASC LIMIT ?3"
            ))
            .map_err(Error::transient)?;
        let rows = stmt
            .query_map(params![today, created_before, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(Error::transient)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::transient)?;

        rows.into_iter()
            .map(|(hash, created, last_sent, count, data)| {
                Ok(DbRow {
                    hash,
                    created,
                    last_sent,
                    count,
                    data: serde_json::from_str(&data).map_err(Error::corruption)?,
                })
            })
            .collect()
    }

    pub async fn count(&self, table: &str) -> Result<usize> {
        Self::check_table(table)?;
        let conn = self.conn.lock().await;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(Error::transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(hash: &str, created: i64, last_sent: &str, count: u32) -> DbRow {
        DbRow {
            hash: hash.into(),
            created,
            last_sent: last_sent.into(),
            count,
            data: json!({ "sites": [hash] }),
        }
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let db = TelemetryDb::open_in_memory().unwrap();
        db.put(TOKENS_TABLE, &[row("a", 1, "", 2), row("b", 2, "20230517", 5)])
            .await
            .unwrap();

        let rows = db
            .get(TOKENS_TABLE, &["a".into(), "b".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], row("a", 1, "", 2));

        db.delete(TOKENS_TABLE, &["a".into()]).await.unwrap();
        assert_eq!(db.count(TOKENS_TABLE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replace_overwrites() {
        let db = TelemetryDb::open_in_memory().unwrap();
        db.put(KEYS_TABLE, &[row("a", 1, "", 1)]).await.unwrap();
        db.put(KEYS_TABLE, &[row("a", 1, "20230517", 9)])
            .await
            .unwrap();
        let rows = db.get(KEYS_TABLE, &["a".into()]).await.unwrap();
        assert_eq!(rows[0].count, 9);
        assert_eq!(rows[0].last_sent, "20230517");
    }

    #[tokio::test]
    async fn scan_filters_and_orders() {
        let db = TelemetryDb::open_in_memory().unwrap();
        db.put(
            TOKENS_TABLE,
            &[
                row("old-unsent", 10, "", 3),
                row("older-unsent", 5, "", 3),
                row("sent-today", 1, "20230517", 3),
                row("too-new", 999, "", 3),
            ],
        )
        .await
        .unwrap();

        let rows = db
            .scan_candidates(TOKENS_TABLE, "20230517", 100, 10)
            .await
            .unwrap();
        let hashes: Vec<&str> = rows.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(hashes, vec!["older-unsent", "old-unsent"]);

        let limited = db
            .scan_candidates(TOKENS_TABLE, "20230517", 100, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn unknown_table_is_rejected() {
        let db = TelemetryDb::open_in_memory().unwrap();
        assert!(db.get("users", &[]).await.is_err());
    }

    #[tokio::test]
    async fn persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.db");
        {
            let db = TelemetryDb::open(&path).unwrap();
            db.put(TOKENS_TABLE, &[row("a", 1, "", 1)]).await.unwrap();
        }
        let db = TelemetryDb::open(&path).unwrap();
        assert_eq!(db.count(TOKENS_TABLE).await.unwrap(), 1);
    }
}
