// Persisted truncated-hash store
//
// Exact membership for "did we already emit this?" questions, backing
// the deduplicating message sender. Entries expire after a TTL; the
// whole set lives under one KV key and is written on demand.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::storage::KvStorage;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default retention for recorded hashes.
pub const DEFAULT_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Encode an entry for persistence. The timestamp comes first so the
/// payload may contain any character, including the separator.
pub fn to_persisted_key(url: &str, created_at: i64) -> String {
    format!("{created_at}|{url}")
}

/// Inverse of [`to_persisted_key`].
pub fn parse_persisted_key(encoded: &str) -> Option<(String, i64)> {
    let (ts, url) = encoded.split_once('|')?;
    Some((url.to_string(), ts.parse().ok()?))
}

pub struct PersistedHashes {
    storage: Arc<dyn KvStorage>,
    clock: Arc<dyn Clock>,
    storage_key: String,
    ttl_ms: i64,
    entries: Mutex<HashMap<String, i64>>,
}

impl PersistedHashes {
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn KvStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            clock,
            storage_key: format!("hashes|{}", name.into()),
            ttl_ms: DEFAULT_TTL_MS,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Restore the persisted set, discarding expired or unreadable rows.
    pub async fn load(&self) -> Result<()> {
        let stored = self
            .storage
            .get(&self.storage_key)
            .await
            .map_err(Error::transient)?;
        let Some(Value::Array(items)) = stored else {
            return Ok(());
        };
        let cutoff = self.clock.now_ms() - self.ttl_ms;
        let mut entries = self.entries.lock().await;
        for item in items {
            if let Some((hash, created_at)) = item.as_str().and_then(parse_persisted_key) {
                if created_at >= cutoff {
                    entries.insert(hash, created_at);
                }
            }
        }
        Ok(())
    }

    pub async fn contains(&self, hash: &str) -> bool {
        self.entries.lock().await.contains_key(hash)
    }

    /// Record a hash. Returns `false` if it was already present.
    pub async fn insert(&self, hash: &str) -> bool {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .await
            .insert(hash.to_string(), now)
            .is_none()
    }

    /// Forget a hash (rollback after a failed send).
    pub async fn remove(&self, hash: &str) {
        self.entries.lock().await.remove(hash);
    }

    /// Drop entries past the TTL. Called from the periodic flush.
    pub async fn expire(&self) {
        let cutoff = self.clock.now_ms() - self.ttl_ms;
        self.entries
            .lock()
            .await
            .retain(|_, created_at| *created_at >= cutoff);
    }

    pub async fn flush(&self) -> Result<()> {
        let encoded: Vec<Value> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .map(|(hash, created_at)| Value::String(to_persisted_key(hash, *created_at)))
                .collect()
        };
        self.storage
            .set(&self.storage_key, Value::Array(encoded))
            .await
            .map_err(Error::transient)
    }
}
