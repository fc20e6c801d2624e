// Persisted bit array, sharded onto KV keys
//
// A logical array of N bits split into S shards so that single-bit
// updates never rewrite the whole array. Shards load lazily (one
// in-flight load per shard) and flush through a 100 ms debounce. Lost
// writes between flushes are tolerated; the structures built on top are
// probabilistic anyway.
//
// Key layout: `arr|<name>|v<n>|<shard>` - bumping the version orphans
// every old shard at once.

use crate::error::{Error, Result};
use crate::lazyvar::CoalescedLoader;
use crate::storage::KvStorage;
use crate::util::Debouncer;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Shards are at least this many bytes.
const MIN_SHARD_BYTES: usize = 4096;
/// Upper bound on the shard count.
const MAX_SHARDS: usize = 128;
/// Write-behind delay.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(100);

struct Inner {
    name: String,
    version: u32,
    n_bits: usize,
    shard_bytes: usize,
    storage: Arc<dyn KvStorage>,
    shards: Mutex<HashMap<usize, Vec<u8>>>,
    dirty: Mutex<HashSet<usize>>,
    loader: CoalescedLoader<usize, ()>,
}

impl Inner {
    fn shard_key(&self, shard: usize) -> String {
        format!("arr|{}|v{}|{}", self.name, self.version, shard)
    }

    fn key_prefix(&self) -> String {
        format!("arr|{}|v{}|", self.name, self.version)
    }

    /// Load a shard into memory if it is not there yet. Concurrent
    /// callers coalesce onto one storage read.
    async fn ensure_shard(&self, shard: usize) -> Result<()> {
        if self.shards.lock().await.contains_key(&shard) {
            return Ok(());
        }
        self.loader
            .load(shard, || async {
                if self.shards.lock().await.contains_key(&shard) {
                    return Ok(());
                }
                let key = self.shard_key(shard);
                let bytes = match self.storage.get(&key).await.map_err(Error::transient)? {
                    Some(Value::String(encoded)) => match hex::decode(&encoded) {
                        Ok(bytes) if bytes.len() == self.shard_bytes => bytes,
                        _ => {
                            tracing::warn!(key, "dropping corrupted bitarray shard");
                            vec![0u8; self.shard_bytes]
                        }
                    },
                    Some(_) => {
                        tracing::warn!(key, "dropping corrupted bitarray shard");
                        vec![0u8; self.shard_bytes]
                    }
                    None => vec![0u8; self.shard_bytes],
                };
                self.shards.lock().await.insert(shard, bytes);
                Ok(())
            })
            .await
    }

    async fn flush(&self) -> Result<()> {
        let pending: Vec<usize> = self.dirty.lock().await.iter().copied().collect();
        for shard in pending {
            let encoded = {
                let shards = self.shards.lock().await;
                match shards.get(&shard) {
                    Some(bytes) => hex::encode(bytes),
                    None => continue,
                }
            };
            self.storage
                .set(&self.shard_key(shard), Value::String(encoded))
                .await
                .map_err(Error::transient)?;
            self.dirty.lock().await.remove(&shard);
        }
        Ok(())
    }
}

/// Sharded, lazily loaded, debounce-flushed bit array.
pub struct PersistedBitarray {
    inner: Arc<Inner>,
    debouncer: Debouncer,
}

impl PersistedBitarray {
    /// `n_bits` must be positive.
    pub fn new(
        name: impl Into<String>,
        version: u32,
        n_bits: usize,
        storage: Arc<dyn KvStorage>,
    ) -> Result<Self> {
        if n_bits == 0 {
            return Err(Error::BadJob("bit array size must be positive".into()));
        }
        let total_bytes = n_bits.div_ceil(8);
        let n_shards = (total_bytes / MIN_SHARD_BYTES).clamp(1, MAX_SHARDS);
        let shard_bytes = total_bytes.div_ceil(n_shards);

        let inner = Arc::new(Inner {
            name: name.into(),
            version,
            n_bits,
            shard_bytes,
            storage,
            shards: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            loader: CoalescedLoader::new(),
        });

        let flusher = inner.clone();
        let debouncer = Debouncer::new(FLUSH_DEBOUNCE, move || {
            let inner = flusher.clone();
            async move {
                if let Err(err) = inner.flush().await {
                    tracing::warn!("bitarray flush failed: {err}");
                }
            }
        });

        Ok(Self { inner, debouncer })
    }

    /// Logical size in bits.
    pub fn len_bits(&self) -> usize {
        self.inner.n_bits
    }

    fn locate(&self, pos: usize) -> Result<(usize, usize, u8)> {
        if pos >= self.inner.n_bits {
            return Err(Error::BadJob(format!(
                "bit {pos} out of range 0..{}",
                self.inner.n_bits
            )));
        }
        let bits_per_shard = self.inner.shard_bytes * 8;
        let shard = pos / bits_per_shard;
        let offset = pos % bits_per_shard;
        Ok((shard, offset / 8, 1u8 << (offset % 8)))
    }

    pub async fn set(&self, pos: usize) -> Result<()> {
        let (shard, byte, mask) = self.locate(pos)?;
        self.inner.ensure_shard(shard).await?;
        {
            let mut shards = self.inner.shards.lock().await;
            let bytes = shards
                .get_mut(&shard)
                .ok_or_else(|| Error::Transient("shard evicted during set".into()))?;
            if bytes[byte] & mask != 0 {
                return Ok(());
            }
            bytes[byte] |= mask;
        }
        self.inner.dirty.lock().await.insert(shard);
        self.debouncer.trigger();
        Ok(())
    }

    pub async fn test(&self, pos: usize) -> Result<bool> {
        let (shard, byte, mask) = self.locate(pos)?;
        self.inner.ensure_shard(shard).await?;
        let shards = self.inner.shards.lock().await;
        Ok(shards
            .get(&shard)
            .map(|bytes| bytes[byte] & mask != 0)
            .unwrap_or(false))
    }

    /// Write all dirty shards now.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Drop all bits, in memory and in storage.
    pub async fn clear(&self) -> Result<()> {
        self.inner.shards.lock().await.clear();
        self.inner.dirty.lock().await.clear();
        let prefix = self.inner.key_prefix();
        let keys = self.inner.storage.keys().await.map_err(Error::transient)?;
        for key in keys.into_iter().filter(|k| k.starts_with(&prefix)) {
            self.inner
                .storage
                .remove(&key)
                .await
                .map_err(Error::transient)?;
        }
        Ok(())
    }
}
