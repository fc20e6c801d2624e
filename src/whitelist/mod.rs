// Query-string whitelist
//
// Answers three questions for the request telemetry: is this third-party
// domain a tracker, and is this (domain, key) or (domain, token) pair
// known to be non-identifying. The bulk of the answers live in a packed
// bloom filter shipped by the CDN; a small local safe-key cache covers
// pairs this client learned before the server did.

pub mod packed;

use crate::clock::Clock;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::lazyvar::LazyVar;
use crate::storage::KvStorage;
use packed::PackedBloomFilter;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::Mutex;

const VERSION_KEY: &str = "qswl|version";
const FILTER_KEY: &str = "qswl|filter";
const SAFE_KEYS_KEY: &str = "qswl|safe-keys";

/// Locally learned safe keys expire after a week; the server either
/// confirmed them into the bloom filter by then or they were wrong.
const SAFE_KEY_TTL_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
struct UpdateManifest {
    version: String,
    #[serde(default, rename = "useDiff")]
    use_diff: bool,
}

pub struct QsWhitelist {
    client: reqwest::Client,
    cdn_url: String,
    storage: Arc<dyn KvStorage>,
    clock: Arc<dyn Clock>,
    filter: Mutex<LazyVar<Arc<PackedBloomFilter>>>,
    version: Mutex<Option<String>>,
    /// tracker hash -> key hash -> day added.
    safe_keys: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl QsWhitelist {
    pub fn new(options: &Options, storage: Arc<dyn KvStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cdn_url: options.whitelist_cdn_url.clone(),
            storage,
            clock,
            filter: Mutex::new(LazyVar::Cancelled),
            version: Mutex::new(None),
            safe_keys: Mutex::new(HashMap::new()),
        }
    }

    /// Restore the persisted filter, version and safe-key cache.
    pub async fn load(&self) {
        match self.storage.get(VERSION_KEY).await {
            Ok(Some(Value::String(version))) => {
                *self.version.lock().await = Some(version);
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("failed to read whitelist version: {err:#}"),
        }

        match self.storage.get(FILTER_KEY).await {
            Ok(Some(Value::String(encoded))) => {
                match hex::decode(&encoded)
                    .map_err(Error::corruption)
                    .and_then(|bytes| PackedBloomFilter::from_bytes(&bytes))
                {
                    Ok(filter) => {
                        self.filter.lock().await.resolve(Arc::new(filter));
                    }
                    Err(err) => {
                        tracing::warn!("dropping corrupted whitelist filter: {err}");
                        let _ = self.storage.remove(FILTER_KEY).await;
                        let _ = self.storage.remove(VERSION_KEY).await;
                        *self.version.lock().await = None;
                    }
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("failed to read whitelist filter: {err:#}"),
        }

        if let Ok(Some(value)) = self.storage.get(SAFE_KEYS_KEY).await {
            match serde_json::from_value(value) {
                Ok(map) => *self.safe_keys.lock().await = map,
                Err(err) => tracing::warn!("dropping corrupted safe-key cache: {err}"),
            }
        }
        self.prune_safe_keys().await;
    }

    async fn fetch_gz(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.cdn_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Error::transient)?
            .error_for_status()
            .map_err(Error::transient)?;
        let bytes = response.bytes().await.map_err(Error::transient)?;
        gunzip(&bytes)
    }

    /// Check the CDN for a new filter version; apply the one-day diff
    /// when offered, otherwise reload the full filter.
    pub async fn update(&self) -> Result<()> {
        let manifest_bytes = self.fetch_gz("update.json.gz").await?;
        let manifest: UpdateManifest =
            serde_json::from_slice(&manifest_bytes).map_err(Error::corruption)?;

        if self.version.lock().await.as_deref() == Some(manifest.version.as_str()) {
            return Ok(());
        }

        let current = self.filter.lock().await.snapshot();
        let next = if manifest.use_diff && current.is_some() {
            let diff_bytes = self
                .fetch_gz(&format!("{}/bf_diff_1.gz", manifest.version))
                .await?;
            let diff = PackedBloomFilter::from_bytes(&diff_bytes)?;
            let mut merged = (*current.unwrap()).clone();
            merged.merge(&diff)?;
            merged
        } else {
            let full_bytes = self
                .fetch_gz(&format!("{}/bloom_filter.gz", manifest.version))
                .await?;
            PackedBloomFilter::from_bytes(&full_bytes)?
        };

        self.storage
            .set(FILTER_KEY, Value::String(hex::encode(next.to_bytes())))
            .await
            .map_err(Error::transient)?;
        self.storage
            .set(VERSION_KEY, Value::String(manifest.version.clone()))
            .await
            .map_err(Error::transient)?;

        self.filter.lock().await.resolve(Arc::new(next));
        *self.version.lock().await = Some(manifest.version);
        Ok(())
    }

    async fn filter(&self) -> Option<Arc<PackedBloomFilter>> {
        self.filter.lock().await.get().await
    }

    /// Whether the third-party domain (truncated hash) is a tracker.
    pub async fn is_tracker_domain(&self, domain_hash: &str) -> bool {
        match self.filter().await {
            Some(filter) => filter.contains(domain_hash),
            None => false,
        }
    }

    /// Whether `(tracker, key)` is known non-identifying.
    pub async fn is_safe_key(&self, tracker_hash: &str, key_hash: &str) -> bool {
        if let Some(keys) = self.safe_keys.lock().await.get(tracker_hash) {
            if keys.contains_key(key_hash) {
                return true;
            }
        }
        match self.filter().await {
            Some(filter) => filter.contains(&format!("{tracker_hash}{key_hash}")),
            None => false,
        }
    }

    /// Whether `(tracker, token)` is known non-identifying.
    pub async fn is_safe_token(&self, tracker_hash: &str, token_hash: &str) -> bool {
        match self.filter().await {
            Some(filter) => filter.contains(&format!("{tracker_hash}{token_hash}")),
            None => false,
        }
    }

    /// Learn a safe key locally until the server picks it up.
    pub async fn add_safe_key(&self, tracker_hash: &str, key_hash: &str) -> Result<()> {
        let day = self.clock.day();
        {
            let mut safe_keys = self.safe_keys.lock().await;
            safe_keys
                .entry(tracker_hash.to_string())
                .or_default()
                .insert(key_hash.to_string(), day);
        }
        self.persist_safe_keys().await
    }

    /// Drop locally learned keys older than the TTL.
    pub async fn prune_safe_keys(&self) {
        let Ok(today) = chrono::NaiveDate::parse_from_str(&self.clock.day(), "%Y%m%d") else {
            return;
        };
        let mut safe_keys = self.safe_keys.lock().await;
        for keys in safe_keys.values_mut() {
            keys.retain(|_, day| {
                chrono::NaiveDate::parse_from_str(day, "%Y%m%d")
                    .map(|d| (today - d).num_days() <= SAFE_KEY_TTL_DAYS)
                    .unwrap_or(false)
            });
        }
        safe_keys.retain(|_, keys| !keys.is_empty());
    }

    async fn persist_safe_keys(&self) -> Result<()> {
        let snapshot = {
            let safe_keys = self.safe_keys.lock().await;
            serde_json::to_value(&*safe_keys).map_err(Error::transient)?
        };
        self.storage
            .set(SAFE_KEYS_KEY, snapshot)
            .await
            .map_err(Error::transient)
    }

    pub async fn version(&self) -> Option<String> {
        self.version.lock().await.clone()
    }
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| Error::Corruption(format!("gzip decode failed: {err}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn whitelist(
        cdn: &str,
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
    ) -> QsWhitelist {
        let options = Options {
            whitelist_cdn_url: cdn.to_string(),
            ..Options::default()
        };
        QsWhitelist::new(&options, storage as Arc<dyn KvStorage>, clock)
    }

    fn manifest(version: &str, use_diff: bool) -> Vec<u8> {
        gzip(
            serde_json::to_string(&serde_json::json!({
                "version": version,
                "useDiff": use_diff,
            }))
            .unwrap()
            .as_bytes(),
        )
    }

    #[tokio::test]
    async fn full_update_loads_filter() {
        let mut server = mockito::Server::new_async().await;
        let mut filter = PackedBloomFilter::empty(128, 7).unwrap();
        filter.insert("trackerhash0000");
        server
            .mock("GET", "/update.json.gz")
            .with_body(manifest("20240110", false))
            .create_async()
            .await;
        server
            .mock("GET", "/20240110/bloom_filter.gz")
            .with_body(gzip(&filter.to_bytes()))
            .create_async()
            .await;

        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_684_332_000_000));
        let whitelist = whitelist(&server.url(), storage.clone(), clock.clone());

        whitelist.update().await.unwrap();
        assert!(whitelist.is_tracker_domain("trackerhash0000").await);
        assert!(!whitelist.is_tracker_domain("otherhash").await);
        assert_eq!(whitelist.version().await.as_deref(), Some("20240110"));

        // A fresh instance restores from storage without the network.
        let restored = super::tests::whitelist("http://unused.invalid", storage, clock);
        restored.load().await;
        assert!(restored.is_tracker_domain("trackerhash0000").await);
    }

    #[tokio::test]
    async fn same_version_is_a_noop() {
        let mut server = mockito::Server::new_async().await;
        let filter = PackedBloomFilter::empty(128, 7).unwrap();
        server
            .mock("GET", "/update.json.gz")
            .with_body(manifest("v1", false))
            .expect(2)
            .create_async()
            .await;
        let full = server
            .mock("GET", "/v1/bloom_filter.gz")
            .with_body(gzip(&filter.to_bytes()))
            .expect(1)
            .create_async()
            .await;

        let whitelist = whitelist(
            &server.url(),
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(0)),
        );
        whitelist.update().await.unwrap();
        whitelist.update().await.unwrap();
        full.assert_async().await;
    }

    #[tokio::test]
    async fn diff_update_merges() {
        let mut server = mockito::Server::new_async().await;
        let mut base = PackedBloomFilter::empty(128, 7).unwrap();
        base.insert("old.example");
        let mut diff = PackedBloomFilter::empty(128, 7).unwrap();
        diff.insert("new.example");

        server
            .mock("GET", "/update.json.gz")
            .with_body(manifest("day1", false))
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/day1/bloom_filter.gz")
            .with_body(gzip(&base.to_bytes()))
            .create_async()
            .await;

        let whitelist = whitelist(
            &server.url(),
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(0)),
        );
        whitelist.update().await.unwrap();

        server.reset_async().await;
        server
            .mock("GET", "/update.json.gz")
            .with_body(manifest("day2", true))
            .create_async()
            .await;
        server
            .mock("GET", "/day2/bf_diff_1.gz")
            .with_body(gzip(&diff.to_bytes()))
            .create_async()
            .await;

        whitelist.update().await.unwrap();
        assert!(whitelist.is_tracker_domain("old.example").await);
        assert!(whitelist.is_tracker_domain("new.example").await);
        assert_eq!(whitelist.version().await.as_deref(), Some("day2"));
    }

    #[tokio::test]
    async fn safe_keys_cache_and_expire() {
        let storage = Arc::new(MemoryStorage::new());
        // 2023-05-17
        let clock = Arc::new(ManualClock::new(1_684_332_000_000));
        let whitelist = whitelist("http://unused.invalid", storage.clone(), clock.clone());

        assert!(!whitelist.is_safe_key("tr", "k1").await);
        whitelist.add_safe_key("tr", "k1").await.unwrap();
        assert!(whitelist.is_safe_key("tr", "k1").await);

        // Persisted: a restart sees it too.
        let restored =
            super::tests::whitelist("http://unused.invalid", storage, clock.clone());
        restored.load().await;
        assert!(restored.is_safe_key("tr", "k1").await);

        // Eight days later the local entry is gone.
        clock.advance(8 * 24 * 60 * 60 * 1000);
        restored.prune_safe_keys().await;
        assert!(!restored.is_safe_key("tr", "k1").await);
    }

    #[tokio::test]
    async fn missing_filter_answers_false() {
        let whitelist = whitelist(
            "http://unused.invalid",
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(0)),
        );
        assert!(!whitelist.is_tracker_domain("x").await);
        assert!(!whitelist.is_safe_token("x", "y").await);
    }

    #[tokio::test]
    async fn corrupted_persisted_filter_is_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set(FILTER_KEY, Value::String("zz-not-hex".into()))
            .await
            .unwrap();
        storage
            .set(VERSION_KEY, Value::String("v9".into()))
            .await
            .unwrap();

        let whitelist = whitelist(
            "http://unused.invalid",
            storage.clone(),
            Arc::new(ManualClock::new(0)),
        );
        whitelist.load().await;
        assert!(whitelist.version().await.is_none());
        assert_eq!(storage.get(FILTER_KEY).await.unwrap(), None);
    }
}
