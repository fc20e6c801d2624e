// Token-domain block list
//
// A token that shows up on many distinct first parties is a cross-site
// identifier no matter what the whitelist says. Tokens crossing the
// threshold are blocked for a week.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::storage::KvStorage;
use chrono::{Duration, NaiveDate};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

const BLOCKED_KEY: &str = "tokendomain|blocked";
const BLOCK_EXPIRY_DAYS: i64 = 7;

pub struct TokenDomainBlocklist {
    storage: Arc<dyn KvStorage>,
    clock: Arc<dyn Clock>,
    threshold: usize,
    /// token hash -> first parties it was seen on (in-memory, rebuilt
    /// each run; the block verdicts are what persists).
    seen: Mutex<HashMap<String, HashSet<String>>>,
    /// token hash -> expiry day (YYYYMMDD).
    blocked: Mutex<HashMap<String, String>>,
}

impl TokenDomainBlocklist {
    pub fn new(threshold: usize, storage: Arc<dyn KvStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            threshold,
            seen: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(&self) {
        match self.storage.get(BLOCKED_KEY).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(map) => *self.blocked.lock().await = map,
                Err(err) => tracing::warn!("dropping corrupted token block list: {err}"),
            },
            Ok(None) => {}
            Err(err) => tracing::warn!("failed to read token block list: {err:#}"),
        }
        self.prune().await;
    }

    /// Record one (token, first party) observation. Returns whether the
    /// token just crossed the threshold.
    pub async fn record(&self, token_hash: &str, first_party: &str) -> Result<bool> {
        if self.blocked.lock().await.contains_key(token_hash) {
            return Ok(false);
        }
        let crossed = {
            let mut seen = self.seen.lock().await;
            let sites = seen.entry(token_hash.to_string()).or_default();
            sites.insert(first_party.to_string());
            sites.len() >= self.threshold
        };
        if !crossed {
            return Ok(false);
        }

        let expiry = self.expiry_day();
        {
            let mut blocked = self.blocked.lock().await;
            blocked.insert(token_hash.to_string(), expiry);
        }
        self.seen.lock().await.remove(token_hash);
        self.persist().await?;
        tracing::debug!(token = token_hash, "token crossed first-party threshold");
        Ok(true)
    }

    pub async fn is_blocked(&self, token_hash: &str) -> bool {
        self.blocked.lock().await.contains_key(token_hash)
    }

    /// Drop expired block entries.
    pub async fn prune(&self) {
        let today = self.clock.day();
        let changed = {
            let mut blocked = self.blocked.lock().await;
            let before = blocked.len();
            blocked.retain(|_, expiry| expiry.as_str() > today.as_str());
            blocked.len() != before
        };
        if changed {
            if let Err(err) = self.persist().await {
                tracing::warn!("failed to persist token block list: {err}");
            }
        }
    }

    fn expiry_day(&self) -> String {
        NaiveDate::parse_from_str(&self.clock.day(), "%Y%m%d")
            .map(|day| (day + Duration::days(BLOCK_EXPIRY_DAYS)).format("%Y%m%d").to_string())
            .unwrap_or_default()
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let blocked = self.blocked.lock().await;
            serde_json::to_value(&*blocked).map_err(Error::transient)?
        };
        self.storage
            .set(BLOCKED_KEY, snapshot)
            .await
            .map_err(Error::transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;

    fn blocklist(
        clock: Arc<ManualClock>,
        storage: Arc<MemoryStorage>,
    ) -> TokenDomainBlocklist {
        TokenDomainBlocklist::new(2, storage as Arc<dyn KvStorage>, clock)
    }

    #[tokio::test]
    async fn blocks_after_threshold_sites() {
        let clock = Arc::new(ManualClock::new(1_684_332_000_000));
        let list = blocklist(clock, Arc::new(MemoryStorage::new()));

        assert!(!list.record("uid", "site-a").await.unwrap());
        assert!(!list.is_blocked("uid").await);

        assert!(list.record("uid", "site-b").await.unwrap());
        assert!(list.is_blocked("uid").await);

        // Same site twice never blocks.
        list.record("other", "site-a").await.unwrap();
        assert!(!list.record("other", "site-a").await.unwrap());
        assert!(!list.is_blocked("other").await);
    }

    #[tokio::test]
    async fn block_survives_restart() {
        let clock = Arc::new(ManualClock::new(1_684_332_000_000));
        let storage = Arc::new(MemoryStorage::new());
        {
            let list = blocklist(clock.clone(), storage.clone());
            list.record("uid", "site-a").await.unwrap();
            list.record("uid", "site-b").await.unwrap();
        }
        let list = blocklist(clock, storage);
        list.load().await;
        assert!(list.is_blocked("uid").await);
    }

    #[tokio::test]
    async fn block_expires_after_a_week() {
        let clock = Arc::new(ManualClock::new(1_684_332_000_000));
        let list = blocklist(clock.clone(), Arc::new(MemoryStorage::new()));
        list.record("uid", "site-a").await.unwrap();
        list.record("uid", "site-b").await.unwrap();

        clock.advance(6 * 24 * 60 * 60 * 1000);
        list.prune().await;
        assert!(list.is_blocked("uid").await);

        clock.advance(2 * 24 * 60 * 60 * 1000);
        list.prune().await;
        assert!(!list.is_blocked("uid").await);
    }
}
