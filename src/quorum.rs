// Quorum client
//
// Maintains the rolling bucket assignment from the quorum config server,
// casts increments for observed URLs and queries consent. Votes are
// deduplicated through a local bloom filter: the same client must never
// increment the same URL twice, or it could reach quorum on its own.

use crate::clock::Clock;
use crate::config::Options;
use crate::digest::sha1_hex;
use crate::error::{Error, Result};
use crate::probe::PersistedBloomFilter;
use crate::selfcheck::{Check, ErrorRate, SelfCheck};
use crate::seqexec::SeqExecutor;
use crate::storage::KvStorage;
use crate::transport::{InstantRequest, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

const STORAGE_KEY: &str = "quorum|config";
const VOTE_PREFIX: &str = "[incQuorum]|";
/// Action the transport resolves to the quorum server base URL.
pub const QUORUM_ACTION: &str = "quorum";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketAssignment {
    last_updated: i64,
    bucket: u8,
}

struct Inner {
    transport: Arc<dyn Transport>,
    storage: Arc<dyn KvStorage>,
    clock: Arc<dyn Clock>,
    voted: PersistedBloomFilter,
    state: Mutex<Option<BucketAssignment>>,
    /// Texts whose local vote bookkeeping failed; consent for them is
    /// answered `false` without asking the server.
    bad_keys: Mutex<HashSet<String>>,
    errors: ErrorRate,
    ttl_ms: i64,
}

impl Inner {
    async fn bucket_if_fresh(&self, now: i64) -> Option<u8> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .filter(|s| s.last_updated <= now && now - s.last_updated < self.ttl_ms)
            .map(|s| s.bucket)
    }

    /// Serialized through the SeqExecutor: at most one refresh in flight.
    async fn refresh(&self, force: bool) -> Result<()> {
        let now = self.clock.now_ms();
        if !force && self.bucket_if_fresh(now).await.is_some() {
            return Ok(());
        }

        // A persisted assignment from the future means the clock jumped
        // backwards. Drop it, in memory too, and load from the server.
        if let Ok(Some(value)) = self.storage.get(STORAGE_KEY).await {
            match serde_json::from_value::<BucketAssignment>(value) {
                Ok(persisted) if persisted.last_updated > now => {
                    tracing::warn!("clock jumped backwards, discarding quorum config");
                    let _ = self.storage.remove(STORAGE_KEY).await;
                    *self.state.lock().await = None;
                }
                Ok(persisted) if !force && now - persisted.last_updated < self.ttl_ms => {
                    *self.state.lock().await = Some(persisted);
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("dropping corrupted quorum config: {err}");
                    let _ = self.storage.remove(STORAGE_KEY).await;
                }
            }
        }

        let response = self
            .transport
            .send_instant(InstantRequest {
                action: QUORUM_ACTION.into(),
                path: "/config".into(),
                method: "GET",
            })
            .await
            .map_err(|err| {
                self.errors.record_failure();
                Error::transient(format!("quorum config fetch failed: {err:#}"))
            })?;
        if !response.ok {
            self.errors.record_failure();
            return Err(Error::Transient(format!(
                "quorum config fetch returned {}",
                response.status
            )));
        }

        let bucket = response
            .json()
            .get("oc")
            .and_then(|v| v.as_u64())
            .filter(|oc| *oc <= 255)
            .ok_or_else(|| {
                self.errors.record_failure();
                Error::Corruption("quorum config without valid oc".into())
            })? as u8;
        self.errors.record_success();

        let assignment = BucketAssignment {
            last_updated: now,
            bucket,
        };
        self.storage
            .set(
                STORAGE_KEY,
                serde_json::to_value(&assignment).map_err(Error::transient)?,
            )
            .await
            .map_err(Error::transient)?;
        *self.state.lock().await = Some(assignment);
        Ok(())
    }
}

pub struct QuorumClient {
    inner: Arc<Inner>,
    exec: SeqExecutor,
}

impl QuorumClient {
    pub fn new(
        options: &Options,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn KvStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                voted: PersistedBloomFilter::new("quorum-votes", 1, storage.clone())?,
                storage,
                clock,
                state: Mutex::new(None),
                bad_keys: Mutex::new(HashSet::new()),
                errors: ErrorRate::default(),
                ttl_ms: options.quorum_config_ttl.as_millis() as i64,
            }),
            exec: SeqExecutor::new(),
        })
    }

    /// Refresh the bucket assignment. Refuses to hit the server unless
    /// forced or the TTL expired; concurrent calls collapse to one fetch.
    pub async fn update_config(&self, force: bool) -> Result<()> {
        let inner = self.inner.clone();
        self.exec.run(async move { inner.refresh(force).await }).await?
    }

    /// Cast one increment for `text`. Idempotent: a repeated call for
    /// the same text performs no network I/O.
    pub async fn send_quorum_increment(&self, text: &str) -> Result<()> {
        let vote_key = format!("{VOTE_PREFIX}{text}");
        if self.inner.voted.test(&vote_key).await? {
            return Ok(());
        }

        // A stale assignment blocks the increment until refreshed.
        self.update_config(false).await?;
        let now = self.inner.clock.now_ms();
        let bucket = self
            .inner
            .bucket_if_fresh(now)
            .await
            .ok_or_else(|| Error::Transient("no quorum bucket assignment".into()))?;

        let digest = sha1_hex(text);
        let response = self
            .inner
            .transport
            .send_instant(InstantRequest {
                action: QUORUM_ACTION.into(),
                path: format!("/incrquorum?hu={digest}&oc={bucket}"),
                method: "GET",
            })
            .await
            .map_err(|err| {
                self.inner.errors.record_failure();
                Error::transient(format!("quorum increment failed: {err:#}"))
            })?;
        if !response.ok {
            self.inner.errors.record_failure();
            return Err(Error::Transient(format!(
                "quorum increment returned {}",
                response.status
            )));
        }
        self.inner.errors.record_success();

        if let Err(err) = self.inner.voted.add(&vote_key).await {
            // The vote went out but we cannot remember it. A retry could
            // double-vote, so consent for this text is poisoned instead.
            tracing::warn!("failed to record quorum vote: {err}");
            self.inner.bad_keys.lock().await.insert(text.to_string());
        }
        Ok(())
    }

    /// Whether `text` reached quorum across the population.
    pub async fn check_quorum_consent(&self, text: &str) -> Result<bool> {
        if self.inner.bad_keys.lock().await.contains(text) {
            return Ok(false);
        }

        let digest = sha1_hex(text);
        let response = self
            .inner
            .transport
            .send_instant(InstantRequest {
                action: QUORUM_ACTION.into(),
                path: format!("/checkquorum?hu={digest}"),
                method: "GET",
            })
            .await
            .map_err(|err| {
                self.inner.errors.record_failure();
                Error::transient(format!("quorum consent check failed: {err:#}"))
            })?;
        if !response.ok {
            self.inner.errors.record_failure();
            return Err(Error::Transient(format!(
                "quorum consent check returned {}",
                response.status
            )));
        }
        self.inner.errors.record_success();

        Ok(response
            .json()
            .get("result")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.voted.flush().await
    }
}

impl SelfCheck for QuorumClient {
    fn self_check(&self) -> Vec<Check> {
        vec![self.inner.errors.check("quorum-errors", 0.2)]
    }
}
