// Shared cached-entry pipeline
//
// The token and key pipelines differ only in what an entry aggregates
// and how payloads are grouped; everything else - cache maintenance,
// send thresholds, the send cycle with its DB merge, the clean cycle -
// is this one structure, parameterized by an `EntryKind`.

use crate::clock::Clock;
use crate::error::Result;
use crate::telemetry::db::{DbRow, TelemetryDb};
use crate::telemetry::BatchItem;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Rows inspected per clean cycle.
const CLEAN_SCAN_LIMIT: usize = 1000;

/// One outbound payload plus its deduplication key.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePayload {
    pub payload: Value,
    pub deduplicate_by: String,
}

/// The kind-specific operations of a pipeline.
pub trait EntryKind: Send + Sync + 'static {
    type Entry: Clone + Send;

    /// Which telemetry table backs this pipeline.
    fn table(&self) -> &'static str;

    /// Cache key of the entry an item contributes to.
    fn cache_key(&self, item: &BatchItem) -> String;

    fn empty_entry(&self) -> Self::Entry;

    /// Fold one observed item into the entry.
    fn update_entry(&self, entry: &mut Self::Entry, item: &BatchItem);

    /// Merge a persisted row's data into the entry (the DB is the
    /// authoritative history).
    fn merge_row(&self, entry: &mut Self::Entry, data: &Value);

    fn serialise(&self, entry: &Self::Entry) -> Value;

    /// Entry was seen on more than one first party.
    fn multi_site(&self, entry: &Self::Entry) -> bool;

    /// Build outbound payloads for a batch of entries.
    fn payloads(&self, day: &str, batch: &[(String, Self::Entry)]) -> Vec<MessagePayload>;

    /// Whether a raw DB row still carries reportable data.
    fn has_data(&self, data: &Value) -> bool;
}

/// Common fields wrapped around every kind-specific entry.
#[derive(Debug, Clone)]
pub struct CachedEntry<E> {
    pub inner: E,
    pub created: i64,
    pub last_sent: String,
    pub count: u32,
    pub dirty: bool,
}

/// Thresholds shared by both pipelines; values come from `Options`.
#[derive(Debug, Clone)]
pub struct PipelineLimits {
    pub min_count: u32,
    pub new_entry_min_age_ms: i64,
    pub low_count_discard_age_ms: i64,
    pub message_size: usize,
    pub batch_limit: usize,
}

pub struct CachedEntryPipeline<K: EntryKind> {
    kind: K,
    db: Arc<TelemetryDb>,
    clock: Arc<dyn Clock>,
    limits: PipelineLimits,
    cache: Mutex<HashMap<String, CachedEntry<K::Entry>>>,
    send_queue: Mutex<VecDeque<String>>,
    queued: Mutex<HashSet<String>>,
}

impl<K: EntryKind> CachedEntryPipeline<K> {
    pub fn new(
        kind: K,
        db: Arc<TelemetryDb>,
        clock: Arc<dyn Clock>,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            kind,
            db,
            clock,
            limits,
            cache: Mutex::new(HashMap::new()),
            send_queue: Mutex::new(VecDeque::new()),
            queued: Mutex::new(HashSet::new()),
        }
    }

    /// Fold a processed batch of observed items into the cache and
    /// queue entries that crossed the send threshold.
    pub async fn process_batch(&self, items: &[BatchItem]) {
        let now = self.clock.now_ms();
        let today = self.clock.day();
        let mut to_queue = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for item in items {
                let key = self.kind.cache_key(item);
                let entry = cache.entry(key.clone()).or_insert_with(|| CachedEntry {
                    inner: self.kind.empty_entry(),
                    created: now,
                    last_sent: String::new(),
                    count: 0,
                    dirty: true,
                });
                self.kind.update_entry(&mut entry.inner, item);
                entry.count += 1;
                entry.dirty = true;

                let old_enough = entry.created < now - self.limits.new_entry_min_age_ms;
                let over_threshold = self.kind.multi_site(&entry.inner)
                    || (entry.count > self.limits.min_count && old_enough);
                if entry.last_sent != today && over_threshold {
                    to_queue.push(key);
                }
            }
        }
        for key in to_queue {
            self.enqueue(key).await;
        }
    }

    async fn enqueue(&self, key: String) {
        let mut queued = self.queued.lock().await;
        if queued.insert(key.clone()) {
            self.send_queue.lock().await.push_back(key);
        }
    }

    /// One send cycle: pop the pending queue, merge the authoritative
    /// DB rows, emit messages up to the batch limit, persist what was
    /// sent and re-enqueue the overflow.
    pub async fn send_cycle(&self) -> Result<Vec<MessagePayload>> {
        let today = self.clock.day();

        let candidates: Vec<String> = {
            let mut queue = self.send_queue.lock().await;
            let mut queued = self.queued.lock().await;
            let drained: Vec<String> = queue.drain(..).collect();
            for key in &drained {
                queued.remove(key);
            }
            drained
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // The DB row is merged into memory strictly before emission.
        let rows = self.db.get(self.kind.table(), &candidates).await?;
        let row_map: HashMap<String, DbRow> =
            rows.into_iter().map(|row| (row.hash.clone(), row)).collect();

        let mut eligible = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for key in candidates {
                let entry = cache.entry(key.clone()).or_insert_with(|| CachedEntry {
                    inner: self.kind.empty_entry(),
                    created: self.clock.now_ms(),
                    last_sent: String::new(),
                    count: 0,
                    dirty: true,
                });
                if let Some(row) = row_map.get(&key) {
                    self.kind.merge_row(&mut entry.inner, &row.data);
                    entry.created = entry.created.min(row.created);
                    entry.count = entry.count.max(row.count);
                    if row.last_sent > entry.last_sent {
                        entry.last_sent = row.last_sent.clone();
                    }
                }
                if entry.last_sent != today {
                    eligible.push(key);
                }
            }
        }

        // Cap this tick and re-enqueue the rest.
        let max_entries = self.limits.batch_limit * self.limits.message_size;
        let overflow = eligible.split_off(eligible.len().min(max_entries));
        for key in overflow {
            self.enqueue(key).await;
        }
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        let mut sent_rows = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for chunk in eligible.chunks(self.limits.message_size) {
                let batch: Vec<(String, K::Entry)> = chunk
                    .iter()
                    .filter_map(|key| {
                        cache.get(key).map(|entry| (key.clone(), entry.inner.clone()))
                    })
                    .collect();
                messages.extend(self.kind.payloads(&today, &batch));
            }
            for key in &eligible {
                if let Some(entry) = cache.get_mut(key) {
                    entry.last_sent = today.clone();
                    entry.dirty = false;
                    sent_rows.push(DbRow {
                        hash: key.clone(),
                        created: entry.created,
                        last_sent: entry.last_sent.clone(),
                        count: entry.count,
                        data: self.kind.serialise(&entry.inner),
                    });
                }
            }
        }
        // Persist before handing the messages to the send callback.
        self.db.put(self.kind.table(), &sent_rows).await?;
        Ok(messages)
    }

    /// One clean cycle: requeue persisted rows that still have data,
    /// discard stale low-count rows, persist dirty cache entries and
    /// evict entries that are sent and clean.
    pub async fn clean_cycle(&self) -> Result<()> {
        let now = self.clock.now_ms();
        let today = self.clock.day();

        let rows = self
            .db
            .scan_candidates(
                self.kind.table(),
                &today,
                now - self.limits.new_entry_min_age_ms,
                CLEAN_SCAN_LIMIT,
            )
            .await?;

        let mut to_delete = Vec::new();
        for row in rows {
            if self.kind.has_data(&row.data) && row.count > self.limits.min_count {
                self.enqueue(row.hash).await;
            } else if row.created < now - self.limits.low_count_discard_age_ms {
                to_delete.push(row.hash);
            }
        }
        self.db.delete(self.kind.table(), &to_delete).await?;

        // Persist dirty entries, then drop everything sent and clean.
        let dirty_rows: Vec<DbRow> = {
            let mut cache = self.cache.lock().await;
            let rows = cache
                .iter()
                .filter(|(_, entry)| entry.dirty)
                .map(|(key, entry)| DbRow {
                    hash: key.clone(),
                    created: entry.created,
                    last_sent: entry.last_sent.clone(),
                    count: entry.count,
                    data: self.kind.serialise(&entry.inner),
                })
                .collect();
            for entry in cache.values_mut() {
                entry.dirty = false;
            }
            cache.retain(|_, entry| entry.dirty || entry.last_sent != today);
            rows
        };
        self.db.put(self.kind.table(), &dirty_rows).await?;
        Ok(())
    }

    /// Cache size, for self checks and tests.
    pub async fn cached_entries(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn pending_sends(&self) -> usize {
        self.send_queue.lock().await.len()
    }
}
