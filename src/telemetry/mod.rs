// Request/token telemetry pipeline
//
// Observes third-party request URLs, extracts suspicious query-string
// pairs, and aggregates them into two report streams: per-token
// (`wtm.tokens`) and per-key-per-site (`wtm.keys`). Nothing leaves the
// client unhashed, and nothing leaves at all until the aggregation
// thresholds say an entry cannot identify anyone.
//
//   request-observed
//       │ per-request step (hash, tracker test, safety verdict)
//       ▼
//   buffer ──(10 s tick)──► token pipeline ──► send cycle ──► wtm.tokens
//                       └──► key pipeline  ──► send cycle ──► wtm.keys

pub mod block_list;
pub mod cached_entry;
pub mod db;
pub mod keys;
pub mod tokens;

use crate::clock::Clock;
use crate::config::Options;
use crate::digest::{md5_hex, truncated_hash};
use crate::error::Result;
use crate::selfcheck::{Check, CheckStatus, SelfCheck};
use crate::storage::KvStorage;
use crate::transport::OutboundMessage;
use crate::whitelist::QsWhitelist;
use block_list::TokenDomainBlocklist;
use cached_entry::{CachedEntryPipeline, PipelineLimits};
use db::TelemetryDb;
use keys::KeyKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokens::TokenKind;
use tokio::sync::Mutex;
use url::Url;

pub const TOKENS_ACTION: &str = "wtm.tokens";
pub const KEYS_ACTION: &str = "wtm.keys";

/// One extracted (key, value) observation, ready for both pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItem {
    pub day: String,
    /// md5 of the query-string key.
    pub key_hash: String,
    /// md5 of the query-string value.
    pub token_hash: String,
    /// Truncated hash of the third-party general domain.
    pub tracker: String,
    /// Truncated hash of the first-party general domain.
    pub site: String,
    pub safe: bool,
    pub is_tracker: bool,
}

/// Pre-digested view of a request URL.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlParts {
    pub general_domain: String,
    pub params: Vec<(String, String)>,
}

impl UrlParts {
    pub fn parse(url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        Some(Self {
            general_domain: general_domain(host),
            params: parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        })
    }
}

/// Registrable-domain approximation: the last two labels, or three when
/// the second-to-last is a well-known second-level registry under a
/// two-letter ccTLD (`co.uk`, `com.au`, ...).
pub fn general_domain(host: &str) -> String {
    const SECOND_LEVEL: &[&str] = &["co", "com", "net", "org", "gov", "ac", "edu"];
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host.to_string();
    }
    let tld = labels[labels.len() - 1];
    let second = labels[labels.len() - 2];
    let keep = if tld.len() == 2 && SECOND_LEVEL.contains(&second) {
        3
    } else {
        2
    };
    labels[labels.len() - keep.min(labels.len())..].join(".")
}

/// Filter for query-string values worth tracking. Short values, constant
/// runs and timestamp-shaped numbers carry no identity.
pub fn should_check_token(value: &str) -> bool {
    if value.len() < 8 {
        return false;
    }
    let mut chars = value.chars();
    let first = chars.next().unwrap_or_default();
    if value.chars().all(|c| c == first) {
        return false;
    }
    if value.chars().all(|c| c.is_ascii_digit()) && looks_like_timestamp(value) {
        return false;
    }
    true
}

fn looks_like_timestamp(digits: &str) -> bool {
    match digits.len() {
        // YYYYMMDD
        8 => digits.starts_with("19") || digits.starts_with("20"),
        // unix seconds / milliseconds of the current era
        10 | 13 => digits.starts_with('1') || digits.starts_with('2'),
        _ => false,
    }
}

#[derive(Debug, Default)]
struct TelemetryStats {
    observed: AtomicU64,
    dropped_private: AtomicU64,
    buffered: AtomicU64,
}

pub struct RequestTelemetry {
    whitelist: Arc<QsWhitelist>,
    block_list: TokenDomainBlocklist,
    tokens: CachedEntryPipeline<TokenKind>,
    keys: CachedEntryPipeline<KeyKind>,
    clock: Arc<dyn Clock>,
    message_version: u32,
    buffer: Mutex<Vec<BatchItem>>,
    stats: TelemetryStats,
}

impl RequestTelemetry {
    pub fn new(
        options: &Options,
        whitelist: Arc<QsWhitelist>,
        db: Arc<TelemetryDb>,
        storage: Arc<dyn KvStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limits = PipelineLimits {
            min_count: options.min_count,
            new_entry_min_age_ms: options.new_entry_min_age.as_millis() as i64,
            low_count_discard_age_ms: options.low_count_discard_age.as_millis() as i64,
            message_size: options.token_message_size,
            batch_limit: options.batch_limit,
        };
        Self {
            whitelist,
            block_list: TokenDomainBlocklist::new(
                options.token_domain_count_threshold,
                storage,
                clock.clone(),
            ),
            tokens: CachedEntryPipeline::new(TokenKind, db.clone(), clock.clone(), limits.clone()),
            keys: CachedEntryPipeline::new(
                KeyKind {
                    tokens_limit: options.key_tokens_limit,
                },
                db,
                clock.clone(),
                limits,
            ),
            clock,
            message_version: options.message_version,
            buffer: Mutex::new(Vec::new()),
            stats: TelemetryStats::default(),
        }
    }

    pub async fn load(&self) {
        self.block_list.load().await;
    }

    /// The per-request step: drop private traffic, hash both parties,
    /// judge every extractable pair and buffer it for the batch tick.
    pub async fn observe_request(&self, url: &str, tab_url: &str, is_private: bool) {
        self.stats.observed.fetch_add(1, Ordering::Relaxed);
        if is_private {
            self.stats.dropped_private.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(parts) = UrlParts::parse(url) else {
            return;
        };
        let Some(tab_parts) = UrlParts::parse(tab_url) else {
            return;
        };
        // Only third-party requests are interesting.
        if parts.general_domain == tab_parts.general_domain || parts.params.is_empty() {
            return;
        }

        let tracker = truncated_hash(&parts.general_domain);
        let site = truncated_hash(&tab_parts.general_domain);
        let is_tracker = self.whitelist.is_tracker_domain(&tracker).await;
        let day = self.clock.day();

        let mut items = Vec::new();
        for (key, value) in &parts.params {
            if !should_check_token(value) {
                continue;
            }
            let key_hash = md5_hex(key);
            let token_hash = md5_hex(value);

            if let Err(err) = self.block_list.record(&token_hash, &site).await {
                tracing::warn!("token block list update failed: {err}");
            }
            let blocked = self.block_list.is_blocked(&token_hash).await;
            let safe = !blocked
                && (!is_tracker
                    || self.whitelist.is_safe_key(&tracker, &key_hash).await
                    || self.whitelist.is_safe_token(&tracker, &token_hash).await);

            items.push(BatchItem {
                day: day.clone(),
                key_hash,
                token_hash,
                tracker: tracker.clone(),
                site: site.clone(),
                safe,
                is_tracker,
            });
        }
        if !items.is_empty() {
            self.stats
                .buffered
                .fetch_add(items.len() as u64, Ordering::Relaxed);
            self.buffer.lock().await.extend(items);
        }
    }

    /// The 10 s batch tick: drain the buffer grouped by token value and
    /// feed both pipelines.
    pub async fn process_buffer(&self) -> usize {
        let mut items: Vec<BatchItem> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if items.is_empty() {
            return 0;
        }
        items.sort_by(|a, b| a.token_hash.cmp(&b.token_hash));
        let count = items.len();
        self.tokens.process_batch(&items).await;
        self.keys.process_batch(&items).await;
        count
    }

    /// Token send cycle, returning the finished messages.
    pub async fn send_tokens(&self) -> Result<Vec<OutboundMessage>> {
        let payloads = self.tokens.send_cycle().await?;
        Ok(self.wrap(TOKENS_ACTION, payloads))
    }

    /// Key send cycle, returning the finished messages.
    pub async fn send_keys(&self) -> Result<Vec<OutboundMessage>> {
        let payloads = self.keys.send_cycle().await?;
        Ok(self.wrap(KEYS_ACTION, payloads))
    }

    fn wrap(
        &self,
        action: &str,
        payloads: Vec<cached_entry::MessagePayload>,
    ) -> Vec<OutboundMessage> {
        payloads
            .into_iter()
            .map(|message| OutboundMessage {
                action: action.to_string(),
                payload: message.payload,
                ver: self.message_version,
                deduplicate_by: Some(message.deduplicate_by),
            })
            .collect()
    }

    /// The 4 min clean cycle across both tables plus block list expiry.
    pub async fn clean(&self) -> Result<()> {
        self.tokens.clean_cycle().await?;
        self.keys.clean_cycle().await?;
        self.block_list.prune().await;
        self.whitelist.prune_safe_keys().await;
        Ok(())
    }

    pub async fn buffered_items(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

impl SelfCheck for RequestTelemetry {
    fn self_check(&self) -> Vec<Check> {
        let observed = self.stats.observed.load(Ordering::Relaxed);
        let buffered = self.stats.buffered.load(Ordering::Relaxed);
        let dropped = self.stats.dropped_private.load(Ordering::Relaxed);
        vec![Check {
            name: "request-telemetry",
            status: CheckStatus::Pass,
            reason: Some(format!(
                "{observed} observed, {buffered} buffered, {dropped} private dropped"
            )),
        }]
    }
}
