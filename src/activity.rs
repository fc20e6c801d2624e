// Activity estimator
//
// Accumulates per-URL active time into fixed-width buckets and condenses
// it into a [0,1] score. The score is intentionally coarse; the
// sanitizer quantizes it further before emission.
//
// Bucket width is the next power of two above five minutes, at most
// seven full buckets (~1h) plus the one currently forming.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// `next_pow2(5 min)`.
pub const BUCKET_DURATION_MS: i64 = 524_288;
/// Full buckets kept; the forming bucket makes it 7+1.
pub const MAX_ACTIVE_BUCKETS: usize = 7;
/// Backward clock jumps below this are clamped, larger ones purge state.
pub const MAX_ACCEPTED_DRIFT_MS: i64 = 2 * 60 * 1000;

/// Twenty minutes of activity saturate the score.
const NORM_MS: f64 = 20.0 * 60.0 * 1000.0;
/// Flat credit for a bucket that saw at least one page load.
const LOAD_CREDIT_MS: i64 = 5_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct UrlSlot {
    loads: u32,
    accum: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Bucket {
    idx: i64,
    start: i64,
    urls: HashMap<String, UrlSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ActiveUrl {
    url: String,
    since: i64,
}

/// Serializable estimator state; newest bucket first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActivityState {
    buckets: VecDeque<Bucket>,
    active: Option<ActiveUrl>,
    last_seen: i64,
}

#[derive(Debug, Default)]
pub struct ActivityEstimator {
    state: ActivityState,
    dirty: bool,
}

impl ActivityEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a persisted snapshot. Impossible layouts are refused
    /// so a corrupted snapshot starts the estimator empty instead.
    pub fn restore(value: serde_json::Value) -> Result<Self> {
        let state: ActivityState =
            serde_json::from_value(value).map_err(Error::corruption)?;
        if state.buckets.len() > MAX_ACTIVE_BUCKETS + 1 {
            return Err(Error::Corruption("too many activity buckets".into()));
        }
        let mut last_idx = i64::MAX;
        for bucket in &state.buckets {
            if bucket.idx >= last_idx || bucket.start != bucket.idx * BUCKET_DURATION_MS {
                return Err(Error::Corruption("activity bucket order".into()));
            }
            last_idx = bucket.idx;
        }
        Ok(Self {
            state,
            dirty: false,
        })
    }

    pub fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    /// Whether state changed since the last `take_dirty`.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Clamp small backward jumps, purge everything on large ones.
    fn normalize_now(&mut self, now: i64) -> i64 {
        if now < self.state.last_seen {
            let jump = self.state.last_seen - now;
            if jump < MAX_ACCEPTED_DRIFT_MS {
                return self.state.last_seen;
            }
            tracing::warn!(jump_ms = jump, "clock jumped backwards, resetting activity state");
            self.state = ActivityState::default();
            self.dirty = true;
        }
        self.state.last_seen = now;
        now
    }

    fn bucket_mut(&mut self, now: i64) -> &mut Bucket {
        let idx = now.div_euclid(BUCKET_DURATION_MS);
        let needs_new = self.state.buckets.front().map(|b| b.idx) != Some(idx);
        if needs_new {
            self.state.buckets.push_front(Bucket {
                idx,
                start: idx * BUCKET_DURATION_MS,
                urls: HashMap::new(),
            });
            while self.state.buckets.len() > MAX_ACTIVE_BUCKETS + 1 {
                self.state.buckets.pop_back();
            }
            self.dirty = true;
        }
        self.state.buckets.front_mut().unwrap()
    }

    /// Settle the currently active URL's ongoing interval into buckets.
    fn settle(&mut self, now: i64) {
        if let Some(active) = self.state.active.take() {
            let elapsed = (now - active.since).max(0);
            if elapsed > 0 {
                let bucket = self.bucket_mut(now);
                bucket.urls.entry(active.url.clone()).or_default().accum += elapsed;
                self.dirty = true;
            }
            self.state.active = Some(ActiveUrl {
                since: now,
                ..active
            });
        }
    }

    /// The user switched to `url` (or away from everything, `None`).
    pub fn update_active_url(&mut self, url: Option<&str>, now: i64) {
        let now = self.normalize_now(now);
        self.settle(now);
        self.state.active = url.map(|url| {
            // Allocate the bucket eagerly so a later `estimate` in the
            // same logical task sees it.
            self.bucket_mut(now).urls.entry(url.to_string()).or_default();
            ActiveUrl {
                url: url.to_string(),
                since: now,
            }
        });
        self.dirty = true;
    }

    /// A page load finished in some tab showing `url`.
    pub fn page_load(&mut self, url: &str, now: i64) {
        let now = self.normalize_now(now);
        let bucket = self.bucket_mut(now);
        bucket.urls.entry(url.to_string()).or_default().loads += 1;
        self.dirty = true;
    }

    /// Activity score for `url` in `[0,1]`.
    pub fn estimate(&self, url: &str, now: i64) -> f64 {
        let now = now.max(self.state.last_seen);
        let mut total_ms: i64 = 0;
        for bucket in &self.state.buckets {
            if let Some(slot) = bucket.urls.get(url) {
                total_ms += slot.accum;
                if slot.loads > 0 {
                    total_ms += LOAD_CREDIT_MS;
                }
            }
        }
        if let Some(active) = &self.state.active {
            if active.url == url {
                total_ms += (now - active.since).max(0);
            }
        }
        (total_ms as f64 / NORM_MS).min(1.0)
    }
}
