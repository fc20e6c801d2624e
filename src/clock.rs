// Trusted clock collaborator.
//
// All components take time through this trait so that tests can drive it
// manually. Day and hour strings are the canonical `YYYYMMDD` /
// `YYYYMMDDHH` forms used in message payloads and send bookkeeping.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock time and canonical day/hour strings.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Current day as `YYYYMMDD`.
    fn day(&self) -> String {
        format_ts(self.now_ms(), "%Y%m%d")
    }

    /// Current hour as `YYYYMMDDHH`.
    fn hour(&self) -> String {
        format_ts(self.now_ms(), "%Y%m%d%H")
    }
}

fn format_ts(ms: i64, fmt: &str) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
        .format(fmt)
        .to_string()
}

/// Real clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    pub fn new(ms: i64) -> Self {
        Self {
            ms: AtomicI64::new(ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.ms.load(Ordering::SeqCst)
    }
}
