//! Shared utility functions

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8 boundaries.
///
/// If the string is already shorter than `max_bytes`, returns it unchanged.
/// Otherwise, finds the last valid UTF-8 character boundary at or before `max_bytes`
/// and returns a slice up to that point.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Smallest power of two that is >= `n`. Used for the activity bucket size.
pub fn next_pow2(n: u64) -> u64 {
    n.next_power_of_two()
}

/// Uniform random integer in `[min, max]` (inclusive). `min > max` is
/// clamped to `min`.
pub fn uniform_ms(min: u64, max: u64) -> u64 {
    if min >= max {
        return min;
    }
    rand::rng().random_range(min..=max)
}

/// Coalesces bursts of triggers into a single deferred action.
///
/// Every `trigger` arms a timer; triggers that arrive while the timer is
/// pending are absorbed, and the action runs once after `delay`. Used for
/// the job-queue snapshot and the bitarray shard flush, where rapid
/// updates must not each hit storage.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub fn new<F, Fut>(delay: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            // Exits when the Debouncer (the only sender) is dropped.
            while rx.recv().await.is_some() {
                tokio::time::sleep(delay).await;
                while rx.try_recv().is_ok() {}
                action().await;
            }
        });
        Self { tx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}
