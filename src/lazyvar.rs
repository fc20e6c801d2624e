// Lazily resolved values and coalesced async loads
//
// `LazyVar` models a value that may still be in flight: readers either
// await the shared future or, when snapshotting, see only resolved
// values. `CoalescedLoader` guarantees one underlying fetch per key no
// matter how many callers ask concurrently (the pending-loads map of the
// persisted bitarray, the whitelist filter load).

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// A value that is pending, resolved, or cancelled.
pub enum LazyVar<T: Clone> {
    Pending(Shared<BoxFuture<'static, T>>),
    Resolved(T),
    Cancelled,
}

impl<T: Clone> LazyVar<T> {
    /// Start from an in-flight computation. The future is shared: every
    /// clone of the inner handle observes the same result.
    pub fn pending<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        LazyVar::Pending(fut.boxed().shared())
    }

    pub fn resolved(value: T) -> Self {
        LazyVar::Resolved(value)
    }

    /// Await the value; `None` if cancelled.
    pub async fn get(&self) -> Option<T> {
        match self {
            LazyVar::Pending(shared) => Some(shared.clone().await),
            LazyVar::Resolved(value) => Some(value.clone()),
            LazyVar::Cancelled => None,
        }
    }

    /// Non-blocking view: only resolved values survive a snapshot.
    pub fn snapshot(&self) -> Option<T> {
        match self {
            LazyVar::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Replace a pending computation with its result once known.
    pub fn resolve(&mut self, value: T) {
        *self = LazyVar::Resolved(value);
    }

    pub fn cancel(&mut self) {
        *self = LazyVar::Cancelled;
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, LazyVar::Resolved(_))
    }
}

/// One in-flight load per key; concurrent callers share the result.
pub struct CoalescedLoader<K, V> {
    pending: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> CoalescedLoader<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Load the value for `key`, running `load` at most once across all
    /// concurrent callers. The cell is dropped after resolution so a
    /// later call (e.g. after eviction) loads fresh.
    pub async fn load<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut pending = self.pending.lock().await;
            pending
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell.get_or_try_init(|| load()).await.cloned();

        let mut pending = self.pending.lock().await;
        pending.remove(&key);
        result
    }
}

impl<K, V> Default for CoalescedLoader<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn lazy_var_transitions() {
        let mut var = LazyVar::pending(async { 42u32 });
        assert!(var.snapshot().is_none());
        assert_eq!(var.get().await, Some(42));

        var.resolve(7);
        assert_eq!(var.snapshot(), Some(7));
        assert!(var.is_resolved());

        var.cancel();
        assert_eq!(var.get().await, None);
        assert!(var.snapshot().is_none());
    }

    #[tokio::test]
    async fn concurrent_loads_coalesce() {
        let loader = Arc::new(CoalescedLoader::<String, u32>::new());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let loader = loader.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                loader
                    .load("shard-0".to_string(), || {
                        let fetches = fetches.clone();
                        async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok::<_, ()>(99)
                        }
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 99);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_load_independently() {
        let loader = CoalescedLoader::<u32, u32>::new();
        let a = loader.load(1, || async { Ok::<_, ()>(10) }).await.unwrap();
        let b = loader.load(2, || async { Ok::<_, ()>(20) }).await.unwrap();
        assert_eq!((a, b), (10, 20));
    }
}
