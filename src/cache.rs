// ABOUTME: Time-to-live memoization for expensive daemon calls
// ABOUTME: Serializes computation per key so a miss never races a second caller

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::clock::Clock;

/// Identity of a memoized call: operation name plus stable argument values.
///
/// Entities contribute their identity (a node's name, a project's name and
/// version), never their full mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    op: &'static str,
    args: Vec<String>,
}

impl CacheKey {
    pub fn new(op: &'static str) -> Self {
        Self {
            op,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn op(&self) -> &str {
        self.op
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    cached_at: DateTime<Utc>,
}

type Slot = Arc<AsyncMutex<Option<Entry>>>;

pub struct TtlCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    clock: Arc<dyn Clock>,
}

impl TtlCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Returns the cached value for `key` if younger than `ttl`, otherwise runs
    /// `compute` and stores its result.
    ///
    /// Callers for the same key queue behind the slot lock, so at most one
    /// `compute` is in flight per key. A failed `compute` leaves whatever was
    /// cached before untouched. A zero `ttl` never reuses a value but still
    /// serializes callers.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<Arc<T>, E>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let slot = self.slot(&key);
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if self.is_fresh(cached.cached_at, ttl) {
                if let Ok(value) = Arc::clone(&cached.value).downcast::<T>() {
                    tracing::debug!(op = key.op(), args = ?key.args(), "cache hit");
                    return Ok(value);
                }
            }
        }

        tracing::debug!(op = key.op(), args = ?key.args(), "cache miss");
        let value = Arc::new(compute().await?);
        *entry = Some(Entry {
            value: Arc::clone(&value) as Arc<dyn Any + Send + Sync>,
            cached_at: self.clock.now(),
        });
        Ok(value)
    }

    /// Drops cached values whose key matches `pred`. Waits for any in-flight
    /// computation on those keys to finish first.
    pub async fn invalidate_where(&self, pred: impl Fn(&CacheKey) -> bool) -> usize {
        let matching: Vec<Slot> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .iter()
                .filter(|(key, _)| pred(key))
                .map(|(_, slot)| Arc::clone(slot))
                .collect()
        };

        let mut dropped = 0;
        for slot in matching {
            if slot.lock().await.take().is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        self.invalidate_where(|k| k == key).await > 0
    }

    /// Drops every cached call of `op` whose first argument is `node`.
    pub async fn invalidate_node_op(&self, node: &str, op: &str) -> usize {
        self.invalidate_where(|k| k.op() == op && k.args().first().map(String::as_str) == Some(node))
            .await
    }

    fn slot(&self, key: &CacheKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn is_fresh(&self, cached_at: DateTime<Utc>, ttl: Duration) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return true;
        };
        self.clock.now() - cached_at < ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (Arc<ManualClock>, TtlCache) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let cache = TtlCache::new(clock.clone());
        (clock, cache)
    }

    fn key() -> CacheKey {
        CacheKey::new("list_projects").arg("node-a")
    }

    #[tokio::test]
    async fn test_hit_within_ttl_computes_once() {
        let (_clock, cache) = cache();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let compute = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec!["shop".to_string()])
        };

        let first = cache.get_or_compute(key(), Duration::from_secs(60), compute).await.unwrap();
        let second = cache.get_or_compute(key(), Duration::from_secs(60), compute).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recomputes_after_ttl_elapses() {
        let (clock, cache) = cache();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let compute = move || async move { Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst)) };

        cache.get_or_compute(key(), Duration::from_secs(60), compute).await.unwrap();
        clock.advance(chrono::Duration::seconds(59));
        cache.get_or_compute(key(), Duration::from_secs(60), compute).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::seconds(1));
        let value = cache.get_or_compute(key(), Duration::from_secs(60), compute).await.unwrap();
        assert_eq!(*value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_compute_is_not_cached() {
        let (_clock, cache) = cache();
        let failed: Result<Arc<u32>, String> = cache
            .get_or_compute(key(), Duration::from_secs(60), || async { Err("timeout".to_string()) })
            .await;
        assert_eq!(failed.unwrap_err(), "timeout");

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let value = cache
            .get_or_compute(key(), Duration::from_secs(60), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(7u32)
            })
            .await
            .unwrap();
        assert_eq!(*value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_value() {
        let (clock, cache) = cache();
        cache
            .get_or_compute(key(), Duration::from_secs(10), || async { Ok::<_, String>(1u32) })
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(30));
        let _ = cache
            .get_or_compute::<u32, _, _, _>(key(), Duration::from_secs(10), || async {
                Err("boom".to_string())
            })
            .await;

        // Still there for a caller willing to accept older data.
        let value = cache
            .get_or_compute(key(), Duration::from_secs(3600), || async { Ok::<_, String>(2u32) })
            .await
            .unwrap();
        assert_eq!(*value, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_never_reuses() {
        let (_clock, cache) = cache();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        for _ in 0..3 {
            cache
                .get_or_compute(key(), Duration::ZERO, move || async move {
                    Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_compute() {
        let (_clock, cache) = cache();
        let cache = Arc::new(cache);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key(), Duration::from_secs(60), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok::<_, String>(42u32)
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(*handle.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_node_op_only_drops_matching_keys() {
        let (_clock, cache) = cache();
        let other = CacheKey::new("list_projects").arg("node-b");
        for k in [key(), other.clone()] {
            cache
                .get_or_compute(k, Duration::from_secs(60), || async { Ok::<_, String>(1u8) })
                .await
                .unwrap();
        }

        assert_eq!(cache.invalidate_node_op("node-a", "list_projects").await, 1);

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        for k in [key(), other] {
            cache
                .get_or_compute(k, Duration::from_secs(60), move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(2u8)
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
