//! In-process, time-bounded cache
//!
//! Entries are immutable `Arc` values. A refresh builds a fresh value and
//! swaps it in whole, so concurrent readers see either the old or the new
//! entry and never a half-written one. Concurrent misses on the same key are
//! collapsed into a single loader call. A bounded cache sweeps expired
//! entries when full and then evicts the entry closest to expiry.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

struct Entry<V> {
    value: Arc<V>,
    expires_at: Instant,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    max_entries: Option<usize>,
    entries: RwLock<HashMap<K, Entry<V>>>,
    inflight: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send + Sync,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            max_entries: None,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// A cache holding at most `max_entries` keys.
    pub fn bounded(ttl: Duration, max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
            ..Self::new(ttl)
        }
    }

    /// Fresh value for `key`, if any.
    pub async fn get(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| Arc::clone(&entry.value))
    }

    pub async fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let entry = Entry {
            value: Arc::clone(&value),
            expires_at: Instant::now() + self.ttl,
        };
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if let Some(max) = self.max_entries {
            if entries.len() >= max && !entries.contains_key(&key) {
                entries.retain(|_, entry| entry.expires_at > now);
            }
            while entries.len() >= max && !entries.contains_key(&key) {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(oldest) => entries.remove(&oldest),
                    None => break,
                };
            }
        }
        entries.insert(key, entry);
        value
    }

    /// Return the cached value or run `loader` once to replace it.
    ///
    /// Loader errors are returned to the caller and nothing is cached.
    pub async fn get_or_refresh<F, Fut, E>(&self, key: K, loader: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = key_lock.lock().await;

        // another caller may have refreshed while we waited
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let result = loader().await;
        let outcome = match result {
            Ok(value) => Ok(self.insert(key.clone(), value).await),
            Err(e) => Err(e),
        };

        self.inflight.lock().await.remove(&key);
        outcome
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn get_or_refresh_loads_once_while_fresh() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_refresh("k".to_string(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(7)
                })
                .await
                .unwrap();
            assert_eq!(*value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_reloaded() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(Duration::from_millis(20));
        cache.insert("k", 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.get(&"k").await.is_none());
        let value = cache
            .get_or_refresh("k", || async { Ok::<_, ()>(2) })
            .await
            .unwrap();
        assert_eq!(*value, 2);
        assert_eq!(cache.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn invalidation_forces_a_reload() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("a", 1).await;
        cache.insert("b", 2).await;

        cache.invalidate(&"a").await;
        assert!(cache.get(&"a").await.is_none());
        assert_eq!(cache.len().await, 1);

        cache.invalidate_all().await;
        let value = cache
            .get_or_refresh("b", || async { Ok::<_, ()>(3) })
            .await
            .unwrap();
        assert_eq!(*value, 3);
    }

    #[tokio::test]
    async fn bounded_cache_sweeps_expired_entries_when_full() {
        let cache: TtlCache<u32, u32> = TtlCache::bounded(Duration::from_millis(20), 3);
        for key in 0..3 {
            cache.insert(key, key).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        cache.insert(10, 10).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(*cache.get(&10).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn bounded_cache_never_grows_past_its_cap() {
        let cache: TtlCache<u32, u32> = TtlCache::bounded(Duration::from_secs(60), 100);
        for key in 0..1_000 {
            cache.insert(key, key).await;
        }
        assert_eq!(cache.len().await, 100);
        assert_eq!(*cache.get(&999).await.unwrap(), 999);
        assert!(cache.get(&0).await.is_none());

        // replacing a present key evicts nothing
        cache.insert(999, 1).await;
        assert_eq!(cache.len().await, 100);
    }

    #[tokio::test]
    async fn loader_errors_are_not_cached() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_refresh("k", || async { Err::<u32, _>("down") })
            .await;
        assert_eq!(err.unwrap_err(), "down");
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn readers_keep_old_value_after_replacement() {
        let cache: TtlCache<&'static str, String> = TtlCache::new(Duration::from_secs(60));
        let old = cache.insert("k", "v1".to_string()).await;
        cache.insert("k", "v2".to_string()).await;

        assert_eq!(old.as_str(), "v1");
        assert_eq!(cache.get(&"k").await.unwrap().as_str(), "v2");

        cache.invalidate(&"k").await;
        assert!(cache.get(&"k").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_load() {
        let cache = Arc::new(TtlCache::<u8, u8>::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_refresh(1, || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok::<_, ()>(9)
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(*handle.await.unwrap(), 9);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
