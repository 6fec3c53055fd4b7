//! Multi-layer cache: a sharded, lock-free-on-hit L1 in front of a
//! pluggable L2 backend, with tag invalidation and single-flight loading.
//!
//! Grounded on `scrapers::polymarket_book_store`'s `ArcSwap`-per-slot
//! lock-free-read pattern (there it guards order book snapshots; here it
//! guards cache entries) and its `tokio::sync::Notify` wake-one-fill-many
//! idiom (there it gates consumers of a slow-arriving book warmup; here it
//! gates concurrent loaders of the same key).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::Notify;

const SHARD_COUNT: usize = 16;

fn shard_of(key: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in key.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash as usize) % SHARD_COUNT
}

#[derive(Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
    tags: Vec<String>,
}

/// Pluggable L2 store. The in-process implementation below is what single-
/// node deployments and tests use; a remote-backed implementation (redis,
/// memcached) plugs in without touching L1 or single-flight.
#[async_trait::async_trait]
pub trait CacheBackend<V: Clone + Send + Sync + 'static>: Send + Sync {
    async fn get(&self, key: &str) -> Option<(V, Instant)>;
    async fn set(&self, key: &str, value: V, expires_at: Instant, tags: &[String]);
    async fn invalidate_tag(&self, tag: &str);
}

/// In-process L2 backing store, TTL-aware, used for single-node deployment
/// and in tests.
pub struct InProcessBackend<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    tag_index: Mutex<HashMap<String, Vec<String>>>,
}

impl<V> Default for InProcessBackend<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            tag_index: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl<V: Clone + Send + Sync + 'static> CacheBackend<V> for InProcessBackend<V> {
    async fn get(&self, key: &str) -> Option<(V, Instant)> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some((entry.value.clone(), entry.expires_at))
    }

    async fn set(&self, key: &str, value: V, expires_at: Instant, tags: &[String]) {
        self.entries.lock().insert(
            key.to_string(),
            Entry { value, expires_at, tags: tags.to_vec() },
        );
        let mut tag_index = self.tag_index.lock();
        for tag in tags {
            tag_index.entry(tag.clone()).or_default().push(key.to_string());
        }
    }

    async fn invalidate_tag(&self, tag: &str) {
        let keys = self.tag_index.lock().remove(tag).unwrap_or_default();
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(&key);
        }
    }
}

struct L1Shard<V> {
    entries: Mutex<HashMap<String, Arc<ArcSwap<Entry<V>>>>>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl<V> Default for L1Shard<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub l1_capacity_per_shard: usize,
    pub l1_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity_per_shard: 1024,
            l1_ttl: Duration::from_secs(30),
        }
    }
}

/// L1 in-process + L2 shared cache with TTL, tag invalidation, and a
/// single-flight loader so a thundering herd of misses on the same key only
/// runs the loader once.
pub struct Cache<V: Clone + Send + Sync + 'static> {
    config: CacheConfig,
    shards: Vec<L1Shard<V>>,
    l2: Arc<dyn CacheBackend<V>>,
    /// Ordered insertion per shard, used as the LRU eviction queue. A
    /// `Mutex<Vec<_>>` is fine here: eviction only runs when a shard is at
    /// capacity, not on every hit.
    lru: Vec<Mutex<Vec<String>>>,
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    pub fn new(config: CacheConfig, l2: Arc<dyn CacheBackend<V>>) -> Self {
        Self {
            config,
            shards: (0..SHARD_COUNT).map(|_| L1Shard::default()).collect(),
            l2,
            lru: (0..SHARD_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn l1_get(&self, key: &str) -> Option<V> {
        let shard = &self.shards[shard_of(key)];
        let entries = shard.entries.lock();
        let slot = entries.get(key)?;
        let entry = slot.load();
        if Instant::now() >= entry.expires_at {
            None
        } else {
            Some(entry.value.clone())
        }
    }

    fn l1_set(&self, key: &str, value: V, expires_at: Instant, tags: &[String]) {
        let shard_idx = shard_of(key);
        let shard = &self.shards[shard_idx];
        let entry = Arc::new(Entry { value, expires_at, tags: tags.to_vec() });
        {
            let mut entries = shard.entries.lock();
            match entries.get(key) {
                Some(slot) => slot.store(entry),
                None => {
                    entries.insert(key.to_string(), Arc::new(ArcSwap::from(entry)));
                }
            }
        }
        let mut lru = self.lru[shard_idx].lock();
        lru.retain(|k| k != key);
        lru.push(key.to_string());
        if lru.len() > self.config.l1_capacity_per_shard {
            let evict = lru.remove(0);
            shard.entries.lock().remove(&evict);
        }
    }

    /// Get `key`, filling it via `loader` on a miss. Concurrent misses on
    /// the same key share one loader invocation.
    pub async fn get_or_load<F, Fut>(&self, key: &str, tags: &[String], loader: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = V>,
    {
        if let Some(v) = self.l1_get(key) {
            return v;
        }
        if let Some((v, expires_at)) = self.l2.get(key).await {
            self.l1_set(key, v.clone(), expires_at.min(Instant::now() + self.config.l1_ttl), tags);
            return v;
        }

        let shard = &self.shards[shard_of(key)];
        let notify = {
            let mut waiters = shard.waiters.lock();
            if let Some(existing) = waiters.get(key) {
                Some(existing.clone())
            } else {
                waiters.insert(key.to_string(), Arc::new(Notify::new()));
                None
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            if let Some(v) = self.l1_get(key) {
                return v;
            }
        }

        let value = loader().await;
        let expires_at = Instant::now() + self.config.l1_ttl;
        self.l1_set(key, value.clone(), expires_at, tags);
        self.l2.set(key, value.clone(), expires_at, tags).await;

        if let Some(notify) = shard.waiters.lock().remove(key) {
            notify.notify_waiters();
        }
        value
    }

    pub async fn set(&self, key: &str, value: V, ttl: Duration, tags: &[String]) {
        let expires_at = Instant::now() + ttl;
        self.l1_set(key, value.clone(), expires_at.min(Instant::now() + self.config.l1_ttl), tags);
        self.l2.set(key, value, expires_at, tags).await;
    }

    /// Delete every key under `tag` from both layers.
    pub async fn invalidate(&self, tag: &str) {
        for shard in &self.shards {
            let keys: Vec<String> = {
                let entries = shard.entries.lock();
                entries
                    .iter()
                    .filter(|(_, v)| v.load().tags.iter().any(|t| t == tag))
                    .map(|(k, _)| k.clone())
                    .collect()
            };
            let mut entries = shard.entries.lock();
            for key in keys {
                entries.remove(&key);
            }
        }
        self.l2.invalidate_tag(tag).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache() -> Cache<u32> {
        Cache::new(CacheConfig::default(), Arc::new(InProcessBackend::default()))
    }

    #[tokio::test]
    async fn miss_then_hit_uses_l1() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let v = cache
            .get_or_load("k", &[], || async move {
                c.fetch_add(1, Ordering::SeqCst);
                42
            })
            .await;
        assert_eq!(v, 42);
        let c2 = calls.clone();
        let v2 = cache.get_or_load("k", &[], || async move {
            c2.fetch_add(1, Ordering::SeqCst);
            99
        }).await;
        assert_eq!(v2, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_flight_collapses_concurrent_loaders() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("shared", &[], || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        7
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_tag_removes_all_tagged_keys() {
        let cache = cache();
        cache.set("a", 1, Duration::from_secs(60), &["group".to_string()]).await;
        cache.set("b", 2, Duration::from_secs(60), &["group".to_string()]).await;
        cache.invalidate("group").await;
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let v = cache.get_or_load("a", &[], || async move {
            c.fetch_add(1, Ordering::SeqCst);
            -1
        }).await;
        assert_eq!(v, -1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_l1_entry_is_treated_as_miss() {
        let cache = Cache::new(
            CacheConfig { l1_ttl: Duration::from_millis(5), ..CacheConfig::default() },
            Arc::new(InProcessBackend::default()),
        );
        cache.set("k", 1, Duration::from_millis(5), &[]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let v = cache.get_or_load("k", &[], || async move {
            c.fetch_add(1, Ordering::SeqCst);
            2
        }).await;
        assert_eq!(v, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
