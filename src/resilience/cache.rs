//! Two-layer in-process cache with stale-while-revalidate.
//!
//! L1 is small, L2 is larger and retains entries for `l2_ttl_multiplier`
//! times their TTL so they can still be served stale after L1 dropped them.
//! Freshness is always judged against the entry's own TTL and insert time,
//! whichever layer it comes from. An L2 hit is promoted back into L1 with
//! its original timestamps. Both layers evict oldest-inserted first when full.

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Overrides the cache's default TTL for a value fetched by this call
    pub ttl: Option<Duration>,
    pub stale_while_revalidate: bool,
    pub force_refresh: bool,
}

impl GetOptions {
    pub fn swr() -> Self {
        Self {
            stale_while_revalidate: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub l2_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    l2_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Debug)]
struct Layer<V> {
    map: HashMap<String, Entry<V>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl<V> Layer<V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    // Returns the number of entries evicted to make room.
    fn insert(&mut self, key: &str, entry: Entry<V>) -> u64 {
        if self.map.insert(key.to_string(), entry).is_none() {
            self.order.push_back(key.to_string());
        }
        let mut evicted = 0;
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
                evicted += 1;
            }
        }
        evicted
    }

    fn remove(&mut self, key: &str) {
        if self.map.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

#[derive(Debug)]
struct Layers<V> {
    l1: Layer<V>,
    l2: Layer<V>,
}

enum Lookup<V> {
    Fresh(V),
    Stale(V),
    Miss,
}

#[derive(Debug)]
pub struct MultiLayerCache<V> {
    layers: Arc<Mutex<Layers<V>>>,
    counters: Arc<Counters>,
    refreshing: Arc<Mutex<HashSet<String>>>,
    default_ttl: Duration,
    l2_multiplier: u32,
}

impl<V> Clone for MultiLayerCache<V> {
    fn clone(&self) -> Self {
        Self {
            layers: self.layers.clone(),
            counters: self.counters.clone(),
            refreshing: self.refreshing.clone(),
            default_ttl: self.default_ttl,
            l2_multiplier: self.l2_multiplier,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<V> MultiLayerCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            layers: Arc::new(Mutex::new(Layers {
                l1: Layer::new(config.l1_capacity),
                l2: Layer::new(config.l2_capacity),
            })),
            counters: Arc::new(Counters::default()),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            l2_multiplier: config.l2_ttl_multiplier.max(1),
        }
    }

    fn lookup(&self, key: &str) -> Lookup<V> {
        let now = Instant::now();
        let mut layers = lock(&self.layers);
        if let Some(entry) = layers.l1.map.get(key) {
            return if entry.is_stale(now) {
                Lookup::Stale(entry.value.clone())
            } else {
                Lookup::Fresh(entry.value.clone())
            };
        }
        let retain = |entry: &Entry<V>| {
            now.duration_since(entry.inserted_at) < entry.ttl * self.l2_multiplier
        };
        let candidate = layers.l2.map.get(key).cloned();
        let promoted = match candidate {
            Some(entry) if retain(&entry) => Some(entry),
            Some(_) => {
                layers.l2.remove(key);
                None
            }
            None => None,
        };
        match promoted {
            Some(entry) => {
                let stale = entry.is_stale(now);
                let value = entry.value.clone();
                let evicted = layers.l1.insert(key, entry);
                self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
                self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                if stale {
                    Lookup::Stale(value)
                } else {
                    Lookup::Fresh(value)
                }
            }
            None => Lookup::Miss,
        }
    }

    /// Stores `value` in both layers.
    pub fn insert(&self, key: &str, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Instant::now();
        let mut layers = lock(&self.layers);
        let mut evicted = layers.l1.insert(
            key,
            Entry {
                value: value.clone(),
                inserted_at: now,
                ttl,
            },
        );
        evicted += layers.l2.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                ttl,
            },
        );
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
    }

    /// Cached value for `key`, fetching it when absent, stale or forced.
    pub async fn get<F, Fut, E>(&self, key: &str, fetch: F, opts: GetOptions) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if !opts.force_refresh {
            match self.lookup(key) {
                Lookup::Fresh(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Lookup::Stale(value) if opts.stale_while_revalidate => {
                    self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                    self.refresh_in_background(key, fetch(), opts.ttl);
                    return Ok(value);
                }
                Lookup::Stale(_) | Lookup::Miss => {}
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let value = fetch().await?;
        self.insert(key, value.clone(), opts.ttl);
        Ok(value)
    }

    fn refresh_in_background<Fut, E>(&self, key: &str, fut: Fut, ttl: Option<Duration>)
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if !lock(&self.refreshing).insert(key.to_string()) {
            debug!(key, "refresh already in flight");
            return;
        }
        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            match fut.await {
                Ok(value) => cache.insert(&key, value, ttl),
                Err(err) => warn!(key = %key, error = %err, "background cache refresh failed"),
            }
            lock(&cache.refreshing).remove(&key);
        });
    }

    pub fn invalidate(&self, key: &str) {
        let mut layers = lock(&self.layers);
        layers.l1.remove(key);
        layers.l2.remove(key);
    }

    pub fn clear(&self) {
        let mut layers = lock(&self.layers);
        layers.l1.clear();
        layers.l2.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cache(l1: usize, l2: usize) -> MultiLayerCache<String> {
        MultiLayerCache::new(&CacheConfig {
            l1_capacity: l1,
            l2_capacity: l2,
            default_ttl_secs: 10,
            l2_ttl_multiplier: 3,
            dedup_ttl_ms: 100,
        })
    }

    fn value(v: &'static str) -> impl Future<Output = Result<String, String>> + Send + 'static {
        async move { Ok(v.to_string()) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_hit_skips_fetch() {
        let c = cache(10, 10);
        assert_eq!(c.get("k", || value("a"), GetOptions::default()).await.unwrap(), "a");
        assert_eq!(c.get("k", || value("b"), GetOptions::default()).await.unwrap(), "a");
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_while_revalidate_serves_stale_then_refreshes() {
        let c = cache(10, 10);
        c.get("k", || value("old"), GetOptions::default()).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let v = c.get("k", || value("new"), GetOptions::swr()).await.unwrap();
        assert_eq!(v, "old");
        assert_eq!(c.stats().stale_hits, 1);

        // let the background refresh land
        tokio::time::sleep(Duration::from_millis(1)).await;
        let v = c.get("k", || value("unused"), GetOptions::default()).await.unwrap();
        assert_eq!(v, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_without_swr_awaits_fresh_fetch() {
        let c = cache(10, 10);
        c.get("k", || value("old"), GetOptions::default()).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let v = c.get("k", || value("new"), GetOptions::default()).await.unwrap();
        assert_eq!(v, "new");
        assert_eq!(c.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let c = cache(10, 10);
        c.insert("k", "cached".to_string(), None);
        let opts = GetOptions {
            force_refresh: true,
            ..GetOptions::default()
        };
        assert_eq!(c.get("k", || value("fresh"), opts).await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_fetch_error_not_cached() {
        let c = cache(10, 10);
        let res = c
            .get("k", || async { Err::<String, _>("llm down".to_string()) }, GetOptions::default())
            .await;
        assert_eq!(res.unwrap_err(), "llm down");
        assert_eq!(c.get("k", || value("ok"), GetOptions::default()).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_l1_eviction_falls_back_to_l2() {
        let c = cache(1, 10);
        c.insert("a", "A".to_string(), None);
        c.insert("b", "B".to_string(), None);
        assert_eq!(c.stats().evictions, 1);

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let v = c
            .get(
                "a",
                move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                    value("refetched")
                },
                GetOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(v, "A");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(c.stats().l2_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_l2_entry_past_ttl_is_refetched() {
        let c = cache(1, 10);
        c.insert("a", "OLD".to_string(), None);
        c.insert("b", "B".to_string(), None);
        // within L2 retention (3 x 10s) but past the 10s TTL
        tokio::time::advance(Duration::from_secs(25)).await;

        let v = c.get("a", || value("FRESH"), GetOptions::default()).await.unwrap();
        assert_eq!(v, "FRESH");
        assert_eq!(c.stats().misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_l2_entry_served_with_swr() {
        let c = cache(1, 10);
        c.insert("a", "OLD".to_string(), None);
        c.insert("b", "B".to_string(), None);
        tokio::time::advance(Duration::from_secs(15)).await;

        let v = c.get("a", || value("NEW"), GetOptions::swr()).await.unwrap();
        assert_eq!(v, "OLD");
        assert_eq!(c.stats().stale_hits, 1);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let v = c.get("a", || value("unused"), GetOptions::default()).await.unwrap();
        assert_eq!(v, "NEW");
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_keeps_original_age() {
        let c = cache(1, 10);
        c.insert("a", "A".to_string(), None);
        c.insert("b", "B".to_string(), None);
        tokio::time::advance(Duration::from_secs(6)).await;
        // promoted from L2 while still fresh
        assert_eq!(c.get("a", || value("x"), GetOptions::default()).await.unwrap(), "A");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(c.get("a", || value("A2"), GetOptions::default()).await.unwrap(), "A2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_l2_drops_entries_past_retention() {
        let c = cache(1, 10);
        c.insert("a", "OLD".to_string(), None);
        c.insert("b", "B".to_string(), None);
        tokio::time::advance(Duration::from_secs(31)).await;

        let v = c.get("a", || value("NEW"), GetOptions::swr()).await.unwrap();
        assert_eq!(v, "NEW");
        assert_eq!(c.stats().stale_hits, 0);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let c = cache(10, 10);
        c.insert("a", "A".to_string(), None);
        c.insert("b", "B".to_string(), None);
        c.invalidate("a");
        assert_eq!(c.get("a", || value("A2"), GetOptions::default()).await.unwrap(), "A2");
        c.clear();
        assert_eq!(c.get("b", || value("B2"), GetOptions::default()).await.unwrap(), "B2");
    }
}
