// src/cache_management/lru_cache.rs

//! Byte-budgeted LRU cache with a time-to-live, shared by the chunked store and
//! the content store. Values are decoded payload bytes; each entry weighs its length.
//!
//! Writers publish with [`LruCache::insert`] or drop with [`LruCache::invalidate`].
//! Readers that miss take a [`FillTicket`] before going to the backend and refill
//! with [`LruCache::fill`], which refuses the value if the key was written or
//! invalidated in between.

use dashmap::DashMap;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::config::CacheConfig;
use crate::metrics;

/// Per-entry bookkeeping overhead counted on top of the payload.
const ENTRY_OVERHEAD: usize = 64;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entry_count: u64,
    pub weighted_bytes: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Write generation of one key plus the prefix-invalidation epoch, observed before a
/// backend read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    generation: u64,
    epoch: u64,
}

#[derive(Clone)]
pub struct LruCache {
    cache: Cache<String, Arc<Vec<u8>>>,
    counters: Arc<Counters>,
    generations: Arc<DashMap<String, u64>>,
    next_generation: Arc<AtomicU64>,
    epoch: Arc<RwLock<u64>>,
}

impl LruCache {
    pub fn new(config: &CacheConfig) -> Self {
        let counters = Arc::new(Counters::default());
        let listener_counters = Arc::clone(&counters);

        let cache = Cache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|key: &String, value: &Arc<Vec<u8>>| -> u32 {
                (key.len() + value.len() + ENTRY_OVERHEAD)
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .time_to_live(config.ttl)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key, _value, cause| match cause {
                RemovalCause::Size => {
                    listener_counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("Evicted {} from cache", key);
                }
                RemovalCause::Expired => {
                    listener_counters.expirations.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            })
            .build();

        Self {
            cache,
            counters,
            generations: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(0)),
            epoch: Arc::new(RwLock::new(0)),
        }
    }

    fn bump_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let found = self.cache.get(key);
        let counter = if found.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache(found.is_some());
        found
    }

    /// Publish a freshly written value. Any fill still in flight for `key` is refused.
    pub fn insert(&self, key: impl Into<String>, payload: Vec<u8>) {
        let key = key.into();
        let mut generation = self.generations.entry(key.clone()).or_insert(0);
        *generation = self.bump_generation();
        self.cache.insert(key, Arc::new(payload));
    }

    pub fn fill_ticket(&self, key: &str) -> FillTicket {
        let epoch = *self.epoch.read().unwrap_or_else(|p| p.into_inner());
        let generation = self.generations.get(key).map_or(0, |g| *g);
        FillTicket { generation, epoch }
    }

    /// Cache a value read from the backend, unless `key` was written or invalidated
    /// after `ticket` was taken. Returns whether the value was cached.
    pub fn fill(&self, key: impl Into<String>, ticket: FillTicket, payload: Vec<u8>) -> bool {
        let key = key.into();
        let epoch = self.epoch.read().unwrap_or_else(|p| p.into_inner());
        if *epoch != ticket.epoch {
            debug!("Skipping cache fill of {}: invalidated during read", key);
            return false;
        }
        let generation = self.generations.entry(key.clone()).or_insert(0);
        if *generation != ticket.generation {
            debug!("Skipping cache fill of {}: written during read", key);
            return false;
        }
        self.cache.insert(key, Arc::new(payload));
        true
    }

    pub fn fill_json<T: Serialize + ?Sized>(&self, key: impl Into<String>, ticket: FillTicket, value: &T) -> bool {
        match serde_json::to_vec(value) {
            Ok(payload) => self.fill(key, ticket, payload),
            Err(_) => false,
        }
    }

    /// Decode a cached JSON payload. An undecodable entry is dropped and reported as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let payload = self.get(key)?;
        match serde_json::from_slice(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Dropping undecodable cache entry {}: {}", key, e);
                self.cache.invalidate(key);
                None
            }
        }
    }

    pub fn insert_json<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) {
        if let Ok(payload) = serde_json::to_vec(value) {
            self.insert(key, payload);
        }
    }

    pub fn invalidate(&self, key: &str) {
        let mut generation = self.generations.entry(key.to_string()).or_insert(0);
        *generation = self.bump_generation();
        self.cache.invalidate(key);
    }

    /// Drop every entry whose key starts with `prefix`. Fills that started before the
    /// call are refused.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut epoch = self.epoch.write().unwrap_or_else(|p| p.into_inner());
        *epoch += 1;
        self.generations.retain(|key, _| !key.starts_with(prefix));
        let keys: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.cache.invalidate(key.as_str());
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut epoch = self.epoch.write().unwrap_or_else(|p| p.into_inner());
        *epoch += 1;
        self.generations.clear();
        self.cache.invalidate_all();
    }

    /// Apply pending evictions and expirations now.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entry_count: self.cache.entry_count(),
            weighted_bytes: self.cache.weighted_size(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache(max_bytes: u64, ttl: Duration) -> LruCache {
        LruCache::new(&CacheConfig { max_bytes, ttl })
    }

    #[test]
    fn test_hit_rate() {
        let cache = cache(1024 * 1024, Duration::from_secs(60));
        cache.insert("a", b"payload".to_vec());

        assert!(cache.get("a").is_some());
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_byte_budget_is_enforced() {
        let cache = cache(4 * 1024, Duration::from_secs(60));
        for i in 0..20 {
            cache.insert(format!("k{}", i), vec![0u8; 1024]);
        }
        cache.run_pending_tasks();

        let stats = cache.stats();
        assert!(stats.weighted_bytes <= 4 * 1024);
        assert!(stats.entry_count < 20);
        assert!(stats.evictions > 0);
    }

    #[test]
    fn test_ttl_expires_entries() {
        let cache = cache(1024 * 1024, Duration::from_millis(50));
        cache.insert("short", b"lived".to_vec());
        std::thread::sleep(Duration::from_millis(120));
        assert!(cache.get("short").is_none());
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = cache(1024 * 1024, Duration::from_secs(60));
        cache.insert("sessions/a/metadata", b"1".to_vec());
        cache.insert("sessions/a/screenshots/chunk-000", b"2".to_vec());
        cache.insert("sessions/b/metadata", b"3".to_vec());

        assert_eq!(cache.invalidate_prefix("sessions/a/"), 2);
        assert!(cache.get("sessions/a/metadata").is_none());
        assert!(cache.get("sessions/b/metadata").is_some());
    }

    #[test]
    fn test_json_helpers() {
        let cache = cache(1024 * 1024, Duration::from_secs(60));
        cache.insert_json("v", &vec![1, 2, 3]);
        assert_eq!(cache.get_json::<Vec<i32>>("v"), Some(vec![1, 2, 3]));

        cache.insert("broken", b"{not json".to_vec());
        assert_eq!(cache.get_json::<Vec<i32>>("broken"), None);
    }

    #[test]
    fn test_fill_refused_after_concurrent_write() {
        let cache = cache(1024 * 1024, Duration::from_secs(60));
        let ticket = cache.fill_ticket("sessions/a/metadata");
        cache.insert("sessions/a/metadata", b"new".to_vec());

        assert!(!cache.fill("sessions/a/metadata", ticket, b"old".to_vec()));
        assert_eq!(cache.get("sessions/a/metadata").unwrap().as_slice(), b"new");

        let fresh = cache.fill_ticket("sessions/a/metadata");
        assert!(cache.fill("sessions/a/metadata", fresh, b"newer".to_vec()));
    }

    #[test]
    fn test_fill_refused_after_invalidation() {
        let cache = cache(1024 * 1024, Duration::from_secs(60));
        let by_key = cache.fill_ticket("k");
        cache.invalidate("k");
        assert!(!cache.fill("k", by_key, b"stale".to_vec()));

        let by_prefix = cache.fill_ticket("sessions/a/screenshots/chunk-000");
        cache.invalidate_prefix("sessions/a/");
        assert!(!cache.fill("sessions/a/screenshots/chunk-000", by_prefix, b"stale".to_vec()));
        assert!(cache.get("sessions/a/screenshots/chunk-000").is_none());
        assert!(cache.get("k").is_none());
    }
}
