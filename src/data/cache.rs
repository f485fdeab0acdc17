//! TTL + LRU memoization for market-data responses.
//!
//! Entries expire after their TTL and the least-recently-used entry is
//! evicted once the configured ceiling is reached. The cache is process-local
//! and never shared across runs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Cache key: one entry per distinct upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub service: String,
    pub symbol: String,
    pub interval: String,
    pub limit: u32,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

struct CacheEntry<T> {
    data: T,
    inserted_at: Instant,
    ttl: Duration,
    /// Monotone access stamp for LRU ordering
    last_access: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Hit/miss counters, surfaced for observability.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner<T> {
    entries: HashMap<CacheKey, CacheEntry<T>>,
    clock: u64,
    hits: u64,
    misses: u64,
}

/// TTL + bounded-LRU cache.
pub struct DataCache<T> {
    inner: Mutex<CacheInner<T>>,
    max_size: usize,
    default_ttl: Duration,
}

impl<T: Clone> DataCache<T> {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                clock: 0,
                hits: 0,
                misses: 0,
            }),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    /// Fetch a live entry. An expired hit is evicted and counts as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        enum Lookup<T> {
            Hit(T),
            Expired,
            Miss,
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.clock += 1;
        let stamp = inner.clock;

        let lookup = match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.last_access = stamp;
                Lookup::Hit(entry.data.clone())
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Miss,
        };

        match lookup {
            Lookup::Hit(data) => {
                inner.hits += 1;
                Some(data)
            }
            Lookup::Expired => {
                inner.entries.remove(key);
                inner.misses += 1;
                None
            }
            Lookup::Miss => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Store with the default TTL.
    pub fn insert(&self, key: CacheKey, data: T) {
        self.insert_with_ttl(key, data, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: CacheKey, data: T, ttl: Duration) {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let stamp = inner.clock;

        inner.entries.remove(&key);
        while inner.entries.len() >= self.max_size {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    inner.entries.remove(&k);
                }
                None => break,
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                data,
                inserted_at: Instant::now(),
                ttl,
                last_access: stamp,
            },
        );
    }

    /// Drop expired entries; returns how many were removed.
    pub fn clear_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.entries.remove(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(service: &str, limit: u32) -> CacheKey {
        CacheKey {
            service: service.to_string(),
            symbol: "BTC/USDT".to_string(),
            interval: "1m".to_string(),
            limit,
            start_ms: None,
            end_ms: None,
        }
    }

    #[test]
    fn round_trip_within_ttl() {
        let cache = DataCache::new(10, Duration::from_secs(300));
        cache.insert(key("klines", 100), vec![1, 2, 3]);

        assert_eq!(cache.get(&key("klines", 100)), Some(vec![1, 2, 3]));
        assert_eq!(cache.get(&key("klines", 200)), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let cache = DataCache::new(10, Duration::from_millis(5));
        cache.insert(key("klines", 100), 42);
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(cache.get(&key("klines", 100)), None);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = DataCache::new(2, Duration::from_secs(300));
        cache.insert(key("a", 1), 1);
        cache.insert(key("b", 1), 2);

        // Touch "a" so "b" becomes the least recently used.
        assert_eq!(cache.get(&key("a", 1)), Some(1));

        cache.insert(key("c", 1), 3);
        assert_eq!(cache.get(&key("b", 1)), None);
        assert_eq!(cache.get(&key("a", 1)), Some(1));
        assert_eq!(cache.get(&key("c", 1)), Some(3));
    }

    #[test]
    fn reinsert_replaces_without_evicting_others() {
        let cache = DataCache::new(2, Duration::from_secs(300));
        cache.insert(key("a", 1), 1);
        cache.insert(key("b", 1), 2);
        cache.insert(key("a", 1), 10);

        assert_eq!(cache.get(&key("a", 1)), Some(10));
        assert_eq!(cache.get(&key("b", 1)), Some(2));
    }

    #[test]
    fn clear_expired_sweeps() {
        let cache = DataCache::new(10, Duration::from_millis(5));
        cache.insert(key("a", 1), 1);
        cache.insert_with_ttl(key("b", 1), 2, Duration::from_secs(300));
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(cache.clear_expired(), 1);
        assert_eq!(cache.get(&key("b", 1)), Some(2));
    }

    #[test]
    fn hit_rate() {
        let cache = DataCache::new(10, Duration::from_secs(300));
        cache.insert(key("a", 1), 1);
        let _ = cache.get(&key("a", 1));
        let _ = cache.get(&key("missing", 1));

        let stats = cache.stats();
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
