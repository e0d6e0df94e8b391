//! Byte-budgeted LRU tile cache
//!
//! Key-addressed cache of materialized tile payloads with strict
//! least-recently-used eviction. Both `get` and `put` count as accesses.
//! Eviction runs after every insert until the budget holds, with one
//! exception: a single over-budget tile is retained rather than evicting
//! itself, so an oversized tile is still usable.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{Scalar, SCALAR_BYTES};

/// Cache access counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that found the key
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Entries evicted to satisfy the budget
    pub evictions: u64,
    /// Total payload bytes evicted
    pub bytes_evicted: u64,
}

struct CacheInner {
    /// Payloads by key
    entries: HashMap<String, Vec<Scalar>>,
    /// Keys ordered by recency, most-recent at the front
    recency: VecDeque<String>,
    current_bytes: usize,
    stats: CacheStats,
}

impl CacheInner {
    /// Move `key` to the most-recent position
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_front(key.to_string());
    }
}

/// Bounded-bytes LRU cache of tile payloads
pub struct TileCache {
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl TileCache {
    /// Create a cache with the given byte budget
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                current_bytes: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Look up a tile payload.
    ///
    /// A hit refreshes the entry to most-recent.
    pub fn get(&self, key: &str) -> Option<Vec<Scalar>> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(key) {
            inner.touch(key);
            inner.stats.hits += 1;
            inner.entries.get(key).cloned()
        } else {
            inner.stats.misses += 1;
            None
        }
    }

    /// Insert or replace a tile payload, then evict from the
    /// least-recent end until the budget holds.
    pub fn put(&self, key: &str, payload: Vec<Scalar>) {
        let bytes = payload.len() * SCALAR_BYTES;
        let mut inner = self.inner.lock();

        if let Some(old) = inner.entries.insert(key.to_string(), payload) {
            inner.current_bytes -= old.len() * SCALAR_BYTES;
        }
        inner.current_bytes += bytes;
        inner.touch(key);

        // Evict until within budget, but never the sole remaining entry.
        while inner.current_bytes > self.max_bytes && inner.entries.len() > 1 {
            let victim = match inner.recency.pop_back() {
                Some(k) => k,
                None => break,
            };
            if let Some(evicted) = inner.entries.remove(&victim) {
                let evicted_bytes = evicted.len() * SCALAR_BYTES;
                inner.current_bytes -= evicted_bytes;
                inner.stats.evictions += 1;
                inner.stats.bytes_evicted += evicted_bytes as u64;
                trace!(key = %victim, bytes = evicted_bytes, "evicted tile");
            }
        }
    }

    /// Exact payload bytes currently held
    pub fn current_bytes(&self) -> usize {
        self.inner.lock().current_bytes
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is cached, without refreshing recency
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Byte budget
    #[inline]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Snapshot of the access counters
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("max_bytes", &self.max_bytes)
            .field("current_bytes", &self.current_bytes())
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(elements: usize, value: Scalar) -> Vec<Scalar> {
        vec![value; elements]
    }

    #[test]
    fn test_get_miss() {
        let cache = TileCache::new(1024);
        assert!(cache.get("nope").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = TileCache::new(1024);
        cache.put("a", payload(8, 1.5));
        assert_eq!(cache.get("a").unwrap(), payload(8, 1.5));
        assert_eq!(cache.current_bytes(), 8 * SCALAR_BYTES);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_replace_accounts_bytes() {
        let cache = TileCache::new(1024);
        cache.put("a", payload(8, 1.0));
        cache.put("a", payload(4, 2.0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_bytes(), 4 * SCALAR_BYTES);
        assert_eq!(cache.get("a").unwrap(), payload(4, 2.0));
    }

    #[test]
    fn test_lru_eviction_order() {
        // Budget fits exactly two 4-element payloads
        let cache = TileCache::new(8 * SCALAR_BYTES);
        cache.put("a", payload(4, 1.0));
        cache.put("b", payload(4, 2.0));

        // Touch "a" so "b" becomes least-recent
        assert!(cache.get("a").is_some());

        cache.put("c", payload(4, 3.0));
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_put_refreshes_recency() {
        let cache = TileCache::new(8 * SCALAR_BYTES);
        cache.put("a", payload(4, 1.0));
        cache.put("b", payload(4, 2.0));

        // Re-putting "a" makes "b" the eviction victim
        cache.put("a", payload(4, 1.1));
        cache.put("c", payload(4, 3.0));
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_single_oversized_entry_retained() {
        let cache = TileCache::new(4 * SCALAR_BYTES);
        cache.put("big", payload(100, 1.0));
        assert_eq!(cache.len(), 1);
        assert!(cache.current_bytes() > cache.max_bytes());
        assert!(cache.get("big").is_some());

        // A second entry forces the oversized one out
        cache.put("small", payload(2, 2.0));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("small"));
        assert!(cache.current_bytes() <= cache.max_bytes());
    }

    #[test]
    fn test_budget_holds_random_sequence() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let budget = 64 * SCALAR_BYTES;
        let cache = TileCache::new(budget);
        let mut rng = StdRng::seed_from_u64(11);

        for i in 0..500 {
            let key = format!("k{}", rng.gen_range(0..20));
            let elements = rng.gen_range(1..32);
            cache.put(&key, payload(elements, i as Scalar));

            // Budget holds, or exactly one oversized entry remains
            assert!(cache.current_bytes() <= budget || cache.len() == 1);
        }
    }
}
