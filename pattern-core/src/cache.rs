//! Capacity-limited LRU map shared by concurrent readers.
//!
//! The lock only guards the map itself. Callers fetch missing values outside
//! of it, so a slow miss never blocks other hits.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

/// LRU cache with hit/miss accounting.
pub struct BoundedCache<K: Hash + Eq, V: Clone> {
    cache: Mutex<LruCache<K, V>>,
    stats: CacheStats,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            stats: CacheStats::default(),
        }
    }

    /// Look up a value and mark it most recently used.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.cache.lock();
        if let Some(value) = cache.get(key) {
            self.stats.record_hit();
            Some(value.clone())
        } else {
            self.stats.record_miss();
            None
        }
    }

    /// Insert or replace a value, evicting the least recently used entry when full.
    pub fn insert(&self, key: K, value: V) {
        self.cache.lock().put(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.cache.lock().pop(key)
    }

    /// Whether a key is cached, without touching recency or stats.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.cache.lock().contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Point-in-time copy of the hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }
}

/// Hit and miss counters of one cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Clone for CacheStats {
    fn clone(&self) -> Self {
        Self {
            hits: AtomicUsize::new(self.hits.load(Ordering::Relaxed)),
            misses: AtomicUsize::new(self.misses.load(Ordering::Relaxed)),
        }
    }
}

impl Serialize for CacheStats {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("CacheStats", 3)?;
        state.serialize_field("hits", &self.hits())?;
        state.serialize_field("misses", &self.misses())?;
        state.serialize_field("hit_rate", &self.hit_rate())?;
        state.end()
    }
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Hits over lookups; 0.0 before the first lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f32 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                hits as f32 / total as f32
            }
        }
    }

    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::Arc;

    #[test]
    fn evicts_least_recently_used() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn zero_capacity_holds_one_entry() {
        let cache = BoundedCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(1, "x");
        cache.insert(2, "y");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&2), Some("y"));
    }

    #[test]
    fn tracks_hits_and_misses() {
        let cache = BoundedCache::new(4);
        cache.insert(7, 70);
        let _ = cache.get(&7);
        let _ = cache.get(&8);
        let _ = cache.get(&7);

        let stats = cache.stats();
        assert_eq!(stats.hits(), 2);
        assert_eq!(stats.misses(), 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = BoundedCache::new(4);
        cache.insert(1, 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn concurrent_writers_respect_capacity() {
        let cache = Arc::new(BoundedCache::new(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.insert(t * 1000 + i, i);
                        let _ = cache.get(&(t * 1000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 8);
        let stats = cache.stats();
        assert_eq!(stats.hits() + stats.misses(), 400);
    }
}
