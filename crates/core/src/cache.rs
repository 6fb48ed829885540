//! Bounded LRU caches shared by all searches of one index.
//!
//! [`LocationCache`] maps `(record, version)` to the traversal-ready form of a stored
//! vector; [`GraphBuildCache`] maps `(record, version)` to the full-precision vector
//! used by graph construction. Keys embed the entry version, so an updated or
//! deleted record can never be served from a stale entry. Values are `Arc`-shared:
//! evicting an entry never frees a vector a concurrent reader is still scoring.

use crate::quantization::ScoringVector;
use crate::record::RecordId;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache of traversal-ready vectors for search.
pub type LocationCache = BoundedCache<(RecordId, u64), ScoringVector>;

/// Cache of full-precision vectors for graph construction.
pub type GraphBuildCache = BoundedCache<(RecordId, u64), Arc<[f32]>>;

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
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

/// LRU cache behind a `parking_lot::Mutex`. Capacity 0 disables caching.
#[derive(Debug)]
pub struct BoundedCache<K: Hash + Eq, V: Clone> {
    inner: Option<Mutex<LruCache<K, V>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.as_ref()?;
        let found = inner.lock().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, key: K, value: V) {
        if let Some(inner) = &self.inner {
            inner.lock().put(key, value);
        }
    }

    /// Return the cached value for `key`, or compute it with `load` and cache it.
    ///
    /// The lock is not held while `load` runs; two threads missing on the same key
    /// may both load it, and the later insert wins.
    pub fn get_or_load<F>(&self, key: K, load: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        if self.inner.is_none() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return load();
        }
        if let Some(v) = self.get(&key) {
            return Some(v);
        }
        let value = load()?;
        self.insert(key, value.clone());
        Some(value)
    }

    pub fn remove(&self, key: &K) {
        if let Some(inner) = &self.inner {
            inner.lock().pop(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }
}
