//! Bounded LRU hot tier
//!
//! A recency-ordered map with a fixed entry capacity. Inserting past
//! capacity displaces the least-recently-used entry, which `insert`
//! returns to the caller so the store can write it through to the cold
//! tier before anything else touches that key.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use crate::cache::entry::CacheEntry;

pub struct HotTier {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl HotTier {
    /// Create a hot tier holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up a key, refreshing its recency on hit
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    /// Insert or overwrite an entry.
    ///
    /// Returns the entry displaced by LRU eviction, if any. An overwrite of
    /// the same key is not an eviction and returns `None`.
    pub fn insert(&self, key: String, entry: CacheEntry) -> Option<(String, CacheEntry)> {
        let mut entries = self.entries.lock();
        match entries.push(key.clone(), entry) {
            Some((evicted_key, evicted)) if evicted_key != key => Some((evicted_key, evicted)),
            _ => None,
        }
    }

    /// Drop an entry without touching the cold tier
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
