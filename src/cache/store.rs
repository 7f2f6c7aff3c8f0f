//! Two-tier cache store
//!
//! The hot tier answers first; a hot miss falls through to the cold tier,
//! and a cold hit is promoted back into the hot tier. Writes only touch
//! the hot tier — the cold tier is populated by the eviction write-back,
//! so slow-tier writes scale with the eviction rate rather than the
//! request rate.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::cold::ColdStore;
use crate::cache::entry::CacheEntry;
use crate::cache::hot::HotTier;
use crate::routing::SharedRoutingTable;

/// Cache status for a request, as recorded in the access log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache
    Hit,
    /// Not in cache, fetched from origin
    Miss,
    /// In cache but past expiry
    Expired,
    /// Expired entry served because the refresh fetch was unusable
    Stale,
    /// Served the result of another request's origin fetch
    Collapsed,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Expired => "EXPIRED",
            CacheStatus::Stale => "STALE",
            CacheStatus::Collapsed => "COLLAPSED",
        }
    }
}

/// Result of a cache lookup: the payload plus how it was found
#[derive(Debug)]
pub struct Lookup {
    pub data: Bytes,
    pub status: CacheStatus,
}

/// The two-tier response cache
pub struct CacheStore {
    hot: HotTier,
    cold: Option<Arc<dyn ColdStore>>,
}

impl CacheStore {
    /// Build a store; `cold` is `None` when the persistent tier is
    /// unavailable, which degrades to hot-tier-only behavior.
    pub fn new(hot_capacity: usize, cold: Option<Arc<dyn ColdStore>>) -> Self {
        Self {
            hot: HotTier::new(hot_capacity),
            cold,
        }
    }

    /// Look up a key across both tiers.
    ///
    /// Expiry is checked here, not assumed from presence: an expired entry
    /// is returned as `Expired` together with its stale payload so the
    /// caller can decide between serve-stale and refresh.
    pub async fn get(&self, key: &str) -> Lookup {
        if let Some(entry) = self.hot.get(key) {
            let status = if entry.is_expired() {
                CacheStatus::Expired
            } else {
                CacheStatus::Hit
            };
            return Lookup {
                data: entry.data,
                status,
            };
        }

        if let Some(cold) = &self.cold {
            if let Some(entry) = cold.get(key).await {
                if entry.is_expired() {
                    cold.remove(key).await;
                    return Lookup {
                        data: entry.data,
                        status: CacheStatus::Expired,
                    };
                }
                // Promote into the hot tier with the original expiry
                self.insert(key.to_string(), entry.clone()).await;
                return Lookup {
                    data: entry.data,
                    status: CacheStatus::Hit,
                };
            }
        }

        Lookup {
            data: Bytes::new(),
            status: CacheStatus::Miss,
        }
    }

    /// Insert or overwrite the hot-tier entry for `key`
    pub async fn set(&self, key: String, data: Bytes, expires_at: DateTime<Utc>) {
        self.insert(key, CacheEntry::new(data, expires_at)).await;
    }

    async fn insert(&self, key: String, entry: CacheEntry) {
        if let Some((evicted_key, evicted)) = self.hot.insert(key, entry) {
            // Write-back on eviction: only entries that survived long
            // enough to be displaced, and are still unexpired, reach the
            // cold tier.
            if !evicted.is_expired() {
                if let Some(cold) = &self.cold {
                    cold.set(&evicted_key, &evicted).await;
                }
            }
        }
    }

    /// Number of entries currently in the hot tier
    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    /// Whether a cold tier is attached
    pub fn has_cold_tier(&self) -> bool {
        self.cold.is_some()
    }

    /// Remove expired cold-tier entries, returning the count removed
    pub async fn purge_cold(&self) -> u64 {
        match &self.cold {
            Some(cold) => cold.purge_expired().await,
            None => 0,
        }
    }
}

/// Spawn the background purge task.
///
/// On each tick the cold tier drops expired documents and every location's
/// collapse registry compacts idle targets. The hot tier self-expires via
/// `get` and is never swept.
pub fn spawn_purge_task(
    store: Arc<CacheStore>,
    routing: SharedRoutingTable,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so startup isn't
        // counted as a sweep.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = store.purge_cold().await;
            let compacted = routing.read().await.compact_registries();
            if purged > 0 || compacted > 0 {
                debug!(purged = purged, compacted = compacted, "Cache purge sweep completed");
            }
        }
    })
}

/// Connect the cold tier, degrading to `None` on failure
pub async fn connect_cold_tier(uri: &str, db_name: &str) -> Option<Arc<dyn ColdStore>> {
    match crate::cache::cold::MongoColdStore::connect(uri, db_name).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("Cold tier unavailable, running hot-tier only: {}", e);
            None
        }
    }
}
