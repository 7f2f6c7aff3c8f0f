//! # Cache System
//!
//! Two-tier storage for proxied responses: a bounded in-process LRU hot
//! tier backed by an unbounded persistent cold tier, with key templating
//! and a background purge of expired cold entries.

mod cold;
mod entry;
mod hot;
mod key;
mod store;

pub use cold::{ColdStore, MongoColdStore};
pub use entry::{decode_response, encode_response, CacheEntry, StoredResponse};
pub use hot::HotTier;
pub use key::{render_cache_key, KeyVars};
pub use store::{
    connect_cold_tier, spawn_purge_task, CacheStatus, CacheStore, Lookup,
};
