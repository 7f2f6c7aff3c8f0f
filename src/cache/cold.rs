//! Persistent cold tier
//!
//! Overflow storage for entries evicted from the hot tier, backed by a
//! MongoDB collection. The cold tier is best-effort: any driver failure or
//! undecodable document is reported as a miss so the cache degrades to
//! hot-tier-only behavior instead of failing requests.

use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary};
use bytes::Bytes;
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::entry::CacheEntry;
use crate::types::{Result, WaypointError};

const CACHE_COLLECTION: &str = "cache";

/// Storage backend for the cold tier
#[async_trait]
pub trait ColdStore: Send + Sync {
    /// Fetch an entry; `None` covers both absence and backend failure
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    /// Insert or overwrite an entry; failures are logged, not propagated
    async fn set(&self, key: &str, entry: &CacheEntry);
    /// Delete one entry
    async fn remove(&self, key: &str);
    /// Delete every entry whose expiry has passed, returning the count
    async fn purge_expired(&self) -> u64;
}

/// Cold-tier document
#[derive(Debug, Serialize, Deserialize)]
struct ColdDoc {
    #[serde(rename = "_id")]
    key: String,
    response: Binary,
    expire_time: bson::DateTime,
}

/// MongoDB-backed cold tier
pub struct MongoColdStore {
    collection: Collection<ColdDoc>,
}

impl MongoColdStore {
    /// Connect and verify the backing database is reachable
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // serverSelectionTimeoutMS keeps startup from hanging on an
        // unreachable MongoDB
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| WaypointError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| WaypointError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            collection: client.database(db_name).collection(CACHE_COLLECTION),
        })
    }
}

#[async_trait]
impl ColdStore for MongoColdStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        match self.collection.find_one(doc! { "_id": key }).await {
            Ok(Some(doc)) => Some(CacheEntry::new(
                Bytes::from(doc.response.bytes),
                doc.expire_time.to_chrono(),
            )),
            Ok(None) => None,
            Err(e) => {
                warn!(key = key, error = %e, "Cold tier read failed, treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry) {
        let doc = ColdDoc {
            key: key.to_string(),
            response: Binary {
                subtype: BinarySubtype::Generic,
                bytes: entry.data.to_vec(),
            },
            expire_time: bson::DateTime::from_chrono(entry.expires_at),
        };

        if let Err(e) = self
            .collection
            .replace_one(doc! { "_id": key }, doc)
            .upsert(true)
            .await
        {
            warn!(key = key, error = %e, "Cold tier write failed");
        }
    }

    async fn remove(&self, key: &str) {
        if let Err(e) = self.collection.delete_one(doc! { "_id": key }).await {
            warn!(key = key, error = %e, "Cold tier delete failed");
        }
    }

    async fn purge_expired(&self) -> u64 {
        match self
            .collection
            .delete_many(doc! { "expire_time": { "$lt": bson::DateTime::now() } })
            .await
        {
            Ok(result) => result.deleted_count,
            Err(e) => {
                warn!(error = %e, "Cold tier purge failed");
                0
            }
        }
    }
}
