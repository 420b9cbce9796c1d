//! Cache Entry Store
//!
//! Versioned entries with hard and soft expiry on top of the shared store.
//! Lookups never block on a miss; recomputation belongs to the singleflight
//! coordinator.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::entry::{CacheEntry, Freshness};
use super::key::CacheKey;
use crate::config::CacheConfig;
use crate::domain::ports::SharedStore;
use crate::error::Result;

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    /// Cached value; empty when not found
    pub value: Bytes,
    pub found: bool,
    /// Found but past its soft TTL
    pub stale: bool,
}

impl CacheLookup {
    pub fn miss() -> Self {
        Self {
            value: Bytes::new(),
            found: false,
            stale: false,
        }
    }

    fn hit(value: Bytes, stale: bool) -> Self {
        Self {
            value,
            found: true,
            stale,
        }
    }

    pub fn is_fresh_hit(&self) -> bool {
        self.found && !self.stale
    }
}

/// Cache entries in the shared store
#[derive(Clone)]
pub struct CacheEntryStore {
    store: Arc<dyn SharedStore>,
    config: CacheConfig,
}

impl std::fmt::Debug for CacheEntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntryStore")
            .field("config", &self.config)
            .finish()
    }
}

impl CacheEntryStore {
    pub fn new(store: Arc<dyn SharedStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up an entry. Expired entries are misses; corrupt ones are
    /// misses too, so the next compute overwrites them.
    pub async fn get(&self, key: &CacheKey) -> Result<CacheLookup> {
        let Some(raw) = self.store.get(&store_key(key)).await? else {
            return Ok(CacheLookup::miss());
        };
        let entry = match CacheEntry::decode(raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %key, error = %err, "Discarding unreadable cache entry");
                return Ok(CacheLookup::miss());
            }
        };

        let now = self.store.now().await?;
        let lookup = match entry.freshness(now) {
            Freshness::Fresh => CacheLookup::hit(entry.value, false),
            Freshness::Stale => CacheLookup::hit(entry.value, true),
            Freshness::Expired => CacheLookup::miss(),
        };
        debug!(key = %key, found = lookup.found, stale = lookup.stale, "Cache lookup");
        Ok(lookup)
    }

    /// Store `value` under `key` for `ttl`, going stale after the configured soft TTL
    pub async fn put(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<CacheEntry> {
        let now = self.store.now().await?;
        let entry = CacheEntry::new(value, now, self.config.soft_ttl, ttl);
        self.store
            .set(&store_key(key), entry.encode(), Some(ttl))
            .await?;
        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Cache entry written");
        Ok(entry)
    }

    /// Store `value` with the configured TTL
    pub async fn put_default(&self, key: &CacheKey, value: Bytes) -> Result<CacheEntry> {
        self.put(key, value, self.config.ttl).await
    }
}

fn store_key(key: &CacheKey) -> String {
    format!("cache:{}", key)
}
