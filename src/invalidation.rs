//! Version-Token Invalidation
//!
//! Every resource namespace has a monotonic version counter in the shared
//! store (`version:{namespace}`). Cache keys embed the current version, so
//! one atomic increment invalidates every entry of the namespace at once
//! without enumerating or deleting keys; old entries simply age out.
//!
//! # Bounded staleness
//!
//! [`Invalidator::current_version`] reads through a local cache whose TTL is
//! `invalidation.version_cache_ttl` (at most 5s). This bounds store round
//! trips on the read path, and it means a bump made by *another* process
//! may not change the cache keys used here until the local entry expires.
//! Requests in that window keep hitting the previous version's entries.
//! A bump made through *this* invalidator is visible here immediately.
//! Set the TTL to zero to read the store on every request.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::config::InvalidationConfig;
use crate::domain::events::AdmissionEvent;
use crate::domain::ports::{EventPublisher, SharedStore};
use crate::error::{Error, Result};
use crate::metrics::AdmissionMetrics;

#[derive(Debug, Clone, Copy)]
struct CachedVersion {
    version: u64,
    fetched_at: Instant,
}

/// Maintains per-namespace version tokens
pub struct Invalidator {
    store: Arc<dyn SharedStore>,
    config: InvalidationConfig,
    local: DashMap<String, CachedVersion>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<AdmissionMetrics>,
}

impl std::fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invalidator")
            .field("config", &self.config)
            .field("cached_namespaces", &self.local.len())
            .finish()
    }
}

impl Invalidator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: InvalidationConfig,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<AdmissionMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            local: DashMap::new(),
            events,
            metrics,
        }
    }

    /// Longest time a remote bump can go unnoticed by this process
    pub fn staleness_bound(&self) -> Duration {
        self.config.version_cache_ttl
    }

    /// Advance the namespace's version after a mutation. One atomic increment.
    #[instrument(skip(self))]
    pub async fn bump(&self, namespace: &str) -> Result<u64> {
        let raw = self.store.incr_by(&version_key(namespace), 1, None).await?;
        let version = u64::try_from(raw)
            .map_err(|_| Error::Codec(format!("negative version for {}", namespace)))?;
        self.remember(namespace, version);

        info!(namespace, version, "Version bumped");
        self.metrics.record_version_bump();
        if let Err(err) = self
            .events
            .publish(AdmissionEvent::version_bumped(namespace, version))
            .await
        {
            debug!(error = %err, "Failed to publish version bump event");
        }
        Ok(version)
    }

    /// Current version of the namespace; zero if it was never bumped
    #[instrument(skip(self))]
    pub async fn current_version(&self, namespace: &str) -> Result<u64> {
        if let Some(cached) = self.local.get(namespace).map(|c| *c.value()) {
            if cached.fetched_at.elapsed() < self.config.version_cache_ttl {
                return Ok(cached.version);
            }
        }

        let version = match self.store.get(&version_key(namespace)).await? {
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| Error::Codec(format!("version for {} is not an integer", namespace)))?,
            None => 0,
        };
        debug!(namespace, version, "Version read from store");
        Ok(self.remember(namespace, version))
    }

    /// Drop the locally cached version so the next read goes to the store
    pub fn forget(&self, namespace: &str) {
        self.local.remove(namespace);
    }

    /// Versions only move forward, so a slow read never hides a newer bump
    fn remember(&self, namespace: &str, version: u64) -> u64 {
        let now = Instant::now();
        let mut entry = self
            .local
            .entry(namespace.to_string())
            .or_insert(CachedVersion {
                version,
                fetched_at: now,
            });
        entry.version = entry.version.max(version);
        entry.fetched_at = now;
        entry.version
    }
}

fn version_key(namespace: &str) -> String {
    format!("version:{}", namespace)
}
