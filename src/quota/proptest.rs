//! Property-Based Tests for the Quota Tracker
//!
//! Uses proptest to drive randomized bursts of concurrent admits against a
//! shared store and checks the admission bound.
//!
//! # Test Properties
//!
//! 1. **Bound**: admitted ≤ limit + burst within one period, for any identity
//! 2. **Liveness**: with an exact store, at least `min(requests, limit)` are admitted
//! 3. **Fallback Safety**: the speculative increment fallback never over-admits

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use proptest::prelude::*;

use super::tracker::QuotaTracker;
use crate::adapters::InMemoryStore;
use crate::config::QuotaConfig;
use crate::domain::ports::{Identity, SharedStore, SubscriptionStream};
use crate::error::Result;

// =============================================================================
// Helpers
// =============================================================================

/// Delegates everything except `incr_below`, forcing the trait's
/// speculative-increment fallback.
struct SpeculativeStore(InMemoryStore);

#[async_trait]
impl SharedStore for SpeculativeStore {
    async fn now(&self) -> Result<u64> {
        self.0.now().await
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        // Let other tasks interleave between the increment and its compensation
        tokio::task::yield_now().await;
        self.0.incr_by(key, delta, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.0.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.0.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        self.0.set_nx(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.0.compare_and_swap(key, expected, new, ttl).await
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.0.delete_if_eq(key, expected).await
    }

    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize> {
        self.0.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<SubscriptionStream> {
        self.0.subscribe(channel).await
    }
}

/// Fire `requests` concurrent admits for one identity and count the admitted ones
fn admitted_count(
    store: Arc<dyn SharedStore>,
    limit: u64,
    burst: u64,
    requests: usize,
) -> std::io::Result<usize> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?;

    Ok(runtime.block_on(async move {
        let tracker = Arc::new(QuotaTracker::new(
            store,
            QuotaConfig {
                limit,
                // Long enough that the run never sees a refill or a window change worth a token
                period: Duration::from_secs(24 * 3600),
                burst,
                ..Default::default()
            },
        ));
        let identity = Identity::new("prop-user");

        let handles: Vec<_> = (0..requests)
            .map(|_| {
                let tracker = tracker.clone();
                let identity = identity.clone();
                tokio::spawn(async move { tracker.admit(&identity, 1).await.allowed })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if matches!(handle.await, Ok(true)) {
                admitted += 1;
            }
        }
        admitted
    }))
}

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for (limit, burst) pairs
fn quota_strategy() -> impl Strategy<Value = (u64, u64)> {
    (1u64..=20, 0u64..=5)
}

/// Strategy for the number of concurrent requests
fn requests_strategy() -> impl Strategy<Value = usize> {
    1usize..=60
}

// =============================================================================
// Admission Bound Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: concurrent admits never exceed limit + burst.
    #[test]
    fn prop_admitted_never_exceeds_limit_plus_burst(
        (limit, burst) in quota_strategy(),
        requests in requests_strategy(),
    ) {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let admitted = admitted_count(store, limit, burst, requests)?;

        prop_assert!(
            admitted as u64 <= limit + burst,
            "admitted {} with limit={}, burst={}", admitted, limit, burst
        );
    }

    /// Property: an exact check-and-increment admits everything up to the limit.
    #[test]
    fn prop_exact_store_admits_up_to_limit(
        (limit, burst) in quota_strategy(),
        requests in requests_strategy(),
    ) {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let admitted = admitted_count(store, limit, burst, requests)?;

        let floor = std::cmp::min(requests as u64, limit);
        prop_assert!(
            admitted as u64 >= floor,
            "admitted only {} of {} with limit={}", admitted, requests, limit
        );
    }

    /// Property: the speculative fallback may refuse spuriously but never over-admits.
    #[test]
    fn prop_speculative_fallback_never_over_admits(
        (limit, burst) in quota_strategy(),
        requests in requests_strategy(),
    ) {
        let store: Arc<dyn SharedStore> = Arc::new(SpeculativeStore(InMemoryStore::new()));
        let admitted = admitted_count(store, limit, burst, requests)?;

        prop_assert!(
            admitted as u64 <= limit + burst,
            "fallback admitted {} with limit={}, burst={}", admitted, limit, burst
        );
    }
}
