//! Store Retry Adapter
//!
//! Wraps any [`SharedStore`] so that a failed operation gets exactly one
//! retry after a short backoff before the failure is classified as
//! [`Error::StoreUnavailable`]. Quota, cache and lease logic never see the
//! retry; swapping the policy (longer backoff, circuit breaking) only
//! touches this file.
//!
//! Only `StoreUnavailable` is retried. Codec and logic errors pass through
//! untouched. A retried `incr_by` whose first attempt reached the store
//! before the connection dropped may be applied twice; quota accounting
//! errs on the side of rejecting in that case.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::domain::ports::{SharedStore, SubscriptionStream};
use crate::error::{Error, Result};

/// Shared store decorated with a single short-backoff retry
#[derive(Clone)]
pub struct RetryingStore {
    inner: Arc<dyn SharedStore>,
    policy: RetryConfig,
}

impl std::fmt::Debug for RetryingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingStore")
            .field("backoff", &self.policy.backoff)
            .finish()
    }
}

impl RetryingStore {
    /// Wrap a store with the given retry policy
    pub fn new(inner: Arc<dyn SharedStore>, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }

    /// Pause before the retry
    pub fn backoff(&self) -> Duration {
        self.policy.backoff
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        match attempt().await {
            Err(Error::StoreUnavailable(first)) => {
                debug!(operation, error = %first, "Store operation failed, retrying once");
                tokio::time::sleep(self.policy.backoff).await;
                attempt().await.map_err(|err| match err {
                    Error::StoreUnavailable(reason) => {
                        warn!(operation, error = %reason, "Store operation failed after retry");
                        Error::StoreUnavailable(format!("{}: {}", operation, reason))
                    }
                    other => other,
                })
            }
            other => other,
        }
    }
}

#[async_trait]
impl SharedStore for RetryingStore {
    async fn now(&self) -> Result<u64> {
        self.with_retry("now", || self.inner.now()).await
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        self.with_retry("incr_by", || self.inner.incr_by(key, delta, ttl))
            .await
    }

    async fn incr_below(
        &self,
        key: &str,
        delta: i64,
        ceiling: i64,
        ttl: Duration,
    ) -> Result<Option<i64>> {
        self.with_retry("incr_below", || {
            self.inner.incr_below(key, delta, ceiling, ttl)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.with_retry("get", || self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.with_retry("set", || self.inner.set(key, value.clone(), ttl))
            .await
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        self.with_retry("set_nx", || self.inner.set_nx(key, value.clone(), ttl))
            .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.with_retry("compare_and_swap", || {
            self.inner.compare_and_swap(key, expected, new.clone(), ttl)
        })
        .await
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.with_retry("delete_if_eq", || self.inner.delete_if_eq(key, expected))
            .await
    }

    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize> {
        self.with_retry("publish", || self.inner.publish(channel, message.clone()))
            .await
    }

    async fn subscribe(&self, channel: &str) -> Result<SubscriptionStream> {
        self.with_retry("subscribe", || self.inner.subscribe(channel))
            .await
    }
}
