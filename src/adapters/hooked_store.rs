//! Store wrapper that runs a hook after each operation, for interleaving tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use super::InMemoryStore;
use crate::domain::ports::{SharedStore, SubscriptionStream};
use crate::error::Result;

type Hook = Box<dyn Fn(&'static str, &str) -> BoxFuture<'static, ()> + Send + Sync>;

/// Delegates to an [`InMemoryStore`], awaiting `hook(operation, key)` after each call
pub(crate) struct HookedStore {
    inner: Arc<InMemoryStore>,
    hook: Hook,
}

impl HookedStore {
    pub(crate) fn new<H>(inner: Arc<InMemoryStore>, hook: H) -> Self
    where
        H: Fn(&'static str, &str) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            inner,
            hook: Box::new(hook),
        }
    }

    async fn after<T>(&self, op: &'static str, key: &str, out: T) -> T {
        (self.hook)(op, key).await;
        out
    }
}

#[async_trait]
impl SharedStore for HookedStore {
    async fn now(&self) -> Result<u64> {
        self.inner.now().await
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let out = self.inner.incr_by(key, delta, ttl).await;
        self.after("incr_by", key, out).await
    }

    async fn incr_below(
        &self,
        key: &str,
        delta: i64,
        ceiling: i64,
        ttl: Duration,
    ) -> Result<Option<i64>> {
        let out = self.inner.incr_below(key, delta, ceiling, ttl).await;
        self.after("incr_below", key, out).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let out = self.inner.get(key).await;
        self.after("get", key, out).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let out = self.inner.set(key, value, ttl).await;
        self.after("set", key, out).await
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let out = self.inner.set_nx(key, value, ttl).await;
        self.after("set_nx", key, out).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let out = self.inner.compare_and_swap(key, expected, new, ttl).await;
        self.after("compare_and_swap", key, out).await
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let out = self.inner.delete_if_eq(key, expected).await;
        self.after("delete_if_eq", key, out).await
    }

    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize> {
        let out = self.inner.publish(channel, message).await;
        self.after("publish", channel, out).await
    }

    async fn subscribe(&self, channel: &str) -> Result<SubscriptionStream> {
        let out = self.inner.subscribe(channel).await;
        self.after("subscribe", channel, out).await
    }
}
