//! Domain Ports (Port/Adapter Pattern)
//!
//! The admission layer owns no authoritative state. Quota windows, cache
//! entries, version tokens and in-flight markers all live in a shared
//! key-value store reached through the [`SharedStore`] port.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  QuotaTracker │ CacheEntryStore │ Singleflight │ Invalidator │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  SharedStore / EventPublisher
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │      InMemoryStore │ RetryingStore │ LoggingEventPublisher   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation is a single atomic store operation (increment,
//! set-if-absent, compare-and-swap, compare-and-delete). The port never
//! exposes a read-then-write sequence as one call.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use super::events::AdmissionEvent;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Opaque caller key used to partition quotas (IP, API key or a composite).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stream of messages delivered on a pub/sub channel.
///
/// The stream ends when the channel is closed by the store.
pub type SubscriptionStream = BoxStream<'static, Bytes>;

// =============================================================================
// Shared Store Port
// =============================================================================

/// Port for the shared key-value store.
///
/// All timestamps come from [`SharedStore::now`], the store's own clock, so
/// that nodes with skewed clocks still agree on window boundaries, stale
/// points and lease expiry.
///
/// # Example
///
/// ```ignore
/// struct RedisStore { /* ... */ }
///
/// #[async_trait]
/// impl SharedStore for RedisStore {
///     async fn now(&self) -> Result<u64> {
///         // TIME
///     }
///     // ...
/// }
/// ```
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Store server clock in milliseconds since the Unix epoch.
    async fn now(&self) -> Result<u64>;

    /// Atomically add `delta` to an integer counter, creating it at zero.
    ///
    /// `ttl` is applied only when the counter is created.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64>;

    /// Atomically add `delta` unless the result would exceed `ceiling`.
    ///
    /// Returns the new value on success, `None` when the increment was refused.
    /// The default implementation is a speculative increment followed by a
    /// compensating decrement, for stores without a native check-and-increment.
    /// It never over-admits, but concurrent callers may be refused spuriously
    /// while a speculative increment is outstanding.
    async fn incr_below(
        &self,
        key: &str,
        delta: i64,
        ceiling: i64,
        ttl: Duration,
    ) -> Result<Option<i64>> {
        let value = self.incr_by(key, delta, Some(ttl)).await?;
        if value > ceiling {
            self.incr_by(key, -delta, Some(ttl)).await?;
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a value unconditionally.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Write a value only if the key is absent (or expired). Returns whether it was written.
    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool>;

    /// Replace the value only if it currently equals `expected` (`None` = absent).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Delete the key only if it currently holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Publish a message, returning the number of subscribers that received it.
    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize>;

    /// Subscribe to a channel. Only messages published after this call are delivered.
    async fn subscribe(&self, channel: &str) -> Result<SubscriptionStream>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing admission events.
///
/// This trait abstracts event publishing, allowing different backends
/// (logging, in-memory, message bus) to be used.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an admission event.
    async fn publish(&self, event: AdmissionEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<AdmissionEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;

    #[test]
    fn test_identity_value_object() {
        let a = Identity::new("key:abc");
        let b: Identity = "key:abc".into();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "key:abc");
        assert_eq!(format!("{}", a), "key:abc");
        assert_eq!(Identity::from("x".to_string()).0, "x");
    }

    /// Counter-only store used to exercise the default `incr_below` fallback.
    #[derive(Default)]
    struct CounterStore {
        counters: Mutex<HashMap<String, i64>>,
    }

    #[async_trait]
    impl SharedStore for CounterStore {
        async fn now(&self) -> Result<u64> {
            Ok(0)
        }

        async fn incr_by(&self, key: &str, delta: i64, _ttl: Option<Duration>) -> Result<i64> {
            let mut counters = self.counters.lock();
            let value = counters.entry(key.to_string()).or_insert(0);
            *value += delta;
            Ok(*value)
        }

        async fn get(&self, key: &str) -> Result<Option<Bytes>> {
            Ok(self
                .counters
                .lock()
                .get(key)
                .map(|v| Bytes::from(v.to_string())))
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<()> {
            Ok(())
        }

        async fn set_nx(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<bool> {
            Ok(false)
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&[u8]>,
            _new: Bytes,
            _ttl: Option<Duration>,
        ) -> Result<bool> {
            Ok(false)
        }

        async fn delete_if_eq(&self, _key: &str, _expected: &[u8]) -> Result<bool> {
            Ok(false)
        }

        async fn publish(&self, _channel: &str, _message: Bytes) -> Result<usize> {
            Ok(0)
        }

        async fn subscribe(&self, _channel: &str) -> Result<SubscriptionStream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[tokio::test]
    async fn test_default_incr_below_compensates_on_refusal() {
        let store = CounterStore::default();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.incr_below("c", 1, 2, ttl).await.unwrap(), Some(1));
        assert_eq!(store.incr_below("c", 1, 2, ttl).await.unwrap(), Some(2));
        assert_eq!(store.incr_below("c", 1, 2, ttl).await.unwrap(), None);

        // The refused increment was rolled back
        assert_eq!(store.counters.lock().get("c").copied(), Some(2));
    }
}
