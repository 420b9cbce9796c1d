//! In-Memory Shared Store
//!
//! Single-node implementation of the [`SharedStore`] port. Keys live in a
//! sharded `DashMap`, so each operation is atomic per key without a global
//! lock; pub/sub channels are tokio broadcast channels.
//!
//! # Design
//!
//! - Counters are stored as ASCII decimals, like a Redis `INCR` value
//! - Expiry is lazy: expired slots are treated as absent and dropped on access
//! - The clock is `tokio::time::Instant` anchored to the wall clock at
//!   construction, so paused-time tests control TTLs, windows and leases
//! - Fault injection (`set_available`, `fail_next`) simulates an unreachable store
//! - A pub/sub channel lives only while it has subscribers; the last
//!   subscription stream to drop removes it

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use crate::domain::ports::{SharedStore, SubscriptionStream};
use crate::error::{Error, Result};

/// Buffered messages per pub/sub channel before slow subscribers lag
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Slot {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Bytes, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Store statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Live and not-yet-purged keys
    pub keys: usize,
    /// Open pub/sub channels
    pub channels: usize,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
}

/// In-memory shared store
pub struct InMemoryStore {
    data: DashMap<String, Slot>,
    channels: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    epoch_ms: u64,
    started: Instant,
    available: AtomicBool,
    pending_failures: AtomicU32,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            data: DashMap::new(),
            channels: Arc::new(DashMap::new()),
            epoch_ms,
            started: Instant::now(),
            available: AtomicBool::new(true),
            pending_failures: AtomicU32::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("keys", &self.data.len())
            .field("channels", &self.channels.len())
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the store offline (or back online); every operation fails while offline
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` operations fail, then recover
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Drop all expired slots, and any channel nobody listens on
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, slot| !slot.is_expired(now));
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.data.len()
    }

    /// Get store statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.data.len(),
            channels: self.channels.len(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn check_available(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("store offline".into()));
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::StoreUnavailable("injected failure".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<()> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Apply `delta` to a counter if `admit(current + delta)` holds.
    fn update_counter(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
        admit: impl Fn(i64) -> bool,
    ) -> Result<Option<i64>> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut e) if !e.get().is_expired(now) => {
                let next = parse_counter(key, &e.get().value)? + delta;
                if !admit(next) {
                    return Ok(None);
                }
                e.get_mut().value = encode_counter(next);
                Ok(Some(next))
            }
            Entry::Occupied(mut e) => {
                if !admit(delta) {
                    e.remove();
                    return Ok(None);
                }
                e.insert(Slot::new(encode_counter(delta), ttl, now));
                Ok(Some(delta))
            }
            Entry::Vacant(e) => {
                if !admit(delta) {
                    return Ok(None);
                }
                e.insert(Slot::new(encode_counter(delta), ttl, now));
                Ok(Some(delta))
            }
        }
    }
}

fn encode_counter(value: i64) -> Bytes {
    Bytes::from(value.to_string())
}

fn parse_counter(key: &str, raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::Codec(format!("value at {} is not an integer", key)))
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn now(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.epoch_ms + self.started.elapsed().as_millis() as u64)
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        self.write()?;
        self.update_counter(key, delta, ttl, |_| true)?
            .ok_or_else(|| Error::Internal("unconditional increment refused".into()))
    }

    async fn incr_below(
        &self,
        key: &str,
        delta: i64,
        ceiling: i64,
        ttl: Duration,
    ) -> Result<Option<i64>> {
        self.write()?;
        self.update_counter(key, delta, Some(ttl), |next| next <= ceiling)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.read()?;
        let now = Instant::now();
        let hit = self
            .data
            .get(key)
            .map(|slot| (slot.is_expired(now), slot.value.clone()));
        match hit {
            Some((false, value)) => Ok(Some(value)),
            Some((true, _)) => {
                self.data.remove_if(key, |_, slot| slot.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.write()?;
        self.data
            .insert(key.to_string(), Slot::new(value, ttl, Instant::now()));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        self.write()?;
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(e) if !e.get().is_expired(now) => Ok(false),
            Entry::Occupied(mut e) => {
                e.insert(Slot::new(value, Some(ttl), now));
                Ok(true)
            }
            Entry::Vacant(e) => {
                e.insert(Slot::new(value, Some(ttl), now));
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.write()?;
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let current = (!e.get().is_expired(now)).then(|| e.get().value.clone());
                if current.as_deref() != expected {
                    return Ok(false);
                }
                e.insert(Slot::new(new, ttl, now));
                Ok(true)
            }
            Entry::Vacant(e) => {
                if expected.is_some() {
                    return Ok(false);
                }
                e.insert(Slot::new(new, ttl, now));
                Ok(true)
            }
        }
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.write()?;
        let now = Instant::now();
        Ok(self
            .data
            .remove_if(key, |_, slot| {
                !slot.is_expired(now) && slot.value.as_ref() == expected
            })
            .is_some())
    }

    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize> {
        self.write()?;
        let sender = self.channels.get(channel).map(|s| s.value().clone());
        let Some(sender) = sender else {
            return Ok(0);
        };
        match sender.send(message) {
            Ok(receivers) => Ok(receivers),
            Err(_) => {
                self.channels
                    .remove_if(channel, |_, s| s.receiver_count() == 0);
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<SubscriptionStream> {
        self.read()?;
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let subscription = Subscription {
            rx,
            channel: channel.to_string(),
            channels: self.channels.clone(),
        };
        let stream = futures::stream::unfold(subscription, |mut sub| async move {
            loop {
                match sub.rx.recv().await {
                    Ok(message) => return Some((message, sub)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Receiving end of a channel; the last one dropped removes the channel
struct Subscription {
    rx: broadcast::Receiver<Bytes>,
    channel: String,
    channels: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // `rx` is still alive here, so a count of one means it is the last
        self.channels
            .remove_if(&self.channel, |_, sender| sender.receiver_count() <= 1);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_incr_creates_and_accumulates() {
        let store = InMemoryStore::new();
        assert_eq!(store.incr_by("c", 1, None).await.unwrap(), 1);
        assert_eq!(store.incr_by("c", 4, None).await.unwrap(), 5);
        assert_eq!(store.incr_by("c", -2, None).await.unwrap(), 3);
        assert_eq!(store.get("c").await.unwrap(), Some(Bytes::from("3")));
    }

    #[tokio::test]
    async fn test_incr_on_non_integer_is_codec_error() {
        let store = InMemoryStore::new();
        store.set("k", Bytes::from("abc"), None).await.unwrap();
        assert!(matches!(
            store.incr_by("k", 1, None).await,
            Err(Error::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_incr_below_is_atomic_check() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_below("q", 2, 3, ttl).await.unwrap(), Some(2));
        assert_eq!(store.incr_below("q", 2, 3, ttl).await.unwrap(), None);
        assert_eq!(store.incr_below("q", 1, 3, ttl).await.unwrap(), Some(3));
        // Refusals leave no trace
        assert_eq!(store.get("q").await.unwrap(), Some(Bytes::from("3")));
    }

    #[tokio::test]
    async fn test_incr_below_on_absent_key_respects_ceiling() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_below("q", 1, 0, ttl).await.unwrap(), None);
        assert_eq!(store.get("q").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set("k", Bytes::from("v"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.stats().keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = InMemoryStore::new();
        store
            .set("short", Bytes::from("v"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set("forever", Bytes::from("v"), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.stats().keys, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_ttl_applies_on_creation_only() {
        let store = InMemoryStore::new();
        let ttl = Some(Duration::from_secs(10));
        store.incr_by("c", 1, ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        store.incr_by("c", 1, ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        // Created 11s ago: expired despite the second increment
        assert_eq!(store.incr_by("c", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let store = InMemoryStore::new();
        let t0 = store.now().await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        let t1 = store.now().await.unwrap();
        assert_eq!(t1 - t0, 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_only_when_absent_or_expired() {
        let store = InMemoryStore::new();
        let lease = Duration::from_millis(500);
        assert!(store.set_nx("lock", Bytes::from("a"), lease).await.unwrap());
        assert!(!store.set_nx("lock", Bytes::from("b"), lease).await.unwrap());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(store.set_nx("lock", Bytes::from("b"), lease).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(Bytes::from("b")));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = InMemoryStore::new();
        assert!(store
            .compare_and_swap("k", None, Bytes::from("1"), None)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("k", None, Bytes::from("2"), None)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("k", Some(b"9"), Bytes::from("2"), None)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some(b"1"), Bytes::from("2"), None)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_delete_if_eq_checks_owner() {
        let store = InMemoryStore::new();
        let lease = Duration::from_secs(5);
        store.set_nx("lock", Bytes::from("owner-a"), lease).await.unwrap();
        assert!(!store.delete_if_eq("lock", b"owner-b").await.unwrap());
        assert!(store.delete_if_eq("lock", b"owner-a").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pubsub_delivers_after_subscribe() {
        let store = InMemoryStore::new();
        assert_eq!(store.publish("ch", Bytes::from("early")).await.unwrap(), 0);

        let mut sub = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", Bytes::from("hello")).await.unwrap(), 1);
        assert_eq!(sub.next().await, Some(Bytes::from("hello")));
    }

    #[tokio::test]
    async fn test_publish_drops_abandoned_channel() {
        let store = InMemoryStore::new();
        let sub = store.subscribe("ch").await.unwrap();
        drop(sub);
        assert_eq!(store.publish("ch", Bytes::from("x")).await.unwrap(), 0);
        assert_eq!(store.stats().channels, 0);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_removes_channel() {
        let store = InMemoryStore::new();
        let mut subs = Vec::new();
        for i in 0..50 {
            let channel = format!("flight-done:k{}", i % 25);
            subs.push(store.subscribe(&channel).await.unwrap());
        }
        assert_eq!(store.stats().channels, 25);

        // Second listeners leave; every channel still has its first
        subs.truncate(25);
        assert_eq!(store.stats().channels, 25);
        assert_eq!(store.publish("flight-done:k0", Bytes::from("done")).await.unwrap(), 1);
        assert_eq!(subs[0].next().await, Some(Bytes::from("done")));

        subs.clear();
        assert_eq!(store.stats().channels, 0);

        // A fresh subscription recreates the channel
        let mut sub = store.subscribe("flight-done:k0").await.unwrap();
        assert_eq!(store.publish("flight-done:k0", Bytes::from("again")).await.unwrap(), 1);
        assert_eq!(sub.next().await, Some(Bytes::from("again")));
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_operation() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.now().await, Err(Error::StoreUnavailable(_))));
        assert!(store.get("k").await.is_err());
        assert!(store.incr_by("c", 1, None).await.is_err());

        store.set_available(true);
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_next_recovers() {
        let store = InMemoryStore::new();
        store.fail_next(2);
        assert!(store.get("k").await.is_err());
        assert!(store.get("k").await.is_err());
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_track_operations() {
        let store = InMemoryStore::new();
        store.set("a", Bytes::from("1"), None).await.unwrap();
        store.get("a").await.unwrap();
        store.get("b").await.unwrap();
        let stats = store.stats();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
    }
}
