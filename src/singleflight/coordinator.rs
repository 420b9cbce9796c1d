//! Singleflight Coordinator
//!
//! At most one computation per cache key at a time, across tasks of this
//! process and across processes sharing the store.
//!
//! # Roles
//!
//! ```text
//!                 execute(key)
//!                      │
//!        local flight for key? ── yes ──► local follower (watch, bounded per phase)
//!                      │ no                       │ stalled
//!                      ▼                          ▼
//!            spawn flight driver task     shared recovery (one per flight)
//!                      │
//!        SETNX flight:{key} ── won ──► leader: compute ► cache put ► PUBLISH ► release
//!                      │ lost
//!                      ▼
//!    remote follower: SUBSCRIBE, re-check cache, wait ≤ follower_timeout
//!                      │ timeout                     │ released / abandoned
//!        lease gone? ── yes ──► promoted leader      └──► contend again as leader
//!                      │ no
//!                      ▼
//!              independent compute
//! ```
//!
//! The driver runs in its own task, so a leader whose originating request is
//! cancelled still completes and wakes everyone waiting on it. Local
//! followers see the driver's phase: while it waits on a remote leader they
//! allow it `2 × follower_timeout`, while it computes they allow it the lease
//! duration. Only a driver that overruns those bounds triggers a recovery,
//! and all stalled followers of one flight share that single recovery.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::{Entry, VacantEntry};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, instrument, warn};

use super::signal::{done_channel, lease_key, FlightSignal, LeaseToken};
use crate::cache::{CacheEntryStore, CacheKey};
use crate::config::FlightConfig;
use crate::domain::events::AdmissionEvent;
use crate::domain::ports::{EventPublisher, SharedStore};
use crate::error::{Error, Result};
use crate::metrics::AdmissionMetrics;

/// Lease takeovers attempted before falling back to an independent compute
const MAX_PROMOTION_ATTEMPTS: usize = 3;

/// How a caller obtained its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// Took the lease and computed
    Leader,
    /// Received another caller's result
    Follower,
    /// Took over the lease after the previous leader disappeared
    Promoted,
    /// Computed without the lease after waiting on a live leader timed out
    Independent,
}

impl std::fmt::Display for FlightRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlightRole::Leader => write!(f, "leader"),
            FlightRole::Follower => write!(f, "follower"),
            FlightRole::Promoted => write!(f, "promoted"),
            FlightRole::Independent => write!(f, "independent"),
        }
    }
}

/// Result of [`SingleflightCoordinator::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightOutcome {
    pub value: Bytes,
    /// The value was produced by another caller's compute
    pub shared: bool,
    pub role: FlightRole,
}

/// Failure shared between everyone waiting on one flight
#[derive(Debug, Clone, PartialEq, Eq)]
enum FlightFailure {
    Compute(String),
    Store(String),
    Internal(String),
}

impl From<&Error> for FlightFailure {
    fn from(err: &Error) -> Self {
        match err {
            Error::ComputeFailed(msg) => FlightFailure::Compute(msg.clone()),
            Error::StoreUnavailable(msg) => FlightFailure::Store(msg.clone()),
            other => FlightFailure::Internal(other.to_string()),
        }
    }
}

impl From<FlightFailure> for Error {
    fn from(failure: FlightFailure) -> Self {
        match failure {
            FlightFailure::Compute(msg) => Error::ComputeFailed(msg),
            FlightFailure::Store(msg) => Error::StoreUnavailable(msg),
            FlightFailure::Internal(msg) => Error::Internal(msg),
        }
    }
}

type FlightResult = std::result::Result<(Bytes, FlightRole), FlightFailure>;

/// Phase of a local flight as seen by its followers
#[derive(Debug, Clone)]
enum FlightState {
    /// Contending for the lease or waiting on a remote leader
    Waiting,
    /// A compute for the key is running in this process
    Computing,
    Done(FlightResult),
}

/// Phase updates from a driver to its local followers
#[derive(Clone, Copy)]
struct Progress<'a>(Option<&'a watch::Sender<FlightState>>);

impl Progress<'_> {
    fn set(&self, state: FlightState) {
        if let Some(tx) = self.0 {
            tx.send_modify(|current| *current = state);
        }
    }
}

struct LocalFlight {
    id: u64,
    state: watch::Receiver<FlightState>,
    recovery: Arc<OnceCell<FlightResult>>,
}

enum Slot {
    Joined(watch::Receiver<FlightState>, Arc<OnceCell<FlightResult>>),
    Started(u64, watch::Sender<FlightState>, watch::Receiver<FlightState>),
}

/// How one round of lease contention ended
enum Attempt {
    Finished(Bytes, FlightRole),
    /// The holder let go of the lease without a usable result
    Released,
}

enum LocalWait {
    Done(FlightResult),
    Stalled,
}

/// Removes the local flight entry when its driver ends, panics included
struct FlightGuard {
    inner: Arc<Inner>,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let id = self.id;
        self.inner.flights.remove_if(&self.key, |_, flight| flight.id == id);
    }
}

struct Inner {
    store: Arc<dyn SharedStore>,
    cache: CacheEntryStore,
    config: FlightConfig,
    owner: String,
    next_id: AtomicU64,
    flights: DashMap<String, LocalFlight>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<AdmissionMetrics>,
}

/// Deduplicates concurrent recomputation per cache key
#[derive(Clone)]
pub struct SingleflightCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SingleflightCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleflightCoordinator")
            .field("owner", &self.inner.owner)
            .field("in_flight", &self.inner.flights.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl SingleflightCoordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        cache: CacheEntryStore,
        config: FlightConfig,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<AdmissionMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                config,
                owner: uuid::Uuid::new_v4().to_string(),
                next_id: AtomicU64::new(1),
                flights: DashMap::new(),
                events,
                metrics,
            }),
        }
    }

    /// Owner id written into this coordinator's leases
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// True while this process has a flight running for `key`
    pub fn in_flight(&self, key: &CacheKey) -> bool {
        self.inner.flights.contains_key(key.as_str())
    }

    /// Compute the value for `key` once, sharing it with every concurrent caller.
    ///
    /// The leader writes the result to the cache with `ttl` before anyone is
    /// woken. Compute errors reach every waiter unchanged and are never cached.
    #[instrument(skip(self, compute), fields(key = %key))]
    pub async fn execute<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<FlightOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let slot = match self.inner.flights.entry(key.to_string()) {
            Entry::Occupied(e) => {
                Slot::Joined(e.get().state.clone(), e.get().recovery.clone())
            }
            Entry::Vacant(e) => {
                let (id, tx, rx) = self.inner.register(e);
                Slot::Started(id, tx, rx)
            }
        };

        let outcome = match slot {
            Slot::Joined(rx, recovery) => {
                self.follow_local(key, ttl, rx, recovery, compute).await?
            }
            Slot::Started(id, tx, rx) => {
                let inner = self.inner.clone();
                let flight_key = key.clone();
                tokio::spawn(async move {
                    let guard = FlightGuard {
                        inner: inner.clone(),
                        key: flight_key.to_string(),
                        id,
                    };
                    let result = inner
                        .drive(&flight_key, ttl, compute, Progress(Some(&tx)))
                        .await;
                    drop(guard);
                    let _ = tx.send(FlightState::Done(result));
                });

                let (value, role) = wait_done(rx).await?.map_err(Error::from)?;
                FlightOutcome {
                    value,
                    shared: role == FlightRole::Follower,
                    role,
                }
            }
        };

        if outcome.shared {
            self.inner.metrics.record_shared();
        }
        debug!(role = %outcome.role, shared = outcome.shared, "Flight complete");
        Ok(outcome)
    }

    /// Refresh a stale entry in the background, unless a refresh or compute
    /// for `key` is already running here or elsewhere.
    ///
    /// Returns whether a refresh was started. Never waits on another flight.
    #[instrument(skip(self, compute), fields(key = %key))]
    pub async fn try_refresh<F, Fut>(&self, key: &CacheKey, ttl: Duration, compute: F) -> Result<bool>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let inner = &self.inner;
        if inner.flights.contains_key(key.as_str()) {
            inner.metrics.record_refresh(false);
            debug!("Refresh skipped: flight already running locally");
            return Ok(false);
        }

        let token = LeaseToken::new(&inner.owner, inner.next_id());
        let acquired = inner
            .store
            .set_nx(&lease_key(key), token.to_bytes(), inner.config.lease_duration)
            .await?;
        if !acquired {
            inner.metrics.record_refresh(false);
            debug!("Refresh skipped: lease held elsewhere");
            return Ok(false);
        }

        let registered = match inner.flights.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(e) => Some(inner.register(e)),
        };
        let Some((id, tx, _rx)) = registered else {
            // A local caller started a flight meanwhile; its driver may already
            // be subscribed to our lease, so tell it the lease is free again
            debug!("Refresh skipped: flight started locally while taking the lease");
            inner
                .finish(key, &token, FlightSignal::Abandoned { owner: token.to_string() })
                .await;
            inner.metrics.record_refresh(false);
            return Ok(false);
        };

        inner.metrics.record_refresh(true);
        let task_inner = inner.clone();
        let flight_key = key.clone();
        tokio::spawn(async move {
            let guard = FlightGuard {
                inner: task_inner.clone(),
                key: flight_key.to_string(),
                id,
            };
            let result = task_inner
                .lead(&flight_key, ttl, compute, &token, FlightRole::Leader, Progress(Some(&tx)))
                .await
                .map_err(|e| FlightFailure::from(&e));
            drop(guard);
            let _ = tx.send(FlightState::Done(result));
        });
        Ok(true)
    }

    async fn follow_local<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        rx: watch::Receiver<FlightState>,
        recovery: Arc<OnceCell<FlightResult>>,
        compute: F,
    ) -> Result<FlightOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let result = match wait_local(rx, &self.inner.config).await? {
            LocalWait::Done(result) => result,
            LocalWait::Stalled => {
                warn!(key = %key, "In-process flight stalled, joining recovery");
                let mut recovered_here = false;
                let inner = self.inner.clone();
                let recovery_key = key.clone();
                let result = recovery
                    .get_or_init(|| {
                        recovered_here = true;
                        async move {
                            let mut compute = Some(compute);
                            inner
                                .recover(&recovery_key, ttl, &mut compute)
                                .await
                                .map_err(|e| FlightFailure::from(&e))
                        }
                    })
                    .await
                    .clone();
                if recovered_here {
                    let (value, role) = result.map_err(Error::from)?;
                    return Ok(FlightOutcome {
                        value,
                        shared: role == FlightRole::Follower,
                        role,
                    });
                }
                result
            }
        };

        let (value, _) = result.map_err(Error::from)?;
        Ok(FlightOutcome {
            value,
            shared: true,
            role: FlightRole::Follower,
        })
    }
}

/// Wait for a local driver's result, giving up when it stops making progress
async fn wait_local(
    mut rx: watch::Receiver<FlightState>,
    config: &FlightConfig,
) -> Result<LocalWait> {
    loop {
        let bound = match &*rx.borrow_and_update() {
            FlightState::Done(result) => return Ok(LocalWait::Done(result.clone())),
            FlightState::Waiting => config.follower_timeout * 2,
            FlightState::Computing => config.lease_duration,
        };
        match tokio::time::timeout(bound, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(Error::Internal("flight ended without a result".into())),
            Err(_) => return Ok(LocalWait::Stalled),
        }
    }
}

async fn wait_done(mut rx: watch::Receiver<FlightState>) -> Result<FlightResult> {
    let state = rx
        .wait_for(|state| matches!(state, FlightState::Done(_)))
        .await
        .map_err(|_| Error::Internal("flight ended without a result".into()))?
        .clone();
    match state {
        FlightState::Done(result) => Ok(result),
        _ => Err(Error::Internal("flight ended without a result".into())),
    }
}

fn take_compute<F>(compute: &mut Option<F>) -> Result<F> {
    compute
        .take()
        .ok_or_else(|| Error::Internal("compute already consumed".into()))
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(
        &self,
        entry: VacantEntry<'_, String, LocalFlight>,
    ) -> (u64, watch::Sender<FlightState>, watch::Receiver<FlightState>) {
        let id = self.next_id();
        let (tx, rx) = watch::channel(FlightState::Waiting);
        entry.insert(LocalFlight {
            id,
            state: rx.clone(),
            recovery: Arc::new(OnceCell::new()),
        });
        (id, tx, rx)
    }

    async fn emit(&self, event: AdmissionEvent) {
        if let Err(err) = self.events.publish(event).await {
            debug!(error = %err, "Failed to publish admission event");
        }
    }

    async fn drive<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
        progress: Progress<'_>,
    ) -> FlightResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let mut compute = Some(compute);
        self.drive_with(key, ttl, &mut compute, false, progress)
            .await
            .map_err(|e| FlightFailure::from(&e))
    }

    /// Stalled-driver recovery: promote if the lease is gone, else compute without it
    async fn recover<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: &mut Option<F>,
    ) -> Result<(Bytes, FlightRole)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        match self.after_follower_timeout(key, ttl, compute, Progress(None)).await {
            Err(Error::LeaseExpiredRetry { .. }) => {
                self.drive_with(key, ttl, compute, true, Progress(None)).await
            }
            other => other,
        }
    }

    async fn drive_with<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: &mut Option<F>,
        mut promoted: bool,
        progress: Progress<'_>,
    ) -> Result<(Bytes, FlightRole)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        for _ in 0..MAX_PROMOTION_ATTEMPTS {
            match self.attempt(key, ttl, compute, promoted, progress).await {
                Ok(Attempt::Finished(value, role)) => return Ok((value, role)),
                Ok(Attempt::Released) => promoted = false,
                Err(Error::LeaseExpiredRetry { .. }) => promoted = true,
                Err(err) => return Err(err),
            }
        }
        warn!(key = %key, "Lease kept changing hands, computing independently");
        self.independent(key, ttl, compute, progress).await
    }

    async fn attempt<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: &mut Option<F>,
        promoted: bool,
        progress: Progress<'_>,
    ) -> Result<Attempt>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let token = LeaseToken::new(&self.owner, self.next_id());
        let acquired = self
            .store
            .set_nx(&lease_key(key), token.to_bytes(), self.config.lease_duration)
            .await?;
        if acquired {
            let role = if promoted {
                FlightRole::Promoted
            } else {
                FlightRole::Leader
            };
            let (value, role) = self
                .lead(key, ttl, take_compute(compute)?, &token, role, progress)
                .await?;
            return Ok(Attempt::Finished(value, role));
        }
        self.follow_remote(key, ttl, compute, progress).await
    }

    async fn lead<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
        token: &LeaseToken,
        role: FlightRole,
        progress: Progress<'_>,
    ) -> Result<(Bytes, FlightRole)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        if role == FlightRole::Promoted {
            warn!(key = %key, owner = %token, "Previous leader's lease expired, taking over");
            self.metrics.record_promotion();
            self.emit(AdmissionEvent::leader_promoted(key.to_string())).await;
        }

        // A previous leader may have finished between the caller's miss and our lease
        match self.cache.get(key).await {
            Ok(lookup) if lookup.is_fresh_hit() => {
                debug!(key = %key, "Entry appeared before compute, skipping");
                self.finish(key, token, FlightSignal::Done { owner: token.to_string() })
                    .await;
                return Ok((lookup.value, FlightRole::Follower));
            }
            Ok(_) => {}
            Err(err) => {
                self.finish(key, token, FlightSignal::Abandoned { owner: token.to_string() })
                    .await;
                return Err(err);
            }
        }

        progress.set(FlightState::Computing);
        self.metrics.record_compute();
        match compute().await {
            Ok(value) => {
                if let Err(err) = self.cache.put(key, value.clone(), ttl).await {
                    warn!(key = %key, error = %err, "Computed value could not be cached");
                }
                self.finish(key, token, FlightSignal::Done { owner: token.to_string() })
                    .await;
                info!(key = %key, role = %role, bytes = value.len(), "Computed");
                Ok((value, role))
            }
            Err(err) => {
                let message = format!("{:#}", err);
                warn!(key = %key, error = %message, "Compute failed");
                self.metrics.record_compute_failure();
                self.emit(AdmissionEvent::compute_failed(key.to_string(), message.clone()))
                    .await;
                self.finish(
                    key,
                    token,
                    FlightSignal::Failed {
                        owner: token.to_string(),
                        error: message.clone(),
                    },
                )
                .await;
                Err(Error::ComputeFailed(message))
            }
        }
    }

    async fn follow_remote<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: &mut Option<F>,
        progress: Progress<'_>,
    ) -> Result<Attempt>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        progress.set(FlightState::Waiting);
        let mut signals = self.store.subscribe(&done_channel(key)).await?;

        // Subscribed first, so a completion after this check cannot be missed
        let lookup = self.cache.get(key).await?;
        if lookup.is_fresh_hit() {
            return Ok(Attempt::Finished(lookup.value, FlightRole::Follower));
        }
        if !self.lease_alive(key).await? {
            debug!(key = %key, "Lease released before we subscribed");
            return Ok(Attempt::Released);
        }

        debug!(key = %key, "Waiting for remote leader");
        match tokio::time::timeout(self.config.follower_timeout, signals.next()).await {
            Ok(Some(raw)) => match FlightSignal::decode(&raw)? {
                FlightSignal::Done { .. } => {
                    let lookup = self.cache.get(key).await?;
                    if lookup.found {
                        Ok(Attempt::Finished(lookup.value, FlightRole::Follower))
                    } else {
                        Ok(Attempt::Released)
                    }
                }
                FlightSignal::Failed { error, .. } => Err(Error::ComputeFailed(error)),
                FlightSignal::Abandoned { owner } => {
                    debug!(key = %key, owner = %owner, "Leader gave up its lease");
                    Ok(Attempt::Released)
                }
            },
            Ok(None) | Err(_) => {
                warn!(key = %key, "Timed out waiting for remote leader");
                let (value, role) = self
                    .after_follower_timeout(key, ttl, compute, progress)
                    .await?;
                Ok(Attempt::Finished(value, role))
            }
        }
    }

    /// Promote if the leader's lease is gone, otherwise compute without it
    async fn after_follower_timeout<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: &mut Option<F>,
        progress: Progress<'_>,
    ) -> Result<(Bytes, FlightRole)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        if self.lease_alive(key).await? {
            self.independent(key, ttl, compute, progress).await
        } else {
            Err(Error::LeaseExpiredRetry {
                key: key.to_string(),
            })
        }
    }

    async fn independent<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: &mut Option<F>,
        progress: Progress<'_>,
    ) -> Result<(Bytes, FlightRole)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let compute = take_compute(compute)?;
        warn!(key = %key, "Leader still alive after follower timeout, computing independently");
        self.metrics.record_independent();
        self.emit(AdmissionEvent::independent_compute(key.to_string()))
            .await;

        progress.set(FlightState::Computing);
        self.metrics.record_compute();
        match compute().await {
            Ok(value) => {
                if let Err(err) = self.cache.put(key, value.clone(), ttl).await {
                    warn!(key = %key, error = %err, "Computed value could not be cached");
                }
                Ok((value, FlightRole::Independent))
            }
            Err(err) => {
                let message = format!("{:#}", err);
                self.metrics.record_compute_failure();
                self.emit(AdmissionEvent::compute_failed(key.to_string(), message.clone()))
                    .await;
                Err(Error::ComputeFailed(message))
            }
        }
    }

    async fn lease_alive(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.store.get(&lease_key(key)).await?.is_some())
    }

    /// Wake followers, then clear the lease
    async fn finish(&self, key: &CacheKey, token: &LeaseToken, signal: FlightSignal) {
        match signal.encode() {
            Ok(message) => {
                if let Err(err) = self.store.publish(&done_channel(key), message).await {
                    warn!(key = %key, error = %err, "Failed to wake followers");
                }
            }
            Err(err) => warn!(key = %key, error = %err, "Failed to encode flight signal"),
        }
        self.release(key, token).await;
    }

    async fn release(&self, key: &CacheKey, token: &LeaseToken) {
        match self.store.delete_if_eq(&lease_key(key), token.as_bytes()).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %key, "Lease already expired or taken over"),
            Err(err) => warn!(key = %key, error = %err, "Failed to release lease; it will expire"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;

    use crate::adapters::{HookedStore, InMemoryEventCollector, InMemoryStore};
    use crate::config::CacheConfig;

    struct Fixture {
        store: Arc<InMemoryStore>,
        cache: CacheEntryStore,
        events: Arc<InMemoryEventCollector>,
        metrics: Arc<AdmissionMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let cache = CacheEntryStore::new(store.clone(), CacheConfig::default());
            Self {
                store,
                cache,
                events: Arc::new(InMemoryEventCollector::new()),
                metrics: Arc::new(AdmissionMetrics::new()),
            }
        }

        fn coordinator(&self, config: FlightConfig) -> SingleflightCoordinator {
            SingleflightCoordinator::new(
                self.store.clone(),
                self.cache.clone(),
                config,
                self.events.clone(),
                self.metrics.clone(),
            )
        }
    }

    fn slow_compute(
        calls: Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, anyhow::Result<Bytes>> + Send + 'static
    {
        compute_taking(calls, value, Duration::from_millis(100))
    }

    fn compute_taking(
        calls: Arc<AtomicUsize>,
        value: &'static str,
        delay: Duration,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, anyhow::Result<Bytes>> + Send + 'static
    {
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(Bytes::from_static(value.as_bytes()))
            })
        }
    }

    fn key() -> CacheKey {
        CacheKey::for_resource("product:42", 3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_compute_once() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(FlightConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(60);

        let key = key();
        let outcomes = futures::future::join_all(
            (0..50).map(|_| coordinator.execute(&key, ttl, slow_compute(calls.clone(), "widget"))),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let outcomes: Vec<_> = outcomes.into_iter().map(|o| o.unwrap()).collect();
        assert!(outcomes.iter().all(|o| o.value == Bytes::from_static(b"widget")));
        assert_eq!(
            outcomes.iter().filter(|o| o.role == FlightRole::Leader).count(),
            1
        );
        assert_eq!(outcomes.iter().filter(|o| o.shared).count(), 49);
        assert!(fx.cache.get(&key).await.unwrap().is_fresh_hit());
        assert!(!coordinator.in_flight(&key));
        assert_eq!(fx.metrics.snapshot().shared_results, 49);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_and_never_cached() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(FlightConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(60);
        let key = key();

        let failing = || {
            let calls = calls.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<Bytes, _>(anyhow::anyhow!("backend exploded"))
            }
        };

        let results =
            futures::future::join_all((0..5).map(|_| coordinator.execute(&key, ttl, failing())))
                .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_matches!(result, Err(Error::ComputeFailed(ref msg)) if msg == "backend exploded");
        }
        assert!(!fx.cache.get(&key).await.unwrap().found);
        assert_eq!(fx.events.events_of_type("ComputeFailed").len(), 1);

        // Nothing was cached, so the next caller computes again
        let outcome = coordinator
            .execute(&key, ttl, slow_compute(calls.clone(), "ok"))
            .await
            .unwrap();
        assert_eq!(outcome.role, FlightRole::Leader);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_leader_is_replaced_after_lease_expiry() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(FlightConfig {
            lease_duration: Duration::from_secs(2),
            follower_timeout: Duration::from_secs(5),
        });
        let key = key();

        // A leader elsewhere took the lease and died
        fx.store
            .set_nx(
                &lease_key(&key),
                Bytes::from_static(b"dead-node:1"),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let outcome = coordinator
            .execute(&key, Duration::from_secs(60), slow_compute(calls.clone(), "recovered"))
            .await
            .unwrap();

        assert_eq!(outcome.role, FlightRole::Promoted);
        assert_eq!(outcome.value, Bytes::from_static(b"recovered"));
        assert!(!outcome.shared);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.events.events_of_type("LeaderPromoted").len(), 1);
        assert_eq!(fx.metrics.snapshot().promotions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_leader_timeout_computes_independently() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(FlightConfig {
            lease_duration: Duration::from_secs(30),
            follower_timeout: Duration::from_secs(1),
        });
        let key = key();
        fx.store
            .set_nx(
                &lease_key(&key),
                Bytes::from_static(b"slow-node:1"),
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let outcome = coordinator
            .execute(&key, Duration::from_secs(60), slow_compute(calls.clone(), "dup"))
            .await
            .unwrap();

        assert_eq!(outcome.role, FlightRole::Independent);
        assert_eq!(fx.events.events_of_type("IndependentCompute").len(), 1);
        // The other node's lease is untouched
        assert_eq!(
            fx.store.get(&lease_key(&key)).await.unwrap(),
            Some(Bytes::from_static(b"slow-node:1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_callers_behind_slow_remote_leader_compute_once() {
        let fx = Fixture::new();
        let config = FlightConfig {
            lease_duration: Duration::from_secs(30),
            follower_timeout: Duration::from_secs(1),
        };
        let node_a = fx.coordinator(config.clone());
        let node_b = fx.coordinator(config);
        let key = key();
        let ttl = Duration::from_secs(60);

        let a_calls = Arc::new(AtomicUsize::new(0));
        let remote_leader = {
            let node_a = node_a.clone();
            let key = key.clone();
            let compute = compute_taking(a_calls.clone(), "from-a", Duration::from_secs(8));
            tokio::spawn(async move { node_a.execute(&key, ttl, compute).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.store.get(&lease_key(&key)).await.unwrap().is_some());

        let b_calls = Arc::new(AtomicUsize::new(0));
        let outcomes = futures::future::join_all(
            (0..20).map(|_| node_b.execute(&key, ttl, slow_compute(b_calls.clone(), "from-b"))),
        )
        .await;

        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        let outcomes: Vec<_> = outcomes.into_iter().map(|o| o.unwrap()).collect();
        assert!(outcomes.iter().all(|o| o.value == Bytes::from_static(b"from-b")));
        assert_eq!(
            outcomes.iter().filter(|o| o.role == FlightRole::Independent).count(),
            1
        );
        assert_eq!(outcomes.iter().filter(|o| o.shared).count(), 19);
        assert_eq!(fx.events.events_of_type("IndependentCompute").len(), 1);

        let a = remote_leader.await.unwrap().unwrap();
        assert_eq!(a.role, FlightRole::Leader);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_driver_recovery_is_shared() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(FlightConfig {
            lease_duration: Duration::from_secs(2),
            follower_timeout: Duration::from_secs(1),
        });
        let key = key();
        let ttl = Duration::from_secs(60);

        // The local leader computes well past its lease
        let calls = Arc::new(AtomicUsize::new(0));
        let leader = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            let compute = compute_taking(calls.clone(), "slow", Duration::from_secs(20));
            tokio::spawn(async move { coordinator.execute(&key, ttl, compute).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcomes = futures::future::join_all(
            (0..10).map(|_| coordinator.execute(&key, ttl, slow_compute(calls.clone(), "rescued"))),
        )
        .await;

        // One leader compute plus one recovery, never one per follower
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let outcomes: Vec<_> = outcomes.into_iter().map(|o| o.unwrap()).collect();
        assert!(outcomes.iter().all(|o| o.value == Bytes::from_static(b"rescued")));
        assert_eq!(outcomes.iter().filter(|o| !o.shared).count(), 1);

        leader.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_lease_is_retaken_without_promotion() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(FlightConfig {
            lease_duration: Duration::from_secs(30),
            follower_timeout: Duration::from_secs(5),
        });
        let key = key();
        let holder = Bytes::from_static(b"other-node:9");
        fx.store
            .set_nx(&lease_key(&key), holder.clone(), Duration::from_secs(30))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let caller = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            let compute = slow_compute(calls.clone(), "retaken");
            tokio::spawn(async move { coordinator.execute(&key, Duration::from_secs(60), compute).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The holder lets go without computing, as a refresh that lost a local race does
        fx.store.delete_if_eq(&lease_key(&key), &holder).await.unwrap();
        let signal = FlightSignal::Abandoned {
            owner: "other-node:9".into(),
        };
        fx.store
            .publish(&done_channel(&key), signal.encode().unwrap())
            .await
            .unwrap();

        let outcome = caller.await.unwrap().unwrap();
        assert_eq!(outcome.role, FlightRole::Leader);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fx.events.events_of_type("LeaderPromoted").is_empty());
        assert_eq!(fx.metrics.snapshot().promotions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_losing_local_race_does_not_cause_promotion() {
        // The first lease holder lingers before acting on its lease
        let lingered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let store: Arc<dyn SharedStore> =
            Arc::new(HookedStore::new(Arc::new(InMemoryStore::new()), move |op, _key| {
                let linger = op == "set_nx" && !lingered.swap(true, Ordering::SeqCst);
                Box::pin(async move {
                    if linger {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                })
            }));
        let events = Arc::new(InMemoryEventCollector::new());
        let metrics = Arc::new(AdmissionMetrics::new());
        let cache = CacheEntryStore::new(store.clone(), CacheConfig::default());
        let coordinator = SingleflightCoordinator::new(
            store,
            cache,
            FlightConfig::default(),
            events.clone(),
            metrics.clone(),
        );
        let key = key();
        let ttl = Duration::from_secs(60);
        let calls = Arc::new(AtomicUsize::new(0));
        let started = tokio::time::Instant::now();

        // The refresh wins the lease, then a request registers the local flight
        let refresh = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            let compute = slow_compute(calls.clone(), "refreshed");
            tokio::spawn(async move { coordinator.try_refresh(&key, ttl, compute).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let request = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            let compute = slow_compute(calls.clone(), "requested");
            tokio::spawn(async move { coordinator.execute(&key, ttl, compute).await })
        };

        assert!(!refresh.await.unwrap().unwrap());
        let outcome = request.await.unwrap().unwrap();
        assert_eq!(outcome.role, FlightRole::Leader);
        assert_eq!(outcome.value, Bytes::from_static(b"requested"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < FlightConfig::default().follower_timeout);
        assert!(events.events_of_type("LeaderPromoted").is_empty());
        assert_eq!(metrics.snapshot().promotions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_completes_when_caller_is_cancelled() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(FlightConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = key();
        let ttl = Duration::from_secs(60);

        let leader = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            let compute = slow_compute(calls.clone(), "survived");
            tokio::spawn(async move { coordinator.execute(&key, ttl, compute).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coordinator.in_flight(&key));

        let follower = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            let compute = slow_compute(calls.clone(), "unused");
            tokio::spawn(async move { coordinator.execute(&key, ttl, compute).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let outcome = follower.await.unwrap().unwrap();
        assert_eq!(outcome.value, Bytes::from_static(b"survived"));
        assert_eq!(outcome.role, FlightRole::Follower);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinators_share_work_through_the_store() {
        let fx = Fixture::new();
        let node_a = fx.coordinator(FlightConfig::default());
        let node_b = fx.coordinator(FlightConfig::default());
        assert_ne!(node_a.owner(), node_b.owner());

        let calls = Arc::new(AtomicUsize::new(0));
        let key = key();
        let ttl = Duration::from_secs(60);

        let (a, b) = tokio::join!(
            node_a.execute(&key, ttl, slow_compute(calls.clone(), "shared")),
            node_b.execute(&key, ttl, slow_compute(calls.clone(), "shared")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.value, b.value);
        assert!(a.shared != b.shared);
        assert_eq!(fx.store.stats().channels, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_waits_leave_no_channels_behind() {
        let fx = Fixture::new();
        let node_a = fx.coordinator(FlightConfig::default());
        let node_b = fx.coordinator(FlightConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(60);

        let keys: Vec<_> = (0..50)
            .map(|i| CacheKey::for_resource(format!("product:{}", i), 1))
            .collect();
        let (node_a, node_b) = (&node_a, &node_b);
        let flights = keys.iter().map(|key| {
            let calls = calls.clone();
            async move {
                tokio::join!(
                    node_a.execute(key, ttl, slow_compute(calls.clone(), "v")),
                    node_b.execute(key, ttl, slow_compute(calls, "v")),
                )
            }
        });
        for (a, b) in futures::future::join_all(flights).await {
            assert!(a.unwrap().shared != b.unwrap().shared);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert_eq!(fx.store.stats().channels, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_runs_once() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(FlightConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = key();
        let ttl = Duration::from_secs(60);

        let first = coordinator
            .try_refresh(&key, ttl, slow_compute(calls.clone(), "fresh"))
            .await
            .unwrap();
        let second = coordinator
            .try_refresh(&key, ttl, slow_compute(calls.clone(), "fresh"))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let lookup = fx.cache.get(&key).await.unwrap();
        assert_eq!(lookup.value, Bytes::from_static(b"fresh"));
        assert!(!coordinator.in_flight(&key));

        let snap = fx.metrics.snapshot();
        assert_eq!(snap.refreshes_started, 1);
        assert_eq!(snap.refreshes_skipped, 1);
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_store_unavailable() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(FlightConfig::default());
        fx.store.set_available(false);

        let result = coordinator
            .execute(&key(), Duration::from_secs(60), || async {
                Ok(Bytes::from_static(b"x"))
            })
            .await;
        assert_matches!(result, Err(Error::StoreUnavailable(_)));
    }
}
