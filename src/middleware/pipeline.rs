//! Admission Middleware
//!
//! Composes quota, versioned cache, singleflight and invalidation into one
//! request pipeline:
//!
//! ```text
//! resolve identity ─► quota admit ─(reject)─► 429 / 503
//!        │
//!        ▼
//! key = resource + canonical params + current version
//!        │
//!        ▼
//! cache get ─► fresh: return
//!           ─► stale: return now, refresh in background (quota exempt)
//!           ─► miss:  singleflight(compute) ─► put ─► return
//! ```
//!
//! With `fail_mode = open`, an unreachable store degrades to calling the
//! backend directly with caching disabled (`X-Cache: BYPASS`).

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::identity::{DefaultIdentityResolver, IdentityResolver};
use super::request::{AdmissionRequest, Backend};
use super::response::{AdmissionResponse, CacheStatus, RateLimitInfo};
use super::state::{PipelineState, PipelineTrace};
use crate::adapters::{LoggingEventPublisher, RetryingStore};
use crate::cache::{CacheEntryStore, CacheKey};
use crate::config::{AdmissionConfig, FailMode};
use crate::domain::events::AdmissionEvent;
use crate::domain::ports::{EventPublisher, SharedStore};
use crate::error::{Error, Result};
use crate::invalidation::Invalidator;
use crate::metrics::AdmissionMetrics;
use crate::quota::{DecisionReason, QuotaTracker};
use crate::singleflight::{FlightRole, SingleflightCoordinator};

fn mark(trace: &mut PipelineTrace, state: PipelineState) {
    // Refusals are logged by the trace itself
    let _ = trace.advance(state);
}

fn compute_fn(
    backend: Arc<dyn Backend>,
    request: AdmissionRequest,
) -> impl FnOnce() -> futures::future::BoxFuture<'static, anyhow::Result<Bytes>> + Send + 'static {
    move || Box::pin(async move { backend.compute(&request).await })
}

/// Builder for [`AdmissionMiddleware`]
pub struct MiddlewareBuilder {
    store: Arc<dyn SharedStore>,
    config: AdmissionConfig,
    events: Option<Arc<dyn EventPublisher>>,
    metrics: Option<Arc<AdmissionMetrics>>,
    resolver: Option<Arc<dyn IdentityResolver>>,
}

impl MiddlewareBuilder {
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn metrics(mut self, metrics: Arc<AdmissionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Assemble the pipeline. The store is wrapped in the retry policy here,
    /// so every component sees the same classification of failures.
    pub fn build(self) -> AdmissionMiddleware {
        let config = self.config;
        let store: Arc<dyn SharedStore> =
            Arc::new(RetryingStore::new(self.store, config.retry.clone()));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(LoggingEventPublisher));
        let metrics = self.metrics.unwrap_or_default();
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(DefaultIdentityResolver));

        let cache = CacheEntryStore::new(store.clone(), config.cache.clone());
        let flights = SingleflightCoordinator::new(
            store.clone(),
            cache.clone(),
            config.flight.clone(),
            events.clone(),
            metrics.clone(),
        );
        let invalidator = Arc::new(Invalidator::new(
            store.clone(),
            config.invalidation.clone(),
            events.clone(),
            metrics.clone(),
        ));

        AdmissionMiddleware {
            quota: QuotaTracker::new(store, config.quota.clone()),
            cache,
            flights,
            invalidator,
            resolver,
            events,
            metrics,
            config,
        }
    }
}

/// Request admission and response caching in front of a backend
pub struct AdmissionMiddleware {
    config: AdmissionConfig,
    quota: QuotaTracker,
    cache: CacheEntryStore,
    flights: SingleflightCoordinator,
    invalidator: Arc<Invalidator>,
    resolver: Arc<dyn IdentityResolver>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<AdmissionMetrics>,
}

impl std::fmt::Debug for AdmissionMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionMiddleware")
            .field("config", &self.config)
            .field("flights", &self.flights)
            .finish()
    }
}

impl AdmissionMiddleware {
    pub fn builder(store: Arc<dyn SharedStore>, config: AdmissionConfig) -> MiddlewareBuilder {
        MiddlewareBuilder {
            store,
            config,
            events: None,
            metrics: None,
            resolver: None,
        }
    }

    /// Middleware with the logging event publisher and default identity resolution
    pub fn new(store: Arc<dyn SharedStore>, config: AdmissionConfig) -> Self {
        Self::builder(store, config).build()
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<AdmissionMetrics> {
        &self.metrics
    }

    pub fn invalidator(&self) -> &Arc<Invalidator> {
        &self.invalidator
    }

    pub fn coordinator(&self) -> &SingleflightCoordinator {
        &self.flights
    }

    /// Advance a namespace's version after a write; see [`Invalidator::bump`]
    pub async fn bump(&self, namespace: &str) -> Result<u64> {
        self.invalidator.bump(namespace).await
    }

    /// Run one request through the pipeline
    #[instrument(skip(self, request, backend), fields(route = %request.route, resource = %request.resource))]
    pub async fn handle(
        &self,
        request: AdmissionRequest,
        backend: Arc<dyn Backend>,
    ) -> AdmissionResponse {
        let mut trace = PipelineTrace::new();
        let identity = self.resolver.resolve(&request).await;
        let partition = self.quota.partition(&identity, &request.route);

        let decision = self.quota.admit(&partition, request.cost).await;
        self.metrics.record_decision(decision.reason);

        match decision.reason {
            DecisionReason::QuotaExceeded => {
                mark(&mut trace, PipelineState::Rejected);
                self.emit(AdmissionEvent::quota_rejected(
                    partition.to_string(),
                    decision.retry_after,
                ))
                .await;
                let err = Error::QuotaExceeded {
                    identity: partition.to_string(),
                    retry_after: decision.retry_after,
                };
                return AdmissionResponse::error(err.status_code(), err.to_string())
                    .with_rate_limit(Some(RateLimitInfo::from(&decision)))
                    .with_retry_after(decision.retry_after)
                    .with_trace(trace.into_states());
            }
            DecisionReason::StoreUnavailable => {
                mark(&mut trace, PipelineState::Rejected);
                self.emit(AdmissionEvent::store_rejected(
                    partition.to_string(),
                    "quota.admit",
                    "shared store unreachable",
                ))
                .await;
                let err = Error::StoreUnavailable("quota store unreachable".into());
                return AdmissionResponse::error(err.status_code(), err.to_string())
                    .with_retry_after(decision.retry_after)
                    .with_trace(trace.into_states());
            }
            DecisionReason::FailOpen => {
                mark(&mut trace, PipelineState::Admitted);
                self.emit(AdmissionEvent::degraded(
                    "quota.admit",
                    FailMode::Open,
                    "shared store unreachable",
                ))
                .await;
                return self.bypass(&request, backend, trace, None).await;
            }
            DecisionReason::Admitted | DecisionReason::Burst => {
                mark(&mut trace, PipelineState::Admitted);
            }
        }

        let rate_limit = Some(RateLimitInfo::from(&decision));
        match self.serve(&request, &backend, &mut trace).await {
            Ok((body, status)) => {
                mark(&mut trace, PipelineState::Responded);
                AdmissionResponse::ok(body, status)
                    .with_rate_limit(rate_limit)
                    .with_trace(trace.into_states())
            }
            Err(err) if err.is_store_unavailable() && self.config.quota.fail_mode == FailMode::Open => {
                warn!(error = %err, "Degraded: serving without cache");
                self.metrics.record_degraded();
                self.emit(AdmissionEvent::degraded("cache", FailMode::Open, err.to_string()))
                    .await;
                self.bypass(&request, backend, trace, rate_limit).await
            }
            Err(err) => {
                debug!(error = %err, "Request failed");
                mark(&mut trace, PipelineState::Errored);
                AdmissionResponse::error(err.status_code(), err.to_string())
                    .with_rate_limit(rate_limit)
                    .with_trace(trace.into_states())
            }
        }
    }

    /// Cache lookup, background refresh or singleflight compute
    async fn serve(
        &self,
        request: &AdmissionRequest,
        backend: &Arc<dyn Backend>,
        trace: &mut PipelineTrace,
    ) -> Result<(Bytes, CacheStatus)> {
        mark(trace, PipelineState::CacheCheck);
        let version = self.invalidator.current_version(&request.namespace).await?;
        let key = CacheKey::new(&request.resource, &request.params, version);

        let lookup = self.cache.get(&key).await?;
        if lookup.found && !lookup.stale {
            mark(trace, PipelineState::HitFresh);
            self.metrics.record_cache_hit();
            return Ok((lookup.value, CacheStatus::Hit));
        }
        if lookup.found {
            mark(trace, PipelineState::HitStale);
            self.metrics.record_cache_stale();
            self.refresh_in_background(key, request.clone(), backend.clone());
            return Ok((lookup.value, CacheStatus::Stale));
        }

        mark(trace, PipelineState::Miss);
        self.metrics.record_cache_miss();
        let outcome = self
            .flights
            .execute(
                &key,
                self.config.cache.ttl,
                compute_fn(backend.clone(), request.clone()),
            )
            .await?;
        let state = match outcome.role {
            FlightRole::Follower => PipelineState::FollowerWait,
            _ => PipelineState::LeaderCompute,
        };
        mark(trace, state);
        Ok((outcome.value, CacheStatus::Miss))
    }

    /// Stale refreshes are not charged to the caller's quota
    fn refresh_in_background(&self, key: CacheKey, request: AdmissionRequest, backend: Arc<dyn Backend>) {
        let flights = self.flights.clone();
        let ttl = self.config.cache.ttl;
        tokio::spawn(async move {
            match flights.try_refresh(&key, ttl, compute_fn(backend, request)).await {
                Ok(true) => debug!(key = %key, "Stale entry refresh started"),
                Ok(false) => debug!(key = %key, "Stale entry refresh already running"),
                Err(err) => warn!(key = %key, error = %err, "Stale entry refresh failed"),
            }
        });
    }

    /// Call the backend directly, caching disabled
    async fn bypass(
        &self,
        request: &AdmissionRequest,
        backend: Arc<dyn Backend>,
        mut trace: PipelineTrace,
        rate_limit: Option<RateLimitInfo>,
    ) -> AdmissionResponse {
        mark(&mut trace, PipelineState::Bypass);
        self.metrics.record_cache_bypass();
        match backend.compute(request).await {
            Ok(body) => {
                mark(&mut trace, PipelineState::Responded);
                AdmissionResponse::ok(body, CacheStatus::Bypass)
                    .with_rate_limit(rate_limit)
                    .with_trace(trace.into_states())
            }
            Err(err) => {
                let err = Error::ComputeFailed(format!("{:#}", err));
                self.metrics.record_compute_failure();
                mark(&mut trace, PipelineState::Errored);
                AdmissionResponse::error(err.status_code(), err.to_string())
                    .with_rate_limit(rate_limit)
                    .with_trace(trace.into_states())
            }
        }
    }

    async fn emit(&self, event: AdmissionEvent) {
        if let Err(err) = self.events.publish(event).await {
            debug!(error = %err, "Failed to publish admission event");
        }
    }
}
