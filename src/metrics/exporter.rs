//! Prometheus Exposition
//!
//! Mirrors [`AdmissionMetrics`] counters into a dedicated Prometheus
//! registry and renders them in the text exposition format.

use parking_lot::Mutex;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use super::counters::MetricsSnapshot;
use crate::error::{Error, Result};

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", err))
}

/// Prometheus exporter for admission metrics
pub struct PrometheusExporter {
    registry: Registry,
    decisions: IntCounterVec,
    cache_lookups: IntCounterVec,
    flights: IntCounterVec,
    refreshes: IntCounterVec,
    version_bumps: IntCounter,
    render_lock: Mutex<()>,
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish()
    }
}

impl PrometheusExporter {
    /// Register all gatehouse metric families in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let decisions = IntCounterVec::new(
            Opts::new(
                "gatehouse_admission_decisions_total",
                "Quota decisions by outcome",
            ),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("gatehouse_cache_lookups_total", "Cache lookups by result"),
            &["result"],
        )
        .map_err(metrics_error)?;
        let flights = IntCounterVec::new(
            Opts::new(
                "gatehouse_flight_events_total",
                "Singleflight computes, shared results, failures and recoveries",
            ),
            &["event"],
        )
        .map_err(metrics_error)?;
        let refreshes = IntCounterVec::new(
            Opts::new(
                "gatehouse_stale_refreshes_total",
                "Background refreshes of stale entries",
            ),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let version_bumps = IntCounter::new(
            "gatehouse_version_bumps_total",
            "Version token increments",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(decisions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(cache_lookups.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(flights.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(refreshes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(version_bumps.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            decisions,
            cache_lookups,
            flights,
            refreshes,
            version_bumps,
            render_lock: Mutex::new(()),
        })
    }

    /// Content type of [`render`](Self::render) output
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Bring the registry up to `snapshot` and encode it
    pub fn render(&self, snapshot: &MetricsSnapshot) -> Result<String> {
        let _guard = self.render_lock.lock();

        for (outcome, value) in [
            ("admitted", snapshot.admitted),
            ("burst", snapshot.admitted_burst),
            ("rejected_quota", snapshot.rejected_quota),
            ("rejected_store", snapshot.rejected_store),
            ("degraded", snapshot.degraded),
        ] {
            advance(&self.decisions.with_label_values(&[outcome]), value);
        }
        for (result, value) in [
            ("hit", snapshot.cache_hits),
            ("stale", snapshot.cache_stale),
            ("miss", snapshot.cache_misses),
            ("bypass", snapshot.cache_bypass),
        ] {
            advance(&self.cache_lookups.with_label_values(&[result]), value);
        }
        for (event, value) in [
            ("compute", snapshot.computes),
            ("shared", snapshot.shared_results),
            ("failure", snapshot.compute_failures),
            ("promotion", snapshot.promotions),
            ("independent", snapshot.independent_computes),
        ] {
            advance(&self.flights.with_label_values(&[event]), value);
        }
        for (outcome, value) in [
            ("started", snapshot.refreshes_started),
            ("skipped", snapshot.refreshes_skipped),
        ] {
            advance(&self.refreshes.with_label_values(&[outcome]), value);
        }
        advance(&self.version_bumps, snapshot.version_bumps);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
    }
}

/// Counters only move forward; catch up to the source value
fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}
