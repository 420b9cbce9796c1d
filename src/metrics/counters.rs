//! Admission Metrics Collection
//!
//! Lock-free counters for every decision the admission layer makes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::quota::DecisionReason;

/// Admission metrics collector
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    // Quota decisions
    admitted: AtomicU64,
    admitted_burst: AtomicU64,
    rejected_quota: AtomicU64,
    rejected_store: AtomicU64,
    degraded: AtomicU64,

    // Cache lookups
    cache_hits: AtomicU64,
    cache_stale: AtomicU64,
    cache_misses: AtomicU64,
    cache_bypass: AtomicU64,

    // Singleflight
    computes: AtomicU64,
    shared_results: AtomicU64,
    compute_failures: AtomicU64,
    promotions: AtomicU64,
    independent_computes: AtomicU64,
    refreshes_started: AtomicU64,
    refreshes_skipped: AtomicU64,

    // Invalidation
    version_bumps: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub admitted_burst: u64,
    pub rejected_quota: u64,
    pub rejected_store: u64,
    pub degraded: u64,
    pub cache_hits: u64,
    pub cache_stale: u64,
    pub cache_misses: u64,
    pub cache_bypass: u64,
    pub computes: u64,
    pub shared_results: u64,
    pub compute_failures: u64,
    pub promotions: u64,
    pub independent_computes: u64,
    pub refreshes_started: u64,
    pub refreshes_skipped: u64,
    pub version_bumps: u64,
}

impl MetricsSnapshot {
    /// Share of cache lookups served from the cache, stale included
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.cache_hits + self.cache_stale) as f64;
        let total = hits + self.cache_misses as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a quota decision under its reason
    pub fn record_decision(&self, reason: DecisionReason) {
        match reason {
            DecisionReason::Admitted => bump(&self.admitted),
            DecisionReason::Burst => bump(&self.admitted_burst),
            DecisionReason::QuotaExceeded => bump(&self.rejected_quota),
            DecisionReason::StoreUnavailable => bump(&self.rejected_store),
            DecisionReason::FailOpen => bump(&self.degraded),
        }
    }

    /// A request served without the store after a store failure
    pub fn record_degraded(&self) {
        bump(&self.degraded);
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits);
    }

    pub fn record_cache_stale(&self) {
        bump(&self.cache_stale);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses);
    }

    pub fn record_cache_bypass(&self) {
        bump(&self.cache_bypass);
    }

    pub fn record_compute(&self) {
        bump(&self.computes);
    }

    pub fn record_shared(&self) {
        bump(&self.shared_results);
    }

    pub fn record_compute_failure(&self) {
        bump(&self.compute_failures);
    }

    pub fn record_promotion(&self) {
        bump(&self.promotions);
    }

    pub fn record_independent(&self) {
        bump(&self.independent_computes);
    }

    pub fn record_refresh(&self, started: bool) {
        if started {
            bump(&self.refreshes_started);
        } else {
            bump(&self.refreshes_skipped);
        }
    }

    pub fn record_version_bump(&self) {
        bump(&self.version_bumps);
    }

    pub fn computes(&self) -> u64 {
        self.computes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            admitted: load(&self.admitted),
            admitted_burst: load(&self.admitted_burst),
            rejected_quota: load(&self.rejected_quota),
            rejected_store: load(&self.rejected_store),
            degraded: load(&self.degraded),
            cache_hits: load(&self.cache_hits),
            cache_stale: load(&self.cache_stale),
            cache_misses: load(&self.cache_misses),
            cache_bypass: load(&self.cache_bypass),
            computes: load(&self.computes),
            shared_results: load(&self.shared_results),
            compute_failures: load(&self.compute_failures),
            promotions: load(&self.promotions),
            independent_computes: load(&self.independent_computes),
            refreshes_started: load(&self.refreshes_started),
            refreshes_skipped: load(&self.refreshes_skipped),
            version_bumps: load(&self.version_bumps),
        }
    }
}
