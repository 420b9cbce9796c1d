//! Gatehouse - Admission Control and Versioned Response Caching
//!
//! A middleware layer that sits in front of an API backend and protects it
//! from overload: per-identity quotas with burst allowance, a versioned
//! stale-while-revalidate response cache, and cluster-wide deduplication of
//! concurrent recomputation. All coordination goes through one shared
//! key-value store with atomic counters, TTLs, conditional writes and pub/sub.
//!
//! # Architecture
//!
//! ```text
//! request ─► Quota Tracker ─► Versioned Cache ─► Singleflight ─► Backend
//!                 │                  │                 │
//!                 └──────────────────┴─────────────────┴──► Shared Store
//!                                    ▲
//!                      Invalidator ──┘ (version tokens)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Store and event sink implementations of the domain ports
//! - [`cache`] - Cache keys, entry envelopes and the entry store
//! - [`config`] - YAML-loadable configuration
//! - [`domain`] - Ports and admission events
//! - [`error`] - Error types
//! - [`invalidation`] - Per-namespace version tokens
//! - [`metrics`] - Counters and Prometheus exposition
//! - [`middleware`] - The request pipeline
//! - [`quota`] - Sliding-window quota with burst bucket
//! - [`singleflight`] - Distributed compute deduplication

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod invalidation;
pub mod metrics;
pub mod middleware;
pub mod quota;
pub mod singleflight;

// Re-export commonly used types
pub use cache::CacheKey;
pub use config::{AdmissionConfig, FailMode, QuotaScope};
pub use domain::{EventPublisher, Identity, SharedStore};
pub use error::{Error, Result};
pub use invalidation::Invalidator;
pub use metrics::{AdmissionMetrics, PrometheusExporter};
pub use middleware::{AdmissionMiddleware, AdmissionRequest, AdmissionResponse, Backend};
pub use quota::{QuotaDecision, QuotaTracker};
pub use singleflight::SingleflightCoordinator;
