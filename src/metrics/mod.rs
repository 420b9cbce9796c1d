//! Metrics module
//!
//! Admission, cache and singleflight counters with Prometheus exposition.

mod counters;
mod exporter;

pub use counters::{AdmissionMetrics, MetricsSnapshot};
pub use exporter::PrometheusExporter;
