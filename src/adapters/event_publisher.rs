//! Event Sinks
//!
//! [`LoggingEventPublisher`] turns admission events into structured tracing
//! records under the `gatehouse::events` target, one field per event
//! attribute, so log pipelines can filter on identity or cache key without
//! parsing a payload. [`InMemoryEventCollector`] keeps them for assertions.
//!
//! | Event                | Level | Fields                               |
//! |----------------------|-------|--------------------------------------|
//! | `QuotaRejected`      | info  | identity, retry_after_ms             |
//! | `StoreRejected`      | warn  | identity, operation, reason          |
//! | `Degraded`           | warn  | operation, fail_mode, reason         |
//! | `LeaderPromoted`     | warn  | key                                  |
//! | `IndependentCompute` | warn  | key                                  |
//! | `ComputeFailed`      | error | key, error                           |
//! | `VersionBumped`      | info  | namespace, version                   |

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::domain::events::AdmissionEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Writes every admission event to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: AdmissionEvent) -> Result<()> {
        let at = event.timestamp().to_rfc3339();
        match &event {
            AdmissionEvent::QuotaRejected {
                identity,
                retry_after_ms,
                ..
            } => {
                info!(target: "gatehouse::events", event = "QuotaRejected", %identity, retry_after_ms, %at, "Request over quota");
            }
            AdmissionEvent::StoreRejected {
                identity,
                operation,
                reason,
                ..
            } => {
                warn!(target: "gatehouse::events", event = "StoreRejected", %identity, %operation, %reason, %at, "Request rejected, store unreachable");
            }
            AdmissionEvent::Degraded {
                operation,
                fail_mode,
                reason,
                ..
            } => {
                warn!(target: "gatehouse::events", event = "Degraded", %operation, %fail_mode, %reason, %at, "Serving without coordination");
            }
            AdmissionEvent::LeaderPromoted { key, .. } => {
                warn!(target: "gatehouse::events", event = "LeaderPromoted", %key, %at, "Follower took over an expired lease");
            }
            AdmissionEvent::IndependentCompute { key, .. } => {
                warn!(target: "gatehouse::events", event = "IndependentCompute", %key, %at, "Computed alongside a live leader");
            }
            AdmissionEvent::ComputeFailed { key, error, .. } => {
                error!(target: "gatehouse::events", event = "ComputeFailed", %key, %error, %at, "Backend compute failed");
            }
            AdmissionEvent::VersionBumped {
                namespace, version, ..
            } => {
                info!(target: "gatehouse::events", event = "VersionBumped", %namespace, version, %at, "Namespace invalidated");
            }
        }
        Ok(())
    }
}

/// Keeps published events in memory
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: Mutex<Vec<AdmissionEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events whose [`AdmissionEvent::event_type`] is `event_type`, oldest first
    pub fn events_of_type(&self, event_type: &str) -> Vec<AdmissionEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: AdmissionEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailMode;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn records(&self) -> Vec<serde_json::Value> {
            let raw = self.0.lock().clone();
            String::from_utf8(raw)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    #[tokio::test]
    async fn test_events_are_logged_with_their_own_fields() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let publisher = LoggingEventPublisher;
        publisher
            .publish_all(vec![
                AdmissionEvent::quota_rejected("userA", Duration::from_millis(1200)),
                AdmissionEvent::degraded("cache.get", FailMode::Open, "connection refused"),
                AdmissionEvent::compute_failed("product:42:v3", "backend timeout"),
                AdmissionEvent::version_bumped("product:42", 4),
            ])
            .await
            .unwrap();

        let records = captured.records();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r["target"] == "gatehouse::events"));

        let rejected = &records[0];
        assert_eq!(rejected["level"], "INFO");
        assert_eq!(rejected["fields"]["identity"], "userA");
        assert_eq!(rejected["fields"]["retry_after_ms"], 1200);

        let degraded = &records[1];
        assert_eq!(degraded["level"], "WARN");
        assert_eq!(degraded["fields"]["fail_mode"], "open");
        assert_eq!(degraded["fields"]["operation"], "cache.get");

        let failed = &records[2];
        assert_eq!(failed["level"], "ERROR");
        assert_eq!(failed["fields"]["key"], "product:42:v3");
        assert_eq!(failed["fields"]["error"], "backend timeout");

        let bumped = &records[3];
        assert_eq!(bumped["fields"]["namespace"], "product:42");
        assert_eq!(bumped["fields"]["version"], 4);
    }

    #[tokio::test]
    async fn test_collector_filters_by_type() {
        let collector = InMemoryEventCollector::new();
        for identity in ["userA", "userB"] {
            collector
                .publish(AdmissionEvent::quota_rejected(identity, Duration::from_secs(3)))
                .await
                .unwrap();
        }
        collector
            .publish(AdmissionEvent::leader_promoted("product:42:v3"))
            .await
            .unwrap();

        let rejected = collector.events_of_type("QuotaRejected");
        assert_eq!(rejected.len(), 2);
        assert_matches::assert_matches!(
            &rejected[1],
            AdmissionEvent::QuotaRejected { identity, .. } if identity == "userB"
        );
        assert_eq!(collector.events_of_type("LeaderPromoted")[0].key(), Some("product:42:v3"));
        assert!(collector.events_of_type("VersionBumped").is_empty());
    }
}
