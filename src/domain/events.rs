//! Admission Events
//!
//! Immutable records of notable decisions taken by the admission layer.
//! They feed audit logs and dashboards; nothing in the request path
//! depends on them being delivered.
//!
//! # Example
//!
//! ```ignore
//! let event = AdmissionEvent::quota_rejected("key:abc", Duration::from_secs(12));
//! event_publisher.publish(event).await?;
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FailMode;

/// Event representing a significant admission or caching decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AdmissionEvent {
    // =========================================================================
    // Quota Events
    // =========================================================================
    /// A caller was over quota.
    QuotaRejected {
        identity: String,
        retry_after_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A request was rejected because the store could not be reached (fail closed).
    StoreRejected {
        identity: String,
        operation: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The store was unreachable and the request was served without caching (fail open).
    Degraded {
        operation: String,
        fail_mode: FailMode,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Compute Events
    // =========================================================================
    /// A follower took over after the leader's lease expired.
    LeaderPromoted {
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A follower gave up waiting and computed on its own.
    IndependentCompute {
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// The backend failed to produce a value.
    ComputeFailed {
        key: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Invalidation Events
    // =========================================================================
    /// A resource namespace moved to a new version.
    VersionBumped {
        namespace: String,
        version: u64,
        timestamp: DateTime<Utc>,
    },
}

impl AdmissionEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AdmissionEvent::QuotaRejected { timestamp, .. } => *timestamp,
            AdmissionEvent::StoreRejected { timestamp, .. } => *timestamp,
            AdmissionEvent::Degraded { timestamp, .. } => *timestamp,
            AdmissionEvent::LeaderPromoted { timestamp, .. } => *timestamp,
            AdmissionEvent::IndependentCompute { timestamp, .. } => *timestamp,
            AdmissionEvent::ComputeFailed { timestamp, .. } => *timestamp,
            AdmissionEvent::VersionBumped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            AdmissionEvent::QuotaRejected { .. } => "QuotaRejected",
            AdmissionEvent::StoreRejected { .. } => "StoreRejected",
            AdmissionEvent::Degraded { .. } => "Degraded",
            AdmissionEvent::LeaderPromoted { .. } => "LeaderPromoted",
            AdmissionEvent::IndependentCompute { .. } => "IndependentCompute",
            AdmissionEvent::ComputeFailed { .. } => "ComputeFailed",
            AdmissionEvent::VersionBumped { .. } => "VersionBumped",
        }
    }

    /// Get the cache key if applicable.
    pub fn key(&self) -> Option<&str> {
        match self {
            AdmissionEvent::LeaderPromoted { key, .. }
            | AdmissionEvent::IndependentCompute { key, .. }
            | AdmissionEvent::ComputeFailed { key, .. } => Some(key),
            _ => None,
        }
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl AdmissionEvent {
    pub fn quota_rejected(identity: impl Into<String>, retry_after: Duration) -> Self {
        AdmissionEvent::QuotaRejected {
            identity: identity.into(),
            retry_after_ms: retry_after.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn store_rejected(
        identity: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        AdmissionEvent::StoreRejected {
            identity: identity.into(),
            operation: operation.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn degraded(operation: impl Into<String>, fail_mode: FailMode, reason: impl Into<String>) -> Self {
        AdmissionEvent::Degraded {
            operation: operation.into(),
            fail_mode,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn leader_promoted(key: impl Into<String>) -> Self {
        AdmissionEvent::LeaderPromoted {
            key: key.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn independent_compute(key: impl Into<String>) -> Self {
        AdmissionEvent::IndependentCompute {
            key: key.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn compute_failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        AdmissionEvent::ComputeFailed {
            key: key.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn version_bumped(namespace: impl Into<String>, version: u64) -> Self {
        AdmissionEvent::VersionBumped {
            namespace: namespace.into(),
            version,
            timestamp: Utc::now(),
        }
    }
}
