//! Flight Lease and Wake Signals
//!
//! Cross-process coordination for one cache key uses two store entries:
//!
//! ```text
//! flight:{key}         lease marker, value = owner token, TTL = lease duration
//! flight-done:{key}    pub/sub channel carrying a FlightSignal when the leader finishes
//! ```
//!
//! The leader publishes only after its cache write, so a follower woken by
//! `Done` always finds the entry. A lease released without a compute is
//! announced as `Abandoned`, which followers answer by contending again
//! rather than by promoting.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;
use crate::error::{Error, Result};

/// Store key of the in-flight lease for `key`
pub fn lease_key(key: &CacheKey) -> String {
    format!("flight:{}", key)
}

/// Channel on which the leader for `key` announces completion
pub fn done_channel(key: &CacheKey) -> String {
    format!("flight-done:{}", key)
}

/// Owner of a lease: the coordinator instance and its flight sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new(owner: &str, flight: u64) -> Self {
        Self(format!("{}:{}", owner, flight))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.0.clone())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message published by a leader when its flight ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum FlightSignal {
    /// Result written to the cache
    Done { owner: String },
    /// Compute failed; followers fail with the same message
    Failed { owner: String, error: String },
    /// Lease given up without computing; followers contend again
    Abandoned { owner: String },
}

impl FlightSignal {
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(format!("flight signal: {}", e)))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::Codec(format!("flight signal: {}", e)))
    }
}
