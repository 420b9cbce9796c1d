//! Configuration for the admission layer
//!
//! All durations are expressed in milliseconds when serialized, e.g.
//!
//! ```yaml
//! quota:
//!   limit: 100
//!   period_ms: 60000
//!   burst: 10
//!   fail_mode: closed
//!   scope: identity
//! cache:
//!   ttl_ms: 300000
//!   soft_ttl_ms: 240000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound for the local version cache; beyond this, writes take too long to show up.
pub const MAX_VERSION_CACHE_TTL: Duration = Duration::from_secs(5);

// =============================================================================
// Enums
// =============================================================================

/// What to do when the shared store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Serve directly from the backend with caching disabled
    Open,
    /// Reject the request
    #[default]
    Closed,
}

impl std::fmt::Display for FailMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailMode::Open => write!(f, "open"),
            FailMode::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for FailMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            other => Err(Error::Config(format!("unknown fail mode: {}", other))),
        }
    }
}

/// How quota counters are partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    /// One quota per caller identity, shared across routes
    #[default]
    Identity,
    /// One quota per (identity, route) pair
    IdentityAndRoute,
}

impl std::str::FromStr for QuotaScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(QuotaScope::Identity),
            "identity_and_route" | "route" => Ok(QuotaScope::IdentityAndRoute),
            other => Err(Error::Config(format!("unknown quota scope: {}", other))),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Quota tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Requests admitted per period
    pub limit: u64,
    /// Window length
    #[serde(rename = "period_ms", with = "duration_ms")]
    pub period: Duration,
    /// Extra requests allowed above `limit` through the burst bucket
    pub burst: u64,
    /// Behavior when the store is unreachable
    pub fail_mode: FailMode,
    /// Counter partitioning
    pub scope: QuotaScope,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            period: Duration::from_secs(60),
            burst: 0,
            fail_mode: FailMode::Closed,
            scope: QuotaScope::Identity,
        }
    }
}

/// Cache entry lifetime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hard expiry; entries are unusable afterwards
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// Entries older than this are served stale and refreshed in the background
    #[serde(rename = "soft_ttl_ms", with = "duration_ms")]
    pub soft_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            soft_ttl: Duration::from_secs(240),
        }
    }
}

/// Singleflight lease configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// How long an in-flight marker stays alive without its leader
    #[serde(rename = "lease_duration_ms", with = "duration_ms")]
    pub lease_duration: Duration,
    /// Maximum time a follower waits for the leader's result
    #[serde(rename = "follower_timeout_ms", with = "duration_ms")]
    pub follower_timeout: Duration,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(10),
            follower_timeout: Duration::from_secs(5),
        }
    }
}

/// Version token cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Local read cache TTL for version tokens (bounded staleness after a bump)
    #[serde(rename = "version_cache_ttl_ms", with = "duration_ms")]
    pub version_cache_ttl: Duration,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            version_cache_ttl: Duration::from_secs(2),
        }
    }
}

/// Store retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Pause before the single retry of a failed store operation
    #[serde(rename = "backoff_ms", with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(25),
        }
    }
}

// =============================================================================
// Root Config
// =============================================================================

/// Complete configuration of the admission middleware
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub quota: QuotaConfig,
    pub cache: CacheConfig,
    pub flight: FlightConfig,
    pub invalidation: InvalidationConfig,
    pub retry: RetryConfig,
}

impl AdmissionConfig {
    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate YAML configuration
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.quota.limit == 0 {
            return Err(Error::Config("quota.limit must be greater than zero".into()));
        }
        if self.quota.period.as_millis() == 0 {
            return Err(Error::Config("quota.period must be at least 1ms".into()));
        }
        if self.cache.ttl.is_zero() {
            return Err(Error::Config("cache.ttl must be greater than zero".into()));
        }
        if self.flight.lease_duration.is_zero() {
            return Err(Error::Config("flight.lease_duration must be greater than zero".into()));
        }
        if self.flight.follower_timeout.is_zero() {
            return Err(Error::Config(
                "flight.follower_timeout must be greater than zero".into(),
            ));
        }
        if self.invalidation.version_cache_ttl > MAX_VERSION_CACHE_TTL {
            return Err(Error::Config(format!(
                "invalidation.version_cache_ttl must not exceed {}ms",
                MAX_VERSION_CACHE_TTL.as_millis()
            )));
        }
        Ok(())
    }

    /// True when entries go through a stale phase before hard expiry
    pub fn has_stale_phase(&self) -> bool {
        self.cache.soft_ttl < self.cache.ttl
    }
}

/// Serde helper storing `Duration` as integer milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
