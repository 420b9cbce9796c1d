//! Quota Tracker
//!
//! Per-identity admit/reject decisions over a sliding window approximated
//! by two fixed windows, with an optional burst bucket on top.
//!
//! # Store layout
//!
//! ```text
//! quota:{identity}:{window}         current / previous window counters
//! quota:{identity}:{window}:burst   burst tokens spent in a window
//! quota:{identity}:bucket           burst token bucket state
//! ```
//!
//! Counters are only ever touched through atomic increments. The window
//! check and the increment are one `incr_below` call, so concurrent callers
//! cannot both slip under the limit.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::bucket::{BucketTake, BurstBucket};
use super::window::WindowPosition;
use crate::config::{FailMode, QuotaConfig, QuotaScope};
use crate::domain::ports::{Identity, SharedStore};
use crate::error::{Error, Result};

/// Retry hint handed out when the store is unreachable and we fail closed
pub const STORE_FAILURE_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Within the sliding window
    Admitted,
    /// Over the window but paid for by the burst bucket
    Burst,
    /// Over quota
    QuotaExceeded,
    /// Store unreachable, rejected (fail closed)
    StoreUnavailable,
    /// Store unreachable, admitted without accounting (fail open)
    FailOpen,
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionReason::Admitted => write!(f, "admitted"),
            DecisionReason::Burst => write!(f, "burst"),
            DecisionReason::QuotaExceeded => write!(f, "quota_exceeded"),
            DecisionReason::StoreUnavailable => write!(f, "store_unavailable"),
            DecisionReason::FailOpen => write!(f, "fail_open"),
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: DecisionReason,
    /// Configured limit per period
    pub limit: u64,
    /// Requests still available in the sliding window
    pub remaining: u64,
    /// Suggested wait before retrying; zero when allowed
    pub retry_after: Duration,
    /// Time until the current fixed window closes
    pub reset_after: Duration,
}

impl QuotaDecision {
    /// True when the decision was driven by a store failure rather than the quota
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self.reason,
            DecisionReason::StoreUnavailable | DecisionReason::FailOpen
        )
    }

    /// Convert a rejection into the matching error
    pub fn into_result(self, identity: &Identity) -> Result<Self> {
        match self.reason {
            DecisionReason::QuotaExceeded => Err(Error::QuotaExceeded {
                identity: identity.to_string(),
                retry_after: self.retry_after,
            }),
            DecisionReason::StoreUnavailable => Err(Error::StoreUnavailable(format!(
                "quota check for {}",
                identity
            ))),
            _ => Ok(self),
        }
    }
}

enum BurstOutcome {
    Admitted { remaining: u64 },
    Refused { wait: Option<Duration> },
}

/// Sliding-window quota tracker backed by the shared store
pub struct QuotaTracker {
    store: Arc<dyn SharedStore>,
    config: QuotaConfig,
    bucket: Option<BurstBucket>,
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("config", &self.config)
            .finish()
    }
}

impl QuotaTracker {
    /// Create a tracker; a non-zero `burst` enables the burst bucket
    pub fn new(store: Arc<dyn SharedStore>, config: QuotaConfig) -> Self {
        let bucket = (config.burst > 0)
            .then(|| BurstBucket::new(config.burst, config.limit, config.period));
        Self {
            store,
            config,
            bucket,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Quota partition for a caller on a route, according to the configured scope
    pub fn partition(&self, identity: &Identity, route: &str) -> Identity {
        match self.config.scope {
            QuotaScope::Identity => identity.clone(),
            QuotaScope::IdentityAndRoute => Identity::new(format!("{}|{}", identity, route)),
        }
    }

    /// Admit or reject `cost` units for `identity`.
    ///
    /// Never fails: store errors become a decision according to `fail_mode`,
    /// tagged so they can be told apart from quota rejections.
    #[instrument(skip(self), fields(identity = %identity))]
    pub async fn admit(&self, identity: &Identity, cost: u64) -> QuotaDecision {
        match self.try_admit(identity, cost).await {
            Ok(decision) => decision,
            Err(err) => self.on_store_failure(identity, err),
        }
    }

    /// Admission check that surfaces store errors to the caller
    pub async fn try_admit(&self, identity: &Identity, cost: u64) -> Result<QuotaDecision> {
        let now = self.store.now().await?;
        let pos = WindowPosition::at(now, self.config.period);
        let limit = self.config.limit;
        let ttl = self.counter_ttl();

        let current_key = window_key(identity, pos.index);
        let previous = match pos.previous_index() {
            Some(index) => read_counter(self.store.get(&window_key(identity, index)).await?)?,
            None => 0,
        };
        let ceiling = pos.ceiling(limit, previous);

        // Costs no window plus burst could ever cover are refused without touching counters
        let max_cost = limit.saturating_add(self.bucket.as_ref().map_or(0, BurstBucket::capacity));
        let affordable = cost <= max_cost;

        let admitted = if affordable && cost <= ceiling {
            self.store
                .incr_below(&current_key, counter_delta(cost)?, counter_delta(ceiling)?, ttl)
                .await?
        } else {
            None
        };

        if let Some(count) = admitted {
            let remaining = ceiling.saturating_sub(count.max(0) as u64);
            debug!(count, ceiling, remaining, "Admitted within window");
            return Ok(QuotaDecision {
                allowed: true,
                reason: DecisionReason::Admitted,
                limit,
                remaining,
                retry_after: Duration::ZERO,
                reset_after: pos.reset_after(),
            });
        }

        let mut bucket_wait = None;
        if let Some(bucket) = self.bucket.as_ref().filter(|_| affordable) {
            match self.try_burst(bucket, identity, &current_key, cost, now).await? {
                BurstOutcome::Admitted { remaining } => {
                    debug!(remaining, "Admitted from burst allowance");
                    return Ok(QuotaDecision {
                        allowed: true,
                        reason: DecisionReason::Burst,
                        limit,
                        remaining: 0,
                        retry_after: Duration::ZERO,
                        reset_after: pos.reset_after(),
                    });
                }
                BurstOutcome::Refused { wait } => bucket_wait = wait,
            }
        }

        let current = read_counter(self.store.get(&current_key).await?)?;
        let window_wait = pos.retry_after(limit, current, previous, cost);
        let retry_after = bucket_wait.map_or(window_wait, |wait| wait.min(window_wait));
        debug!(
            current,
            previous,
            effective = pos.effective_count(current, previous),
            retry_after_ms = retry_after.as_millis() as u64,
            "Quota exceeded"
        );

        Ok(QuotaDecision {
            allowed: false,
            reason: DecisionReason::QuotaExceeded,
            limit,
            remaining: 0,
            retry_after,
            reset_after: pos.reset_after(),
        })
    }

    async fn try_burst(
        &self,
        bucket: &BurstBucket,
        identity: &Identity,
        current_key: &str,
        cost: u64,
        now: u64,
    ) -> Result<BurstOutcome> {
        let ttl = self.counter_ttl();
        let spent_key = format!("{}:burst", current_key);

        let delta = counter_delta(cost)?;

        // Per-window cap first, so limit + burst holds within any one window
        let reserved = self
            .store
            .incr_below(&spent_key, delta, counter_delta(bucket.capacity())?, ttl)
            .await?;
        if reserved.is_none() {
            return Ok(BurstOutcome::Refused { wait: None });
        }

        let take = bucket
            .try_take(self.store.as_ref(), &bucket_key(identity), cost, now)
            .await;
        match take {
            Ok(BucketTake::Taken { remaining }) => Ok(BurstOutcome::Admitted { remaining }),
            Ok(refused) => {
                self.store.incr_by(&spent_key, -delta, Some(ttl)).await?;
                let wait = match refused {
                    BucketTake::Empty { wait } => Some(wait),
                    _ => None,
                };
                Ok(BurstOutcome::Refused { wait })
            }
            Err(err) => {
                // Give the reservation back before surfacing the failure
                if let Err(refund_err) = self.store.incr_by(&spent_key, -delta, Some(ttl)).await {
                    warn!(
                        identity = %identity,
                        key = %spent_key,
                        cost,
                        error = %refund_err,
                        "Burst reservation not returned; window burst allowance reduced until reset"
                    );
                }
                Err(err)
            }
        }
    }

    fn on_store_failure(&self, identity: &Identity, err: Error) -> QuotaDecision {
        let reset_after = Duration::ZERO;
        match self.config.fail_mode {
            FailMode::Closed => {
                warn!(identity = %identity, error = %err, reason = "store_unavailable", "Rejecting: quota store unreachable");
                QuotaDecision {
                    allowed: false,
                    reason: DecisionReason::StoreUnavailable,
                    limit: self.config.limit,
                    remaining: 0,
                    retry_after: STORE_FAILURE_RETRY_AFTER,
                    reset_after,
                }
            }
            FailMode::Open => {
                warn!(identity = %identity, error = %err, reason = "fail_open", "Degraded: admitting without quota accounting");
                QuotaDecision {
                    allowed: true,
                    reason: DecisionReason::FailOpen,
                    limit: self.config.limit,
                    remaining: 0,
                    retry_after: Duration::ZERO,
                    reset_after,
                }
            }
        }
    }

    /// Counters must outlive the window after theirs, where they act as `previous`
    fn counter_ttl(&self) -> Duration {
        self.config.period * 2
    }
}

fn window_key(identity: &Identity, index: u64) -> String {
    format!("quota:{}:{}", identity, index)
}

fn bucket_key(identity: &Identity) -> String {
    format!("quota:{}:bucket", identity)
}

fn read_counter(raw: Option<Bytes>) -> Result<u64> {
    let Some(raw) = raw else {
        return Ok(0);
    };
    std::str::from_utf8(&raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map(|v| v.max(0) as u64)
        .ok_or_else(|| Error::Codec("quota counter is not an integer".into()))
}

// =============================================================================
// Tests
// =============================================================================

/// Counter increment for a quota amount
fn counter_delta(amount: u64) -> Result<i64> {
    i64::try_from(amount)
        .map_err(|_| Error::Internal(format!("quota amount {} exceeds counter range", amount)))
}
