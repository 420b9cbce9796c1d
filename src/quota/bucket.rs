//! Burst Token Bucket
//!
//! Secondary allowance consulted only when the sliding window is full.
//! Capacity is `burst` tokens, refilled at `limit / period`. The bucket
//! state is a single store value updated by compare-and-swap, so two nodes
//! can never spend the same token.
//!
//! Tokens are tracked in thousandths to keep slow refill rates precise.

use std::time::Duration;

use crate::domain::ports::SharedStore;
use crate::error::{Error, Result};

/// Milli-tokens per token
const SCALE: u64 = 1000;

/// CAS attempts before a contended take gives up
const MAX_CAS_ATTEMPTS: usize = 8;

/// Persisted bucket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Available tokens × 1000
    pub tokens_milli: u64,
    /// Store time of the last refill
    pub updated_ms: u64,
}

impl BucketState {
    fn encode(&self) -> bytes::Bytes {
        bytes::Bytes::from(format!("{}:{}", self.tokens_milli, self.updated_ms))
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        let parsed = std::str::from_utf8(raw).ok().and_then(|s| {
            let (tokens, updated) = s.split_once(':')?;
            Some(Self {
                tokens_milli: tokens.parse().ok()?,
                updated_ms: updated.parse().ok()?,
            })
        });
        parsed.ok_or_else(|| Error::Codec("malformed burst bucket state".into()))
    }

    /// Whole tokens available
    pub fn tokens(&self) -> u64 {
        self.tokens_milli / SCALE
    }
}

/// Result of trying to take tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketTake {
    /// Tokens were spent; `remaining` whole tokens are left
    Taken { remaining: u64 },
    /// Not enough tokens; `wait` until enough have refilled
    Empty { wait: Duration },
    /// Too many concurrent writers; treated as empty by callers
    Contended,
}

/// Burst bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstBucket {
    capacity: u64,
    refill_tokens: u64,
    refill_period_ms: u64,
}

impl BurstBucket {
    /// Bucket holding `capacity` tokens, refilled at `refill_tokens` per `refill_period`
    pub fn new(capacity: u64, refill_tokens: u64, refill_period: Duration) -> Self {
        Self {
            capacity,
            refill_tokens,
            refill_period_ms: (refill_period.as_millis() as u64).max(1),
        }
    }

    /// Maximum tokens
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// How long an idle bucket key must survive; a bucket that expires is full anyway
    pub fn state_ttl(&self) -> Duration {
        Duration::from_millis(self.full_refill_ms().saturating_add(self.refill_period_ms))
    }

    fn full_refill_ms(&self) -> u64 {
        if self.refill_tokens == 0 {
            return self.refill_period_ms;
        }
        (self.capacity as u128 * self.refill_period_ms as u128)
            .div_ceil(self.refill_tokens as u128) as u64
    }

    /// A bucket seen for the first time starts full
    pub fn full(&self, now_ms: u64) -> BucketState {
        BucketState {
            tokens_milli: self.capacity * SCALE,
            updated_ms: now_ms,
        }
    }

    /// State after refilling up to `now_ms`
    pub fn refill(&self, state: BucketState, now_ms: u64) -> BucketState {
        if now_ms <= state.updated_ms {
            return state;
        }
        let elapsed = (now_ms - state.updated_ms) as u128;
        let added = elapsed * self.refill_tokens as u128 * SCALE as u128 / self.refill_period_ms as u128;
        let tokens = (state.tokens_milli as u128 + added).min((self.capacity * SCALE) as u128);
        BucketState {
            tokens_milli: tokens as u64,
            updated_ms: now_ms,
        }
    }

    /// Time until `cost` tokens are available
    pub fn time_until(&self, state: &BucketState, cost: u64) -> Duration {
        if cost > self.capacity {
            return Duration::MAX;
        }
        let needed = cost * SCALE;
        if state.tokens_milli >= needed {
            return Duration::ZERO;
        }
        if self.refill_tokens == 0 {
            return Duration::MAX;
        }
        let deficit = (needed - state.tokens_milli) as u128;
        let ms = (deficit * self.refill_period_ms as u128)
            .div_ceil(self.refill_tokens as u128 * SCALE as u128);
        Duration::from_millis(ms as u64)
    }

    /// Atomically take `cost` tokens from the bucket stored at `key`
    pub async fn try_take(
        &self,
        store: &dyn SharedStore,
        key: &str,
        cost: u64,
        now_ms: u64,
    ) -> Result<BucketTake> {
        // Never satisfiable, and `cost * SCALE` is only meaningful up to capacity
        if cost > self.capacity {
            return Ok(BucketTake::Empty {
                wait: Duration::MAX,
            });
        }
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = store.get(key).await?;
            let state = match raw.as_deref() {
                Some(bytes) => BucketState::decode(bytes)?,
                None => self.full(now_ms),
            };
            let refilled = self.refill(state, now_ms);
            if refilled.tokens_milli < cost * SCALE {
                return Ok(BucketTake::Empty {
                    wait: self.time_until(&refilled, cost),
                });
            }
            let next = BucketState {
                tokens_milli: refilled.tokens_milli - cost * SCALE,
                updated_ms: refilled.updated_ms,
            };
            if store
                .compare_and_swap(key, raw.as_deref(), next.encode(), Some(self.state_ttl()))
                .await?
            {
                return Ok(BucketTake::Taken {
                    remaining: next.tokens(),
                });
            }
        }
        Ok(BucketTake::Contended)
    }
}
