//! Cache Entry Envelope
//!
//! Entries are stored as opaque bytes wrapped in a fixed header carrying
//! their lifetimes, all in store-clock milliseconds:
//!
//! ```text
//! ┌─────────┬────────────┬──────────┬────────────┬───────────────┐
//! │ format  │ created_at │ stale_at │ expires_at │ value ...     │
//! │ 1 byte  │ u64 BE     │ u64 BE   │ u64 BE     │               │
//! └─────────┴────────────┴──────────┴────────────┴───────────────┘
//! ```
//!
//! An entry is replaced on recompute, never mutated in place.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const FORMAT_V1: u8 = 1;
const HEADER_LEN: usize = 1 + 8 * 3;

/// Where an entry is in its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Past `stale_at`: still served, refresh in the background
    Stale,
    /// Past `expires_at`: unusable
    Expired,
}

/// A cached value and its lifetimes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Bytes,
    pub created_at: u64,
    pub stale_at: u64,
    pub expires_at: u64,
}

impl CacheEntry {
    /// Entry created at `now_ms`, stale after `soft_ttl`, expired after `ttl`.
    ///
    /// A `soft_ttl` at or beyond `ttl` means the entry never goes stale.
    pub fn new(value: Bytes, now_ms: u64, soft_ttl: Duration, ttl: Duration) -> Self {
        let expires_at = now_ms.saturating_add(ttl.as_millis() as u64);
        let stale_at = now_ms
            .saturating_add(soft_ttl.as_millis() as u64)
            .min(expires_at);
        Self {
            value,
            created_at: now_ms,
            stale_at,
            expires_at,
        }
    }

    /// Hard lifetime of the entry
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(self.created_at))
    }

    /// Time left before the entry becomes unusable
    pub fn remaining_ttl(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_ms))
    }

    pub fn freshness(&self, now_ms: u64) -> Freshness {
        if now_ms >= self.expires_at {
            Freshness::Expired
        } else if now_ms >= self.stale_at {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Serialize into the stored envelope
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.value.len());
        buf.put_u8(FORMAT_V1);
        buf.put_u64(self.created_at);
        buf.put_u64(self.stale_at);
        buf.put_u64(self.expires_at);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// Parse a stored envelope; the value shares the input buffer
    pub fn decode(raw: Bytes) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::Codec(format!(
                "cache envelope too short: {} bytes",
                raw.len()
            )));
        }
        let mut header = &raw[..HEADER_LEN];
        let format = header.get_u8();
        if format != FORMAT_V1 {
            return Err(Error::Codec(format!("unknown cache envelope format {}", format)));
        }
        let created_at = header.get_u64();
        let stale_at = header.get_u64();
        let expires_at = header.get_u64();
        if stale_at > expires_at {
            return Err(Error::Codec("cache envelope goes stale after expiry".into()));
        }
        Ok(Self {
            value: raw.slice(HEADER_LEN..),
            created_at,
            stale_at,
            expires_at,
        })
    }
}
