//! Admission Response Model

use std::time::Duration;

use bytes::Bytes;
use hyper::StatusCode;

use super::state::PipelineState;
use crate::quota::QuotaDecision;

/// Where the response body came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
    /// Store unreachable, served straight from the backend
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Stale => "STALE",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota state reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

impl From<&QuotaDecision> for RateLimitInfo {
    fn from(decision: &QuotaDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_after: decision.reset_after,
        }
    }
}

/// Response produced by the admission middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub cache_status: Option<CacheStatus>,
    pub rate_limit: Option<RateLimitInfo>,
    pub retry_after: Option<Duration>,
    pub trace: Vec<PipelineState>,
}

/// Whole seconds, rounded up
fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}

impl AdmissionResponse {
    pub fn ok(body: Bytes, cache_status: CacheStatus) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            cache_status: Some(cache_status),
            rate_limit: None,
            retry_after: None,
            trace: Vec::new(),
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Bytes::from(message.into()),
            cache_status: None,
            rate_limit: None,
            retry_after: None,
            trace: Vec::new(),
        }
    }

    pub fn with_rate_limit(mut self, info: Option<RateLimitInfo>) -> Self {
        self.rate_limit = info;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_trace(mut self, trace: Vec<PipelineState>) -> Self {
        self.trace = trace;
        self
    }

    /// Final pipeline state
    pub fn final_state(&self) -> Option<PipelineState> {
        self.trace.last().copied()
    }

    /// Response metadata as HTTP header name/value pairs
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(info) = &self.rate_limit {
            headers.push(("X-RateLimit-Limit", info.limit.to_string()));
            headers.push(("X-RateLimit-Remaining", info.remaining.to_string()));
            headers.push(("X-RateLimit-Reset", ceil_secs(info.reset_after).to_string()));
        }
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", ceil_secs(retry_after).max(1).to_string()));
        }
        if let Some(status) = self.cache_status {
            headers.push(("X-Cache", status.as_str().to_string()));
        }
        headers
    }
}
