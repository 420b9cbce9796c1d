//! Request Pipeline State Machine
//!
//! ```text
//! Received ─► Admitted ─► CacheCheck ─┬─► HitFresh ──────────────────┐
//!    │           │            │       ├─► HitStale ──────────────────┤
//!    │           │            │       └─► Miss ─┬─► LeaderCompute ───┤
//!    │           │            │                 └─► FollowerWait ────┼─► Responded
//!    │           └────────────┴──────────────────────► Bypass ───────┘
//!    └─► Rejected                       (any non-terminal) ─► Errored
//! ```
//!
//! `Bypass` is the fail-open path: the store is unreachable and the backend
//! is called directly with caching disabled.

use serde::Serialize;
use tracing::error;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Received,
    Admitted,
    CacheCheck,
    HitFresh,
    HitStale,
    Miss,
    LeaderCompute,
    FollowerWait,
    Bypass,
    Responded,
    Rejected,
    Errored,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Responded | PipelineState::Rejected | PipelineState::Errored
        )
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Errored {
            return true;
        }
        matches!(
            (self, next),
            (Received, Admitted)
                | (Received, Rejected)
                | (Admitted, CacheCheck)
                | (Admitted, Bypass)
                | (CacheCheck, HitFresh)
                | (CacheCheck, HitStale)
                | (CacheCheck, Miss)
                | (CacheCheck, Bypass)
                | (Miss, LeaderCompute)
                | (Miss, FollowerWait)
                | (Miss, Bypass)
                | (HitFresh, Responded)
                | (HitStale, Responded)
                | (LeaderCompute, Responded)
                | (FollowerWait, Responded)
                | (Bypass, Responded)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Received => "RECEIVED",
            PipelineState::Admitted => "ADMITTED",
            PipelineState::CacheCheck => "CACHE_CHECK",
            PipelineState::HitFresh => "HIT_FRESH",
            PipelineState::HitStale => "HIT_STALE",
            PipelineState::Miss => "MISS",
            PipelineState::LeaderCompute => "LEADER_COMPUTE",
            PipelineState::FollowerWait => "FOLLOWER_WAIT",
            PipelineState::Bypass => "BYPASS",
            PipelineState::Responded => "RESPONDED",
            PipelineState::Rejected => "REJECTED",
            PipelineState::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}

/// Ordered record of the states one request went through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTrace {
    states: Vec<PipelineState>,
}

impl Default for PipelineTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineTrace {
    pub fn new() -> Self {
        Self {
            states: vec![PipelineState::Received],
        }
    }

    pub fn current(&self) -> PipelineState {
        self.states
            .last()
            .copied()
            .unwrap_or(PipelineState::Received)
    }

    /// Record a transition; illegal transitions are logged and not recorded
    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(next) {
            error!(from = %current, to = %next, "Illegal pipeline transition");
            return Err(Error::Internal(format!(
                "illegal pipeline transition {} -> {}",
                current, next
            )));
        }
        self.states.push(next);
        Ok(())
    }

    pub fn states(&self) -> &[PipelineState] {
        &self.states
    }

    pub fn into_states(self) -> Vec<PipelineState> {
        self.states
    }
}
