//! Quota Tracker Module
//!
//! Per-identity admission over rolling time windows.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       QuotaTracker                            │
//! │                                                               │
//! │   admit(identity, cost)                                       │
//! │        │                                                      │
//! │        ▼                                                      │
//! │   ┌─────────────────┐   full    ┌──────────────────────────┐  │
//! │   │ Sliding Window  │ ────────► │ Burst Bucket (optional)  │  │
//! │   │ current + prev  │           │ refilled at limit/period │  │
//! │   └─────────────────┘           └──────────────────────────┘  │
//! │        │                                  │                   │
//! │        └──────────── QuotaDecision ◄──────┘                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Window** (`window.rs`): fixed-window positioning and the overlap
//!   weighting that approximates a sliding window
//! - **Bucket** (`bucket.rs`): compare-and-swap token bucket for bursts
//! - **Tracker** (`tracker.rs`): the admission decision, fail modes and
//!   store key layout
//!
//! # Usage
//!
//! ```rust,ignore
//! use gatehouse::quota::QuotaTracker;
//!
//! let tracker = QuotaTracker::new(store, config.quota.clone());
//! let decision = tracker.admit(&Identity::new("userA"), 1).await;
//! if !decision.allowed {
//!     // 429 with Retry-After: decision.retry_after
//! }
//! ```

pub mod bucket;
pub mod tracker;
pub mod window;

mod proptest;

pub use bucket::{BucketTake, BurstBucket};
pub use tracker::{DecisionReason, QuotaDecision, QuotaTracker, STORE_FAILURE_RETRY_AFTER};
pub use window::WindowPosition;
