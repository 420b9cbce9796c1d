//! Singleflight Module
//!
//! Exactly one recomputation per cache key at a time; every concurrent
//! caller for the key receives the same outcome.
//!
//! # Components
//!
//! - **Coordinator** (`coordinator.rs`): leader election through a leased
//!   store marker, in-process joining, follower timeouts, promotion and
//!   background refresh
//! - **Signal** (`signal.rs`): lease tokens and the completion messages
//!   published to followers in other processes
//!
//! # Usage
//!
//! ```rust,ignore
//! let outcome = coordinator
//!     .execute(&key, ttl, move || async move { backend.fetch(&request).await })
//!     .await?;
//! if outcome.shared {
//!     // value computed by another caller
//! }
//! ```

pub mod coordinator;
pub mod signal;

pub use coordinator::{FlightOutcome, FlightRole, SingleflightCoordinator};
pub use signal::{FlightSignal, LeaseToken};
