//! Domain Layer
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the shared store and event sink
//! - **Events** (`events.rs`) - Admission events for audit and observability
//!
//! # Usage
//!
//! ```ignore
//! use gatehouse::domain::ports::SharedStore;
//!
//! async fn current_count<S: SharedStore>(store: &S, key: &str) -> Result<i64> {
//!     store.incr_by(key, 0, None).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::AdmissionEvent;
pub use ports::{EventPublisher, Identity, SharedStore, SubscriptionStream};
