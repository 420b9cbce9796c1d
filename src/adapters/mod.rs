//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │            SharedStore │ EventPublisher                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryStore │ RetryingStore (decorator)                  │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gatehouse::adapters::{InMemoryStore, RetryingStore};
//! use gatehouse::config::RetryConfig;
//!
//! let store = Arc::new(RetryingStore::new(
//!     Arc::new(InMemoryStore::new()),
//!     RetryConfig::default(),
//! ));
//! ```

mod event_publisher;
#[cfg(test)]
mod hooked_store;
mod memory_store;
mod retry;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
#[cfg(test)]
pub(crate) use hooked_store::HookedStore;
pub use memory_store::{InMemoryStore, StoreStats};
pub use retry::RetryingStore;
