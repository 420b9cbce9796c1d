//! Response Cache Module
//!
//! Versioned, stale-while-revalidate response caching in the shared store.
//!
//! # Components
//!
//! - **Key** (`key.rs`): deterministic keys from resource, canonical params
//!   and version token
//! - **Entry** (`entry.rs`): stored envelope with created/stale/expiry times
//! - **Store** (`store.rs`): `get` / `put` against the shared store
//!
//! # Entry Lifetime
//!
//! ```text
//!  created_at          stale_at            expires_at
//!      |------ fresh ------|------ stale ------|---- gone
//!                           served + refreshed
//! ```

pub mod entry;
pub mod key;
pub mod store;

pub use entry::{CacheEntry, Freshness};
pub use key::CacheKey;
pub use store::{CacheEntryStore, CacheLookup};
