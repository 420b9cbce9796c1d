//! Admission Middleware
//!
//! Ties quota, cache, singleflight and invalidation into a single request
//! pipeline in front of a [`Backend`].
//!
//! # Usage
//!
//! ```ignore
//! use gatehouse::adapters::InMemoryStore;
//! use gatehouse::config::AdmissionConfig;
//! use gatehouse::middleware::{AdmissionMiddleware, AdmissionRequest, BackendFn};
//!
//! let middleware = AdmissionMiddleware::new(Arc::new(InMemoryStore::new()), AdmissionConfig::default());
//! let backend = Arc::new(BackendFn(|req: AdmissionRequest| async move {
//!     Ok(Bytes::from(format!("body of {}", req.resource)))
//! }));
//!
//! let request = AdmissionRequest::new("/products", "product:42").with_api_key("abc");
//! let response = middleware.handle(request, backend).await;
//! ```

pub mod identity;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod state;

pub use identity::{DefaultIdentityResolver, IdentityResolver};
pub use pipeline::{AdmissionMiddleware, MiddlewareBuilder};
pub use request::{AdmissionRequest, Backend, BackendFn};
pub use response::{AdmissionResponse, CacheStatus, RateLimitInfo};
pub use state::{PipelineState, PipelineTrace};
