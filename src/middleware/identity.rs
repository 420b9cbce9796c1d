//! Caller Identity Resolution

use async_trait::async_trait;

use super::request::AdmissionRequest;
use crate::domain::ports::Identity;

/// Port to the authentication layer that names the caller
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, request: &AdmissionRequest) -> Identity;
}

/// API key if present, else client address, else a shared anonymous bucket
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIdentityResolver;

#[async_trait]
impl IdentityResolver for DefaultIdentityResolver {
    async fn resolve(&self, request: &AdmissionRequest) -> Identity {
        if let Some(key) = request.api_key.as_deref().filter(|k| !k.is_empty()) {
            return Identity::new(format!("key:{}", key));
        }
        match request.client_addr {
            Some(addr) => Identity::new(format!("ip:{}", addr)),
            None => Identity::new("anonymous"),
        }
    }
}
