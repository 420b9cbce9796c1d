//! Request Model and Backend Port

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;

/// A read request as seen by the admission layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Route the request arrived on, e.g. `/products`
    pub route: String,
    /// Resource id used in cache keys, e.g. `product:42`
    pub resource: String,
    /// Version namespace; bumping it invalidates this request's entries
    pub namespace: String,
    /// Query parameters; order does not matter
    pub params: BTreeMap<String, String>,
    pub api_key: Option<String>,
    pub client_addr: Option<IpAddr>,
    /// Quota units charged for this request
    pub cost: u64,
}

impl AdmissionRequest {
    /// Request for `resource` on `route`, versioned under the resource's own namespace
    pub fn new(route: impl Into<String>, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self {
            route: route.into(),
            namespace: resource.clone(),
            resource,
            params: BTreeMap::new(),
            api_key: None,
            client_addr: None,
            cost: 1,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

/// Port for the backend business logic behind the admission layer.
///
/// May be invoked more than once for the same request in rare
/// crash-recovery races.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn compute(&self, request: &AdmissionRequest) -> anyhow::Result<Bytes>;
}

/// Adapts an async closure into a [`Backend`]
pub struct BackendFn<F>(pub F);

#[async_trait]
impl<F, Fut> Backend for BackendFn<F>
where
    F: Fn(AdmissionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
{
    async fn compute(&self, request: &AdmissionRequest) -> anyhow::Result<Bytes> {
        (self.0)(request.clone()).await
    }
}
