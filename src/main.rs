//! Gatehouse Gateway
//!
//! Demo gateway running the admission middleware in front of a synthetic
//! backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Gatehouse Gateway                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Gateway    │───▶│  Admission   │───▶│  Synthetic   │       │
//! │  │   (HTTP)     │    │  Middleware  │    │   Backend    │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             ▼                                    │
//! │                      ┌──────────────┐                           │
//! │                      │ Shared Store │                           │
//! │                      └──────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `GET /<resource>?<params>` goes through the middleware, `POST /<resource>`
//! bumps the resource's version token.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gatehouse::adapters::{InMemoryStore, LoggingEventPublisher};
use gatehouse::config::{
    AdmissionConfig, CacheConfig, FailMode, FlightConfig, InvalidationConfig, QuotaConfig,
    QuotaScope, RetryConfig,
};
use gatehouse::error::{Error, Result};
use gatehouse::metrics::{AdmissionMetrics, PrometheusExporter};
use gatehouse::middleware::{AdmissionMiddleware, AdmissionRequest, Backend};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Gatehouse - Admission control and response caching gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; takes precedence over the individual flags
    #[arg(long, env = "GATEHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Requests admitted per period
    #[arg(long, env = "QUOTA_LIMIT", default_value = "100")]
    quota_limit: u64,

    /// Quota period in milliseconds
    #[arg(long, env = "QUOTA_PERIOD_MS", default_value = "60000")]
    quota_period_ms: u64,

    /// Burst allowance above the limit
    #[arg(long, env = "QUOTA_BURST", default_value = "0")]
    quota_burst: u64,

    /// Behavior when the store is unreachable (open, closed)
    #[arg(long, env = "FAIL_MODE", default_value = "closed")]
    fail_mode: FailMode,

    /// Quota partitioning (identity, identity_and_route)
    #[arg(long, env = "QUOTA_SCOPE", default_value = "identity")]
    quota_scope: QuotaScope,

    /// Cache hard TTL in milliseconds
    #[arg(long, env = "CACHE_TTL_MS", default_value = "300000")]
    cache_ttl_ms: u64,

    /// Cache soft TTL in milliseconds
    #[arg(long, env = "CACHE_SOFT_TTL_MS", default_value = "240000")]
    cache_soft_ttl_ms: u64,

    /// Singleflight lease duration in milliseconds
    #[arg(long, env = "LEASE_DURATION_MS", default_value = "10000")]
    lease_duration_ms: u64,

    /// How long followers wait for a leader in milliseconds
    #[arg(long, env = "FOLLOWER_TIMEOUT_MS", default_value = "5000")]
    follower_timeout_ms: u64,

    /// Local version cache TTL in milliseconds
    #[arg(long, env = "VERSION_CACHE_TTL_MS", default_value = "2000")]
    version_cache_ttl_ms: u64,

    /// Store retry backoff in milliseconds
    #[arg(long, env = "STORE_RETRY_BACKOFF_MS", default_value = "25")]
    store_retry_backoff_ms: u64,

    /// Simulated backend latency in milliseconds
    #[arg(long, env = "BACKEND_LATENCY_MS", default_value = "200")]
    backend_latency_ms: u64,

    /// Gateway bind address
    #[arg(long, env = "GATEWAY_ADDR", default_value = "0.0.0.0:8000")]
    gateway_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn admission_config(&self) -> Result<AdmissionConfig> {
        let config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                AdmissionConfig::from_yaml_file(path)?
            }
            None => AdmissionConfig {
                quota: QuotaConfig {
                    limit: self.quota_limit,
                    period: Duration::from_millis(self.quota_period_ms),
                    burst: self.quota_burst,
                    fail_mode: self.fail_mode,
                    scope: self.quota_scope,
                },
                cache: CacheConfig {
                    ttl: Duration::from_millis(self.cache_ttl_ms),
                    soft_ttl: Duration::from_millis(self.cache_soft_ttl_ms),
                },
                flight: FlightConfig {
                    lease_duration: Duration::from_millis(self.lease_duration_ms),
                    follower_timeout: Duration::from_millis(self.follower_timeout_ms),
                },
                invalidation: InvalidationConfig {
                    version_cache_ttl: Duration::from_millis(self.version_cache_ttl_ms),
                },
                retry: RetryConfig {
                    backoff: Duration::from_millis(self.store_retry_backoff_ms),
                },
            },
        };
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Synthetic Backend
// =============================================================================

/// Stands in for the protected API: sleeps, then renders the request
struct SyntheticBackend {
    latency: Duration,
}

#[async_trait]
impl Backend for SyntheticBackend {
    async fn compute(&self, request: &AdmissionRequest) -> anyhow::Result<Bytes> {
        tokio::time::sleep(self.latency).await;
        let body = serde_json::json!({
            "resource": request.resource,
            "params": request.params,
            "computed_at": chrono::Utc::now().to_rfc3339(),
        });
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.admission_config()?;

    info!("Starting Gatehouse gateway");
    info!(
        "  Quota: {} per {}ms, burst {}, fail {}",
        config.quota.limit,
        config.quota.period.as_millis(),
        config.quota.burst,
        config.quota.fail_mode
    );
    info!(
        "  Cache TTL: {}ms (soft {}ms, stale-while-revalidate {})",
        config.cache.ttl.as_millis(),
        config.cache.soft_ttl.as_millis(),
        if config.has_stale_phase() { "on" } else { "off" }
    );
    info!("  Backend latency: {}ms", args.backend_latency_ms);
    warn!("Using the in-process store; quotas and flights are not shared across instances");

    let metrics = Arc::new(AdmissionMetrics::new());
    let middleware = Arc::new(
        AdmissionMiddleware::builder(Arc::new(InMemoryStore::new()), config)
            .events(Arc::new(LoggingEventPublisher))
            .metrics(metrics.clone())
            .build(),
    );
    let backend: Arc<dyn Backend> = Arc::new(SyntheticBackend {
        latency: Duration::from_millis(args.backend_latency_ms),
    });
    let exporter = Arc::new(PrometheusExporter::new()?);

    let shutdown = CancellationToken::new();

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, exporter, metrics, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    let gateway_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        gateway_shutdown.cancel();
    });

    run_gateway(&args.gateway_addr, middleware, backend, shutdown).await?;

    info!("Gateway shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Helpers
// =============================================================================

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn bind(addr: &str, name: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid {} address: {}", name, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", name, e)))?;

    info!("{} listening on {}", name, addr);
    Ok(listener)
}

/// Accept connections until `shutdown` fires, serving each with `handler`
async fn serve<F, Fut>(
    listener: TcpListener,
    name: &'static str,
    shutdown: CancellationToken,
    handler: F,
) -> Result<()>
where
    F: Fn(Request<Incoming>, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{} stopping", name);
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("{} accept error: {}", name, e)))?,
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(req, peer).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} connection error: {}", name, e);
            }
        });
    }
}

// =============================================================================
// Gateway Server
// =============================================================================

async fn run_gateway(
    addr: &str,
    middleware: Arc<AdmissionMiddleware>,
    backend: Arc<dyn Backend>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind(addr, "Gateway").await?;
    serve(listener, "Gateway", shutdown, move |req, peer| {
        let middleware = middleware.clone();
        let backend = backend.clone();
        async move { gateway_handler(req, peer, middleware, backend).await }
    })
    .await
}

async fn gateway_handler(
    req: Request<Incoming>,
    peer: SocketAddr,
    middleware: Arc<AdmissionMiddleware>,
    backend: Arc<dyn Backend>,
) -> Response<Full<Bytes>> {
    let resource = req.uri().path().trim_matches('/').to_string();
    if resource.is_empty() {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }

    match *req.method() {
        Method::GET => {
            let request = admission_request(&req, &resource, peer);
            let response = middleware.handle(request, backend).await;

            let mut http = text_response(response.status, response.body.clone());
            if response.status.is_success() {
                http.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            for (name, value) in response.header_pairs() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(&value),
                ) {
                    http.headers_mut().insert(name, value);
                }
            }
            http
        }
        Method::POST | Method::PUT | Method::DELETE => match middleware.bump(&resource).await {
            Ok(version) => text_response(
                StatusCode::OK,
                serde_json::json!({ "resource": resource, "version": version }).to_string(),
            ),
            Err(e) => {
                warn!(resource = %resource, error = %e, "Version bump failed");
                text_response(e.status_code(), e.to_string())
            }
        },
        _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    }
}

fn admission_request(req: &Request<Incoming>, resource: &str, peer: SocketAddr) -> AdmissionRequest {
    let mut request = AdmissionRequest::new(req.uri().path(), resource).with_client_addr(peer.ip());

    if let Some(key) = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        request = request.with_api_key(key);
    }

    for pair in req.uri().query().unwrap_or_default().split('&') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if name.is_empty() {
            continue;
        }
        match (urlencoding::decode(name), urlencoding::decode(value)) {
            (Ok(name), Ok(value)) => request = request.with_param(name, value),
            _ => warn!(pair, "Skipping undecodable query parameter"),
        }
    }
    request
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = bind(addr, "Health server").await?;
    serve(listener, "Health server", shutdown, |req, _peer| async move {
        match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    })
    .await
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    exporter: Arc<PrometheusExporter>,
    metrics: Arc<AdmissionMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind(addr, "Metrics server").await?;
    serve(listener, "Metrics server", shutdown, move |req, _peer| {
        let exporter = exporter.clone();
        let metrics = metrics.clone();
        async move {
            if req.uri().path() != "/metrics" {
                return text_response(StatusCode::NOT_FOUND, "not found");
            }
            match exporter.render(&metrics.snapshot()) {
                Ok(body) => {
                    let mut response = text_response(StatusCode::OK, body);
                    if let Ok(value) = HeaderValue::from_str(&exporter.content_type()) {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }
    })
    .await
}
