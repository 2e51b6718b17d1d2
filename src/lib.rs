use axum::{
    extract::{Host, Path, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use thiserror::Error;

pub mod client;
pub mod config;
pub mod invoke;
pub mod metadata;
pub mod options;
pub mod resilience;
pub mod storage;

use crate::client::ClientDetector;
use crate::config::GatewayConfig;
use crate::invoke::{CacheHook, NoopCacheHook, PassthroughTransformer, TransformHook, TransformInvoker};
use crate::metadata::MetadataService;
use crate::options::builder::is_subrequest;
use crate::options::{OptionBuilder, TransformOptions};
use crate::storage::{HttpPayload, ObjectStore, StorageResolver};

/// Cache-Control applied when a bypass parameter is present.
pub const NO_STORE_CACHE_CONTROL: &str = "no-store, no-cache, must-revalidate";

/// Header stamped on the gateway's own outbound subrequests; its
/// presence on an inbound request trips the subrequest guard.
pub const PROCESSED_MARKER: &str = "x-imagegate-processed";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Authentication failed: {0}")]
    AuthError(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Origin error: {0}")]
    OriginError(String),
    #[error("Circuit open for {0}")]
    CircuitOpen(String),
    #[error("All sources failed: {0}")]
    AllSourcesFailed(String),
    #[error("Transform timed out")]
    TransformTimeout,
    #[error("Transform failed: {0}")]
    TransformFailure(String),
    #[error("Invalid option: {0}")]
    Validation(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Only timeouts and origin-side errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::OriginError(_)
        )
    }

    /// Stable code for the adaptive failure log.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::AuthError(_) => "AUTH_ERROR",
            GatewayError::Timeout(_) => "TIMEOUT",
            GatewayError::OriginError(_) => "ORIGIN_ERROR",
            GatewayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            GatewayError::AllSourcesFailed(_) => "ALL_SOURCES_FAILED",
            GatewayError::TransformTimeout => "TRANSFORM_TIMEOUT",
            GatewayError::TransformFailure(_) => "TRANSFORM_FAILURE",
            GatewayError::Validation(_) => "VALIDATION",
            GatewayError::Config(_) => "CONFIG",
            GatewayError::Internal(_) => "UNKNOWN_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Injected collaborators for one gateway instance.
pub struct GatewayHooks {
    pub transformer: Arc<dyn TransformHook>,
    pub cache: Arc<dyn CacheHook>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
}

impl Default for GatewayHooks {
    fn default() -> Self {
        Self {
            transformer: Arc::new(PassthroughTransformer),
            cache: Arc::new(NoopCacheHook),
            object_store: None,
        }
    }
}

/// One gateway instance: the orchestrator plus its long-lived services.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    resolver: Arc<StorageResolver>,
    metadata: Arc<MetadataService>,
    builder: OptionBuilder,
    invoker: TransformInvoker,
}

impl Gateway {
    pub fn new(config: GatewayConfig, hooks: GatewayHooks) -> Arc<Self> {
        let config = Arc::new(config);
        let resolver = Arc::new(StorageResolver::new(
            Arc::clone(&config),
            hooks.object_store.clone(),
        ));
        let metadata = MetadataService::new(
            Arc::clone(&config),
            Arc::clone(&resolver),
            Arc::clone(&hooks.transformer),
        );
        let builder = OptionBuilder::new(Arc::clone(&config), Arc::clone(&metadata));
        let invoker = TransformInvoker::new(hooks.transformer, hooks.cache, Arc::clone(&config));
        Arc::new(Self {
            config,
            resolver,
            metadata,
            builder,
            invoker,
        })
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<StorageResolver> {
        &self.resolver
    }

    pub fn metadata(&self) -> &Arc<MetadataService> {
        &self.metadata
    }

    /// Serve one image request end to end.
    pub async fn handle(
        &self,
        host: &str,
        path: &str,
        query: &str,
        headers: &HeaderMap,
    ) -> Result<HttpPayload> {
        use std::sync::atomic::Ordering;
        METRICS.requests.fetch_add(1, Ordering::Relaxed);
        let started = std::time::Instant::now();

        // A request that already went through the pipeline must never
        // re-enter it.
        if is_subrequest(headers) {
            METRICS.subrequests.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(path, "subrequest detected; passing origin response through");
            let stored = self.resolver.fetch_image(path, headers).await?;
            return Ok(stored.payload);
        }

        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(query).unwrap_or_default();
        let bypass_cache = pairs
            .iter()
            .any(|(key, _)| self.config.cache.bypass_params.contains(key));
        let (url_options, parse_warnings) = TransformOptions::from_query_pairs(&pairs);
        for warning in &parse_warnings {
            tracing::debug!(path, warning = %warning, "option parse warning");
        }

        let stored = self.resolver.fetch_image(path, headers).await?;

        // Conditional hits carry no body; there is nothing to transform.
        if stored.payload.status == StatusCode::NOT_MODIFIED
            || stored.payload.status == StatusCode::PARTIAL_CONTENT
        {
            return Ok(stored.payload);
        }

        let detector = ClientDetector::new(Arc::clone(&self.config));
        let built = self
            .builder
            .build(&detector, host, path, headers, url_options, &stored)
            .await;

        let mut payload = self
            .invoker
            .invoke(path, &stored, &built.options, built.client_hints_used)
            .await;

        if bypass_cache {
            payload.headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(NO_STORE_CACHE_CONTROL),
            );
        }
        if self.config.performance.performance_tracking {
            tracing::info!(
                path,
                elapsed_ms = started.elapsed().as_millis() as u64,
                source = stored.source.as_str(),
                "request served"
            );
        }
        Ok(payload)
    }
}

async fn image_handler(
    State(gateway): State<Arc<Gateway>>,
    host: Option<Host>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> axum::response::Response {
    let host = host.map(|Host(h)| h).unwrap_or_default();
    let path = format!("/{}", path.trim_start_matches('/'));
    let query = query.unwrap_or_default();

    match gateway.handle(&host, &path, &query, &headers).await {
        Ok(payload) => payload.into_response(),
        Err(err) => {
            use std::sync::atomic::Ordering;
            METRICS.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(path, error = %err, "request failed");
            error_response(err)
        }
    }
}

fn error_response(err: GatewayError) -> axum::response::Response {
    let status = match &err {
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::AuthError(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::AllSourcesFailed(_) | GatewayError::OriginError(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

// ====================================================================================
// OBSERVABILITY
// ====================================================================================

use std::sync::atomic::{AtomicU64, Ordering};

/// Global request counters
pub struct Metrics {
    pub requests: AtomicU64,
    pub subrequests: AtomicU64,
    pub transform_fallbacks: AtomicU64,
    pub metadata_coalesced: AtomicU64,
    pub errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            subrequests: AtomicU64::new(0),
            transform_fallbacks: AtomicU64::new(0),
            metadata_coalesced: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    pub static ref METRICS: Metrics = Metrics::new();
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    use serde_json::json;

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "imagegate"
    }))
}

/// Metrics endpoint (Prometheus-compatible plain text)
async fn metrics_handler() -> impl IntoResponse {
    let requests = METRICS.requests.load(Ordering::Relaxed);
    let subrequests = METRICS.subrequests.load(Ordering::Relaxed);
    let fallbacks = METRICS.transform_fallbacks.load(Ordering::Relaxed);
    let coalesced = METRICS.metadata_coalesced.load(Ordering::Relaxed);
    let errors = METRICS.errors.load(Ordering::Relaxed);

    let body = format!(
        "# HELP imagegate_requests_total Total number of image requests\n\
         # TYPE imagegate_requests_total counter\n\
         imagegate_requests_total {}\n\
         # HELP imagegate_subrequests_total Requests short-circuited by the subrequest guard\n\
         # TYPE imagegate_subrequests_total counter\n\
         imagegate_subrequests_total {}\n\
         # HELP imagegate_transform_fallbacks_total Transformer failures served from origin\n\
         # TYPE imagegate_transform_fallbacks_total counter\n\
         imagegate_transform_fallbacks_total {}\n\
         # HELP imagegate_metadata_coalesced_total Metadata fetches served from an in-flight future\n\
         # TYPE imagegate_metadata_coalesced_total counter\n\
         imagegate_metadata_coalesced_total {}\n\
         # HELP imagegate_errors_total Total number of failed requests\n\
         # TYPE imagegate_errors_total counter\n\
         imagegate_errors_total {}\n",
        requests, subrequests, fallbacks, coalesced, errors
    );

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Build the gateway router with the given configuration and hooks.
pub fn router(config: GatewayConfig, hooks: GatewayHooks) -> Router {
    router_with(Gateway::new(config, hooks))
}

/// Build the router around an existing gateway instance (shared state
/// with tests or embedding services).
pub fn router_with(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/images/*path", get(image_handler).with_state(gateway))
}
