use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GatewayConfig;
use crate::options::{cache_key_basis, TransformOptions};
use crate::storage::{HttpPayload, StorageResult};
use crate::GatewayError;

/// Hard ceiling on one transformer invocation.
pub const TRANSFORM_TIMEOUT: Duration = Duration::from_secs(25);

/// The platform image transformer, injected at construction.
///
/// Receives the resolved source payload and a validated options record;
/// the record never contains pipeline-internal fields.
#[async_trait::async_trait]
pub trait TransformHook: Send + Sync {
    async fn transform(
        &self,
        path: &str,
        source: &StorageResult,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<HttpPayload, GatewayError>;
}

/// Cache directives handed to the external cache layer.
#[derive(Debug, Clone, Default)]
pub struct FetchDirectives {
    pub cache_everything: bool,
    pub ttl_ok: u32,
    pub ttl_client_error: u32,
    pub ttl_server_error: u32,
    pub cache_tags: Vec<String>,
}

/// The external cache layer, injected at construction. The gateway does
/// not cache; it only guarantees a deterministic key/tag basis.
#[async_trait::async_trait]
pub trait CacheHook: Send + Sync {
    async fn apply(
        &self,
        directives: FetchDirectives,
        path: &str,
        options: &TransformOptions,
    ) -> FetchDirectives;
}

/// Cache hook that leaves directives untouched.
pub struct NoopCacheHook;

#[async_trait::async_trait]
impl CacheHook for NoopCacheHook {
    async fn apply(
        &self,
        directives: FetchDirectives,
        _path: &str,
        _options: &TransformOptions,
    ) -> FetchDirectives {
        directives
    }
}

/// Reference transformer used by local development and tests: returns
/// the source bytes unchanged, and answers `format=json` describe
/// requests from what the gateway already knows about the source.
pub struct PassthroughTransformer;

#[async_trait::async_trait]
impl TransformHook for PassthroughTransformer {
    async fn transform(
        &self,
        _path: &str,
        source: &StorageResult,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<HttpPayload, GatewayError> {
        if options.get("format").and_then(|v| v.as_str()) == Some("json") {
            let mut original = serde_json::Map::new();
            if let Some(w) = source.width {
                original.insert("width".into(), json!(w));
            }
            if let Some(h) = source.height {
                original.insert("height".into(), json!(h));
            }
            original.insert("file_size".into(), json!(source.size));
            original.insert("format".into(), json!(source.content_type()));
            let body = serde_json::to_vec(&json!({ "original": original }))
                .map_err(|e| GatewayError::TransformFailure(e.to_string()))?;

            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            return Ok(HttpPayload {
                status: axum::http::StatusCode::OK,
                headers,
                body: body.into(),
            });
        }
        Ok(source.payload.clone())
    }
}

/// Dispatches one transformer call with cache directives, a hard
/// timeout and a total fallback path.
pub struct TransformInvoker {
    transformer: Arc<dyn TransformHook>,
    cache: Arc<dyn CacheHook>,
    config: Arc<GatewayConfig>,
    timeout: Duration,
}

impl TransformInvoker {
    pub fn new(
        transformer: Arc<dyn TransformHook>,
        cache: Arc<dyn CacheHook>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            transformer,
            cache,
            config,
            timeout: TRANSFORM_TIMEOUT,
        }
    }

    /// Override the transformer deadline (embedding services, tests).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke the transformer for one request. Never fails while a
    /// storage body is available: timeouts and transformer errors fall
    /// back to the cloned origin response.
    pub async fn invoke(
        &self,
        path: &str,
        source: &StorageResult,
        options: &TransformOptions,
        client_hints_used: bool,
    ) -> HttpPayload {
        let record = options.to_transformer_record();

        let directives = self.base_directives(path, options);
        let directives = self.cache.apply(directives, path, options).await;

        let outcome =
            tokio::time::timeout(self.timeout, self.transformer.transform(path, source, &record))
                .await;

        let payload = match outcome {
            Err(_) => {
                tracing::warn!(path, "transformer timed out; serving origin response");
                crate::METRICS
                    .transform_fallbacks
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return source.payload.clone();
            }
            Ok(Err(err)) => {
                tracing::warn!(path, error = %err, "transformer failed; serving origin response");
                crate::METRICS
                    .transform_fallbacks
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return source.payload.clone();
            }
            Ok(Ok(payload)) if !payload.status.is_success() => {
                tracing::warn!(
                    path,
                    status = %payload.status,
                    "transformer returned non-success; serving origin response"
                );
                crate::METRICS
                    .transform_fallbacks
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return source.payload.clone();
            }
            Ok(Ok(payload)) => payload,
        };

        self.decorate(payload, options, &directives, client_hints_used)
    }

    fn base_directives(&self, path: &str, options: &TransformOptions) -> FetchDirectives {
        let cache = &self.config.cache;
        let mut tags = Vec::new();
        if cache.cache_tags.enabled {
            let prefix = &cache.cache_tags.prefix;
            tags.push(format!("{}{}", prefix, path.trim_start_matches('/')));
            tags.push(format!("{}{}", prefix, cache_key_basis(path, options)));
            if let Some(derivative) = &options.derivative {
                tags.push(format!("{}derivative-{}", prefix, derivative));
            }
        }
        FetchDirectives {
            cache_everything: cache.cacheability,
            ttl_ok: cache.ttl.ok,
            ttl_client_error: cache.ttl.client_error,
            ttl_server_error: cache.ttl.server_error,
            cache_tags: tags,
        }
    }

    /// Single batched header update on the success path.
    fn decorate(
        &self,
        mut payload: HttpPayload,
        options: &TransformOptions,
        directives: &FetchDirectives,
        client_hints_used: bool,
    ) -> HttpPayload {
        let mut updates: Vec<(HeaderName, HeaderValue)> = Vec::new();
        let mut push = |name: &'static str, value: String| {
            if let Ok(value) = HeaderValue::from_str(&value) {
                updates.push((HeaderName::from_static(name), value));
            }
        };

        if let Some(w) = options.width {
            push("x-image-width", w.to_string());
        }
        if let Some(h) = options.height {
            push("x-image-height", h.to_string());
        }
        if let Some(f) = options.format {
            push("x-image-format", f.as_str().to_string());
        }
        if let Some(q) = options.quality {
            push("x-image-quality", q.to_string());
        }
        if let Some(d) = &options.derivative {
            push("x-image-derivative", d.clone());
        }
        if directives.cache_everything {
            push(
                "cache-control",
                format!("public, max-age={}", directives.ttl_ok),
            );
        }
        if client_hints_used {
            push(
                "accept-ch",
                "Sec-CH-DPR, Sec-CH-Viewport-Width, Save-Data".to_string(),
            );
        }

        for (name, value) in updates {
            payload.headers.insert(name, value);
        }
        payload
    }
}
