pub mod auth;
pub mod r2;

pub use r2::{
    ByteRange, Conditional, GetOptions, MemoryObjectStore, ObjectMeta, ObjectStore, StoreGet,
};

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

use crate::config::{GatewayConfig, OriginAuth, PathOriginRule, SourceKind};
use crate::resilience::{with_resilience, CircuitBreaker, FailureLog};
use crate::GatewayError;

/// Where a storage result ultimately came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    R2,
    Remote,
    Fallback,
    Error,
}

impl From<SourceKind> for SourceOrigin {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::R2 => SourceOrigin::R2,
            SourceKind::Remote => SourceOrigin::Remote,
            SourceKind::Fallback => SourceOrigin::Fallback,
        }
    }
}

impl SourceOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceOrigin::R2 => "r2",
            SourceOrigin::Remote => "remote",
            SourceOrigin::Fallback => "fallback",
            SourceOrigin::Error => "error",
        }
    }
}

/// A buffered HTTP payload. The body is `Bytes`, so cloning is cheap and
/// downstream consumers may read it more than once.
#[derive(Debug, Clone)]
pub struct HttpPayload {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpPayload {
    pub fn into_response(self) -> axum::response::Response {
        let mut response = axum::response::Response::new(axum::body::Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Result of a successful origin fetch
#[derive(Debug, Clone)]
pub struct StorageResult {
    pub payload: HttpPayload,
    pub source: SourceOrigin,
    pub content_type: Option<String>,
    pub size: u64,
    pub path: String,
    pub original_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub metadata: BTreeMap<String, String>,
}

impl StorageResult {
    /// Content type with the documented default for origins that omit it.
    pub fn content_type(&self) -> &str {
        self.content_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

/// Per-origin fetch outcome: a miss moves on to the next source without
/// being an error.
#[derive(Debug)]
pub enum Fetched {
    Found(StorageResult),
    Miss,
}

/// Map an underlying error message to the gateway taxonomy.
///
/// Substring matching is deliberate and kept in this one place; a typed
/// origin client can replace it wholesale.
pub fn classify_error(message: &str, source: SourceKind) -> GatewayError {
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("404") {
        GatewayError::NotFound(message.to_string())
    } else if lower.contains("timeout") || lower.contains("timed out") {
        GatewayError::Timeout(format!("{}: {}", source, message))
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("authentication")
    {
        GatewayError::AuthError(format!("{}: {}", source, message))
    } else {
        GatewayError::OriginError(format!("{}: {}", source, message))
    }
}

/// Multi-origin storage resolver.
///
/// Owns the per-source circuit breakers and the adaptive failure log for
/// the process lifetime; requests borrow it through the orchestrator.
pub struct StorageResolver {
    config: Arc<GatewayConfig>,
    client: reqwest::Client,
    object_store: Option<Arc<dyn ObjectStore>>,
    breakers: HashMap<SourceKind, CircuitBreaker>,
    failure_log: FailureLog,
}

impl StorageResolver {
    pub fn new(config: Arc<GatewayConfig>, object_store: Option<Arc<dyn ObjectStore>>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(config.storage.fetch_options.user_agent.clone())
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let breaker_settings = config.breaker_settings();
        let mut breakers = HashMap::new();
        for kind in [SourceKind::R2, SourceKind::Remote, SourceKind::Fallback] {
            breakers.insert(kind, CircuitBreaker::new(kind.as_str(), breaker_settings));
        }

        Self {
            config,
            client,
            object_store,
            breakers,
            failure_log: FailureLog::default(),
        }
    }

    pub fn failure_log(&self) -> &FailureLog {
        &self.failure_log
    }

    pub fn breaker(&self, source: SourceKind) -> &CircuitBreaker {
        &self.breakers[&source]
    }

    /// Fetch `path` from the first healthy origin in effective priority
    /// order. Every candidate exhausting is `AllSourcesFailed`.
    pub async fn fetch_image(
        &self,
        path: &str,
        request_headers: &HeaderMap,
    ) -> Result<StorageResult, GatewayError> {
        let (priority, rule) = self.effective_priority(path);
        tracing::debug!(path, ?priority, "resolved origin priority");

        for source in priority {
            match self.fetch_from(source, path, request_headers, rule).await {
                Ok(Fetched::Found(result)) => {
                    tracing::info!(path, source = %source, status = %result.payload.status, "origin hit");
                    return Ok(result);
                }
                Ok(Fetched::Miss) => {
                    tracing::debug!(path, source = %source, "origin miss");
                }
                Err(err) => {
                    tracing::warn!(path, source = %source, error = %err, "origin failed");
                }
            }
        }

        Err(GatewayError::AllSourcesFailed(path.to_string()))
    }

    /// Effective priority: path rules first, then prerequisite and
    /// health filtering. An empty filtered list falls back to the
    /// unfiltered rule-or-default priority.
    pub fn effective_priority(&self, path: &str) -> (Vec<SourceKind>, Option<&PathOriginRule>) {
        let rule = self
            .config
            .storage
            .path_based_origins
            .values()
            .find(|rule| rule.matches(path));

        let base: Vec<SourceKind> = rule
            .map(|r| r.priority.clone())
            .unwrap_or_else(|| self.config.storage.priority.clone());

        let filtered: Vec<SourceKind> = base
            .iter()
            .copied()
            .filter(|source| self.prerequisites_met(*source, rule))
            .filter(|source| {
                if !self.breakers[source].try_acquire() {
                    tracing::debug!(source = %source, "skipped: circuit open");
                    return false;
                }
                if self.failure_log.is_avoided(*source) {
                    tracing::debug!(source = %source, "skipped: adaptive avoidance");
                    return false;
                }
                true
            })
            .collect();

        if filtered.is_empty() {
            tracing::warn!(path, "all candidates filtered out; using unfiltered priority");
            (base, rule)
        } else {
            (filtered, rule)
        }
    }

    fn prerequisites_met(&self, source: SourceKind, rule: Option<&PathOriginRule>) -> bool {
        match source {
            SourceKind::R2 => self.config.storage.r2.enabled && self.object_store.is_some(),
            SourceKind::Remote => self.remote_url(rule).is_some(),
            SourceKind::Fallback => self.fallback_url(rule).is_some(),
        }
    }

    fn remote_url<'a>(&'a self, rule: Option<&'a PathOriginRule>) -> Option<&'a str> {
        rule.and_then(|r| r.remote_url.as_deref())
            .or(self.config.storage.remote_url.as_deref())
    }

    fn fallback_url<'a>(&'a self, rule: Option<&'a PathOriginRule>) -> Option<&'a str> {
        rule.and_then(|r| r.fallback_url.as_deref())
            .or(self.config.storage.fallback_url.as_deref())
    }

    /// Apply at most one path-segment transformation for this source.
    pub fn transform_path(
        &self,
        path: &str,
        source: SourceKind,
        rule: Option<&PathOriginRule>,
    ) -> String {
        let transforms = rule
            .filter(|r| !r.path_transforms.is_empty())
            .map(|r| &r.path_transforms)
            .unwrap_or(&self.config.storage.path_transforms);
        if transforms.is_empty() {
            return path.to_string();
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (index, segment) in segments.iter().enumerate() {
            let Some(transform) = transforms.get(*segment) else {
                continue;
            };
            let Some(entry) = transform.for_source(source) else {
                continue;
            };
            if !entry.remove_prefix {
                continue;
            }

            let mut rebuilt: Vec<&str> = Vec::new();
            let prefix = entry.prefix.trim_matches('/');
            if !prefix.is_empty() {
                rebuilt.extend(prefix.split('/'));
            }
            rebuilt.extend(segments[..index].iter().copied());
            rebuilt.extend(segments[index + 1..].iter().copied());
            return format!("/{}", rebuilt.join("/"));
        }

        path.to_string()
    }

    async fn fetch_from(
        &self,
        source: SourceKind,
        path: &str,
        request_headers: &HeaderMap,
        rule: Option<&PathOriginRule>,
    ) -> Result<Fetched, GatewayError> {
        let transformed = self.transform_path(path, source, rule);
        match source {
            SourceKind::R2 => self.fetch_r2(&transformed, request_headers).await,
            SourceKind::Remote => {
                let Some(base) = self.remote_url(rule) else {
                    return Ok(Fetched::Miss);
                };
                let auth = rule
                    .and_then(|r| r.remote_auth.as_ref())
                    .or(self.config.storage.remote_auth.as_ref());
                self.fetch_http(source, base, &transformed, auth).await
            }
            SourceKind::Fallback => {
                let Some(base) = self.fallback_url(rule) else {
                    return Ok(Fetched::Miss);
                };
                let auth = rule
                    .and_then(|r| r.fallback_auth.as_ref())
                    .or(self.config.storage.fallback_auth.as_ref());
                self.fetch_http(source, base, &transformed, auth).await
            }
        }
    }

    async fn fetch_r2(
        &self,
        path: &str,
        request_headers: &HeaderMap,
    ) -> Result<Fetched, GatewayError> {
        let Some(store) = self.object_store.as_ref() else {
            return Ok(Fetched::Miss);
        };
        let key = path.trim_start_matches('/').to_string();
        let opts = GetOptions {
            only_if: conditional_from_headers(request_headers),
            range: range_from_headers(request_headers),
        };

        let retry = self.config.retry_settings();
        let breaker = &self.breakers[&SourceKind::R2];
        let log = &self.failure_log;
        let outcome = with_resilience("r2", &retry, breaker, |_attempt| {
            let store = Arc::clone(store);
            let key = key.clone();
            let opts = opts.clone();
            async move {
                store.get(&key, &opts).await.map_err(|e| {
                    log.record(SourceKind::R2, e.code());
                    e
                })
            }
        })
        .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            // A classified not-found is a miss, not a source failure.
            Err(GatewayError::NotFound(_)) => return Ok(Fetched::Miss),
            Err(err) => return Err(err),
        };

        let ttl = self.config.cache.ttl.r2_headers;
        match outcome {
            StoreGet::Missing => Ok(Fetched::Miss),
            StoreGet::Unmodified(meta) => {
                let mut headers = HeaderMap::new();
                if let Ok(etag) = HeaderValue::from_str(&meta.etag) {
                    headers.insert(header::ETAG, etag);
                }
                set_cache_headers(&mut headers, ttl);
                Ok(Fetched::Found(StorageResult {
                    payload: HttpPayload {
                        status: StatusCode::NOT_MODIFIED,
                        headers,
                        body: Bytes::new(),
                    },
                    source: SourceOrigin::R2,
                    content_type: None,
                    size: 0,
                    path: path.to_string(),
                    original_url: None,
                    width: None,
                    height: None,
                    metadata: BTreeMap::new(),
                }))
            }
            StoreGet::Body(meta, body) => {
                let mut headers = HeaderMap::new();
                if let Some(ct) = meta.content_type.as_deref() {
                    if let Ok(value) = HeaderValue::from_str(ct) {
                        headers.insert(header::CONTENT_TYPE, value);
                    }
                }
                for (name, value) in &meta.http_metadata {
                    if let (Ok(name), Ok(value)) = (
                        header::HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(value),
                    ) {
                        headers.insert(name, value);
                    }
                }
                if let Ok(etag) = HeaderValue::from_str(&meta.etag) {
                    headers.insert(header::ETAG, etag);
                }
                set_cache_headers(&mut headers, ttl);
                headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

                let status = match opts.range {
                    Some(range) => {
                        let start = range.offset;
                        let end = start + body.len() as u64 - 1;
                        let content_range = format!("bytes {}-{}/{}", start, end, meta.size);
                        if let Ok(value) = HeaderValue::from_str(&content_range) {
                            headers.insert(header::CONTENT_RANGE, value);
                        }
                        StatusCode::PARTIAL_CONTENT
                    }
                    None => StatusCode::OK,
                };
                headers.insert(
                    header::CONTENT_LENGTH,
                    HeaderValue::from_str(&body.len().to_string()).unwrap(),
                );

                Ok(Fetched::Found(StorageResult {
                    payload: HttpPayload {
                        status,
                        headers,
                        body,
                    },
                    source: SourceOrigin::R2,
                    content_type: meta.content_type.clone(),
                    size: meta.size,
                    path: path.to_string(),
                    original_url: None,
                    width: None,
                    height: None,
                    metadata: meta.http_metadata.clone(),
                }))
            }
        }
    }

    async fn fetch_http(
        &self,
        source: SourceKind,
        base_url: &str,
        path: &str,
        auth: Option<&OriginAuth>,
    ) -> Result<Fetched, GatewayError> {
        let mut url = join_url(base_url, path);
        let mut headers = HeaderMap::new();
        // If an origin URL ever points back at this gateway, the marker
        // trips the subrequest guard instead of recursing.
        headers.insert(
            header::HeaderName::from_static(crate::PROCESSED_MARKER),
            HeaderValue::from_static("1"),
        );
        for (name, value) in &self.config.storage.fetch_options.headers {
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if let Some(auth) = auth {
            if let Err(err) = auth::apply_auth(
                &mut url,
                &mut headers,
                auth,
                self.config.storage.security_mode,
            ) {
                self.failure_log.record(source, err.code());
                return Err(err);
            }
        }

        let retry = self.config.retry_settings();
        let breaker = &self.breakers[&source];
        let client = &self.client;
        let log = &self.failure_log;
        let response = with_resilience(source.as_str(), &retry, breaker, |_attempt| {
            let url = url.clone();
            let headers = headers.clone();
            async move {
                let attempt = async {
                    let response = client
                        .get(&url)
                        .headers(headers)
                        .send()
                        .await
                        .map_err(|e| classify_error(&e.to_string(), source))?;

                    let status = response.status();
                    if status.is_server_error()
                        || status == StatusCode::UNAUTHORIZED
                        || status == StatusCode::FORBIDDEN
                    {
                        return Err(classify_error(
                            &format!("upstream status {}", status),
                            source,
                        ));
                    }
                    Ok(response)
                };
                attempt.await.map_err(|e: GatewayError| {
                    log.record(source, e.code());
                    e
                })
            }
        })
        .await;
        let response = match response {
            Ok(response) => response,
            Err(GatewayError::NotFound(_)) => return Ok(Fetched::Miss),
            Err(err) => return Err(err),
        };

        let status = response.status();
        if !status.is_success() {
            // Misses (404 and other client errors) move on to the next
            // source without counting as failures.
            return Ok(Fetched::Miss);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            headers.insert(name.clone(), value.clone());
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if let Some(parsed) = content_type.as_deref().and_then(|ct| ct.parse::<mime::Mime>().ok()) {
            if parsed.type_() != mime::IMAGE && parsed.type_() != mime::APPLICATION {
                tracing::warn!(url = %url, content_type = %parsed, "origin served a non-image payload");
            }
        }
        let declared_length = response.content_length();

        let body = response.bytes().await.map_err(|e| {
            let err = classify_error(&e.to_string(), source);
            self.failure_log.record(source, err.code());
            err
        })?;
        let size = declared_length.unwrap_or(body.len() as u64);

        Ok(Fetched::Found(StorageResult {
            payload: HttpPayload {
                status,
                headers,
                body,
            },
            source: source.into(),
            content_type,
            size,
            path: path.to_string(),
            original_url: Some(url),
            width: None,
            height: None,
            metadata: BTreeMap::new(),
        }))
    }
}

fn set_cache_headers(headers: &mut HeaderMap, ttl: u32) {
    let value = format!("public, max-age={}", ttl);
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(header::CACHE_CONTROL, value);
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Translate client conditional headers into object-store predicates.
fn conditional_from_headers(headers: &HeaderMap) -> Option<Conditional> {
    let etag = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let uploaded_after = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| OffsetDateTime::parse(s, &Rfc2822).ok());
    if etag.is_none() && uploaded_after.is_none() {
        return None;
    }
    Some(Conditional {
        etag_does_not_match: etag,
        uploaded_after,
    })
}

/// Parse a single `bytes=a-b` range. Multi-range and suffix forms are
/// passed through unhandled.
fn range_from_headers(headers: &HeaderMap) -> Option<ByteRange> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let ranges = raw.strip_prefix("bytes=")?;
    if ranges.contains(',') {
        return None;
    }
    let (start, end) = ranges.split_once('-')?;
    let offset = start.trim().parse::<u64>().ok()?;
    let length = match end.trim() {
        "" => None,
        end => {
            let end = end.parse::<u64>().ok()?;
            Some(end.checked_sub(offset)? + 1)
        }
    };
    Some(ByteRange { offset, length })
}
