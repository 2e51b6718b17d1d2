use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::routing::get;
use axum::Router;
use imagegate::config::{
    GatewayConfig, OriginAuth, PathOriginRule, PathTransformEntry, PathTransformRule, RetryConfig,
    SecurityMode, SourceKind,
};
use imagegate::resilience::BreakerState;
use imagegate::storage::{
    auth::apply_auth, classify_error, GetOptions, MemoryObjectStore, ObjectStore, SourceOrigin,
    StorageResolver, StoreGet,
};
use imagegate::GatewayError;
use std::collections::BTreeMap;
use std::sync::Arc;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 4,
    }
}

fn r2_config(store_enabled: bool) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.storage.r2.enabled = store_enabled;
    config.storage.retry = Some(fast_retry());
    config
}

async fn spawn_origin(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Object store that times out on every call.
struct TimeoutStore;

#[async_trait::async_trait]
impl ObjectStore for TimeoutStore {
    async fn get(&self, _key: &str, _opts: &GetOptions) -> Result<StoreGet, GatewayError> {
        Err(GatewayError::Timeout("r2 binding timed out".into()))
    }
}

#[test]
fn error_classification_by_substring() {
    let source = SourceKind::Remote;
    assert!(matches!(
        classify_error("object not found", source),
        GatewayError::NotFound(_)
    ));
    assert!(matches!(
        classify_error("status 404 from upstream", source),
        GatewayError::NotFound(_)
    ));
    assert!(matches!(
        classify_error("connection timed out", source),
        GatewayError::Timeout(_)
    ));
    assert!(matches!(
        classify_error("upstream status 403", source),
        GatewayError::AuthError(_)
    ));
    assert!(matches!(
        classify_error("authentication required", source),
        GatewayError::AuthError(_)
    ));
    assert!(matches!(
        classify_error("connection reset by peer", source),
        GatewayError::OriginError(_)
    ));
}

#[test]
fn path_rule_replaces_priority() {
    let mut config = r2_config(true);
    config.storage.remote_url = Some("https://origin.example.com".into());
    config.storage.path_based_origins.insert(
        "remote-first".into(),
        PathOriginRule {
            pattern: "/managed/".into(),
            regex: false,
            priority: vec![SourceKind::Remote, SourceKind::R2],
            remote_url: None,
            fallback_url: None,
            remote_auth: None,
            fallback_auth: None,
            path_transforms: BTreeMap::new(),
        },
    );
    let resolver = StorageResolver::new(Arc::new(config), Some(Arc::new(MemoryObjectStore::new())));

    let (priority, rule) = resolver.effective_priority("/managed/cat.jpg");
    assert!(rule.is_some());
    assert_eq!(priority, vec![SourceKind::Remote, SourceKind::R2]);

    let (priority, rule) = resolver.effective_priority("/other/cat.jpg");
    assert!(rule.is_none());
    // Fallback has no URL configured, so it is filtered out.
    assert_eq!(priority, vec![SourceKind::R2, SourceKind::Remote]);
}

#[test]
fn regex_path_rule_matches() {
    let mut config = r2_config(true);
    config.storage.path_based_origins.insert(
        "previews".into(),
        PathOriginRule {
            pattern: r"^/previews/\d+/".into(),
            regex: true,
            priority: vec![SourceKind::R2],
            remote_url: None,
            fallback_url: None,
            remote_auth: None,
            fallback_auth: None,
            path_transforms: BTreeMap::new(),
        },
    );
    let resolver = StorageResolver::new(Arc::new(config), Some(Arc::new(MemoryObjectStore::new())));

    assert!(resolver.effective_priority("/previews/42/cat.jpg").1.is_some());
    assert!(resolver.effective_priority("/previews/none/cat.jpg").1.is_none());
}

#[test]
fn unmet_prerequisites_remove_sources() {
    // R2 disabled and no URLs: filtering empties the list, which falls
    // back to the unfiltered default priority.
    let config = r2_config(false);
    let resolver = StorageResolver::new(Arc::new(config), None);
    let (priority, _) = resolver.effective_priority("/cat.jpg");
    assert_eq!(
        priority,
        vec![SourceKind::R2, SourceKind::Remote, SourceKind::Fallback]
    );
}

#[test]
fn avoided_source_is_skipped_in_priority() {
    let mut config = r2_config(true);
    config.storage.remote_url = Some("https://origin.example.com".into());
    let resolver = StorageResolver::new(Arc::new(config), Some(Arc::new(MemoryObjectStore::new())));

    for _ in 0..5 {
        resolver.failure_log().record(SourceKind::R2, "TIMEOUT");
    }
    let (priority, _) = resolver.effective_priority("/cat.jpg");
    assert_eq!(priority, vec![SourceKind::Remote]);
}

#[test]
fn path_transform_rewrites_matched_segment() {
    let mut config = r2_config(true);
    config.storage.path_transforms.insert(
        "assets".into(),
        PathTransformRule {
            generic: Some(PathTransformEntry {
                remove_prefix: true,
                prefix: "img/production".into(),
            }),
            ..Default::default()
        },
    );
    let resolver = StorageResolver::new(Arc::new(config), Some(Arc::new(MemoryObjectStore::new())));

    let rewritten = resolver.transform_path("/assets/cats/tabby.jpg", SourceKind::R2, None);
    assert_eq!(rewritten, "/img/production/cats/tabby.jpg");

    // Unmatched paths pass through untouched.
    let untouched = resolver.transform_path("/media/tabby.jpg", SourceKind::R2, None);
    assert_eq!(untouched, "/media/tabby.jpg");
}

#[test]
fn origin_specific_transform_wins_over_generic() {
    let mut config = r2_config(true);
    config.storage.path_transforms.insert(
        "assets".into(),
        PathTransformRule {
            generic: Some(PathTransformEntry {
                remove_prefix: true,
                prefix: "generic".into(),
            }),
            remote: Some(PathTransformEntry {
                remove_prefix: true,
                prefix: "remote-bucket".into(),
            }),
            ..Default::default()
        },
    );
    let resolver = StorageResolver::new(Arc::new(config), Some(Arc::new(MemoryObjectStore::new())));

    assert_eq!(
        resolver.transform_path("/assets/a.jpg", SourceKind::Remote, None),
        "/remote-bucket/a.jpg"
    );
    assert_eq!(
        resolver.transform_path("/assets/a.jpg", SourceKind::R2, None),
        "/generic/a.jpg"
    );
}

#[tokio::test]
async fn r2_hit_returns_body_and_cache_headers() {
    let store = Arc::new(MemoryObjectStore::new());
    store.put("cat.jpg", vec![7u8; 64], "image/jpeg");
    let resolver = StorageResolver::new(Arc::new(r2_config(true)), Some(store));

    let result = resolver
        .fetch_image("/cat.jpg", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(result.source, SourceOrigin::R2);
    assert_eq!(result.payload.status, StatusCode::OK);
    assert_eq!(result.size, 64);
    assert_eq!(result.content_type(), "image/jpeg");
    assert_eq!(
        result.payload.headers.get(header::CACHE_CONTROL).unwrap(),
        "public, max-age=86400"
    );
    assert_eq!(
        result.payload.headers.get(header::ACCEPT_RANGES).unwrap(),
        "bytes"
    );
}

#[tokio::test]
async fn conditional_get_round_trips_as_304() {
    let store = Arc::new(MemoryObjectStore::new());
    store.put("cat.jpg", vec![7u8; 64], "image/jpeg");
    let etag = store.etag_of("cat.jpg").unwrap();
    let resolver = StorageResolver::new(Arc::new(r2_config(true)), Some(store));

    let mut headers = HeaderMap::new();
    headers.insert(header::IF_NONE_MATCH, HeaderValue::from_str(&etag).unwrap());

    let result = resolver.fetch_image("/cat.jpg", &headers).await.unwrap();
    assert_eq!(result.payload.status, StatusCode::NOT_MODIFIED);
    assert_eq!(result.source, SourceOrigin::R2);
    assert!(result.payload.body.is_empty());
    assert_eq!(result.size, 0);
    assert!(result.content_type.is_none());
}

#[tokio::test]
async fn range_request_yields_partial_content() {
    let store = Arc::new(MemoryObjectStore::new());
    store.put("big.bin", (0..=255).cycle().take(1000).collect::<Vec<u8>>(), "image/jpeg");
    let resolver = StorageResolver::new(Arc::new(r2_config(true)), Some(store));

    let mut headers = HeaderMap::new();
    headers.insert(header::RANGE, HeaderValue::from_static("bytes=10-19"));

    let result = resolver.fetch_image("/big.bin", &headers).await.unwrap();
    assert_eq!(result.payload.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(result.payload.body.len(), 10);
    assert_eq!(
        result.payload.headers.get(header::CONTENT_RANGE).unwrap(),
        "bytes 10-19/1000"
    );
    assert_eq!(result.payload.body.as_ref(), &(10u8..20).collect::<Vec<u8>>()[..]);
}

#[tokio::test]
async fn failing_r2_falls_through_to_remote() {
    // Three timeout attempts against the store, then the remote origin
    // serves the image; the breaker stays closed below its threshold.
    let origin = spawn_origin(Router::new().route(
        "/cat.jpg",
        get(|| async {
            (
                [(header::CONTENT_TYPE, "image/jpeg")],
                vec![9u8; 32],
            )
        }),
    ))
    .await;

    let mut config = r2_config(true);
    config.storage.remote_url = Some(origin);
    let resolver = StorageResolver::new(Arc::new(config), Some(Arc::new(TimeoutStore)));

    let result = resolver
        .fetch_image("/cat.jpg", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(result.source, SourceOrigin::Remote);
    assert_eq!(result.payload.body.len(), 32);

    assert_eq!(resolver.failure_log().count_for(SourceKind::R2), 3);
    assert_eq!(
        resolver.failure_log().codes_for(SourceKind::R2),
        vec!["TIMEOUT"; 3]
    );
    assert_eq!(resolver.breaker(SourceKind::R2).state(), BreakerState::Closed);
    assert_eq!(resolver.failure_log().count_for(SourceKind::Remote), 0);
}

#[tokio::test]
async fn remote_miss_exhausts_into_all_sources_failed() {
    let origin = spawn_origin(Router::new()).await; // every path 404s

    let mut config = GatewayConfig::default();
    config.storage.priority = vec![SourceKind::Remote];
    config.storage.remote_url = Some(origin);
    config.storage.retry = Some(fast_retry());
    let resolver = StorageResolver::new(Arc::new(config), None);

    let err = resolver
        .fetch_image("/missing.jpg", &HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::AllSourcesFailed(_)));
    // A miss is not a failure: nothing lands in the adaptive log.
    assert_eq!(resolver.failure_log().count_for(SourceKind::Remote), 0);
}

#[tokio::test]
async fn remote_server_errors_are_retried_then_surfaced() {
    let origin = spawn_origin(Router::new().route(
        "/cat.jpg",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    ))
    .await;

    let mut config = GatewayConfig::default();
    config.storage.priority = vec![SourceKind::Remote];
    config.storage.remote_url = Some(origin);
    config.storage.retry = Some(fast_retry());
    let resolver = StorageResolver::new(Arc::new(config), None);

    let err = resolver
        .fetch_image("/cat.jpg", &HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::AllSourcesFailed(_)));
    assert_eq!(resolver.failure_log().count_for(SourceKind::Remote), 3);
}

#[test]
fn bearer_auth_sets_prefixed_authorization_header() {
    let mut url = "https://origin.example.com/cat.jpg".to_string();
    let mut headers = HeaderMap::new();
    let auth = OriginAuth::Bearer {
        header: "Authorization".into(),
        token: "sekrit".into(),
    };
    apply_auth(&mut url, &mut headers, &auth, SecurityMode::Strict).unwrap();
    assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer sekrit");
}

#[test]
fn bearer_auth_with_custom_header_is_raw() {
    let mut url = "https://origin.example.com/cat.jpg".to_string();
    let mut headers = HeaderMap::new();
    let auth = OriginAuth::Bearer {
        header: "X-Api-Key".into(),
        token: "sekrit".into(),
    };
    apply_auth(&mut url, &mut headers, &auth, SecurityMode::Strict).unwrap();
    assert_eq!(headers.get("x-api-key").unwrap(), "sekrit");
}

#[test]
fn header_auth_attaches_configured_headers_verbatim() {
    let mut url = "https://origin.example.com/cat.jpg".to_string();
    let mut headers = HeaderMap::new();
    let mut configured = BTreeMap::new();
    configured.insert("X-Custom-Auth".to_string(), "abc".to_string());
    configured.insert("X-Tenant".to_string(), "media".to_string());
    let auth = OriginAuth::Header {
        headers: configured,
    };
    apply_auth(&mut url, &mut headers, &auth, SecurityMode::Strict).unwrap();
    assert_eq!(headers.get("x-custom-auth").unwrap(), "abc");
    assert_eq!(headers.get("x-tenant").unwrap(), "media");
}

#[test]
fn query_auth_appends_expiry_and_token() {
    let mut url = "https://origin.example.com/cat.jpg".to_string();
    let mut headers = HeaderMap::new();
    let auth = OriginAuth::Query {
        token: "sekrit".into(),
        ttl_secs: 300,
    };
    apply_auth(&mut url, &mut headers, &auth, SecurityMode::Strict).unwrap();
    assert!(url.contains("?expires="));
    assert!(url.ends_with("&token=sekrit"));

    let expires: i64 = url
        .split("expires=")
        .nth(1)
        .unwrap()
        .split('&')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    assert!(expires > now && expires <= now + 301);
}

#[test]
fn aws_auth_without_credentials_fails_in_strict_mode() {
    let mut url = "https://bucket.s3.amazonaws.com/cat.jpg".to_string();
    let mut headers = HeaderMap::new();
    let auth = OriginAuth::AwsS3 {
        access_key_env: "IMAGEGATE_TEST_MISSING_AK".into(),
        secret_key_env: "IMAGEGATE_TEST_MISSING_SK".into(),
        region: "us-east-1".into(),
        service: "s3".into(),
    };
    let err = apply_auth(&mut url, &mut headers, &auth, SecurityMode::Strict).unwrap_err();
    assert!(matches!(err, GatewayError::AuthError(_)));

    // Permissive mode proceeds unsigned.
    apply_auth(&mut url, &mut headers, &auth, SecurityMode::Permissive).unwrap();
    assert!(headers.get(header::AUTHORIZATION).is_none());
}

#[test]
fn aws_signature_produces_expected_headers() {
    let signed = imagegate::storage::auth::sign_aws_s3(
        "https://bucket.s3.amazonaws.com/cats/tabby.jpg?versionId=3",
        "us-east-1",
        "s3",
        "AKIDEXAMPLE",
        "wJalrXUtnFEMI",
    )
    .unwrap();

    let names: Vec<&str> = signed.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec!["x-amz-date", "x-amz-content-sha256", "authorization"]
    );
    let authorization = signed
        .iter()
        .find(|(n, _)| n.as_str() == "authorization")
        .map(|(_, v)| v.to_str().unwrap().to_string())
        .unwrap();
    assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert!(authorization.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    assert!(authorization.contains("Signature="));
}
