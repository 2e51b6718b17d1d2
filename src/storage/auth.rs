use axum::http::{HeaderMap, HeaderName, HeaderValue};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::config::{OriginAuth, SecurityMode};
use crate::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of an empty payload; outbound origin requests carry no body.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Apply the configured authentication to an outbound origin request.
///
/// Mutates the URL (query-signed origins) or the header map (all other
/// kinds). With missing credentials the request fails unless the
/// security mode is permissive, in which case it proceeds unsigned.
pub fn apply_auth(
    url: &mut String,
    headers: &mut HeaderMap,
    auth: &OriginAuth,
    mode: SecurityMode,
) -> Result<(), GatewayError> {
    match auth {
        OriginAuth::AwsS3 {
            access_key_env,
            secret_key_env,
            region,
            service,
        } => {
            let access_key = std::env::var(access_key_env).ok();
            let secret_key = std::env::var(secret_key_env).ok();
            match (access_key, secret_key) {
                (Some(access_key), Some(secret_key)) => {
                    let signed = sign_aws_s3(url, region, service, &access_key, &secret_key)?;
                    // Only x-amz-* headers plus authorization cross over.
                    for (name, value) in signed {
                        if name.as_str().starts_with("x-amz-") || name == "authorization" {
                            headers.insert(name, value);
                        }
                    }
                    Ok(())
                }
                _ if mode == SecurityMode::Permissive => {
                    tracing::warn!(url = %url, "aws-s3 credentials missing; proceeding unsigned");
                    Ok(())
                }
                _ => Err(GatewayError::AuthError(format!(
                    "aws-s3 credentials missing ({}/{})",
                    access_key_env, secret_key_env
                ))),
            }
        }
        OriginAuth::Bearer { header, token } => {
            let token = if let Some(var) = token.strip_prefix('$') {
                std::env::var(var).map_err(|_| {
                    GatewayError::AuthError(format!("bearer token env var {} missing", var))
                })?
            } else {
                token.clone()
            };
            let value = if header.eq_ignore_ascii_case("authorization") {
                format!("Bearer {}", token)
            } else {
                token
            };
            let name = HeaderName::from_bytes(header.to_lowercase().as_bytes())
                .map_err(|e| GatewayError::AuthError(format!("invalid auth header name: {}", e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| GatewayError::AuthError(format!("invalid auth header value: {}", e)))?;
            headers.insert(name, value);
            Ok(())
        }
        OriginAuth::Header {
            headers: configured,
        } => {
            for (name, value) in configured {
                let name = HeaderName::from_bytes(name.to_lowercase().as_bytes()).map_err(|e| {
                    GatewayError::AuthError(format!("invalid auth header name: {}", e))
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| {
                    GatewayError::AuthError(format!("invalid auth header value: {}", e))
                })?;
                headers.insert(name, value);
            }
            Ok(())
        }
        OriginAuth::Query { token, ttl_secs } => {
            let expires = OffsetDateTime::now_utc().unix_timestamp() + ttl_secs;
            let separator = if url.contains('?') { '&' } else { '?' };
            url.push(separator);
            url.push_str(&format!("expires={}&token={}", expires, token));
            Ok(())
        }
    }
}

/// SigV4-style signature over an outbound GET. Returns the headers to
/// attach: `x-amz-date`, `x-amz-content-sha256` and `authorization`.
pub fn sign_aws_s3(
    url: &str,
    region: &str,
    service: &str,
    access_key: &str,
    secret_key: &str,
) -> Result<Vec<(HeaderName, HeaderValue)>, GatewayError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| GatewayError::AuthError(format!("unsignable url {}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GatewayError::AuthError(format!("url {} has no host", url)))?
        .to_string();
    let canonical_uri = if parsed.path().is_empty() {
        "/".to_string()
    } else {
        parsed.path().to_string()
    };

    let mut query_pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    query_pairs.sort();
    let canonical_query = query_pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let now = OffsetDateTime::now_utc();
    let amz_date = now
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .map_err(|e| GatewayError::AuthError(e.to_string()))?;
    let datestamp = now
        .format(format_description!("[year][month][day]"))
        .map_err(|e| GatewayError::AuthError(e.to_string()))?;

    let canonical_headers = format!(
        "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
        host, EMPTY_PAYLOAD_SHA256, amz_date
    );
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";

    let canonical_request = format!(
        "GET\n{}\n{}\n{}\n{}\n{}",
        canonical_uri, canonical_query, canonical_headers, signed_headers, EMPTY_PAYLOAD_SHA256
    );

    let scope = format!("{}/{}/{}/aws4_request", datestamp, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), datestamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        access_key, scope, signed_headers, signature
    );

    let mut out = Vec::new();
    out.push((
        HeaderName::from_static("x-amz-date"),
        HeaderValue::from_str(&amz_date).map_err(|e| GatewayError::AuthError(e.to_string()))?,
    ));
    out.push((
        HeaderName::from_static("x-amz-content-sha256"),
        HeaderValue::from_static(EMPTY_PAYLOAD_SHA256),
    ));
    out.push((
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&authorization)
            .map_err(|e| GatewayError::AuthError(e.to_string()))?,
    ));
    Ok(out)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
