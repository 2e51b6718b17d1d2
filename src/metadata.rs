use axum::http::{header, HeaderMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::DeviceClass;
use crate::config::GatewayConfig;
use crate::invoke::TransformHook;
use crate::options::{ContentKind, FocalPoint, Format, MetadataMode, TransformOptions};
use crate::storage::StorageResolver;
use crate::GatewayError;

/// Concurrent in-flight fetches before new callers bypass coalescing.
const COALESCE_CAPACITY: usize = 50;

/// Watchdog that force-evicts a stuck in-flight entry.
const COALESCE_WATCHDOG: Duration = Duration::from_secs(5);

/// Smallest origin body worth running the size heuristic on.
const SIZE_HEURISTIC_THRESHOLD: u64 = 50 * 1024;

/// Estimated-dimension floor below which the size heuristic is rejected.
const MIN_ESTIMATED_WIDTH: u32 = 800;
const MIN_ESTIMATED_HEIGHT: u32 = 600;

/// Dimensions reported when every discovery tier fails.
const FALLBACK_WIDTH: u32 = 1600;
const FALLBACK_HEIGHT: u32 = 900;

/// Megapixels per megabyte by format. A coarse estimator; swapping in a
/// better one is a one-table change.
const MEGAPIXELS_PER_MB: &[(&str, f64)] = &[("jpeg", 2.0), ("jpg", 2.0), ("png", 1.4)];
const MEGAPIXELS_PER_MB_DEFAULT: f64 = 1.8;

/// Device caps applied to reported dimensions during processing.
const DEVICE_MAX_WIDTH_MOBILE: u32 = 600;
const DEVICE_MAX_WIDTH_TABLET: u32 = 1200;
const DEVICE_MAX_WIDTH_DESKTOP: u32 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataOrigin {
    Direct,
    Exif,
    Headers,
    FileSize,
    Fallback,
    Error,
}

impl MetadataOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataOrigin::Direct => "direct",
            MetadataOrigin::Exif => "exif",
            MetadataOrigin::Headers => "headers",
            MetadataOrigin::FileSize => "file-size",
            MetadataOrigin::Fallback => "fallback",
            MetadataOrigin::Error => "error",
        }
    }
}

/// What the gateway knows about a source image, with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: Option<String>,
    pub confidence: Confidence,
    pub source: MetadataOrigin,
    pub original_payload: Option<Arc<Value>>,
}

impl ImageMetadata {
    fn fallback(source: MetadataOrigin) -> Self {
        Self {
            width: FALLBACK_WIDTH,
            height: FALLBACK_HEIGHT,
            format: None,
            confidence: Confidence::Low,
            source,
            original_payload: None,
        }
    }
}

/// Inputs to `process_metadata` beyond the metadata itself.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub focal_point: Option<FocalPoint>,
    pub content_type: Option<ContentKind>,
    pub device_type: Option<DeviceClass>,
    pub platform: Option<String>,
    pub allow_expansion: bool,
    pub width: Option<u32>,
    pub quality_factor: Option<f64>,
}

/// A computed crop satisfying a target aspect while maximizing the
/// preserved area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AspectCrop {
    pub width: u32,
    pub height: u32,
    pub hoffset: f64,
    pub voffset: f64,
    pub allow_expansion: bool,
}

/// Output of metadata processing
#[derive(Debug, Clone, PartialEq)]
pub struct TransformationResult {
    pub width: u32,
    pub height: u32,
    pub aspect_crop: Option<AspectCrop>,
    pub quality: Option<u8>,
    pub format: Option<String>,
}

type SharedFetch = Shared<BoxFuture<'static, ImageMetadata>>;

/// Metadata fetching service.
///
/// Idempotent and concurrency-safe: concurrent callers for the same
/// path share one in-flight fetch, and successful results live in a
/// process-lifetime cache.
pub struct MetadataService {
    config: Arc<GatewayConfig>,
    resolver: Arc<StorageResolver>,
    transformer: Arc<dyn TransformHook>,
    cache: Mutex<HashMap<String, ImageMetadata>>,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
}

impl MetadataService {
    pub fn new(
        config: Arc<GatewayConfig>,
        resolver: Arc<StorageResolver>,
        transformer: Arc<dyn TransformHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resolver,
            transformer,
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch metadata for `path`, coalescing concurrent callers.
    ///
    /// Never fails: every error path degrades to fallback dimensions
    /// with the provenance recorded.
    pub async fn fetch_metadata(self: &Arc<Self>, path: &str) -> ImageMetadata {
        let cache_key = format!("metadata:{}", path);
        if let Some(hit) = self.cache.lock().unwrap().get(&cache_key) {
            return hit.clone();
        }

        let shared = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(existing) = in_flight.get(&cache_key) {
                crate::METRICS
                    .metadata_coalesced
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Some(existing.clone())
            } else if in_flight.len() >= COALESCE_CAPACITY {
                tracing::warn!(path, "metadata coalescer at capacity; executing directly");
                None
            } else {
                let service = Arc::clone(self);
                let owned_path = path.to_string();
                let future = async move { service.discover_or_fallback(&owned_path).await }
                    .boxed()
                    .shared();
                in_flight.insert(cache_key.clone(), future.clone());

                let service = Arc::clone(self);
                let watchdog_key = cache_key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(COALESCE_WATCHDOG).await;
                    if service
                        .in_flight
                        .lock()
                        .unwrap()
                        .remove(&watchdog_key)
                        .is_some()
                    {
                        tracing::warn!(key = %watchdog_key, "metadata fetch watchdog evicted entry");
                    }
                });
                Some(future)
            }
        };

        let metadata = match shared {
            Some(future) => {
                let metadata = future.await;
                self.in_flight.lock().unwrap().remove(&cache_key);
                metadata
            }
            None => self.discover_or_fallback(path).await,
        };

        if metadata.source != MetadataOrigin::Error {
            self.cache
                .lock()
                .unwrap()
                .insert(cache_key, metadata.clone());
        }
        metadata
    }

    async fn discover_or_fallback(&self, path: &str) -> ImageMetadata {
        match self.discover(path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::error!(path, error = %err, "metadata discovery failed");
                ImageMetadata::fallback(MetadataOrigin::Error)
            }
        }
    }

    /// Walk the discovery tiers until one yields dimensions.
    async fn discover(&self, path: &str) -> Result<ImageMetadata, GatewayError> {
        let stored = self
            .resolver
            .fetch_image(path, &HeaderMap::new())
            .await?;
        let source_format = stored
            .content_type
            .as_deref()
            .and_then(|ct| ct.rsplit('/').next())
            .map(|s| s.to_string());

        // Tier 1: the transformer's describe endpoint.
        let mut describe = TransformOptions::default();
        describe.format = Some(Format::Json);
        if let Ok(response) = self
            .transformer
            .transform(path, &stored, &describe.to_transformer_record())
            .await
        {
            let is_json = response
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("json"))
                .unwrap_or(false);

            if is_json {
                if let Ok(payload) = serde_json::from_slice::<Value>(&response.body) {
                    if let Some((width, height)) = dims_from_describe(&payload) {
                        return Ok(ImageMetadata {
                            width,
                            height,
                            format: format_from_payload(&payload).or(source_format),
                            confidence: Confidence::High,
                            source: MetadataOrigin::Direct,
                            original_payload: Some(Arc::new(payload)),
                        });
                    }
                    if let Some((width, height)) = dims_from_nested(&payload) {
                        return Ok(ImageMetadata {
                            width,
                            height,
                            format: format_from_payload(&payload).or(source_format),
                            confidence: Confidence::Medium,
                            source: MetadataOrigin::Exif,
                            original_payload: Some(Arc::new(payload)),
                        });
                    }
                }
            } else if let Some((width, height)) = dims_from_headers(&response.headers) {
                // Tier 2: an image came back, but carrying dimension headers.
                return Ok(ImageMetadata {
                    width,
                    height,
                    format: source_format,
                    confidence: Confidence::High,
                    source: MetadataOrigin::Headers,
                    original_payload: None,
                });
            }
        }

        // Tier 3: alternate metadata parameter, EXIF-style extraction.
        let mut alternate = TransformOptions::default();
        alternate.format = Some(Format::Json);
        alternate.metadata = Some(MetadataMode::Keep);
        if let Ok(response) = self
            .transformer
            .transform(path, &stored, &alternate.to_transformer_record())
            .await
        {
            if let Ok(payload) = serde_json::from_slice::<Value>(&response.body) {
                if let Some((width, height)) = dims_from_describe(&payload)
                    .into_iter()
                    .chain(dims_from_nested(&payload))
                    .max_by_key(|(w, h)| (*w as u64) * (*h as u64))
                {
                    return Ok(ImageMetadata {
                        width,
                        height,
                        format: format_from_payload(&payload).or(source_format),
                        confidence: Confidence::High,
                        source: MetadataOrigin::Exif,
                        original_payload: Some(Arc::new(payload)),
                    });
                }
            } else if let Some((width, height)) = dims_from_headers(&response.headers) {
                return Ok(ImageMetadata {
                    width,
                    height,
                    format: source_format,
                    confidence: Confidence::High,
                    source: MetadataOrigin::Headers,
                    original_payload: None,
                });
            }
        }

        // Tier 4: file-size heuristic.
        if stored.size >= SIZE_HEURISTIC_THRESHOLD {
            if let Some((width, height)) =
                estimate_from_size(stored.size, source_format.as_deref())
            {
                return Ok(ImageMetadata {
                    width,
                    height,
                    format: source_format,
                    confidence: Confidence::Medium,
                    source: MetadataOrigin::FileSize,
                    original_payload: None,
                });
            }
        }

        // Tier 5: absolute fallback.
        tracing::debug!(path, "all metadata tiers exhausted; using fallback dimensions");
        let mut fallback = ImageMetadata::fallback(MetadataOrigin::Fallback);
        fallback.format = source_format;
        Ok(fallback)
    }

    /// Compute crop, dimensions and quality from metadata.
    ///
    /// Pure and deterministic: the same inputs always produce identical
    /// output.
    pub fn process_metadata(
        &self,
        metadata: &ImageMetadata,
        target_aspect: Option<(u32, u32)>,
        opts: &ProcessOptions,
    ) -> TransformationResult {
        let orig_w = metadata.width.max(1);
        let orig_h = metadata.height.max(1);
        let orig_ratio = orig_w as f64 / orig_h as f64;

        let target = target_aspect.or_else(|| {
            opts.platform
                .as_deref()
                .and_then(platform_aspect)
        });
        let tgt_ratio = target
            .map(|(aw, ah)| aw as f64 / ah as f64)
            .unwrap_or(orig_ratio);

        let aspect_crop = if (orig_ratio - tgt_ratio).abs() <= 0.01 {
            None
        } else if opts.allow_expansion {
            let (hoffset, voffset) = focal_offsets(orig_ratio, opts);
            Some(AspectCrop {
                width: orig_w,
                height: orig_h,
                hoffset,
                voffset,
                allow_expansion: true,
            })
        } else {
            let (new_w, new_h) = if let Some(width) = opts.width.filter(|w| *w > 0) {
                (width, (width as f64 / tgt_ratio).round().max(1.0) as u32)
            } else if orig_ratio > tgt_ratio {
                // Too wide: keep full height.
                ((orig_h as f64 * tgt_ratio).round().max(1.0) as u32, orig_h)
            } else {
                // Too tall: keep full width.
                (orig_w, (orig_w as f64 / tgt_ratio).round().max(1.0) as u32)
            };
            let (hoffset, voffset) = focal_offsets(orig_ratio, opts);
            Some(AspectCrop {
                width: new_w,
                height: new_h,
                hoffset,
                voffset,
                allow_expansion: false,
            })
        };

        let (mut out_w, mut out_h) = (orig_w, orig_h);
        if let Some(max_width) = opts.device_type.map(device_max_width) {
            if out_w > max_width {
                let scale = max_width as f64 / out_w as f64;
                out_w = max_width;
                out_h = ((out_h as f64) * scale).round().max(1.0) as u32;
            }
        }

        let base_quality: f64 = if (orig_w as u64) * (orig_h as u64) > 1_000_000 {
            80.0
        } else {
            85.0
        };
        let quality = match opts.quality_factor {
            Some(factor) => (base_quality * factor).round().clamp(1.0, 100.0) as u8,
            None => base_quality as u8,
        };

        TransformationResult {
            width: out_w,
            height: out_h,
            aspect_crop,
            quality: Some(quality),
            format: metadata.format.clone(),
        }
    }

    /// Fetch then process in one call.
    pub async fn fetch_and_process(
        self: &Arc<Self>,
        path: &str,
        target_aspect: Option<(u32, u32)>,
        opts: &ProcessOptions,
    ) -> (ImageMetadata, TransformationResult) {
        let metadata = self.fetch_metadata(path).await;
        let result = self.process_metadata(&metadata, target_aspect, opts);
        (metadata, result)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

/// Fixed platform aspect table
fn platform_aspect(platform: &str) -> Option<(u32, u32)> {
    match platform.to_lowercase().as_str() {
        "twitter" => Some((16, 9)),
        "instagram" => Some((1, 1)),
        "instagram_portrait" => Some((4, 5)),
        "instagram_story" => Some((9, 16)),
        "pinterest" => Some((2, 3)),
        "linkedin" => Some((191, 100)),
        "facebook" => Some((191, 100)),
        _ => None,
    }
}

/// Focal offsets: explicit focal point wins, then the content-type
/// table, then a guess from the original ratio alone.
fn focal_offsets(orig_ratio: f64, opts: &ProcessOptions) -> (f64, f64) {
    if let Some(fp) = opts.focal_point {
        return (fp.x, fp.y);
    }
    match opts.content_type {
        Some(ContentKind::Portrait) => (0.5, 0.33),
        Some(ContentKind::Landscape) => (0.4, 0.4),
        Some(ContentKind::Product) | Some(ContentKind::Banner) => (0.5, 0.5),
        Some(ContentKind::Profile) => (0.5, 0.25),
        None => {
            if orig_ratio < 0.95 {
                (0.5, 0.33)
            } else if orig_ratio > 1.05 {
                (0.4, 0.4)
            } else {
                (0.5, 0.5)
            }
        }
    }
}

fn device_max_width(device: DeviceClass) -> u32 {
    match device {
        DeviceClass::Mobile => DEVICE_MAX_WIDTH_MOBILE,
        DeviceClass::Tablet => DEVICE_MAX_WIDTH_TABLET,
        DeviceClass::Desktop => DEVICE_MAX_WIDTH_DESKTOP,
    }
}

/// `original.{width,height}` from the describe payload.
fn dims_from_describe(payload: &Value) -> Option<(u32, u32)> {
    let original = payload.get("original")?;
    let width = original.get("width")?.as_u64()? as u32;
    let height = original.get("height")?.as_u64()? as u32;
    (width > 0 && height > 0).then_some((width, height))
}

/// EXIF subfields and nested dimension objects. The largest reported
/// pair wins, which can prefer a stale EXIF value over a true origin
/// value in edge cases; that trade-off is deliberate to avoid selecting
/// thumbnail variants.
fn dims_from_nested(payload: &Value) -> Option<(u32, u32)> {
    let mut candidates: Vec<(u32, u32)> = Vec::new();

    let pairs: &[(&str, &str)] = &[
        ("width", "height"),
        ("ExifImageWidth", "ExifImageHeight"),
        ("PixelXDimension", "PixelYDimension"),
        ("ImageWidth", "ImageHeight"),
    ];
    for (wk, hk) in pairs {
        if let (Some(w), Some(h)) = (
            payload.get(*wk).and_then(value_as_dim),
            payload.get(*hk).and_then(value_as_dim),
        ) {
            candidates.push((w, h));
        }
    }
    for container in ["exif", "dimensions", "size", "image"] {
        if let Some(nested) = payload.get(container) {
            if let (Some(w), Some(h)) = (
                nested.get("width").and_then(value_as_dim),
                nested.get("height").and_then(value_as_dim),
            ) {
                candidates.push((w, h));
            }
            for (wk, hk) in pairs {
                if let (Some(w), Some(h)) = (
                    nested.get(*wk).and_then(value_as_dim),
                    nested.get(*hk).and_then(value_as_dim),
                ) {
                    candidates.push((w, h));
                }
            }
        }
    }

    candidates
        .into_iter()
        .filter(|(w, h)| *w > 0 && *h > 0)
        .max_by_key(|(w, h)| (*w as u64) * (*h as u64))
}

fn value_as_dim(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as u32),
        Value::String(s) => s.parse::<u32>().ok(),
        _ => None,
    }
}

fn format_from_payload(payload: &Value) -> Option<String> {
    payload
        .get("original")
        .and_then(|o| o.get("format"))
        .or_else(|| payload.get("format"))
        .and_then(|v| v.as_str())
        .map(|s| s.rsplit('/').next().unwrap_or(s).to_string())
}

/// `x-image-width`/`x-image-height` and variants on an image response.
fn dims_from_headers(headers: &HeaderMap) -> Option<(u32, u32)> {
    let get = |names: &[&str]| {
        names.iter().find_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u32>().ok())
        })
    };
    let width = get(&["x-image-width", "x-original-width", "x-amz-meta-width"])?;
    let height = get(&["x-image-height", "x-original-height", "x-amz-meta-height"])?;
    (width > 0 && height > 0).then_some((width, height))
}

/// Megapixel estimate from the origin body size, assuming 16:9.
fn estimate_from_size(size: u64, format: Option<&str>) -> Option<(u32, u32)> {
    let rate = format
        .and_then(|f| {
            MEGAPIXELS_PER_MB
                .iter()
                .find(|(name, _)| f.eq_ignore_ascii_case(name))
                .map(|(_, rate)| *rate)
        })
        .unwrap_or(MEGAPIXELS_PER_MB_DEFAULT);

    let megapixels = (size as f64 / (1024.0 * 1024.0)) * rate;
    let aspect = 16.0 / 9.0;
    let width = (megapixels * 1_000_000.0 * aspect).sqrt().round() as u32;
    let height = (width as f64 / aspect).round() as u32;

    (width >= MIN_ESTIMATED_WIDTH && height >= MIN_ESTIMATED_HEIGHT).then_some((width, height))
}
