//! The deterministic option-merge pipeline. Stages execute in a fixed
//! order, each refining the evolving option record.

use axum::http::HeaderMap;
use std::sync::Arc;

use crate::client::{ClientDetector, NetworkQuality};
use crate::config::{GatewayConfig, METADATA_DERIVATIVES};
use crate::metadata::{MetadataService, ProcessOptions};
use crate::options::{conditions, Fit, Format, Gravity, GravityPosition, TransformOptions};
use crate::options::ContentKind;
use crate::storage::StorageResult;

pub use crate::PROCESSED_MARKER;

/// Output of one pipeline run
#[derive(Debug, Clone)]
pub struct BuiltOptions {
    pub options: TransformOptions,
    pub warnings: Vec<String>,
    pub client_hints_used: bool,
}

/// True when this request already went through the pipeline once:
/// either the via chain names image resizing or the processed marker is
/// present. Such requests pass through untransformed.
pub fn is_subrequest(headers: &HeaderMap) -> bool {
    let via_hit = headers
        .get("via")
        .and_then(|v| v.to_str().ok())
        .map(|via| via.to_lowercase().contains("image-resizing"))
        .unwrap_or(false);
    via_hit || headers.contains_key(PROCESSED_MARKER)
}

pub struct OptionBuilder {
    config: Arc<GatewayConfig>,
    metadata: Arc<MetadataService>,
}

impl OptionBuilder {
    pub fn new(config: Arc<GatewayConfig>, metadata: Arc<MetadataService>) -> Self {
        Self { config, metadata }
    }

    /// Run the full merge pipeline for one request. The subrequest
    /// guard is the orchestrator's stage; everything after it happens
    /// here, in order.
    pub async fn build(
        &self,
        detector: &ClientDetector,
        host: &str,
        path: &str,
        headers: &HeaderMap,
        url_options: TransformOptions,
        storage: &StorageResult,
    ) -> BuiltOptions {
        let mut opts = url_options;
        let mut warnings = Vec::new();

        // Empty options expand to a fully automatic rendition.
        if opts.is_empty() {
            opts.auto_width = true;
            opts.auto_height = true;
            opts.auto_quality = true;
            opts.format = Some(Format::Auto);
        }

        // Metadata gate and processing.
        let template = opts
            .derivative
            .as_deref()
            .and_then(|name| self.config.derivative(name));
        if self.needs_metadata(&opts) {
            self.apply_metadata(&mut opts, template.as_ref(), path).await;
        }

        // Smart content specialization.
        match opts.content {
            Some(ContentKind::Portrait) => {
                opts.gravity = Some(Gravity::Named(GravityPosition::Face));
            }
            Some(ContentKind::Product) if opts.focal.is_none() => {
                opts.gravity = Some(Gravity::center());
            }
            _ => {}
        }

        // Derivative template merge: URL options override the template.
        if let Some(name) = opts.derivative.clone() {
            match template {
                Some(template) => opts.merge_under(&template),
                None => {
                    warnings.push(format!("unknown derivative '{}'", name));
                    tracing::warn!(derivative = %name, "derivative not configured; ignoring");
                }
            }
        }

        // Auto markers already live as flags; an auto quality clears any
        // template-supplied value so resolution below decides it.
        if opts.auto_quality {
            opts.quality = None;
        }

        // Client optimization. Idempotent; detector errors fall through
        // to the untouched options.
        opts = detector.optimized_options(host, path, headers, &opts);
        let info = detector.detect(host, path, headers);
        let client_hints_used =
            info.viewport_width.is_some() || info.dpr.is_some() || info.save_data;

        // Responsive width for anything still auto.
        if opts.width.is_none() {
            opts.width = Some(self.responsive_width(detector, host, path, headers));
        }

        // Format resolution.
        if opts.format.is_none() || opts.format == Some(Format::Auto) {
            opts.format = Some(self.resolve_format(detector, host, path, headers, &opts, storage));
        }

        // Quality resolution.
        if opts.quality.is_none() {
            opts.quality = Some(self.resolve_quality(&opts, &info.network, info.save_data));
        }

        // Configured defaults for fit and metadata handling. An aspect
        // keeps fit open for the postcondition below.
        if opts.fit.is_none() && opts.aspect.is_none() {
            opts.fit = Some(self.config.responsive.fit);
        }
        if opts.metadata.is_none() {
            opts.metadata = Some(self.config.responsive.metadata);
        }

        // Conditional rules against source properties.
        warnings.extend(conditions::apply_conditions(&mut opts, storage));

        // Sanitize, validate, and settle the aspect arithmetic.
        warnings.extend(opts.sanitize());
        warnings.extend(opts.validate());
        opts.apply_aspect_postcondition();

        opts.auto_width = false;
        opts.auto_height = false;
        opts.auto_quality = false;

        for warning in &warnings {
            tracing::debug!(warning = %warning, "option pipeline warning");
        }

        BuiltOptions {
            options: opts,
            warnings,
            client_hints_used,
        }
    }

    /// Metadata is needed for smart mode, underdetermined aspect or
    /// focal handling, expansion containers, and the dimension-aware
    /// derivatives.
    fn needs_metadata(&self, opts: &TransformOptions) -> bool {
        if opts.smart || opts.allow_expansion {
            return true;
        }
        let explicit_dim = opts.explicit_width || opts.explicit_height;
        if opts.aspect.is_some() && !explicit_dim {
            return true;
        }
        if opts.focal.is_some() {
            let sufficient = (opts.explicit_width && opts.explicit_height)
                || (explicit_dim && opts.aspect.is_some());
            if !sufficient {
                return true;
            }
        }
        if let Some(derivative) = opts.derivative.as_deref() {
            if METADATA_DERIVATIVES.contains(&derivative) {
                return true;
            }
        }
        false
    }

    /// Fetch metadata and merge the computed crop into the options.
    ///
    /// The derivative template participates in the processing inputs
    /// (aspect, content, focal) even though its field merge happens a
    /// stage later.
    async fn apply_metadata(
        &self,
        opts: &mut TransformOptions,
        template: Option<&TransformOptions>,
        path: &str,
    ) {
        let mut view = opts.clone();
        if let Some(template) = template {
            view.merge_under(template);
        }

        let target_aspect = view.aspect.map(|a| (a.w, a.h));
        let process_opts = ProcessOptions {
            focal_point: view.focal,
            content_type: view.content,
            device_type: view.device,
            platform: view.platform.clone(),
            allow_expansion: view.allow_expansion,
            width: if opts.explicit_width { opts.width } else { None },
            quality_factor: None,
        };

        let (metadata, result) = self
            .metadata
            .fetch_and_process(path, target_aspect, &process_opts)
            .await;
        tracing::debug!(
            path,
            width = metadata.width,
            height = metadata.height,
            source = metadata.source.as_str(),
            "metadata resolved"
        );

        let Some(crop) = result.aspect_crop else {
            return;
        };

        if crop.allow_expansion {
            // Container box: contains the original and has the target
            // aspect.
            let ratio = target_aspect
                .map(|(aw, ah)| aw as f64 / ah as f64)
                .unwrap_or(metadata.width.max(1) as f64 / metadata.height.max(1) as f64);
            let container_w = opts.width.unwrap_or(0).max(metadata.width);
            let container_h = (container_w as f64 / ratio).ceil() as u32;
            opts.width = Some(container_w);
            opts.height = Some(container_h);
            opts.fit = Some(Fit::Pad);
            if opts.background.is_none() {
                opts.background = Some("transparent".to_string());
            }
            if opts.gravity.is_none() && view.gravity.is_none() {
                opts.gravity = Some(Gravity::Coord {
                    x: crop.hoffset,
                    y: crop.voffset,
                });
            }
        } else {
            opts.width = Some(crop.width);
            opts.height = Some(crop.height);
            opts.fit = Some(Fit::Crop);
            if opts.gravity.is_none() && view.gravity.is_none() {
                opts.gravity = Some(Gravity::Coord {
                    x: crop.hoffset,
                    y: crop.voffset,
                });
            }
        }
    }

    /// Width when everything upstream left it open: viewport-derived
    /// breakpoint, else device-class width, else 1200.
    fn responsive_width(
        &self,
        detector: &ClientDetector,
        host: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> u32 {
        let info = detector.detect(host, path, headers);
        if let Some(viewport) = info.viewport_width {
            let effective = (viewport as f64 * info.dpr.unwrap_or(1.0)).round() as u32;
            let breakpoints = &self.config.responsive.breakpoints;
            if let Some(bp) = breakpoints.iter().filter(|bp| **bp >= effective).min() {
                return *bp;
            }
            if let Some(bp) = breakpoints.iter().max() {
                return *bp;
            }
        }
        let device_width = detector.device_width(info.device);
        if device_width > 0 {
            device_width
        } else {
            1200
        }
    }

    /// Resolve `format=auto` through Save-Data, capability probes, UA
    /// heuristics and finally the source format.
    fn resolve_format(
        &self,
        detector: &ClientDetector,
        host: &str,
        path: &str,
        headers: &HeaderMap,
        opts: &TransformOptions,
        storage: &StorageResult,
    ) -> Format {
        let info = detector.detect(host, path, headers);

        if info.save_data {
            if info.accepts_avif {
                return Format::Avif;
            }
            if info.accepts_webp {
                return Format::Webp;
            }
        }

        let support = detector.supports_formats(host, path, headers, &["avif", "webp"]);
        if support.get("avif").copied().unwrap_or(false) {
            return Format::Avif;
        }
        if support.get("webp").copied().unwrap_or(false) {
            return Format::Webp;
        }

        // UA heuristic for clients that send no Accept detail.
        let ua = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if ua.contains("chrome/") || ua.contains("opera/") || ua.contains("edg/") {
            return Format::Webp;
        }

        // Source-format special cases. Only a caller-requested resize
        // counts as a dimension change; pipeline-derived widths do not.
        let dims_changed = opts.explicit_width || opts.explicit_height;
        match storage.content_type() {
            "image/svg+xml" => {
                if dims_changed {
                    return Format::Png;
                }
                return Format::Svg;
            }
            "image/gif" => {
                if dims_changed {
                    return Format::Png;
                }
                return Format::Gif;
            }
            _ => {}
        }

        Format::Jpeg
    }

    /// Per-format quality, discounted 15% on low-bandwidth clients.
    fn resolve_quality(
        &self,
        opts: &TransformOptions,
        network: &NetworkQuality,
        save_data: bool,
    ) -> u8 {
        let format = opts.format.unwrap_or(Format::Auto);
        let base = self.config.format_quality(format);
        let low_bandwidth = save_data || *network == NetworkQuality::Slow;
        if low_bandwidth {
            ((base as f64) * 0.85).round().clamp(1.0, 100.0) as u8
        } else {
            base
        }
    }
}
