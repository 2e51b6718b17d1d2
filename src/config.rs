use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::options::{AspectRatio, ContentKind, Fit, Format, Gravity, GravityPosition, MetadataMode, TransformOptions};

/// Origin kinds the resolver can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    R2,
    Remote,
    Fallback,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::R2 => "r2",
            SourceKind::Remote => "remote",
            SourceKind::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Behavior when signing credentials are missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    Strict,
    Permissive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct R2Config {
    pub enabled: bool,
    pub binding_name: String,
}

impl Default for R2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            binding_name: "IMAGES_BUCKET".into(),
        }
    }
}

fn default_auth_header() -> String {
    "Authorization".into()
}

fn default_access_key_env() -> String {
    "AWS_ACCESS_KEY_ID".into()
}

fn default_secret_key_env() -> String {
    "AWS_SECRET_ACCESS_KEY".into()
}

fn default_region() -> String {
    "us-east-1".into()
}

fn default_service() -> String {
    "s3".into()
}

fn default_signed_ttl() -> i64 {
    300
}

/// Per-origin outbound authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OriginAuth {
    /// Sign the outbound request SigV4-style with keys from the
    /// environment. Only `x-amz-*` headers plus `authorization` are
    /// copied onto the outbound request.
    AwsS3 {
        #[serde(default = "default_access_key_env")]
        access_key_env: String,
        #[serde(default = "default_secret_key_env")]
        secret_key_env: String,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default = "default_service")]
        service: String,
    },
    /// Token in a configurable header. A leading `$` names an
    /// environment variable; the canonical `Authorization` header gets a
    /// `Bearer ` prefix.
    Bearer {
        #[serde(default = "default_auth_header")]
        header: String,
        token: String,
    },
    /// Attach the configured headers verbatim.
    Header { headers: BTreeMap<String, String> },
    /// Append `expires=<unixNow+TTL>&token=<secret>` to the URL.
    Query {
        token: String,
        #[serde(default = "default_signed_ttl")]
        ttl_secs: i64,
    },
}

/// One path-segment rewrite: the matched segment is removed and `prefix`
/// is prepended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathTransformEntry {
    pub remove_prefix: bool,
    pub prefix: String,
}

/// Segment rewrite rules, optionally specialized per origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathTransformRule {
    pub generic: Option<PathTransformEntry>,
    pub r2: Option<PathTransformEntry>,
    pub remote: Option<PathTransformEntry>,
    pub fallback: Option<PathTransformEntry>,
}

impl PathTransformRule {
    /// Origin-specific sub-rule wins over the generic one.
    pub fn for_source(&self, source: SourceKind) -> Option<&PathTransformEntry> {
        let specific = match source {
            SourceKind::R2 => self.r2.as_ref(),
            SourceKind::Remote => self.remote.as_ref(),
            SourceKind::Fallback => self.fallback.as_ref(),
        };
        specific.or(self.generic.as_ref())
    }
}

/// A path-based origin override: when `pattern` matches the request
/// path, the rule's priority and per-origin settings replace the
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathOriginRule {
    pub pattern: String,
    /// Treat `pattern` as a regular expression rather than a literal
    /// substring.
    #[serde(default)]
    pub regex: bool,
    pub priority: Vec<SourceKind>,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub fallback_url: Option<String>,
    #[serde(default)]
    pub remote_auth: Option<OriginAuth>,
    #[serde(default)]
    pub fallback_auth: Option<OriginAuth>,
    #[serde(default)]
    pub path_transforms: BTreeMap<String, PathTransformRule>,
}

impl PathOriginRule {
    pub fn matches(&self, path: &str) -> bool {
        if self.regex {
            Regex::new(&self.pattern)
                .map(|re| re.is_match(path))
                .unwrap_or(false)
        } else {
            path.contains(&self.pattern)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("imagegate/{}", env!("CARGO_PKG_VERSION")),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub priority: Vec<SourceKind>,
    pub r2: R2Config,
    pub remote_url: Option<String>,
    pub fallback_url: Option<String>,
    pub remote_auth: Option<OriginAuth>,
    pub fallback_auth: Option<OriginAuth>,
    pub path_based_origins: BTreeMap<String, PathOriginRule>,
    pub path_transforms: BTreeMap<String, PathTransformRule>,
    pub fetch_options: FetchOptions,
    pub retry: Option<RetryConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub security_mode: SecurityMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            priority: vec![SourceKind::R2, SourceKind::Remote, SourceKind::Fallback],
            r2: R2Config::default(),
            remote_url: None,
            fallback_url: None,
            remote_auth: None,
            fallback_auth: None,
            path_based_origins: BTreeMap::new(),
            path_transforms: BTreeMap::new(),
            fetch_options: FetchOptions::default(),
            retry: None,
            circuit_breaker: None,
            security_mode: SecurityMode::Strict,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtl {
    pub ok: u32,
    pub client_error: u32,
    pub server_error: u32,
    pub r2_headers: u32,
    pub remote_fetch: u32,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            ok: 86_400,
            client_error: 60,
            server_error: 10,
            r2_headers: 86_400,
            remote_fetch: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTags {
    pub enabled: bool,
    pub prefix: String,
}

impl Default for CacheTags {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "img-".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub method: String,
    pub cacheability: bool,
    pub ttl: CacheTtl,
    pub cache_tags: CacheTags,
    pub bypass_params: Vec<String>,
    /// Fallbacks consulted when the storage section omits its own tuning.
    pub retry: Option<RetryConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            method: "cache-api".into(),
            cacheability: true,
            ttl: CacheTtl::default(),
            cache_tags: CacheTags::default(),
            bypass_params: vec!["nocache".into()],
            retry: None,
            circuit_breaker: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceWidths {
    pub mobile: u32,
    pub tablet: u32,
    pub desktop: u32,
}

impl Default for DeviceWidths {
    fn default() -> Self {
        Self {
            mobile: 480,
            tablet: 768,
            desktop: 1440,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDetection {
    pub mobile_regex: String,
    pub tablet_regex: String,
}

impl Default for DeviceDetection {
    fn default() -> Self {
        Self {
            mobile_regex: r"(?i)mobile|android|iphone|ipod|webos|blackberry".into(),
            tablet_regex: r"(?i)ipad|tablet|kindle|silk|playbook".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponsiveConfig {
    pub quality: u8,
    pub fit: Fit,
    pub format: Format,
    pub metadata: MetadataMode,
    pub breakpoints: Vec<u32>,
    pub device_widths: DeviceWidths,
    pub format_quality: BTreeMap<String, u8>,
    pub device_detection: DeviceDetection,
}

impl Default for ResponsiveConfig {
    fn default() -> Self {
        let mut format_quality = BTreeMap::new();
        format_quality.insert("webp".to_string(), 85u8);
        format_quality.insert("avif".to_string(), 80u8);
        format_quality.insert("jpeg".to_string(), 85u8);
        format_quality.insert("png".to_string(), 90u8);
        Self {
            quality: 85,
            fit: Fit::ScaleDown,
            format: Format::Auto,
            metadata: MetadataMode::None,
            breakpoints: vec![320, 640, 768, 960, 1024, 1440, 1920],
            device_widths: DeviceWidths::default(),
            format_quality,
            device_detection: DeviceDetection::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub optimized_client_detection: bool,
    pub optimized_caching: bool,
    pub performance_tracking: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub derivatives: BTreeMap<String, TransformOptions>,
    pub responsive: ResponsiveConfig,
    pub performance: PerformanceConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("storage.priority cannot be empty")]
    EmptyPriority,
    #[error("invalid pattern for path rule '{0}': {1}")]
    InvalidPattern(String, String),
    #[error("invalid device detection regex: {0}")]
    InvalidDeviceRegex(String),
    #[error("retry.max_attempts must be > 0")]
    InvalidRetry,
    #[error("quality for format '{0}' out of range")]
    InvalidFormatQuality(String),
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.priority.is_empty() {
            return Err(ConfigError::EmptyPriority);
        }
        for (name, rule) in &self.storage.path_based_origins {
            if rule.regex {
                Regex::new(&rule.pattern)
                    .map_err(|e| ConfigError::InvalidPattern(name.clone(), e.to_string()))?;
            }
            if rule.priority.is_empty() {
                return Err(ConfigError::EmptyPriority);
            }
        }
        let detection = &self.responsive.device_detection;
        Regex::new(&detection.mobile_regex)
            .map_err(|e| ConfigError::InvalidDeviceRegex(e.to_string()))?;
        Regex::new(&detection.tablet_regex)
            .map_err(|e| ConfigError::InvalidDeviceRegex(e.to_string()))?;
        if self.retry_settings().max_attempts == 0 {
            return Err(ConfigError::InvalidRetry);
        }
        for (format, quality) in &self.responsive.format_quality {
            if !(1..=100).contains(quality) {
                return Err(ConfigError::InvalidFormatQuality(format.clone()));
            }
        }
        Ok(())
    }

    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        let config: GatewayConfig = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }

    /// Storage retry tuning with the cache-section fallback.
    pub fn retry_settings(&self) -> RetryConfig {
        self.storage.retry.or(self.cache.retry).unwrap_or_default()
    }

    /// Storage breaker tuning with the cache-section fallback.
    pub fn breaker_settings(&self) -> CircuitBreakerConfig {
        self.storage
            .circuit_breaker
            .or(self.cache.circuit_breaker)
            .unwrap_or_default()
    }

    /// Look up a derivative template: configured templates override the
    /// built-in registry.
    pub fn derivative(&self, name: &str) -> Option<TransformOptions> {
        if let Some(template) = self.derivatives.get(name) {
            return Some(template.clone());
        }
        builtin_derivative(name)
    }

    /// Per-format quality from configuration with fixed fallbacks.
    pub fn format_quality(&self, format: Format) -> u8 {
        if let Some(q) = self.responsive.format_quality.get(format.as_str()) {
            return *q;
        }
        match format {
            Format::Webp => 85,
            Format::Avif => 80,
            _ => self.responsive.quality,
        }
    }
}

/// Built-in derivative templates, overridable from configuration.
pub fn builtin_derivative(name: &str) -> Option<TransformOptions> {
    let mut opts = TransformOptions::default();
    match name {
        "banner" => {
            opts.aspect = Some(AspectRatio { w: 16, h: 5 });
            opts.smart = true;
            opts.fit = Some(Fit::Crop);
            opts.gravity = Some(Gravity::Named(GravityPosition::Face));
            opts.content = Some(ContentKind::Banner);
        }
        "thumbnail" => {
            opts.width = Some(320);
            opts.fit = Some(Fit::ScaleDown);
            opts.quality = Some(85);
        }
        "avatar" => {
            opts.width = Some(180);
            opts.height = Some(180);
            opts.fit = Some(Fit::Crop);
            opts.gravity = Some(Gravity::Named(GravityPosition::Face));
        }
        "profile" => {
            opts.width = Some(300);
            opts.height = Some(300);
            opts.fit = Some(Fit::Crop);
            opts.gravity = Some(Gravity::Named(GravityPosition::Face));
            opts.content = Some(ContentKind::Profile);
        }
        "portrait" => {
            opts.aspect = Some(AspectRatio { w: 3, h: 4 });
            opts.smart = true;
            opts.fit = Some(Fit::Crop);
        }
        "square" => {
            opts.aspect = Some(AspectRatio { w: 1, h: 1 });
            opts.smart = true;
            opts.fit = Some(Fit::Crop);
        }
        "og" => {
            opts.width = Some(1200);
            opts.height = Some(630);
            opts.fit = Some(Fit::Crop);
            opts.quality = Some(85);
        }
        _ => return None,
    }
    Some(opts)
}

/// Derivatives that need source dimensions before cropping.
pub const METADATA_DERIVATIVES: &[&str] =
    &["banner", "avatar", "profile", "thumbnail", "portrait", "square"];
