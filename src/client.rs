use axum::http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;

use crate::config::GatewayConfig;
use crate::options::{Format, TransformOptions};

/// Upper bound on per-request memoized detector results. When exceeded,
/// the oldest 20% of entries (by insertion) are evicted.
const SCOPED_CACHE_CAPACITY: usize = 100;

/// Device classes derived from the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mobile" => Ok(DeviceClass::Mobile),
            "tablet" => Ok(DeviceClass::Tablet),
            "desktop" => Ok(DeviceClass::Desktop),
            _ => Err(format!("Invalid device class: {}", s)),
        }
    }
}

/// Network quality buckets derived from client hints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    Fast,
    Medium,
    Slow,
}

/// Everything the detector learns about one client from request headers
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub device: DeviceClass,
    pub network: NetworkQuality,
    pub viewport_width: Option<u32>,
    pub dpr: Option<f64>,
    pub save_data: bool,
    pub accepts_avif: bool,
    pub accepts_webp: bool,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            device: DeviceClass::Desktop,
            network: NetworkQuality::Medium,
            viewport_width: None,
            dpr: None,
            save_data: false,
            accepts_avif: false,
            accepts_webp: false,
        }
    }
}

#[derive(Debug, Clone)]
enum CachedValue {
    Info(ClientInfo),
    Formats(BTreeMap<String, bool>),
    Options(Box<TransformOptions>),
}

/// Insertion-ordered bounded map for per-request memoization.
#[derive(Default)]
struct ScopedCache {
    entries: HashMap<String, CachedValue>,
    order: VecDeque<String>,
}

impl ScopedCache {
    fn get(&self, key: &str) -> Option<&CachedValue> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: String, value: CachedValue) {
        if !self.entries.contains_key(&key) && self.entries.len() >= SCOPED_CACHE_CAPACITY {
            let evict = (SCOPED_CACHE_CAPACITY / 5).max(1);
            for _ in 0..evict {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
            tracing::debug!(evicted = evict, "detector cache over capacity");
        }
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
    }
}

/// Per-request client detector.
///
/// Born at request start, dropped at response completion. Every decision
/// is memoized under a stable fingerprint of hostname, path and the
/// capability headers so repeated pipeline stages never re-derive them.
pub struct ClientDetector {
    config: Arc<GatewayConfig>,
    mobile_re: Regex,
    tablet_re: Regex,
    cache: Mutex<ScopedCache>,
}

impl ClientDetector {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        let detection = &config.responsive.device_detection;
        let mobile_re = Regex::new(&detection.mobile_regex)
            .unwrap_or_else(|_| Regex::new(r"(?i)mobile|android|iphone|ipod").unwrap());
        let tablet_re = Regex::new(&detection.tablet_regex)
            .unwrap_or_else(|_| Regex::new(r"(?i)ipad|tablet|kindle|silk").unwrap());
        Self {
            config,
            mobile_re,
            tablet_re,
            cache: Mutex::new(ScopedCache::default()),
        }
    }

    /// Stable key over hostname + path + the headers that feed detection.
    pub fn fingerprint(&self, host: &str, path: &str, headers: &HeaderMap) -> String {
        let mut hasher = Sha256::new();
        hasher.update(host.as_bytes());
        hasher.update(b"|");
        hasher.update(path.as_bytes());
        for name in [
            "user-agent",
            "accept",
            "viewport-width",
            "sec-ch-viewport-width",
            "dpr",
            "sec-ch-dpr",
            "save-data",
            "ect",
            "downlink",
        ] {
            hasher.update(b"|");
            if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
                hasher.update(v.as_bytes());
            }
        }
        hex::encode(&hasher.finalize()[..16])
    }

    /// Derive device class, network quality, accepted formats, viewport
    /// and DPR from the request headers. Memoized per fingerprint.
    pub fn detect(&self, host: &str, path: &str, headers: &HeaderMap) -> ClientInfo {
        let key = format!("info:{}", self.fingerprint(host, path, headers));
        if let Some(CachedValue::Info(info)) = self.cache.lock().unwrap().get(&key) {
            return info.clone();
        }

        let info = self.detect_uncached(headers);
        self.cache
            .lock()
            .unwrap()
            .insert(key, CachedValue::Info(info.clone()));
        info
    }

    fn detect_uncached(&self, headers: &HeaderMap) -> ClientInfo {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let ua = header("user-agent").unwrap_or("");
        let device = if self.tablet_re.is_match(ua) {
            DeviceClass::Tablet
        } else if self.mobile_re.is_match(ua) {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        };

        let network = match header("ect") {
            Some("slow-2g") | Some("2g") => NetworkQuality::Slow,
            Some("3g") => NetworkQuality::Medium,
            Some("4g") => NetworkQuality::Fast,
            _ => match header("downlink").and_then(|v| v.parse::<f64>().ok()) {
                Some(mbps) if mbps >= 5.0 => NetworkQuality::Fast,
                Some(mbps) if mbps >= 1.5 => NetworkQuality::Medium,
                Some(_) => NetworkQuality::Slow,
                None => NetworkQuality::Medium,
            },
        };

        let viewport_width = header("sec-ch-viewport-width")
            .or_else(|| header("viewport-width"))
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v.round() as u32);
        let dpr = header("sec-ch-dpr")
            .or_else(|| header("dpr"))
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|d| *d > 0.0);
        let save_data = header("save-data")
            .map(|v| v.eq_ignore_ascii_case("on"))
            .unwrap_or(false);

        let accept = header("accept").unwrap_or("");
        ClientInfo {
            device,
            network,
            viewport_width,
            dpr,
            save_data,
            accepts_avif: accept.contains("image/avif"),
            accepts_webp: accept.contains("image/webp"),
        }
    }

    /// Batched format-support probe: resolves every requested format in
    /// one sweep and returns a complete mapping.
    pub fn supports_formats(
        &self,
        host: &str,
        path: &str,
        headers: &HeaderMap,
        formats: &[&str],
    ) -> BTreeMap<String, bool> {
        let key = format!("formats:{}", self.fingerprint(host, path, headers));
        if let Some(CachedValue::Formats(map)) = self.cache.lock().unwrap().get(&key) {
            if formats.iter().all(|f| map.contains_key(*f)) {
                return map.clone();
            }
        }

        let info = self.detect(host, path, headers);
        let mut map = BTreeMap::new();
        for format in formats {
            let supported = match format.to_lowercase().as_str() {
                "avif" => info.accepts_avif,
                "webp" => info.accepts_webp,
                "jpeg" | "jpg" | "png" | "gif" => true,
                _ => false,
            };
            map.insert(format.to_string(), supported);
        }
        self.cache
            .lock()
            .unwrap()
            .insert(key, CachedValue::Formats(map.clone()));
        map
    }

    /// Conservative support map used when detection fails outright.
    pub fn safe_default_formats(formats: &[&str]) -> BTreeMap<String, bool> {
        formats
            .iter()
            .map(|f| {
                let supported = matches!(f.to_lowercase().as_str(), "jpeg" | "jpg" | "png" | "gif");
                (f.to_string(), supported)
            })
            .collect()
    }

    /// Merge capability-derived values into `base`, touching only fields
    /// the caller left absent. Memoized per fingerprint + input options.
    pub fn optimized_options(
        &self,
        host: &str,
        path: &str,
        headers: &HeaderMap,
        base: &TransformOptions,
    ) -> TransformOptions {
        let serialized = serde_json::to_string(base).unwrap_or_default();
        let key = format!(
            "opts:{}:{}",
            self.fingerprint(host, path, headers),
            hex::encode(&Sha256::digest(serialized.as_bytes())[..8])
        );
        if let Some(CachedValue::Options(opts)) = self.cache.lock().unwrap().get(&key) {
            return (**opts).clone();
        }

        let info = self.detect(host, path, headers);
        let mut opts = base.clone();

        if opts.format.is_none() || opts.format == Some(Format::Auto) {
            opts.format = Some(if info.accepts_avif {
                Format::Avif
            } else if info.accepts_webp {
                Format::Webp
            } else {
                Format::Auto
            });
        }

        if opts.width.is_none() && !opts.auto_width {
            opts.width = Some(self.optimal_width(&info));
        }

        // Capability-driven quality only; the per-format configured
        // quality downstream owns the unconstrained case.
        if opts.quality.is_none() && (info.device != DeviceClass::Desktop || info.save_data) {
            let mut quality: f64 = match info.device {
                DeviceClass::Mobile => 80.0,
                DeviceClass::Tablet => 82.0,
                DeviceClass::Desktop => 85.0,
            };
            if info.save_data {
                quality *= 0.8;
            }
            opts.quality = Some(quality.floor() as u8);
        }

        if opts.dpr.is_none() {
            if let Some(dpr) = info.dpr {
                opts.dpr = Some(dpr.min(3.0));
            }
        }

        self.cache
            .lock()
            .unwrap()
            .insert(key, CachedValue::Options(Box::new(opts.clone())));
        opts
    }

    /// Viewport-derived width: viewport × DPR capped at 2000 and rounded
    /// up to the nearest 100, else the configured device-class width.
    pub fn optimal_width(&self, info: &ClientInfo) -> u32 {
        if let Some(viewport) = info.viewport_width {
            let effective = (viewport as f64 * info.dpr.unwrap_or(1.0)).min(2000.0);
            return ((effective / 100.0).ceil() * 100.0) as u32;
        }
        self.device_width(info.device)
    }

    pub fn device_width(&self, device: DeviceClass) -> u32 {
        let widths = &self.config.responsive.device_widths;
        match device {
            DeviceClass::Mobile => widths.mobile,
            DeviceClass::Tablet => widths.tablet,
            DeviceClass::Desktop => widths.desktop,
        }
    }
}
