pub mod builder;
pub mod conditions;

pub use builder::{BuiltOptions, OptionBuilder};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::client::DeviceClass;

/// Supported output image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Auto,
    Avif,
    Webp,
    Jpeg,
    Png,
    Gif,
    Json,
    Svg,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Auto => "auto",
            Format::Avif => "avif",
            Format::Webp => "webp",
            Format::Jpeg => "jpeg",
            Format::Png => "png",
            Format::Gif => "gif",
            Format::Json => "json",
            Format::Svg => "svg",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Format::Auto),
            "avif" => Ok(Format::Avif),
            "webp" => Ok(Format::Webp),
            "jpeg" | "jpg" => Ok(Format::Jpeg),
            "png" => Ok(Format::Png),
            "gif" => Ok(Format::Gif),
            "json" => Ok(Format::Json),
            "svg" => Ok(Format::Svg),
            _ => Err(format!("Invalid format: {}", s)),
        }
    }
}

/// Fit modes for image transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fit {
    ScaleDown,
    Contain,
    Cover,
    Crop,
    Pad,
}

impl Fit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fit::ScaleDown => "scale-down",
            Fit::Contain => "contain",
            Fit::Cover => "cover",
            Fit::Crop => "crop",
            Fit::Pad => "pad",
        }
    }
}

impl fmt::Display for Fit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Fit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scale-down" => Ok(Fit::ScaleDown),
            "contain" => Ok(Fit::Contain),
            "cover" => Ok(Fit::Cover),
            "crop" => Ok(Fit::Crop),
            "pad" => Ok(Fit::Pad),
            _ => Err(format!("Invalid fit mode: {}", s)),
        }
    }
}

/// Named cropping anchors understood by the transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GravityPosition {
    Auto,
    Center,
    Face,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl GravityPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            GravityPosition::Auto => "auto",
            GravityPosition::Center => "center",
            GravityPosition::Face => "face",
            GravityPosition::Top => "top",
            GravityPosition::Bottom => "bottom",
            GravityPosition::Left => "left",
            GravityPosition::Right => "right",
            GravityPosition::TopLeft => "top-left",
            GravityPosition::TopRight => "top-right",
            GravityPosition::BottomLeft => "bottom-left",
            GravityPosition::BottomRight => "bottom-right",
        }
    }
}

impl FromStr for GravityPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(GravityPosition::Auto),
            "center" | "centre" => Ok(GravityPosition::Center),
            "face" => Ok(GravityPosition::Face),
            "top" => Ok(GravityPosition::Top),
            "bottom" => Ok(GravityPosition::Bottom),
            "left" => Ok(GravityPosition::Left),
            "right" => Ok(GravityPosition::Right),
            "top-left" => Ok(GravityPosition::TopLeft),
            "top-right" => Ok(GravityPosition::TopRight),
            "bottom-left" => Ok(GravityPosition::BottomLeft),
            "bottom-right" => Ok(GravityPosition::BottomRight),
            _ => Err(format!("Invalid gravity: {}", s)),
        }
    }
}

/// Cropping anchor: either a named position or normalized coordinates.
///
/// Serializes the way the transformer expects it: named positions as a
/// bare string, coordinates as `{"x": .., "y": ..}` with both in [0,1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Gravity {
    Named(GravityPosition),
    Coord { x: f64, y: f64 },
}

impl Gravity {
    pub fn center() -> Self {
        Gravity::Named(GravityPosition::Center)
    }

    /// Coordinates are only valid inside the unit square.
    pub fn is_valid(&self) -> bool {
        match self {
            Gravity::Named(_) => true,
            Gravity::Coord { x, y } => (0.0..=1.0).contains(x) && (0.0..=1.0).contains(y),
        }
    }
}

impl FromStr for Gravity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(named) = s.parse::<GravityPosition>() {
            return Ok(Gravity::Named(named));
        }
        let coords = s
            .split_once(',')
            .or_else(|| s.split_once('x'))
            .ok_or_else(|| format!("Invalid gravity: {}", s))?;
        let x = coords.0.trim().parse::<f64>().map_err(|e| e.to_string())?;
        let y = coords.1.trim().parse::<f64>().map_err(|e| e.to_string())?;
        Ok(Gravity::Coord { x, y })
    }
}

/// Target aspect ratio, written as "16:9" or "16-9" in URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio {
    pub w: u32,
    pub h: u32,
}

impl AspectRatio {
    pub fn ratio(&self) -> f64 {
        self.w as f64 / self.h as f64
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.w, self.h)
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(':')
            .or_else(|| s.split_once('-'))
            .ok_or_else(|| format!("Invalid aspect ratio: {}", s))?;
        let w = w.trim().parse::<u32>().map_err(|e| e.to_string())?;
        let h = h.trim().parse::<u32>().map_err(|e| e.to_string())?;
        if w == 0 || h == 0 {
            return Err(format!("Aspect ratio sides must be positive: {}", s));
        }
        Ok(AspectRatio { w, h })
    }
}

impl Serialize for AspectRatio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AspectRatio {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Normalized focal point, written as "x,y" with both in [0,1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocalPoint {
    pub x: f64,
    pub y: f64,
}

impl FocalPoint {
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }
}

impl fmt::Display for FocalPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

impl FromStr for FocalPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = s
            .split_once(',')
            .ok_or_else(|| format!("Invalid focal point: {}", s))?;
        let x = x.trim().parse::<f64>().map_err(|e| e.to_string())?;
        let y = y.trim().parse::<f64>().map_err(|e| e.to_string())?;
        let fp = FocalPoint { x, y };
        if !fp.is_valid() {
            return Err(format!("Focal point out of range: {}", s));
        }
        Ok(fp)
    }
}

impl Serialize for FocalPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FocalPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Content hints used by smart cropping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Portrait,
    Landscape,
    Product,
    Banner,
    Profile,
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "portrait" => Ok(ContentKind::Portrait),
            "landscape" => Ok(ContentKind::Landscape),
            "product" => Ok(ContentKind::Product),
            "banner" => Ok(ContentKind::Banner),
            "profile" => Ok(ContentKind::Profile),
            _ => Err(format!("Invalid content kind: {}", s)),
        }
    }
}

/// How the transformer handles embedded metadata in the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataMode {
    Keep,
    Copyright,
    None,
}

impl MetadataMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataMode::Keep => "keep",
            MetadataMode::Copyright => "copyright",
            MetadataMode::None => "none",
        }
    }
}

impl FromStr for MetadataMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keep" => Ok(MetadataMode::Keep),
            "copyright" => Ok(MetadataMode::Copyright),
            "none" => Ok(MetadataMode::None),
            _ => Err(format!("Invalid metadata mode: {}", s)),
        }
    }
}

/// A single overlay composited onto the image.
///
/// `left`/`right` and `top`/`bottom` are mutually exclusive; validation
/// drops the later one of a conflicting pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DrawOverlay {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<u32>,
}

/// Property a conditional rule inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CondProperty {
    Width,
    Height,
    Ratio,
    Format,
}

impl FromStr for CondProperty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "width" => Ok(CondProperty::Width),
            "height" => Ok(CondProperty::Height),
            "ratio" => Ok(CondProperty::Ratio),
            "format" => Ok(CondProperty::Format),
            _ => Err(format!("Invalid condition property: {}", s)),
        }
    }
}

/// Comparison operator in a conditional rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CondOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CondOp::Lt => "<",
            CondOp::Le => "<=",
            CondOp::Eq => "==",
            CondOp::Ne => "!=",
            CondOp::Gt => ">",
            CondOp::Ge => ">=",
        }
    }
}

impl FromStr for CondOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(CondOp::Lt),
            "<=" => Ok(CondOp::Le),
            "=" | "==" => Ok(CondOp::Eq),
            "!=" => Ok(CondOp::Ne),
            ">" => Ok(CondOp::Gt),
            ">=" => Ok(CondOp::Ge),
            _ => Err(format!("Invalid condition operator: {}", s)),
        }
    }
}

impl Serialize for CondOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CondOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Comparison value: numeric for dimensions/ratio, textual for format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CondValue {
    Number(f64),
    Text(String),
}

/// An ordered conditional rule: when `property op value` holds against the
/// source image, `then` (native or Akamai `im.*` syntax) is merged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub property: CondProperty,
    pub op: CondOp,
    pub value: CondValue,
    pub then: String,
}

/// The full transformation option record.
///
/// Every field is optional; the option builder fills, resolves and
/// validates them in a fixed stage order before dispatch. The `auto_*`
/// and `explicit_*` fields are internal pipeline markers and are never
/// serialized to the transformer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fit: Option<Fit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gravity: Option<Gravity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blur: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharpen: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contrast: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saturation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate: Option<i32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub flip: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub flop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trim: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub draw: Vec<DrawOverlay>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataMode>,

    // Semantic fields consumed by the pipeline, never dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivative: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub smart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect: Option<AspectRatio>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focal: Option<FocalPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceClass>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_expansion: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(skip)]
    pub(crate) auto_width: bool,
    #[serde(skip)]
    pub(crate) auto_height: bool,
    #[serde(skip)]
    pub(crate) auto_quality: bool,
    #[serde(skip)]
    pub(crate) explicit_width: bool,
    #[serde(skip)]
    pub(crate) explicit_height: bool,
}

impl TransformOptions {
    /// True when no option at all was supplied.
    pub fn is_empty(&self) -> bool {
        *self == TransformOptions::default()
    }

    /// Parse URL query pairs into options.
    ///
    /// Unknown keys are ignored; invalid values are dropped with a
    /// warning rather than failing the request. `width=auto` style values
    /// set the internal auto markers instead of a dimension.
    pub fn from_query_pairs(pairs: &[(String, String)]) -> (Self, Vec<String>) {
        let mut opts = TransformOptions::default();
        let mut warnings = Vec::new();

        for (key, value) in pairs {
            let key = key.as_str();
            if key.starts_with("im.") || key == "im" {
                conditions::apply_akamai_pair(&mut opts, key, value, &mut warnings);
                continue;
            }
            match key {
                "width" | "w" => parse_auto_dim(value, &mut opts.width, &mut opts.auto_width, &mut opts.explicit_width, key, &mut warnings),
                "height" | "h" => parse_auto_dim(value, &mut opts.height, &mut opts.auto_height, &mut opts.explicit_height, key, &mut warnings),
                "dpr" => parse_into(value, &mut opts.dpr, key, &mut warnings),
                "fit" => parse_into(value, &mut opts.fit, key, &mut warnings),
                "gravity" | "g" => parse_into(value, &mut opts.gravity, key, &mut warnings),
                "format" | "f" => {
                    match value.parse::<Format>() {
                        Ok(f) => opts.format = Some(f),
                        Err(_) => {
                            warnings.push(format!("invalid format '{}', defaulting to auto", value));
                            opts.format = Some(Format::Auto);
                        }
                    }
                }
                "quality" | "q" => {
                    if value.eq_ignore_ascii_case("auto") {
                        opts.auto_quality = true;
                    } else {
                        match value.parse::<u8>() {
                            Ok(q) => opts.quality = Some(q),
                            Err(_) => warnings.push(format!("invalid quality '{}', dropped", value)),
                        }
                    }
                }
                "compression" => opts.compression = Some(value.clone()),
                "blur" => parse_into(value, &mut opts.blur, key, &mut warnings),
                "sharpen" => parse_into(value, &mut opts.sharpen, key, &mut warnings),
                "gamma" => parse_into(value, &mut opts.gamma, key, &mut warnings),
                "brightness" => parse_into(value, &mut opts.brightness, key, &mut warnings),
                "contrast" => parse_into(value, &mut opts.contrast, key, &mut warnings),
                "saturation" => parse_into(value, &mut opts.saturation, key, &mut warnings),
                "rotate" => parse_into(value, &mut opts.rotate, key, &mut warnings),
                "flip" => opts.flip = truthy(value),
                "flop" => opts.flop = truthy(value),
                "trim" => opts.trim = Some(value.clone()),
                "background" => opts.background = Some(value.clone()),
                "draw" => match serde_json::from_str::<Vec<DrawOverlay>>(value) {
                    Ok(overlays) => opts.draw.extend(overlays),
                    Err(e) => warnings.push(format!("invalid draw '{}': {}", value, e)),
                },
                "metadata" => parse_into(value, &mut opts.metadata, key, &mut warnings),
                "derivative" | "d" => opts.derivative = Some(value.clone()),
                "smart" => opts.smart = truthy(value),
                "aspect" | "r" => parse_into(value, &mut opts.aspect, key, &mut warnings),
                "focal" | "p" => parse_into(value, &mut opts.focal, key, &mut warnings),
                "content" => parse_into(value, &mut opts.content, key, &mut warnings),
                "platform" => opts.platform = Some(value.clone()),
                "device" => parse_into(value, &mut opts.device, key, &mut warnings),
                "allowExpansion" | "allow-expansion" => opts.allow_expansion = truthy(value),
                "condition" => match conditions::parse_condition(value) {
                    Ok(cond) => opts.conditions.push(cond),
                    Err(e) => warnings.push(format!("invalid condition '{}': {}", value, e)),
                },
                _ => {}
            }
        }

        (opts, warnings)
    }

    /// Parse a raw query string.
    pub fn from_query_str(query: &str) -> (Self, Vec<String>) {
        match serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
            Ok(pairs) => Self::from_query_pairs(&pairs),
            Err(e) => (
                TransformOptions::default(),
                vec![format!("unparseable query string: {}", e)],
            ),
        }
    }

    /// Merge a derivative template underneath these options: fields the
    /// URL already set win, absent fields are taken from the template.
    pub fn merge_under(&mut self, template: &TransformOptions) {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = template.$field.clone();
                }
            };
        }
        fill!(width);
        fill!(height);
        fill!(dpr);
        fill!(fit);
        fill!(gravity);
        fill!(format);
        fill!(quality);
        fill!(compression);
        fill!(blur);
        fill!(sharpen);
        fill!(gamma);
        fill!(brightness);
        fill!(contrast);
        fill!(saturation);
        fill!(rotate);
        fill!(trim);
        fill!(background);
        fill!(metadata);
        fill!(aspect);
        fill!(focal);
        fill!(content);
        fill!(platform);
        fill!(device);
        if template.flip {
            self.flip = true;
        }
        if template.flop {
            self.flop = true;
        }
        if template.smart {
            self.smart = true;
        }
        if template.allow_expansion {
            self.allow_expansion = true;
        }
        if self.draw.is_empty() {
            self.draw = template.draw.clone();
        }
        self.conditions.extend(template.conditions.iter().cloned());
    }

    /// Overlay `other` on top of these options: fields `other` sets win.
    /// Used by conditional rules, whose branches are more specific than
    /// what they replace.
    pub fn merge_over(&mut self, other: &TransformOptions) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take!(width);
        take!(height);
        take!(dpr);
        take!(fit);
        take!(gravity);
        take!(format);
        take!(quality);
        take!(compression);
        take!(blur);
        take!(sharpen);
        take!(gamma);
        take!(brightness);
        take!(contrast);
        take!(saturation);
        take!(rotate);
        take!(trim);
        take!(background);
        take!(metadata);
        take!(aspect);
        take!(focal);
        take!(content);
        take!(platform);
        take!(device);
        if other.flip {
            self.flip = true;
        }
        if other.flop {
            self.flop = true;
        }
        if other.smart {
            self.smart = true;
        }
        if other.allow_expansion {
            self.allow_expansion = true;
        }
        if !other.draw.is_empty() {
            self.draw = other.draw.clone();
        }
    }

    /// Structural sanitization: fix overlay conflicts, drop entries the
    /// transformer cannot use. Returns human-readable warnings.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if matches!(self.width, Some(0)) {
            warnings.push("width 0 dropped".into());
            self.width = None;
        }
        if matches!(self.height, Some(0)) {
            warnings.push("height 0 dropped".into());
            self.height = None;
        }

        self.draw.retain(|overlay| {
            if overlay.url.is_empty() {
                warnings.push("draw overlay without url dropped".into());
                false
            } else {
                true
            }
        });
        for overlay in &mut self.draw {
            if overlay.left.is_some() && overlay.right.is_some() {
                warnings.push("draw overlay had both left and right; right dropped".into());
                overlay.right = None;
            }
            if overlay.top.is_some() && overlay.bottom.is_some() {
                warnings.push("draw overlay had both top and bottom; bottom dropped".into());
                overlay.bottom = None;
            }
            if matches!(overlay.width, Some(0)) {
                warnings.push("draw overlay width 0 dropped".into());
                overlay.width = None;
            }
            if matches!(overlay.height, Some(0)) {
                warnings.push("draw overlay height 0 dropped".into());
                overlay.height = None;
            }
        }

        warnings
    }

    /// Range validation: clamp where reasonable, reset to safe defaults
    /// where not. Returns human-readable warnings.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(q) = self.quality {
            if !(1..=100).contains(&q) {
                let clamped = q.clamp(1, 100);
                warnings.push(format!("quality {} clamped to {}", q, clamped));
                self.quality = Some(clamped);
            }
        }
        if let Some(b) = self.blur {
            if !(1..=250).contains(&b) {
                let clamped = b.clamp(1, 250);
                warnings.push(format!("blur {} clamped to {}", b, clamped));
                self.blur = Some(clamped);
            }
        }
        if let Some(g) = self.gamma {
            if g <= 0.0 {
                warnings.push(format!("gamma {} dropped", g));
                self.gamma = None;
            }
        }
        if let Some(d) = self.dpr {
            if d <= 0.0 {
                warnings.push(format!("dpr {} dropped", d));
                self.dpr = None;
            } else if d > 3.0 {
                warnings.push(format!("dpr {} clamped to 3", d));
                self.dpr = Some(3.0);
            }
        }
        if let Some(c) = &self.compression {
            if c != "fast" {
                warnings.push(format!("unknown compression '{}' dropped", c));
                self.compression = None;
            }
        }
        if let Some(gravity) = &self.gravity {
            if !gravity.is_valid() {
                warnings.push("gravity coordinates out of range; reset to center".into());
                self.gravity = Some(Gravity::center());
            }
        }
        if let Some(fp) = &self.focal {
            if !fp.is_valid() {
                warnings.push("focal point out of range; dropped".into());
                self.focal = None;
            }
        }
        for overlay in &mut self.draw {
            if let Some(op) = overlay.opacity {
                if !(0.0..=1.0).contains(&op) {
                    let clamped = op.clamp(0.0, 1.0);
                    warnings.push(format!("draw opacity {} clamped to {}", op, clamped));
                    overlay.opacity = Some(clamped);
                }
            }
        }

        warnings
    }

    /// Aspect postcondition: an aspect ratio implies `fit=crop` unless a
    /// fit was set earlier in the pipeline, focal becomes gravity when
    /// gravity is still unset, and a missing dimension is computed from
    /// the one that is present.
    pub fn apply_aspect_postcondition(&mut self) {
        let Some(aspect) = self.aspect else { return };
        if self.fit.is_none() {
            self.fit = Some(Fit::Crop);
        }
        if self.gravity.is_none() {
            if let Some(fp) = self.focal {
                self.gravity = Some(Gravity::Coord { x: fp.x, y: fp.y });
            }
        }
        match (self.width, self.height) {
            (Some(w), None) => {
                self.height = Some(((w as f64) / aspect.ratio()).round().max(1.0) as u32);
            }
            (None, Some(h)) => {
                self.width = Some(((h as f64) * aspect.ratio()).round().max(1.0) as u32);
            }
            _ => {}
        }
    }

    /// The record dispatched to the transformer.
    ///
    /// Only dimensional, encoding, effect and composition fields are
    /// included; semantic fields and internal markers never leave the
    /// pipeline.
    pub fn to_transformer_record(&self) -> serde_json::Map<String, serde_json::Value> {
        use serde_json::{json, Value};
        let mut record = serde_json::Map::new();
        let mut put = |key: &str, value: Value| {
            record.insert(key.to_string(), value);
        };

        if let Some(w) = self.width {
            put("width", json!(w));
        }
        if let Some(h) = self.height {
            put("height", json!(h));
        }
        if let Some(d) = self.dpr {
            put("dpr", json!(d));
        }
        if let Some(fit) = self.fit {
            put("fit", json!(fit.as_str()));
        }
        match &self.gravity {
            Some(Gravity::Named(pos)) => put("gravity", json!(pos.as_str())),
            Some(Gravity::Coord { x, y }) => put("gravity", json!({"x": x, "y": y})),
            None => {}
        }
        if let Some(f) = self.format {
            put("format", json!(f.as_str()));
        }
        if let Some(q) = self.quality {
            put("quality", json!(q));
        }
        if let Some(c) = &self.compression {
            put("compression", json!(c));
        }
        if let Some(b) = self.blur {
            put("blur", json!(b));
        }
        if let Some(s) = self.sharpen {
            put("sharpen", json!(s));
        }
        if let Some(g) = self.gamma {
            put("gamma", json!(g));
        }
        if let Some(b) = self.brightness {
            put("brightness", json!(b));
        }
        if let Some(c) = self.contrast {
            put("contrast", json!(c));
        }
        if let Some(s) = self.saturation {
            put("saturation", json!(s));
        }
        if let Some(r) = self.rotate {
            put("rotate", json!(r));
        }
        if self.flip {
            put("flip", json!(true));
        }
        if self.flop {
            put("flop", json!(true));
        }
        if let Some(t) = &self.trim {
            put("trim", json!(t));
        }
        if let Some(b) = &self.background {
            put("background", json!(b));
        }
        if let Some(m) = self.metadata {
            put("metadata", json!(m.as_str()));
        }
        if !self.draw.is_empty() {
            let overlays: Vec<Value> = self
                .draw
                .iter()
                .map(|o| serde_json::to_value(o).unwrap_or(Value::Null))
                .collect();
            put("draw", Value::Array(overlays));
        }

        record
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "" | "1" | "true" | "yes" | "on")
}

fn parse_into<T: FromStr>(
    value: &str,
    slot: &mut Option<T>,
    key: &str,
    warnings: &mut Vec<String>,
) where
    T::Err: fmt::Display,
{
    match value.parse::<T>() {
        Ok(parsed) => *slot = Some(parsed),
        Err(e) => warnings.push(format!("invalid {} '{}': {}", key, value, e)),
    }
}

fn parse_auto_dim(
    value: &str,
    slot: &mut Option<u32>,
    auto_marker: &mut bool,
    explicit_marker: &mut bool,
    key: &str,
    warnings: &mut Vec<String>,
) {
    if value.eq_ignore_ascii_case("auto") {
        *auto_marker = true;
        return;
    }
    match value.parse::<u32>() {
        Ok(parsed) => {
            *slot = Some(parsed);
            *explicit_marker = true;
        }
        Err(_) => warnings.push(format!("invalid {} '{}', dropped", key, value)),
    }
}

/// Serialized basis for cache keys and tags: the fields that uniquely
/// identify a rendition of a path.
pub fn cache_key_basis(path: &str, opts: &TransformOptions) -> String {
    let mut parts: BTreeMap<&str, String> = BTreeMap::new();
    if let Some(f) = opts.format {
        parts.insert("format", f.as_str().to_string());
    }
    if let Some(w) = opts.width {
        parts.insert("width", w.to_string());
    }
    if let Some(h) = opts.height {
        parts.insert("height", h.to_string());
    }
    if let Some(q) = opts.quality {
        parts.insert("quality", q.to_string());
    }
    if let Some(fit) = opts.fit {
        parts.insert("fit", fit.as_str().to_string());
    }
    if let Some(d) = &opts.derivative {
        parts.insert("derivative", d.clone());
    }
    let suffix: Vec<String> = parts.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}?{}", path, suffix.join("&"))
}
