//! Conditional transformation rules, including the Akamai `im.*`
//! compatibility syntax.

use crate::options::{
    CondOp, CondProperty, CondValue, Condition, Fit, Format, TransformOptions,
};
use crate::storage::StorageResult;

/// Rough bytes-per-pixel by encoded format, used when the origin did
/// not report dimensions. A coarse estimator; replace the table to
/// replace the heuristic.
const BYTES_PER_PIXEL: &[(&str, f64)] = &[("jpeg", 0.25), ("jpg", 0.25), ("png", 1.0)];
const BYTES_PER_PIXEL_DEFAULT: f64 = 0.5;

/// Parse `width>800:quality=60;fit=cover` into a condition. The part
/// after the first `:` is kept raw and parsed again at evaluation time.
pub fn parse_condition(raw: &str) -> Result<Condition, String> {
    let (test, then) = raw
        .split_once(':')
        .ok_or_else(|| "condition needs a ':' separating test and options".to_string())?;
    if then.trim().is_empty() {
        return Err("condition has no consequent options".to_string());
    }

    // Two-character operators first so `<=` is not read as `<`.
    let op_index = ["<=", ">=", "==", "!=", "<", ">", "="]
        .iter()
        .find_map(|op| test.find(op).map(|at| (at, *op)))
        .ok_or_else(|| "condition has no comparison operator".to_string())?;
    let (at, op_str) = op_index;

    let property: CondProperty = test[..at].trim().parse()?;
    let op: CondOp = op_str.parse()?;
    let value_str = test[at + op_str.len()..].trim();
    let value = match value_str.parse::<f64>() {
        Ok(n) => CondValue::Number(n),
        Err(_) => CondValue::Text(value_str.to_string()),
    };

    Ok(Condition {
        property,
        op,
        value,
        then: then.to_string(),
    })
}

/// Parse a consequent option string: `;`-separated `key=value` pairs in
/// native or Akamai syntax.
pub fn parse_then_options(then: &str) -> (TransformOptions, Vec<String>) {
    let pairs: Vec<(String, String)> = then
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    TransformOptions::from_query_pairs(&pairs)
}

/// Evaluate the ordered conditional rules against what storage told us
/// about the source, merging matching consequents over the options.
pub fn apply_conditions(opts: &mut TransformOptions, storage: &StorageResult) -> Vec<String> {
    let mut warnings = Vec::new();
    let rules = std::mem::take(&mut opts.conditions);

    for rule in &rules {
        let holds = match rule.property {
            CondProperty::Width => {
                compare_number(source_width(storage), &rule.op, &rule.value)
            }
            CondProperty::Height => {
                compare_number(source_height(storage), &rule.op, &rule.value)
            }
            CondProperty::Ratio => {
                let ratio = match (source_width(storage), source_height(storage)) {
                    (Some(w), Some(h)) if h > 0.0 => Some(w / h),
                    _ => None,
                };
                compare_number(ratio, &rule.op, &rule.value)
            }
            CondProperty::Format => compare_format(storage, &rule.op, &rule.value),
        };

        if holds {
            tracing::debug!(
                property = ?rule.property,
                op = rule.op.as_str(),
                "conditional rule matched"
            );
            let (then_opts, mut then_warnings) = parse_then_options(&rule.then);
            warnings.append(&mut then_warnings);
            opts.merge_over(&then_opts);
        }
    }

    warnings
}

fn source_width(storage: &StorageResult) -> Option<f64> {
    storage
        .width
        .map(|w| w as f64)
        .or_else(|| estimated_dims(storage).map(|(w, _)| w))
}

fn source_height(storage: &StorageResult) -> Option<f64> {
    storage
        .height
        .map(|h| h as f64)
        .or_else(|| estimated_dims(storage).map(|(_, h)| h))
}

/// Dimension estimate from body size when the origin reported none:
/// pixels = size / bytes-per-pixel, shaped 16:9.
fn estimated_dims(storage: &StorageResult) -> Option<(f64, f64)> {
    if storage.size == 0 {
        return None;
    }
    let subtype = storage.content_type().rsplit('/').next().unwrap_or("");
    let bpp = BYTES_PER_PIXEL
        .iter()
        .find(|(name, _)| subtype.eq_ignore_ascii_case(name))
        .map(|(_, bpp)| *bpp)
        .unwrap_or(BYTES_PER_PIXEL_DEFAULT);
    let pixels = storage.size as f64 / bpp;
    let aspect = 16.0 / 9.0;
    let width = (pixels * aspect).sqrt();
    Some((width, width / aspect))
}

fn compare_number(actual: Option<f64>, op: &CondOp, value: &CondValue) -> bool {
    let Some(actual) = actual else { return false };
    let expected = match value {
        CondValue::Number(n) => *n,
        CondValue::Text(s) => match s.parse::<f64>() {
            Ok(n) => n,
            Err(_) => return false,
        },
    };
    match op {
        CondOp::Lt => actual < expected,
        CondOp::Le => actual <= expected,
        CondOp::Eq => (actual - expected).abs() < f64::EPSILON,
        CondOp::Ne => (actual - expected).abs() >= f64::EPSILON,
        CondOp::Gt => actual > expected,
        CondOp::Ge => actual >= expected,
    }
}

fn compare_format(storage: &StorageResult, op: &CondOp, value: &CondValue) -> bool {
    let actual = storage.content_type().rsplit('/').next().unwrap_or("");
    let expected = match value {
        CondValue::Text(s) => s.as_str(),
        CondValue::Number(_) => return false,
    };
    match op {
        CondOp::Eq => actual.eq_ignore_ascii_case(expected),
        CondOp::Ne => !actual.eq_ignore_ascii_case(expected),
        _ => false,
    }
}

/// Translate one Akamai `im.*` query pair onto the options record.
///
/// Mode names map onto transformer fits: fit→contain,
/// stretch→scale-down, fill→cover, crop→crop, pad→pad. Named qualities
/// are low=50, medium=75, high=90.
pub fn apply_akamai_pair(
    opts: &mut TransformOptions,
    key: &str,
    value: &str,
    warnings: &mut Vec<String>,
) {
    match key {
        "im.resize" => {
            for part in value.split(',') {
                let Some((k, v)) = part.split_once(':') else {
                    warnings.push(format!("malformed im.resize fragment '{}'", part));
                    continue;
                };
                match k.trim().to_lowercase().as_str() {
                    "width" => match v.trim().parse::<u32>() {
                        Ok(w) => {
                            opts.width = Some(w);
                            opts.explicit_width = true;
                        }
                        Err(_) => warnings.push(format!("invalid im.resize width '{}'", v)),
                    },
                    "height" => match v.trim().parse::<u32>() {
                        Ok(h) => {
                            opts.height = Some(h);
                            opts.explicit_height = true;
                        }
                        Err(_) => warnings.push(format!("invalid im.resize height '{}'", v)),
                    },
                    "mode" => match akamai_mode(v.trim()) {
                        Some(fit) => opts.fit = Some(fit),
                        None => warnings.push(format!("unknown im.resize mode '{}'", v)),
                    },
                    other => warnings.push(format!("unknown im.resize key '{}'", other)),
                }
            }
        }
        "im.quality" => match akamai_quality(value) {
            Some(q) => opts.quality = Some(q),
            None => warnings.push(format!("invalid im.quality '{}'", value)),
        },
        "im.format" => match value.parse::<Format>() {
            Ok(f) => opts.format = Some(f),
            Err(_) => warnings.push(format!("invalid im.format '{}'", value)),
        },
        "im.background" | "im.backgroundcolor" => {
            opts.background = Some(value.to_string());
        }
        "im.blur" => match value.parse::<u32>() {
            Ok(b) => opts.blur = Some(b),
            Err(_) => warnings.push(format!("invalid im.blur '{}'", value)),
        },
        "im.grayscale" | "im.greyscale" => {
            opts.saturation = Some(0.0);
        }
        other => warnings.push(format!("unsupported Akamai parameter '{}'", other)),
    }
}

fn akamai_mode(mode: &str) -> Option<Fit> {
    match mode.to_lowercase().as_str() {
        "fit" => Some(Fit::Contain),
        "stretch" => Some(Fit::ScaleDown),
        "fill" => Some(Fit::Cover),
        "crop" => Some(Fit::Crop),
        "pad" => Some(Fit::Pad),
        _ => None,
    }
}

fn akamai_quality(value: &str) -> Option<u8> {
    match value.to_lowercase().as_str() {
        "low" => Some(50),
        "medium" => Some(75),
        "high" => Some(90),
        other => other.parse::<u8>().ok().filter(|q| (1..=100).contains(q)),
    }
}
