//! Soft, type-aware equality between a model value and a ground-truth value.
//!
//! Rules apply in order: missing, date, integer, float, then normalized string.
//! Any coercion failure drops through to the string rule, so comparison
//! never fails.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;

use super::value::{render_json, ExpectedValue};
use crate::config::ScoringConfig;

/// Whitespace, hyphen and underscore runs removed by normalization.
pub const NORMALIZE_PATTERN: &str = r"[\s\-_]+";

/// Decimal places floats are rounded to before comparing.
const FLOAT_DECIMALS: i32 = 5;

/// Strips, lower-cases and removes separator runs.
#[derive(Debug, Clone)]
pub struct Normalizer {
    pattern: Regex,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(NORMALIZE_PATTERN).expect("normalization pattern is valid"),
        }
    }

    pub fn normalize(&self, s: &str) -> String {
        let lowered = s.trim().to_lowercase();
        self.pattern.replace_all(&lowered, "").into_owned()
    }

    pub fn matches(&self, a: &str, b: &str) -> bool {
        self.normalize(a) == self.normalize(b)
    }
}

/// Compare `model` (absent when the answer lacked the field) to `expected`.
pub fn compare(
    model: Option<&Value>,
    expected: &ExpectedValue,
    field: &str,
    config: &ScoringConfig,
) -> bool {
    let model_missing = model.map_or(true, |v| config.is_missing(v));
    if model_missing || expected.is_missing() {
        return model_missing && expected.is_missing();
    }

    let sentinel = &config.missing_sentinel;
    let model_text = model.map(|v| render_json(v, sentinel)).unwrap_or_default();

    let typed = match expected {
        ExpectedValue::Date(want) => dates_equal(&model_text, want),
        ExpectedValue::Integer(want) => model.and_then(coerce_integer).map(|got| got == *want),
        ExpectedValue::Float(want) => model
            .and_then(coerce_float)
            .map(|got| round_to(got, FLOAT_DECIMALS) == round_to(*want, FLOAT_DECIMALS)),
        ExpectedValue::Boolean(_) | ExpectedValue::Text(_) | ExpectedValue::Missing => None,
    };

    match typed {
        Some(equal) => equal,
        None => {
            if !matches!(expected, ExpectedValue::Boolean(_) | ExpectedValue::Text(_)) {
                tracing::debug!(field, model = %model_text, "typed comparison fell back to string rule");
            }
            config
                .normalizer
                .matches(&model_text, &expected.render(sentinel))
        }
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    f.is_finite().then_some(f)
}

/// Integers accept any numeric form whose value is whole at five decimals,
/// so `"100.00000"` coerces to `100` while `"100.5"` does not.
fn coerce_integer(value: &Value) -> Option<i64> {
    if let Value::Number(n) = value {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    let f = round_to(coerce_float(value)?, FLOAT_DECIMALS);
    (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// Values too large to scale are already whole at any precision and are
/// returned unchanged.
fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / factor
}

fn dates_equal(a: &str, b: &str) -> Option<bool> {
    Some(parse_instant(a)? == parse_instant(b)?)
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y%m%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%d.%m.%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%B %d %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%d %b, %Y",
    "%d-%b-%Y",
    "%d-%B-%Y",
    "%Y-%b-%d",
    "%b-%d-%Y",
];

/// Parse common textual date and datetime forms into a naive instant.
pub fn parse_instant(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}
