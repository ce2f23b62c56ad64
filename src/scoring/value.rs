//! Typed ground-truth values and string rendering of both sides.

use serde_json::{Map, Value};

use crate::config::ScoringConfig;

/// A ground-truth value tagged by the comparison rule that applies to it.
///
/// The tag is decided once, when the record is loaded, from the field name
/// and the value's native JSON type. Model values are never inspected to
/// pick a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpectedValue {
    Missing,
    Date(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

impl ExpectedValue {
    pub fn from_json(field: &str, value: &Value, config: &ScoringConfig) -> Self {
        if config.is_missing(value) {
            return ExpectedValue::Missing;
        }
        if config.is_date_field(field) {
            return ExpectedValue::Date(render_json(value, &config.missing_sentinel));
        }
        match value {
            Value::Bool(b) => ExpectedValue::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ExpectedValue::Integer(i),
                None => match n.as_f64() {
                    Some(f) if f.is_nan() => ExpectedValue::Missing,
                    Some(f) => ExpectedValue::Float(f),
                    None => ExpectedValue::Text(n.to_string()),
                },
            },
            Value::String(s) => ExpectedValue::Text(s.clone()),
            other => ExpectedValue::Text(other.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ExpectedValue::Missing)
    }

    /// Literal string form used in result tables.
    pub fn render(&self, sentinel: &str) -> String {
        match self {
            ExpectedValue::Missing => sentinel.to_string(),
            ExpectedValue::Date(s) | ExpectedValue::Text(s) => s.clone(),
            ExpectedValue::Integer(i) => i.to_string(),
            ExpectedValue::Float(f) => render_float(*f),
            ExpectedValue::Boolean(b) => b.to_string(),
        }
    }
}

/// Expected field values for one sample, in source column order.
///
/// Identifier and input columns are dropped at construction, so every field
/// here is scored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundTruthRecord {
    fields: Vec<(String, ExpectedValue)>,
}

impl GroundTruthRecord {
    pub fn from_row(row: &Map<String, Value>, config: &ScoringConfig) -> Self {
        let fields = row
            .iter()
            .filter(|(column, _)| !config.is_excluded_column(column))
            .map(|(column, value)| {
                (column.clone(), ExpectedValue::from_json(column, value, config))
            })
            .collect();
        Self { fields }
    }

    pub fn from_fields(fields: Vec<(String, ExpectedValue)>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExpectedValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, field: &str) -> Option<&ExpectedValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// The gating field, matched by normalized name.
    pub fn gate<'a>(&'a self, config: &ScoringConfig) -> Option<(&'a str, &'a ExpectedValue)> {
        self.iter().find(|(name, _)| config.is_gate_field(name))
    }
}

/// Render a model-side JSON value the way it appears in result tables.
/// Strings are unquoted; `null` becomes the missing sentinel.
pub fn render_json(value: &Value, sentinel: &str) -> String {
    match value {
        Value::Null => sentinel.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) => render_float(f),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Whole floats keep one decimal so `100.0` stays distinguishable from `100`.
pub fn render_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}
