//! Process settings and the immutable scoring configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scoring::compare::Normalizer;
use crate::scoring::extract::ExtractionStrategy;
use crate::scoring::instrument::ExperimentFamily;

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding experiment files and prompt overrides.
    pub data_path: PathBuf,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Maximum in-flight provider calls per stage.
    pub concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data"),
            log_level: "info".to_string(),
            concurrency: 16,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        if let Some(path) = lookup("DATA_PATH") {
            settings.data_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            settings.log_level = level.to_lowercase();
        }
        if let Some(raw) = lookup("SCORING_CONCURRENCY") {
            settings.concurrency = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidValue {
                    key: "SCORING_CONCURRENCY",
                    value: raw,
                })?;
        }

        Ok(settings)
    }
}

// =============================================================================
// Scoring configuration
// =============================================================================

/// How the per-field share of the total score is assigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingPolicy {
    /// Every ground-truth field, the gate field included, is worth `1/N`.
    #[default]
    EqualIncludingGate,
    /// The gate field only gates; the other fields are worth `1/(N-1)` each.
    EqualExcludingGate,
}

const NONE_SYNONYMS: &[&str] = &[
    "",
    "-",
    "None",
    "none",
    "Null",
    "null",
    "NULL",
    "NaN",
    "nan",
    "N/A",
    "n/a",
    "NA",
    "Unknown",
    "unknown",
    "Not Specified",
    "Not specified",
    "not specified",
    "Not Applicable",
    "Not applicable",
];

/// Everything the scorer, comparator and resolver consult. Built once and
/// shared read-only.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Case-sensitive strings treated as "no value".
    pub none_synonyms: Vec<String>,
    pub normalizer: Normalizer,
    /// Field names ending with this (after normalization) compare as dates.
    pub date_suffix: String,
    /// Field whose correctness gates every other field.
    pub gate_field: String,
    /// Columns present in experiment rows that are not ground truth.
    pub excluded_columns: Vec<String>,
    /// Rendered in place of a missing value.
    pub missing_sentinel: String,
    pub extraction: ExtractionStrategy,
    pub weighting: WeightingPolicy,
    pub vocabularies: HashMap<ExperimentFamily, Vec<String>>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let vocabularies = ExperimentFamily::ALL
            .iter()
            .map(|f| {
                let terms = f.default_vocabulary().iter().map(|t| t.to_string()).collect();
                (*f, terms)
            })
            .collect();

        Self {
            none_synonyms: NONE_SYNONYMS.iter().map(|s| s.to_string()).collect(),
            normalizer: Normalizer::new(),
            date_suffix: "date".to_string(),
            gate_field: "instrument_type".to_string(),
            excluded_columns: vec!["input".to_string(), "sample_id".to_string()],
            missing_sentinel: "None".to_string(),
            extraction: ExtractionStrategy::default(),
            weighting: WeightingPolicy::default(),
            vocabularies,
        }
    }
}

impl ScoringConfig {
    pub fn with_extraction(mut self, extraction: ExtractionStrategy) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn with_weighting(mut self, weighting: WeightingPolicy) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn with_vocabulary(mut self, family: ExperimentFamily, terms: Vec<String>) -> Self {
        self.vocabularies.insert(family, terms);
        self
    }

    pub fn vocabulary(&self, family: ExperimentFamily) -> &[String] {
        self.vocabularies
            .get(&family)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_missing_str(&self, s: &str) -> bool {
        let trimmed = s.trim();
        self.none_synonyms.iter().any(|syn| syn == trimmed)
    }

    pub fn is_missing(&self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::String(s) => self.is_missing_str(s),
            Value::Number(n) => n.as_f64().is_some_and(f64::is_nan),
            _ => false,
        }
    }

    /// The date suffix must start a word: `maturity_date`, `Maturity Date`,
    /// `MaturityDate` and `date` qualify, `Update` and `Candidate` do not.
    pub fn is_date_field(&self, field: &str) -> bool {
        let field = field.trim();
        let suffix = self.date_suffix.trim();
        if suffix.is_empty() || field.len() < suffix.len() {
            return false;
        }
        let split = field.len() - suffix.len();
        if !field.is_char_boundary(split) {
            return false;
        }
        let (head, tail) = field.split_at(split);
        if !tail.eq_ignore_ascii_case(suffix) {
            return false;
        }
        match head.chars().last() {
            None => true,
            Some(c) if c.is_whitespace() || c == '_' || c == '-' => true,
            Some(c) => !c.is_uppercase() && tail.starts_with(char::is_uppercase),
        }
    }

    pub fn is_gate_field(&self, field: &str) -> bool {
        self.normalizer.matches(field, &self.gate_field)
    }

    pub fn is_excluded_column(&self, column: &str) -> bool {
        self.excluded_columns
            .iter()
            .any(|c| self.normalizer.matches(c, column))
    }
}
