//! Per-sample scoring with instrument-type gating, and experiment aggregation.

use serde::Serialize;
use serde_json::Value;

use super::compare::compare;
use super::extract::{extract_answer, Extraction, ParsedAnswer};
use super::value::{render_json, GroundTruthRecord};
use crate::config::{ScoringConfig, WeightingPolicy};

/// Model-column placeholder when the answer had no JSON object.
pub const NOT_FOUND_PLACEHOLDER: &str = "None";
/// Model-column placeholder when the JSON object did not decode.
pub const MALFORMED_PLACEHOLDER: &str = "Malformed JSON";

/// Why a field received the score it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOutcome {
    /// Compared normally; `matched` holds the result.
    Scored,
    /// Extraction found no braces.
    NotFound,
    /// Extraction found a span that was not a JSON object.
    MalformedJson,
    /// This is the gate field and it did not match.
    GateMismatch,
    /// Another field, unscored because the gate did not match.
    InstrumentTypeMismatch,
}

impl FieldOutcome {
    /// Table label replacing the numeric score, if any.
    pub fn label(&self) -> Option<&'static str> {
        match self {
            FieldOutcome::Scored => None,
            FieldOutcome::NotFound => Some("not found"),
            FieldOutcome::MalformedJson => Some("malformed JSON"),
            FieldOutcome::GateMismatch => Some("no score - mismatch"),
            FieldOutcome::InstrumentTypeMismatch => Some("instrument type mismatch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldResult {
    pub field: String,
    /// Model value as rendered text, or a placeholder.
    pub model: String,
    /// Ground-truth value as rendered text.
    pub correct: String,
    pub matched: bool,
    /// Share of the total in `[0, 1]`.
    pub score: f64,
    pub outcome: FieldOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleResult {
    pub sample_id: u64,
    /// Percentage in `[0, 100]`.
    pub total_score: f64,
    pub raw_answer: String,
    /// `no-braces` or `malformed-json` when extraction failed.
    pub extraction_failure: Option<&'static str>,
    pub fields: Vec<FieldResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentResult {
    /// Mean of per-sample totals; `0.0` when there are no samples.
    pub aggregate_score: f64,
    pub samples: Vec<SampleResult>,
}

impl ExperimentResult {
    pub fn from_samples(samples: Vec<SampleResult>) -> Self {
        let aggregate_score = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|s| s.total_score).sum::<f64>() / samples.len() as f64
        };
        Self {
            aggregate_score,
            samples,
        }
    }
}

/// Extract the answer object from `raw_answer` and score it.
pub fn score_answer(
    sample_id: u64,
    raw_answer: &str,
    record: &GroundTruthRecord,
    config: &ScoringConfig,
) -> SampleResult {
    let extraction = extract_answer(raw_answer, config.extraction);
    score_extraction(sample_id, raw_answer, &extraction, record, config)
}

/// Score an already-extracted answer. One `FieldResult` per record field,
/// in record order, whatever the extraction outcome.
pub fn score_extraction(
    sample_id: u64,
    raw_answer: &str,
    extraction: &Extraction,
    record: &GroundTruthRecord,
    config: &ScoringConfig,
) -> SampleResult {
    let sentinel = &config.missing_sentinel;

    let parsed = match extraction {
        Extraction::Parsed(map) => map,
        failed => {
            let (model, outcome) = match failed {
                Extraction::Malformed(reason) => {
                    tracing::debug!(sample_id, %reason, "answer JSON did not decode");
                    (MALFORMED_PLACEHOLDER, FieldOutcome::MalformedJson)
                }
                _ => (NOT_FOUND_PLACEHOLDER, FieldOutcome::NotFound),
            };
            let fields = record
                .iter()
                .map(|(field, expected)| FieldResult {
                    field: field.to_string(),
                    model: model.to_string(),
                    correct: expected.render(sentinel),
                    matched: false,
                    score: 0.0,
                    outcome,
                })
                .collect();
            return SampleResult {
                sample_id,
                total_score: 0.0,
                raw_answer: raw_answer.to_string(),
                extraction_failure: failed.failure_reason(),
                fields,
            };
        }
    };

    let gate = record.gate(config);
    let gate_matches = gate.map_or(true, |(field, expected)| {
        let model = lookup(parsed, field, config)
            .map(|v| render_json(v, sentinel))
            .unwrap_or_else(|| sentinel.clone());
        config.normalizer.matches(&model, &expected.render(sentinel))
    });

    let weights = Weights::new(record, gate.is_some(), config.weighting);
    let mut fields = Vec::with_capacity(record.len());
    let mut total = 0.0;

    for (field, expected) in record.iter() {
        let is_gate = gate.is_some_and(|(g, _)| g == field);
        let model_value = lookup(parsed, field, config);
        let model = model_value
            .map(|v| render_json(v, sentinel))
            .unwrap_or_else(|| sentinel.clone());
        let correct_text = expected.render(sentinel);

        let (matched, score, outcome) = if !gate_matches {
            let outcome = if is_gate {
                FieldOutcome::GateMismatch
            } else {
                FieldOutcome::InstrumentTypeMismatch
            };
            (false, 0.0, outcome)
        } else if is_gate {
            (true, weights.gate, FieldOutcome::Scored)
        } else {
            let equal = compare(model_value, expected, field, config);
            let score = if equal { weights.item } else { 0.0 };
            (equal, score, FieldOutcome::Scored)
        };

        total += score;
        fields.push(FieldResult {
            field: field.to_string(),
            model,
            correct: correct_text,
            matched,
            score,
            outcome,
        });
    }

    SampleResult {
        sample_id,
        total_score: 100.0 * total,
        raw_answer: raw_answer.to_string(),
        extraction_failure: None,
        fields,
    }
}

/// Per-field shares under a weighting policy.
struct Weights {
    gate: f64,
    item: f64,
}

impl Weights {
    fn new(record: &GroundTruthRecord, has_gate: bool, policy: WeightingPolicy) -> Self {
        let n = record.len().max(1) as f64;
        match policy {
            WeightingPolicy::EqualIncludingGate => Self {
                gate: 1.0 / n,
                item: 1.0 / n,
            },
            WeightingPolicy::EqualExcludingGate if has_gate && record.len() > 1 => Self {
                gate: 0.0,
                item: 1.0 / (n - 1.0),
            },
            WeightingPolicy::EqualExcludingGate => Self {
                gate: 1.0 / n,
                item: 1.0 / n,
            },
        }
    }
}

/// Find a field in the model answer: exact key first, then normalized key.
fn lookup<'a>(parsed: &'a ParsedAnswer, field: &str, config: &ScoringConfig) -> Option<&'a Value> {
    parsed.get(field).or_else(|| {
        let wanted = config.normalizer.normalize(field);
        parsed
            .iter()
            .find(|(key, _)| config.normalizer.normalize(key) == wanted)
            .map(|(_, value)| value)
    })
}

/// Whether a parsed answer carries at least one non-missing value, either
/// among `fields` or, when `fields` is `None`, anywhere in the object.
pub fn has_any_value(
    parsed: &ParsedAnswer,
    fields: Option<&GroundTruthRecord>,
    config: &ScoringConfig,
) -> bool {
    match fields {
        Some(record) => record
            .field_names()
            .any(|f| lookup(parsed, f, config).is_some_and(|v| !config.is_missing(v))),
        None => parsed.values().any(|v| !config.is_missing(v)),
    }
}

/// Value of `field` in a parsed answer using the same key matching as scoring.
pub fn answer_value<'a>(
    parsed: &'a ParsedAnswer,
    field: &str,
    config: &ScoringConfig,
) -> Option<&'a Value> {
    lookup(parsed, field, config)
}
