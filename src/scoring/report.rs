//! Public response shapes for sample and experiment results.
//!
//! Scores are rendered as percentage strings (`"25.0%"`); field values are
//! always literal strings.

use serde::{Deserialize, Serialize};

use super::scorer::{ExperimentResult, FieldResult, SampleResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleItem {
    pub field: String,
    pub model: String,
    pub correct: String,
    /// Percentage contribution, or an explanation when the field was not scored.
    pub score: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResponse {
    pub overall_sample_score: String,
    /// Raw final-stage answer.
    pub output: String,
    pub sample_data: Vec<SampleItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSample {
    pub sample_id: u64,
    #[serde(flatten)]
    pub result: SampleResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResponse {
    pub overall_experiment_score: String,
    pub experiment_data: Vec<ExperimentSample>,
}

impl From<&FieldResult> for SampleItem {
    fn from(field: &FieldResult) -> Self {
        let score = match field.outcome.label() {
            Some(label) => label.to_string(),
            None => format_percent(field.score * 100.0),
        };
        Self {
            field: field.field.clone(),
            model: field.model.clone(),
            correct: field.correct.clone(),
            score,
        }
    }
}

impl From<&SampleResult> for SampleResponse {
    fn from(sample: &SampleResult) -> Self {
        Self {
            overall_sample_score: format_percent(sample.total_score),
            output: sample.raw_answer.clone(),
            sample_data: sample.fields.iter().map(SampleItem::from).collect(),
        }
    }
}

impl From<&ExperimentResult> for ExperimentResponse {
    fn from(experiment: &ExperimentResult) -> Self {
        Self {
            overall_experiment_score: format_percent(experiment.aggregate_score),
            experiment_data: experiment
                .samples
                .iter()
                .map(|s| ExperimentSample {
                    sample_id: s.sample_id,
                    result: SampleResponse::from(s),
                })
                .collect(),
        }
    }
}

/// Two decimal places at most; whole values keep one (`"100.0%"`).
pub fn format_percent(value: f64) -> String {
    if !value.is_finite() {
        return "0.0%".to_string();
    }
    let rounded = (value * 100.0).round() / 100.0;
    if rounded == 0.0 {
        "0.0%".to_string()
    } else if rounded.fract() == 0.0 {
        format!("{rounded:.1}%")
    } else {
        format!("{rounded}%")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;
    use crate::scoring::scorer::score_answer;
    use crate::scoring::value::GroundTruthRecord;
    use serde_json::json;

    #[test]
    fn percent_formatting() {
        assert_eq!(format_percent(25.0), "25.0%");
        assert_eq!(format_percent(100.0), "100.0%");
        assert_eq!(format_percent(100.0 / 3.0), "33.33%");
        assert_eq!(format_percent(12.5), "12.5%");
        assert_eq!(format_percent(-0.0), "0.0%");
        assert_eq!(format_percent(f64::NAN), "0.0%");
    }

    #[test]
    fn sample_response_shape() {
        let cfg = ScoringConfig::default();
        let row = json!({"InstrumentType": "Swaption", "Strike": 0.03, "ExpiryDate": "2026-06-30", "Currency": "EUR"});
        let record = GroundTruthRecord::from_row(row.as_object().unwrap(), &cfg);
        let raw = r#"{"InstrumentType": "Swaption", "Strike": 0.03, "ExpiryDate": "2026-06-30", "Currency": "USD"}"#;
        let sample = score_answer(4, raw, &record, &cfg);

        let response = SampleResponse::from(&sample);
        assert_eq!(response.overall_sample_score, "75.0%");
        assert_eq!(response.output, raw);
        assert_eq!(response.sample_data[0].score, "25.0%");
        assert_eq!(response.sample_data[3].score, "0.0%");
        assert_eq!(response.sample_data[1].model, "0.03");

        let value = serde_json::to_value(&response).unwrap();
        assert!(value["sample_data"][0].get("correct").is_some());
    }

    #[test]
    fn mismatch_labels_replace_scores() {
        let cfg = ScoringConfig::default();
        let row = json!({"InstrumentType": "Cap", "Strike": 0.03});
        let record = GroundTruthRecord::from_row(row.as_object().unwrap(), &cfg);
        let sample = score_answer(1, r#"{"InstrumentType": "Floor", "Strike": 0.03}"#, &record, &cfg);
        let response = SampleResponse::from(&sample);
        assert_eq!(response.sample_data[0].score, "no score - mismatch");
        assert_eq!(response.sample_data[1].score, "instrument type mismatch");
        assert_eq!(response.overall_sample_score, "0.0%");
    }

    #[test]
    fn experiment_response_flattens_samples() {
        let experiment = ExperimentResult::from_samples(Vec::new());
        let response = ExperimentResponse::from(&experiment);
        assert_eq!(response.overall_experiment_score, "0.0%");

        let cfg = ScoringConfig::default();
        let row = json!({"Currency": "EUR"});
        let record = GroundTruthRecord::from_row(row.as_object().unwrap(), &cfg);
        let experiment = ExperimentResult::from_samples(vec![score_answer(
            9,
            r#"{"Currency": "eur"}"#,
            &record,
            &cfg,
        )]);
        let value = serde_json::to_value(ExperimentResponse::from(&experiment)).unwrap();
        assert_eq!(value["experiment_data"][0]["sample_id"], 9);
        assert_eq!(value["experiment_data"][0]["overall_sample_score"], "100.0%");
    }
}
