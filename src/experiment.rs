//! File-backed experiments: ground-truth tables and prompt templates.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data>/<experiment>.json                 {"family": "...", "samples": [ {row}, ... ]}
//! <data>/prompts/<family>/stage1.txt       optional override of the built-in template
//! <data>/prompts/<family>/stage2.txt
//! ```
//!
//! Each row carries an `input` column, an optional `sample_id` (defaults to
//! the 1-based row index) and the ground-truth fields.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ScoringConfig;
use crate::gateway::BatchAnswer;
use crate::prompts::{default_template, PromptStage, PromptTemplate};
use crate::scoring::{ExperimentFamily, GroundTruthRecord};

const EXPERIMENT_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("invalid experiment name: {0:?}")]
    InvalidName(String),
    #[error("experiment not found: {0}")]
    NotFound(String),
    #[error("sample {sample_id} not found in experiment {experiment}")]
    SampleNotFound { experiment: String, sample_id: u64 },
    #[error("malformed {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("experiment {experiment} row {row} is missing column {column}")]
    MissingColumn {
        experiment: String,
        row: usize,
        column: &'static str,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Data types
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub sample_id: u64,
    pub input: String,
    pub truth: GroundTruthRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleInput {
    pub sample_id: u64,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub name: String,
    pub family: ExperimentFamily,
    pub samples: Vec<Sample>,
}

impl Experiment {
    pub fn sample(&self, sample_id: u64) -> Result<&Sample, ExperimentError> {
        self.samples
            .iter()
            .find(|s| s.sample_id == sample_id)
            .ok_or_else(|| ExperimentError::SampleNotFound {
                experiment: self.name.clone(),
                sample_id,
            })
    }

    pub fn inputs(&self) -> Vec<SampleInput> {
        self.samples
            .iter()
            .map(|s| SampleInput {
                sample_id: s.sample_id,
                input: s.input.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ExperimentFile {
    family: String,
    samples: Vec<Map<String, Value>>,
}

// =============================================================================
// Sources
// =============================================================================

/// Supplies ground-truth tables by experiment name.
pub trait GroundTruthSource: Send + Sync {
    fn list(&self) -> Result<Vec<String>, ExperimentError>;
    fn load(&self, name: &str, config: &ScoringConfig) -> Result<Experiment, ExperimentError>;
}

/// Supplies the template for a family and stage.
pub trait PromptSource: Send + Sync {
    fn template(
        &self,
        family: ExperimentFamily,
        stage: PromptStage,
    ) -> Result<PromptTemplate, ExperimentError>;
}

/// Reads experiments and template overrides from a data directory.
#[derive(Debug, Clone)]
pub struct FileExperimentStore {
    root: PathBuf,
}

impl FileExperimentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, name: &str) -> Result<PathBuf, ExperimentError> {
        validate_name(name)?;
        let exact = self.root.join(format!("{name}.{EXPERIMENT_EXTENSION}"));
        if exact.is_file() {
            return Ok(exact);
        }
        let lowered = self
            .root
            .join(format!("{}.{EXPERIMENT_EXTENSION}", name.to_lowercase()));
        if lowered.is_file() {
            return Ok(lowered);
        }
        Err(ExperimentError::NotFound(name.to_string()))
    }
}

impl GroundTruthSource for FileExperimentStore {
    fn list(&self) -> Result<Vec<String>, ExperimentError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(EXPERIMENT_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn load(&self, name: &str, config: &ScoringConfig) -> Result<Experiment, ExperimentError> {
        let path = self.resolve_path(name)?;
        let text = std::fs::read_to_string(&path)?;
        let file: ExperimentFile =
            serde_json::from_str(&text).map_err(|e| ExperimentError::Malformed {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let family = file
            .family
            .parse::<ExperimentFamily>()
            .map_err(|message| ExperimentError::Malformed {
                path: path.clone(),
                message,
            })?;

        let mut samples = Vec::with_capacity(file.samples.len());
        let mut seen = HashSet::new();
        for (idx, row) in file.samples.iter().enumerate() {
            let sample = parse_row(name, idx, row, config, &path)?;
            if !seen.insert(sample.sample_id) {
                return Err(ExperimentError::Malformed {
                    path,
                    message: format!("duplicate sample_id {}", sample.sample_id),
                });
            }
            samples.push(sample);
        }

        tracing::debug!(experiment = name, samples = samples.len(), %family, "loaded experiment");
        Ok(Experiment {
            name: name.to_string(),
            family,
            samples,
        })
    }
}

impl PromptSource for FileExperimentStore {
    fn template(
        &self,
        family: ExperimentFamily,
        stage: PromptStage,
    ) -> Result<PromptTemplate, ExperimentError> {
        let path = self
            .root
            .join("prompts")
            .join(family.as_str())
            .join(format!("stage{}.txt", stage.index()));
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let slug = format!("{}_stage{}_file", family.as_str(), stage.index());
                Ok(PromptTemplate::new(slug, text))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(default_template(family, stage))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Built-in templates only.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPrompts;

impl PromptSource for DefaultPrompts {
    fn template(
        &self,
        family: ExperimentFamily,
        stage: PromptStage,
    ) -> Result<PromptTemplate, ExperimentError> {
        Ok(default_template(family, stage))
    }
}

/// Names are restricted so they can never escape the data directory.
pub fn validate_name(name: &str) -> Result<(), ExperimentError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ExperimentError::InvalidName(name.to_string()))
    }
}

fn parse_row(
    experiment: &str,
    idx: usize,
    row: &Map<String, Value>,
    config: &ScoringConfig,
    path: &Path,
) -> Result<Sample, ExperimentError> {
    let input = match row.get("input") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => {
            return Err(ExperimentError::MissingColumn {
                experiment: experiment.to_string(),
                row: idx + 1,
                column: "input",
            })
        }
    };

    let sample_id = match row.get("sample_id") {
        None | Some(Value::Null) => idx as u64 + 1,
        Some(value) => value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| ExperimentError::Malformed {
                path: path.to_path_buf(),
                message: format!("row {}: sample_id {value} is not a non-negative integer", idx + 1),
            })?,
    };

    Ok(Sample {
        sample_id,
        input,
        truth: GroundTruthRecord::from_row(row, config),
    })
}

// =============================================================================
// Recorded answers
// =============================================================================

/// Read a JSONL file of `{"sample_id": .., "answer": ".."}` lines.
/// Blank lines are skipped.
pub fn read_answers_jsonl(path: impl AsRef<Path>) -> Result<Vec<BatchAnswer>, ExperimentError> {
    let path = path.as_ref();
    let reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut answers = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let answer: BatchAnswer =
            serde_json::from_str(&line).map_err(|e| ExperimentError::Malformed {
                path: path.to_path_buf(),
                message: format!("line {}: {e}", idx + 1),
            })?;
        answers.push(answer);
    }
    Ok(answers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_restricted() {
        assert!(validate_name("pricing_models-v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../secrets").is_err());
        assert!(validate_name("a b").is_err());
    }

    #[test]
    fn row_defaults_sample_id_to_position() {
        let cfg = ScoringConfig::default();
        let row = serde_json::json!({"input": "text", "InstrumentType": "Cap"});
        let sample = parse_row("e", 2, row.as_object().unwrap(), &cfg, Path::new("e.json")).unwrap();
        assert_eq!(sample.sample_id, 3);
        assert_eq!(sample.truth.len(), 1);
    }

    #[test]
    fn row_without_input_is_rejected() {
        let cfg = ScoringConfig::default();
        let row = serde_json::json!({"InstrumentType": "Cap"});
        let err = parse_row("e", 0, row.as_object().unwrap(), &cfg, Path::new("e.json")).unwrap_err();
        assert!(matches!(err, ExperimentError::MissingColumn { column: "input", row: 1, .. }));
    }
}
