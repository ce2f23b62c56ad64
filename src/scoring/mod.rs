//! Answer scoring engine.
//!
//! Pure, synchronous functions: extract the JSON object from a raw answer,
//! compare its fields to a ground-truth record, gate on the instrument type,
//! and aggregate into percentage scores.

pub mod compare;
pub mod extract;
pub mod instrument;
pub mod report;
pub mod scorer;
pub mod value;

pub use compare::{compare, Normalizer};
pub use extract::{extract_answer, Extraction, ExtractionStrategy, ParsedAnswer};
pub use instrument::{resolve_instrument_type, similarity_ratio, ExperimentFamily};
pub use report::{format_percent, ExperimentResponse, ExperimentSample, SampleItem, SampleResponse};
pub use scorer::{
    score_answer, score_extraction, ExperimentResult, FieldOutcome, FieldResult, SampleResult,
};
pub use value::{ExpectedValue, GroundTruthRecord};
