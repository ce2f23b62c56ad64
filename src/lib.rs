#![forbid(unsafe_code)]

//! # scoring-harness
//!
//! Scores free-text LLM answers against a ground-truth table.
//!
//! A provider answer is mined for its embedded JSON object, each field is
//! compared to the expected value with type-aware soft equality, and the
//! instrument-type field gates whether anything else counts. A two-stage
//! prompt pipeline produces the answers, repairing non-JSON output with one
//! extra call per stage at most.

pub mod config;
pub mod experiment;
pub mod gateway;
pub mod pipeline;
pub mod prompts;
pub mod scoring;

pub use config::{ScoringConfig, Settings, WeightingPolicy};
pub use experiment::{Experiment, ExperimentError, FileExperimentStore, GroundTruthSource, PromptSource};
pub use gateway::{AnswerSource, ChatGateway, GatewayBatchRunner, ProviderGateway, UsageSink};
pub use pipeline::trace::{CallTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
pub use pipeline::{score_answers, Pipeline, PipelineError, PipelineOptions, PipelineOutput};
pub use scoring::{
    compare, extract_answer, resolve_instrument_type, score_answer, ExperimentResponse,
    ExperimentResult, GroundTruthRecord, SampleResponse, SampleResult,
};
