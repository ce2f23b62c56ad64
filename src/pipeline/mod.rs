//! Two-stage prompt pipeline with one-shot JSON repair.
//!
//! Each sample walks a small state machine:
//!
//! ```text
//! Stage1Run -> Stage1Parse -> ok? Stage2PromptBuild : Stage1Repair -> Stage1Parse
//! Stage2PromptBuild -> Stage2Run -> Stage2Parse -> ok? Done : Stage2Repair -> Done
//! ```
//!
//! Provider calls happen only in the `*Run` and `*Repair` stages, and each
//! repair is issued at most once, so a sample makes at most four calls.
//!
//! Across a batch, the driver always issues the earliest pending call stage
//! for every sample waiting at it, so all of stage 1 (repairs included)
//! finishes before any stage-2 call starts.

pub mod trace;

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::experiment::{Experiment, ExperimentError, PromptSource, Sample};
use crate::gateway::{
    validate_request, AnswerSource, BatchAnswer, BatchItem, CatalogError, ChatModel,
    SamplingParams,
};
use crate::prompts::{
    repair_template, PromptStage, PromptTemplate, INPUT_PLACEHOLDER, STAGE1_ANSWER_PLACEHOLDER,
};
use crate::scoring::scorer::{answer_value, has_any_value};
use crate::scoring::value::render_json;
use crate::scoring::{
    extract_answer, resolve_instrument_type, score_answer, ExperimentFamily, ExperimentResult,
    ParsedAnswer, SampleResult,
};
use trace::{now_epoch_ms, CallTrace, TraceError, TraceSink};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Experiment(#[from] ExperimentError),
    #[error(transparent)]
    Validation(#[from] CatalogError),
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stage1Run,
    Stage1Parse,
    Stage1Repair,
    Stage2PromptBuild,
    Stage2Run,
    Stage2Parse,
    Stage2Repair,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageIndex {
    Stage1,
    Stage2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Initial,
    Repair,
}

impl Stage {
    /// `json_ok` is read only by parse stages; `repaired` is whether the
    /// current stage already spent its repair call.
    pub fn next(self, json_ok: bool, repaired: bool) -> Stage {
        match self {
            Stage::Stage1Run => Stage::Stage1Parse,
            Stage::Stage1Parse if json_ok || repaired => Stage::Stage2PromptBuild,
            Stage::Stage1Parse => Stage::Stage1Repair,
            Stage::Stage1Repair => Stage::Stage1Parse,
            Stage::Stage2PromptBuild => Stage::Stage2Run,
            Stage::Stage2Run => Stage::Stage2Parse,
            Stage::Stage2Parse if json_ok || repaired => Stage::Done,
            Stage::Stage2Parse => Stage::Stage2Repair,
            Stage::Stage2Repair => Stage::Done,
            Stage::Done => Stage::Done,
        }
    }

    /// The provider call made in this stage, if any.
    pub fn provider_call(self) -> Option<(StageIndex, CallKind)> {
        match self {
            Stage::Stage1Run => Some((StageIndex::Stage1, CallKind::Initial)),
            Stage::Stage1Repair => Some((StageIndex::Stage1, CallKind::Repair)),
            Stage::Stage2Run => Some((StageIndex::Stage2, CallKind::Initial)),
            Stage::Stage2Repair => Some((StageIndex::Stage2, CallKind::Repair)),
            _ => None,
        }
    }
}

// =============================================================================
// Per-sample state
// =============================================================================

/// What happened to one sample on its way through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct SampleTranscript {
    pub sample_id: u64,
    pub stage1_answer: String,
    pub stage2_prompt: String,
    pub final_answer: String,
    pub provider_calls: u8,
    pub repairs: u8,
}

struct SampleRun<'s> {
    sample: &'s Sample,
    stage: Stage,
    repaired: bool,
    stage1_answer: String,
    stage1_parsed: Option<ParsedAnswer>,
    stage2_prompt: String,
    final_answer: String,
    provider_calls: u8,
    repairs: u8,
    dropped: bool,
}

struct Templates {
    family: ExperimentFamily,
    stage1: PromptTemplate,
    stage2: PromptTemplate,
    repair: PromptTemplate,
}

impl Templates {
    fn for_call(&self, call: (StageIndex, CallKind)) -> &PromptTemplate {
        match call {
            (_, CallKind::Repair) => &self.repair,
            (StageIndex::Stage1, CallKind::Initial) => &self.stage1,
            (StageIndex::Stage2, CallKind::Initial) => &self.stage2,
        }
    }
}

impl<'s> SampleRun<'s> {
    fn new(sample: &'s Sample) -> Self {
        Self {
            sample,
            stage: Stage::Stage1Run,
            repaired: false,
            stage1_answer: String::new(),
            stage1_parsed: None,
            stage2_prompt: String::new(),
            final_answer: String::new(),
            provider_calls: 0,
            repairs: 0,
            dropped: false,
        }
    }

    fn is_active(&self) -> bool {
        !self.dropped && self.stage != Stage::Done
    }

    /// Run synchronous stages until the sample waits on a provider call or
    /// is done.
    fn advance(&mut self, templates: &Templates, config: &ScoringConfig) {
        while self.is_active() && self.stage.provider_call().is_none() {
            let sample_id = self.sample.sample_id;
            self.stage = match self.stage {
                Stage::Stage1Parse => {
                    let extraction = extract_answer(&self.stage1_answer, config.extraction);
                    let json_ok = extraction
                        .parsed()
                        .is_some_and(|p| has_any_value(p, None, config));
                    if !json_ok && !self.repaired {
                        tracing::debug!(sample_id, "stage-1 answer has no usable JSON, repairing");
                    }
                    self.stage1_parsed = extraction.parsed().cloned();
                    self.stage.next(json_ok, self.repaired)
                }
                Stage::Stage2PromptBuild => {
                    self.stage2_prompt = build_stage2_prompt(
                        &templates.stage2,
                        &self.stage1_answer,
                        self.stage1_parsed.as_ref(),
                        templates.family,
                        config,
                    );
                    self.repaired = false;
                    self.stage.next(false, false)
                }
                Stage::Stage2Parse => {
                    let extraction = extract_answer(&self.final_answer, config.extraction);
                    let json_ok = extraction
                        .parsed()
                        .is_some_and(|p| has_any_value(p, Some(&self.sample.truth), config));
                    if !json_ok && !self.repaired {
                        tracing::debug!(sample_id, "stage-2 answer has no usable JSON, repairing");
                    }
                    self.stage.next(json_ok, self.repaired)
                }
                other => other.next(false, self.repaired),
            };
        }
    }

    /// Prompt and context for the call this sample is waiting on.
    fn batch_item(
        &self,
        template: &PromptTemplate,
        options: &PipelineOptions,
        caller: &'static str,
    ) -> BatchItem {
        let (prompt, context) = match self.stage {
            Stage::Stage1Run => (template.text().to_string(), self.sample.input.clone()),
            Stage::Stage1Repair => (template.text().to_string(), self.stage1_answer.clone()),
            Stage::Stage2Run => (self.stage2_prompt.clone(), self.sample.input.clone()),
            _ => (template.text().to_string(), self.final_answer.clone()),
        };
        BatchItem {
            sample_id: self.sample.sample_id,
            prompt,
            context,
            model: options.model.clone(),
            sampling: options.sampling,
            caller,
        }
    }

    fn apply_answer(&mut self, answer: String) {
        let Some((stage_index, kind)) = self.stage.provider_call() else {
            return;
        };
        if kind == CallKind::Repair {
            self.repaired = true;
            self.repairs += 1;
        }
        match stage_index {
            StageIndex::Stage1 => self.stage1_answer = answer,
            StageIndex::Stage2 => self.final_answer = answer,
        }
        self.provider_calls += 1;
        self.stage = self.stage.next(false, self.repaired);
    }

    fn transcript(&self) -> SampleTranscript {
        SampleTranscript {
            sample_id: self.sample.sample_id,
            stage1_answer: self.stage1_answer.clone(),
            stage2_prompt: self.stage2_prompt.clone(),
            final_answer: self.final_answer.clone(),
            provider_calls: self.provider_calls,
            repairs: self.repairs,
        }
    }
}

/// Fill the stage-2 template from stage-1 output.
///
/// `{input}` is left for question building. `{stage1_answer}` gets the literal
/// stage-1 text. Every other placeholder takes the matching stage-1 field,
/// or the missing sentinel; the gate field always goes through the
/// instrument resolver.
pub fn build_stage2_prompt(
    template: &PromptTemplate,
    stage1_answer: &str,
    stage1: Option<&ParsedAnswer>,
    family: ExperimentFamily,
    config: &ScoringConfig,
) -> String {
    let sentinel = &config.missing_sentinel;
    let mut values = HashMap::new();

    for name in template.placeholders() {
        if name == INPUT_PLACEHOLDER {
            continue;
        }
        if name == STAGE1_ANSWER_PLACEHOLDER {
            values.insert(name.to_string(), stage1_answer.to_string());
            continue;
        }

        let raw = stage1
            .and_then(|parsed| answer_value(parsed, name, config))
            .filter(|v| !config.is_missing(v))
            .map(|v| render_json(v, sentinel));

        let value = if config.is_gate_field(name) {
            resolve_instrument_type(
                raw.as_deref().unwrap_or(""),
                stage1_answer,
                config.vocabulary(family),
                &config.normalizer,
            )
        } else {
            raw.unwrap_or_else(|| sentinel.clone())
        };
        values.insert(name.to_string(), value);
    }

    template.render(&values)
}

// =============================================================================
// Driver
// =============================================================================

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub model: ChatModel,
    pub sampling: SamplingParams,
    pub run_id: Uuid,
}

impl PipelineOptions {
    pub fn new(model: ChatModel, sampling: SamplingParams) -> Self {
        Self {
            model,
            sampling,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        validate_request(self.model.provider, self.model.model_id(), &self.sampling)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub run_id: Uuid,
    pub result: ExperimentResult,
    pub transcripts: Vec<SampleTranscript>,
}

pub struct Pipeline<'a> {
    source: &'a dyn AnswerSource,
    prompts: &'a dyn PromptSource,
    config: &'a ScoringConfig,
    trace: Option<&'a dyn TraceSink>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        source: &'a dyn AnswerSource,
        prompts: &'a dyn PromptSource,
        config: &'a ScoringConfig,
    ) -> Self {
        Self {
            source,
            prompts,
            config,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: &'a dyn TraceSink) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Run one sample through both stages and score it.
    pub async fn run_sample(
        &self,
        experiment: &Experiment,
        sample_id: u64,
        options: &PipelineOptions,
    ) -> Result<PipelineOutput, PipelineError> {
        let sample = experiment.sample(sample_id)?.clone();
        let single = Experiment {
            name: experiment.name.clone(),
            family: experiment.family,
            samples: vec![sample],
        };
        self.run_experiment(&single, options).await
    }

    /// Run every sample through both stages, one stage barrier at a time,
    /// and score the final answers.
    pub async fn run_experiment(
        &self,
        experiment: &Experiment,
        options: &PipelineOptions,
    ) -> Result<PipelineOutput, PipelineError> {
        options.validate()?;

        let family = experiment.family;
        let templates = Templates {
            family,
            stage1: self.prompts.template(family, PromptStage::Extraction)?,
            stage2: self.prompts.template(family, PromptStage::Refinement)?,
            repair: repair_template(),
        };

        let mut runs: Vec<SampleRun<'_>> = experiment.samples.iter().map(SampleRun::new).collect();

        loop {
            for run in runs.iter_mut() {
                run.advance(&templates, self.config);
            }

            let Some(stage) = runs
                .iter()
                .filter(|r| r.is_active())
                .map(|r| r.stage)
                .min()
            else {
                break;
            };
            let Some(call) = stage.provider_call() else {
                break;
            };
            let template = templates.for_call(call);
            let caller = caller_for(call);

            let items: Vec<BatchItem> = runs
                .iter()
                .filter(|r| r.is_active() && r.stage == stage)
                .map(|r| r.batch_item(template, options, caller))
                .collect();

            tracing::info!(
                experiment = %experiment.name,
                ?stage,
                samples = items.len(),
                "issuing provider batch"
            );

            let answers = self.source.run(items).await;
            let mut by_id: HashMap<u64, String> = answers
                .into_iter()
                .map(|a| (a.sample_id, a.answer))
                .collect();

            for run in runs.iter_mut().filter(|r| r.is_active() && r.stage == stage) {
                let sample_id = run.sample.sample_id;
                match by_id.remove(&sample_id) {
                    Some(answer) => {
                        if let Some(trace) = self.trace {
                            trace.record(self.call_trace(
                                experiment, options, run, call, template, &answer,
                            ))?;
                        }
                        run.apply_answer(answer);
                    }
                    None => {
                        tracing::warn!(sample_id, ?stage, "no answer returned; dropping sample");
                        run.dropped = true;
                    }
                }
            }
        }

        let samples: Vec<SampleResult> = runs
            .iter()
            .filter(|r| !r.dropped)
            .map(|r| {
                score_answer(
                    r.sample.sample_id,
                    &r.final_answer,
                    &r.sample.truth,
                    self.config,
                )
            })
            .collect();
        let transcripts = runs
            .iter()
            .filter(|r| !r.dropped)
            .map(SampleRun::transcript)
            .collect();

        let result = ExperimentResult::from_samples(samples);
        tracing::info!(
            experiment = %experiment.name,
            run_id = %options.run_id,
            samples = result.samples.len(),
            aggregate = result.aggregate_score,
            "pipeline finished"
        );

        Ok(PipelineOutput {
            run_id: options.run_id,
            result,
            transcripts,
        })
    }

    /// Send one prompt for every sample in a single call and score the answers.
    pub async fn run_single_stage(
        &self,
        experiment: &Experiment,
        prompt: &str,
        options: &PipelineOptions,
    ) -> Result<ExperimentResult, PipelineError> {
        options.validate()?;
        let items = experiment
            .samples
            .iter()
            .map(|s| BatchItem {
                sample_id: s.sample_id,
                prompt: prompt.to_string(),
                context: s.input.clone(),
                model: options.model.clone(),
                sampling: options.sampling,
                caller: "pipeline::single_stage",
            })
            .collect();
        let answers = self.source.run(items).await;
        Ok(score_answers(experiment, &answers, self.config))
    }

    fn call_trace(
        &self,
        experiment: &Experiment,
        options: &PipelineOptions,
        run: &SampleRun<'_>,
        call: (StageIndex, CallKind),
        template: &PromptTemplate,
        answer: &str,
    ) -> CallTrace {
        let extraction = extract_answer(answer, self.config.extraction);
        let truth = match call.0 {
            StageIndex::Stage1 => None,
            StageIndex::Stage2 => Some(&run.sample.truth),
        };
        let json_ok = extraction
            .parsed()
            .is_some_and(|p| has_any_value(p, truth, self.config));
        CallTrace {
            timestamp_ms: now_epoch_ms(),
            run_id: options.run_id,
            experiment: experiment.name.clone(),
            sample_id: run.sample.sample_id,
            stage: call.0,
            call: call.1,
            template_slug: template.slug().to_string(),
            template_hash: template.hash(),
            model: options.model.model_id().to_string(),
            answer_chars: answer.chars().count(),
            extraction_failure: extraction.failure_reason(),
            json_ok,
        }
    }
}

fn caller_for(call: (StageIndex, CallKind)) -> &'static str {
    match call {
        (StageIndex::Stage1, CallKind::Initial) => "pipeline::stage1",
        (StageIndex::Stage1, CallKind::Repair) => "pipeline::stage1_repair",
        (StageIndex::Stage2, CallKind::Initial) => "pipeline::stage2",
        (StageIndex::Stage2, CallKind::Repair) => "pipeline::stage2_repair",
    }
}

/// Score recorded answers against an experiment without calling a provider.
/// Samples with no answer are dropped; output follows experiment order.
pub fn score_answers(
    experiment: &Experiment,
    answers: &[BatchAnswer],
    config: &ScoringConfig,
) -> ExperimentResult {
    let by_id: HashMap<u64, &str> = answers
        .iter()
        .map(|a| (a.sample_id, a.answer.as_str()))
        .collect();

    let samples = experiment
        .samples
        .iter()
        .filter_map(|sample| {
            let answer = by_id.get(&sample.sample_id)?;
            Some(score_answer(sample.sample_id, answer, &sample.truth, config))
        })
        .collect();
    ExperimentResult::from_samples(samples)
}
