use std::sync::{Arc, Mutex};

use scoring_harness::experiment::{DefaultPrompts, Experiment, Sample};
use scoring_harness::gateway::{
    AnswerSource, BatchAnswer, BatchItem, ChatGateway, ChatModel, ChatRequest, ChatResponse,
    GatewayBatchRunner, ProviderError, ProviderKind, SamplingParams,
};
use scoring_harness::pipeline::{score_answers, Pipeline, PipelineError, PipelineOptions};
use scoring_harness::scoring::{FieldOutcome, GroundTruthRecord, SampleResponse};
use scoring_harness::{JsonlTraceSink, ScoringConfig};
use serde_json::json;
use tempfile::tempdir;

type Script = dyn Fn(u64, &'static str) -> Result<String, ProviderError> + Send + Sync;

/// Answers from a script keyed by sample id and caller, logging every call.
struct ScriptedGateway {
    script: Box<Script>,
    log: Mutex<Vec<(u64, &'static str, String)>>,
}

impl ScriptedGateway {
    fn new(script: impl Fn(u64, &'static str) -> Result<String, ProviderError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            log: Mutex::new(Vec::new()),
        })
    }

    fn calls_for(&self, sample_id: u64) -> Vec<&'static str> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == sample_id)
            .map(|(_, caller, _)| *caller)
            .collect()
    }

    fn prompt_for(&self, sample_id: u64, caller: &str) -> Option<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .find(|(id, c, _)| *id == sample_id && *c == caller)
            .map(|(_, _, prompt)| prompt.clone())
    }
}

#[async_trait::async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let sample_id = req.attribution.sample_id.unwrap_or_default();
        let caller = req.attribution.caller;
        self.log
            .lock()
            .unwrap()
            .push((sample_id, caller, req.messages[0].content.clone()));
        (self.script)(sample_id, caller).map(ChatResponse::text)
    }
}

fn truth() -> GroundTruthRecord {
    let row = json!({
        "InstrumentType": "EuropeanOption",
        "Strike": 100,
        "MaturityDate": "2025-01-01"
    });
    GroundTruthRecord::from_row(row.as_object().unwrap(), &ScoringConfig::default())
}

fn experiment(ids: &[u64]) -> Experiment {
    Experiment {
        name: "pricing_models".to_string(),
        family: scoring_harness::scoring::ExperimentFamily::PricingModels,
        samples: ids
            .iter()
            .map(|&sample_id| Sample {
                sample_id,
                input: format!("Trade {sample_id}: buy a European call on SPX, strike 100, expiring 1 Jan 2025."),
                truth: truth(),
            })
            .collect(),
    }
}

fn options() -> PipelineOptions {
    PipelineOptions::new(
        ChatModel::new(ProviderKind::OpenAi, "gpt-4"),
        SamplingParams {
            temperature: Some(0.2),
            ..Default::default()
        },
    )
}

const CORRECT: &str = r#"{"InstrumentType": "EuropeanOption", "Strike": 100, "MaturityDate": "2025-01-01"}"#;
const NOISY_CORRECT: &str = r#"noise {"InstrumentType":"european-option","Strike":"100.00000","MaturityDate":"Jan 1, 2025"} noise"#;

/// Sample 1 needs a stage-1 repair that also fails to produce JSON but
/// names a different instrument, sample 2 is clean, sample 3's provider
/// always errors.
fn mixed_script(sample_id: u64, caller: &'static str) -> Result<String, ProviderError> {
    match (sample_id, caller) {
        (1, "pipeline::stage1") => Ok("I think it's a European option.".to_string()),
        (1, "pipeline::stage1_repair") => {
            Ok("Sorry, still no JSON, but on reflection it is a barrier option.".to_string())
        }
        (1, "pipeline::stage2") => Ok(CORRECT.to_string()),
        (2, "pipeline::stage1") => Ok(r#"{"InstrumentType": "european option", "Strike": 100}"#.to_string()),
        (2, "pipeline::stage2") => Ok(NOISY_CORRECT.to_string()),
        (3, _) => Err(ProviderError::upstream(ProviderKind::Fireworks, "bad key", false)),
        other => panic!("unexpected call {other:?}"),
    }
}

#[tokio::test]
async fn repair_bound_and_scores_per_sample() {
    let gateway = ScriptedGateway::new(mixed_script);
    let runner = GatewayBatchRunner::new(gateway.clone(), 8);
    let config = ScoringConfig::default();
    let pipeline = Pipeline::new(&runner, &DefaultPrompts, &config);

    let output = pipeline
        .run_experiment(&experiment(&[1, 2, 3]), &options())
        .await
        .unwrap();

    assert_eq!(
        gateway.calls_for(1),
        ["pipeline::stage1", "pipeline::stage1_repair", "pipeline::stage2"]
    );
    assert_eq!(gateway.calls_for(2), ["pipeline::stage1", "pipeline::stage2"]);
    assert_eq!(gateway.calls_for(3).len(), 4);

    let totals: Vec<(u64, f64)> = output
        .result
        .samples
        .iter()
        .map(|s| (s.sample_id, s.total_score))
        .collect();
    assert_eq!(totals.len(), 3);
    assert_eq!(totals[0].0, 1);
    assert!((totals[0].1 - 100.0).abs() < 1e-9);
    assert!((totals[1].1 - 100.0).abs() < 1e-9);
    assert_eq!(totals[2].1, 0.0);
    assert!((output.result.aggregate_score - 200.0 / 3.0).abs() < 1e-9);

    let failed = &output.result.samples[2];
    assert!(failed.raw_answer.starts_with("An error has occurred: "));
    assert!(failed.fields.iter().all(|f| f.outcome == FieldOutcome::NotFound));

    let transcript = &output.transcripts[0];
    assert_eq!(transcript.provider_calls, 3);
    assert_eq!(transcript.repairs, 1);
}

#[tokio::test]
async fn stage_one_finishes_for_every_sample_before_stage_two() {
    let gateway = ScriptedGateway::new(mixed_script);
    let runner = GatewayBatchRunner::new(gateway.clone(), 8);
    let config = ScoringConfig::default();
    Pipeline::new(&runner, &DefaultPrompts, &config)
        .run_experiment(&experiment(&[1, 2, 3]), &options())
        .await
        .unwrap();

    let log = gateway.log.lock().unwrap();
    let last_stage1 = log
        .iter()
        .rposition(|(_, caller, _)| caller.starts_with("pipeline::stage1"))
        .unwrap();
    let first_stage2 = log
        .iter()
        .position(|(_, caller, _)| caller.starts_with("pipeline::stage2"))
        .unwrap();
    assert!(last_stage1 < first_stage2);
}

#[tokio::test]
async fn stage_two_prompt_carries_resolved_instrument_and_input() {
    let gateway = ScriptedGateway::new(mixed_script);
    let runner = GatewayBatchRunner::new(gateway.clone(), 8);
    let config = ScoringConfig::default();
    Pipeline::new(&runner, &DefaultPrompts, &config)
        .run_experiment(&experiment(&[1, 2]), &options())
        .await
        .unwrap();

    // Sample 1 never produced JSON; its gate comes from scanning the latest
    // stage-1 text, the repair answer, not the first answer.
    let expected = [(1, "as a BarrierOption on None"), (2, "as a EuropeanOption on None")];
    for (sample_id, phrase) in expected {
        let prompt = gateway.prompt_for(sample_id, "pipeline::stage2").unwrap();
        assert!(prompt.contains(phrase), "{prompt}");
        assert!(prompt.contains(&format!("Trade {sample_id}: buy a European call")));
    }
    let repair = gateway.prompt_for(1, "pipeline::stage1_repair").unwrap();
    assert!(repair.contains("I think it's a European option."));
}

#[tokio::test]
async fn single_sample_run_uses_only_that_sample() {
    let gateway = ScriptedGateway::new(mixed_script);
    let runner = GatewayBatchRunner::new(gateway.clone(), 8);
    let config = ScoringConfig::default();
    let output = Pipeline::new(&runner, &DefaultPrompts, &config)
        .run_sample(&experiment(&[1, 2, 3]), 2, &options())
        .await
        .unwrap();

    assert_eq!(gateway.log.lock().unwrap().len(), 2);
    let response = SampleResponse::from(&output.result.samples[0]);
    assert_eq!(response.overall_sample_score, "100.0%");
    assert_eq!(response.output, NOISY_CORRECT);
    assert_eq!(response.sample_data.len(), 3);
}

#[tokio::test]
async fn unknown_sample_and_bad_model_are_validation_errors() {
    let gateway = ScriptedGateway::new(mixed_script);
    let runner = GatewayBatchRunner::new(gateway.clone(), 8);
    let config = ScoringConfig::default();
    let pipeline = Pipeline::new(&runner, &DefaultPrompts, &config);

    let err = pipeline
        .run_sample(&experiment(&[1]), 42, &options())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Experiment(_)));

    let bad_model = PipelineOptions::new(
        ChatModel::new(ProviderKind::OpenAi, "gpt-2"),
        SamplingParams {
            temperature: Some(0.2),
            ..Default::default()
        },
    );
    let err = pipeline
        .run_experiment(&experiment(&[1]), &bad_model)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert!(gateway.log.lock().unwrap().is_empty());
}

/// Drops every answer for one sample id.
struct Lossy<'a> {
    inner: &'a GatewayBatchRunner,
    drop_id: u64,
}

#[async_trait::async_trait]
impl AnswerSource for Lossy<'_> {
    async fn run(&self, items: Vec<BatchItem>) -> Vec<BatchAnswer> {
        let mut answers = self.inner.run(items).await;
        answers.retain(|a| a.sample_id != self.drop_id);
        answers
    }
}

#[tokio::test]
async fn samples_without_answers_are_dropped() {
    let gateway = ScriptedGateway::new(mixed_script);
    let runner = GatewayBatchRunner::new(gateway.clone(), 8);
    let lossy = Lossy {
        inner: &runner,
        drop_id: 1,
    };
    let config = ScoringConfig::default();
    let output = Pipeline::new(&lossy, &DefaultPrompts, &config)
        .run_experiment(&experiment(&[1, 2]), &options())
        .await
        .unwrap();

    let ids: Vec<u64> = output.result.samples.iter().map(|s| s.sample_id).collect();
    assert_eq!(ids, [2]);
    assert!((output.result.aggregate_score - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn trace_records_every_provider_call() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");
    let (sink, worker) = JsonlTraceSink::create(&path).unwrap();

    let gateway = ScriptedGateway::new(mixed_script);
    let runner = GatewayBatchRunner::new(gateway.clone(), 8);
    let config = ScoringConfig::default();
    Pipeline::new(&runner, &DefaultPrompts, &config)
        .with_trace(&sink)
        .run_experiment(&experiment(&[1, 2, 3]), &options())
        .await
        .unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<serde_json::Value> = raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rows.len(), 9);

    let repair = rows
        .iter()
        .find(|r| r["sample_id"] == 1 && r["call"] == "repair")
        .unwrap();
    assert_eq!(repair["stage"], "stage1");
    assert_eq!(repair["extraction_failure"], "no-braces");
    assert_eq!(repair["template_slug"], "repair_v1");
    assert_eq!(repair["template_hash"].as_str().unwrap().len(), 64);
}

#[test]
fn offline_scoring_matches_answers_by_sample_id() {
    let config = ScoringConfig::default();
    let answers = vec![
        BatchAnswer {
            sample_id: 3,
            answer: NOISY_CORRECT.to_string(),
        },
        BatchAnswer {
            sample_id: 99,
            answer: CORRECT.to_string(),
        },
        BatchAnswer {
            sample_id: 1,
            answer: "no idea".to_string(),
        },
    ];
    let result = score_answers(&experiment(&[1, 2, 3]), &answers, &config);
    let ids: Vec<u64> = result.samples.iter().map(|s| s.sample_id).collect();
    assert_eq!(ids, [1, 3]);
    assert!((result.aggregate_score - 50.0).abs() < 1e-9);
}
