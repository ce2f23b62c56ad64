#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use scoring_harness::experiment::{read_answers_jsonl, GroundTruthSource};
use scoring_harness::gateway::{
    list_providers, ChatModel, GatewayBatchRunner, ProviderGateway, ProviderKind, SamplingParams,
    TracingUsageSink,
};
use scoring_harness::scoring::{ExperimentResponse, ExtractionStrategy, SampleResponse};
use scoring_harness::{
    score_answers, FileExperimentStore, JsonlTraceSink, Pipeline, PipelineOptions, ScoringConfig,
    Settings, WeightingPolicy,
};

#[derive(Parser)]
#[command(name = "scoring", version, about = "Score LLM answers against ground truth")]
struct Cli {
    /// Data directory (overrides DATA_PATH)
    #[arg(long, global = true)]
    data: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List experiments in the data directory
    Experiments,
    /// List an experiment's sample inputs
    Inputs {
        #[arg(long)]
        experiment: String,
    },
    /// List providers with their models and sampling parameters
    Providers,
    /// Run the two-stage pipeline on an experiment (or one sample) and score it
    Run {
        #[arg(long)]
        experiment: String,
        /// Run only this sample
        #[arg(long)]
        sample: Option<u64>,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        scoring: ScoringArgs,
        /// JSONL trace of every provider call
        #[arg(long)]
        trace: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Send one custom prompt per sample and score the answers
    Score {
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        prompt_file: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        scoring: ScoringArgs,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Score recorded answers (JSONL of {sample_id, answer}) without calling a provider
    Rescore {
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        answers: PathBuf,
        #[command(flatten)]
        scoring: ScoringArgs,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ModelArgs {
    #[arg(long)]
    provider: ProviderKind,
    #[arg(long)]
    model: String,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    top_p: Option<f32>,
    #[arg(long)]
    top_k: Option<u32>,
    /// Require every provider sampling parameter to be given explicitly
    #[arg(long)]
    strict_params: bool,
}

impl ModelArgs {
    fn options(&self) -> PipelineOptions {
        let mut sampling = SamplingParams {
            seed: self.seed,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
        };
        if !self.strict_params {
            sampling = sampling.with_defaults(self.provider.available_params());
        }
        PipelineOptions::new(ChatModel::new(self.provider, &self.model), sampling)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ExtractionArg {
    FirstBraces,
    Balanced,
}

#[derive(Clone, Copy, ValueEnum)]
enum WeightingArg {
    IncludingGate,
    ExcludingGate,
}

#[derive(Args)]
struct ScoringArgs {
    #[arg(long, value_enum, default_value = "first-braces")]
    extraction: ExtractionArg,
    #[arg(long, value_enum, default_value = "including-gate")]
    weighting: WeightingArg,
}

impl ScoringArgs {
    fn config(&self) -> ScoringConfig {
        let extraction = match self.extraction {
            ExtractionArg::FirstBraces => ExtractionStrategy::FirstBraces,
            ExtractionArg::Balanced => ExtractionStrategy::Balanced,
        };
        let weighting = match self.weighting {
            WeightingArg::IncludingGate => WeightingPolicy::EqualIncludingGate,
            WeightingArg::ExcludingGate => WeightingPolicy::EqualExcludingGate,
        };
        ScoringConfig::default()
            .with_extraction(extraction)
            .with_weighting(weighting)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    if let Some(data) = cli.data {
        settings.data_path = data;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let store = FileExperimentStore::new(&settings.data_path);

    match cli.command {
        Commands::Experiments => {
            for name in store.list()? {
                println!("{name}");
            }
        }
        Commands::Inputs { experiment } => {
            let experiment = store.load(&experiment, &ScoringConfig::default())?;
            write_json(None, &experiment.inputs())?;
        }
        Commands::Providers => {
            write_json(None, &list_providers())?;
        }
        Commands::Run {
            experiment,
            sample,
            model,
            scoring,
            trace,
            out,
        } => {
            let config = scoring.config();
            let experiment = store.load(&experiment, &config)?;
            let options = model.options();
            let runner = batch_runner(model.provider, &settings)?.with_run(options.run_id);

            let trace_pair = match trace {
                Some(path) => Some(JsonlTraceSink::create(path)?),
                None => None,
            };
            let mut pipeline = Pipeline::new(&runner, &store, &config);
            if let Some((sink, _)) = &trace_pair {
                pipeline = pipeline.with_trace(sink);
            }

            let output = match sample {
                Some(id) => pipeline.run_sample(&experiment, id, &options).await?,
                None => pipeline.run_experiment(&experiment, &options).await?,
            };
            drop(pipeline);
            if let Some((sink, worker)) = trace_pair {
                drop(sink);
                worker.join()?;
            }

            match (sample, output.result.samples.first()) {
                (Some(_), Some(result)) => write_json(out.as_deref(), &SampleResponse::from(result))?,
                _ => write_json(out.as_deref(), &ExperimentResponse::from(&output.result))?,
            }
        }
        Commands::Score {
            experiment,
            prompt_file,
            model,
            scoring,
            out,
        } => {
            let config = scoring.config();
            let experiment = store.load(&experiment, &config)?;
            let prompt = std::fs::read_to_string(prompt_file)?;
            let options = model.options();
            let runner = batch_runner(model.provider, &settings)?.with_run(options.run_id);

            let pipeline = Pipeline::new(&runner, &store, &config);
            let result = pipeline
                .run_single_stage(&experiment, &prompt, &options)
                .await?;
            write_json(out.as_deref(), &ExperimentResponse::from(&result))?;
        }
        Commands::Rescore {
            experiment,
            answers,
            scoring,
            out,
        } => {
            let config = scoring.config();
            let experiment = store.load(&experiment, &config)?;
            let answers = read_answers_jsonl(answers)?;
            let result = score_answers(&experiment, &answers, &config);
            write_json(out.as_deref(), &ExperimentResponse::from(&result))?;
        }
    }

    Ok(())
}

fn batch_runner(
    provider: ProviderKind,
    settings: &Settings,
) -> Result<GatewayBatchRunner, Box<dyn std::error::Error>> {
    let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink));
    if !gateway.has_provider(provider) {
        return Err(format!("{} is not set", provider.api_key_env()).into());
    }
    Ok(GatewayBatchRunner::new(Arc::new(gateway), settings.concurrency))
}

fn write_json<T: serde::Serialize>(path: Option<&Path>, value: &T) -> Result<(), io::Error> {
    match path {
        Some(path) => {
            let mut file = File::create(path)?;
            serde_json::to_writer_pretty(&mut file, value)?;
            writeln!(file)?;
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            serde_json::to_writer_pretty(&mut lock, value)?;
            writeln!(lock)?;
        }
    }
    Ok(())
}
