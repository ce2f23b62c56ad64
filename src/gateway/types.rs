//! Core types for the provider gateway.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage tracking and debugging.
///
/// Every request through the gateway carries attribution so we know:
/// - Which scoring run it belongs to (run_id)
/// - Which sample it was made for (sample_id)
/// - Which code path triggered it (caller)
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Scoring run this request is part of.
    pub run_id: Option<Uuid>,
    /// Sample the request was issued for.
    pub sample_id: Option<u64>,
    /// Which code path made this call, e.g. "pipeline::stage1".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_sample(mut self, sample_id: u64) -> Self {
        self.sample_id = Some(sample_id);
        self
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

const FIREWORKS_MODEL_PREFIX: &str = "accounts/fireworks/models/";

/// Upstream LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Fireworks,
    OpenRouter,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::OpenAi,
        ProviderKind::Fireworks,
        ProviderKind::OpenRouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Fireworks => "fireworks",
            ProviderKind::OpenRouter => "openrouter",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Fireworks => "https://api.fireworks.ai/inference/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Fireworks => "FIREWORKS_API_KEY",
            ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    pub fn base_url_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_BASE_URL",
            ProviderKind::Fireworks => "FIREWORKS_BASE_URL",
            ProviderKind::OpenRouter => "OPENROUTER_BASE_URL",
        }
    }

    /// Model id as the provider's endpoint expects it. Fireworks wants the
    /// fully qualified `accounts/fireworks/models/<id>` form.
    pub fn wire_model<'a>(&self, model_id: &'a str) -> Cow<'a, str> {
        match self {
            ProviderKind::Fireworks if !model_id.starts_with(FIREWORKS_MODEL_PREFIX) => {
                Cow::Owned(format!("{FIREWORKS_MODEL_PREFIX}{model_id}"))
            }
            _ => Cow::Borrowed(model_id),
        }
    }

    /// Fixed upper bound on a single call to this provider.
    pub fn request_timeout(&self) -> Duration {
        match self {
            ProviderKind::OpenAi => Duration::from_secs(120),
            ProviderKind::Fireworks => Duration::from_secs(30),
            ProviderKind::OpenRouter => Duration::from_secs(120),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "fireworks" => Ok(ProviderKind::Fireworks),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            other => Err(format!("unsupported provider: {other}")),
        }
    }
}

// =============================================================================
// SAMPLING
// =============================================================================

/// Sampling knobs a provider may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingParam {
    Seed,
    Temperature,
    TopP,
    TopK,
}

impl SamplingParam {
    pub fn name(&self) -> &'static str {
        match self {
            SamplingParam::Seed => "seed",
            SamplingParam::Temperature => "temperature",
            SamplingParam::TopP => "top_p",
            SamplingParam::TopK => "top_k",
        }
    }

    pub fn default_value(&self) -> f64 {
        match self {
            SamplingParam::Seed => 1.0,
            SamplingParam::Temperature => 0.2,
            SamplingParam::TopP => 0.85,
            SamplingParam::TopK => 70.0,
        }
    }
}

/// Sampling parameters supplied with a request. Unset values are omitted
/// from the provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
}

impl SamplingParams {
    pub fn is_set(&self, param: SamplingParam) -> bool {
        match param {
            SamplingParam::Seed => self.seed.is_some(),
            SamplingParam::Temperature => self.temperature.is_some(),
            SamplingParam::TopP => self.top_p.is_some(),
            SamplingParam::TopK => self.top_k.is_some(),
        }
    }

    /// Fill every listed parameter that is unset with its default.
    pub fn with_defaults(mut self, params: &[SamplingParam]) -> Self {
        for param in params {
            let value = param.default_value();
            match param {
                SamplingParam::Seed => {
                    self.seed.get_or_insert(value as u64);
                }
                SamplingParam::Temperature => {
                    self.temperature.get_or_insert(value as f32);
                }
                SamplingParam::TopP => {
                    self.top_p.get_or_insert(value as f32);
                }
                SamplingParam::TopK => {
                    self.top_k.get_or_insert(value as u32);
                }
            }
        }
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Chat model specification: a provider plus its model id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatModel {
    pub provider: ProviderKind,
    pub model_id: String,
}

impl ChatModel {
    pub fn new(provider: ProviderKind, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Llama chat models expect `[INST]` instruction framing.
    pub fn is_llama(&self) -> bool {
        self.model_id.to_lowercase().contains("llama")
    }
}

/// One chat completion call. The pipeline always sends a single user message.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: ChatModel,
    pub messages: Vec<Message>,
    pub sampling: SamplingParams,
    /// Generation cap; the adapter's default applies when unset.
    pub max_tokens: Option<u32>,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            sampling: SamplingParams::default(),
            max_tokens: None,
            attribution,
        }
    }

    pub fn sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Raw answer text, handed to the extractor unmodified.
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// Convenience constructor for plain text responses.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::ZERO,
            finish_reason: FinishReason::Stop,
        }
    }
}
