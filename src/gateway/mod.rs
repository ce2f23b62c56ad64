//! Provider gateway for chat completions.

pub mod batch;
pub mod catalog;
pub mod error;
pub mod openai_compat;
pub mod types;
pub mod usage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};

use openai_compat::{ChatProvider, OpenAiCompatAdapter};
use usage::UsageSink as UsageSinkTrait;

pub use batch::{error_answer, AnswerSource, BatchAnswer, BatchItem, GatewayBatchRunner};
pub use catalog::{list_providers, validate_request, CatalogError, ProviderItem};
pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{CallOutcome, NoopUsageSink, ProviderCallRecord, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retries after the first attempt; `2` means three attempts in total.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Overrides every provider's fixed request timeout when set.
    pub timeout_override: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            timeout_override: None,
        }
    }
}

/// Routes each request to the adapter registered for its provider, bounding
/// every attempt by that provider's timeout and retrying transient failures.
pub struct ProviderGateway<U: UsageSinkTrait> {
    providers: HashMap<ProviderKind, Arc<dyn ChatProvider>>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn new(usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            providers: HashMap::new(),
            usage_sink,
            config,
        }
    }

    /// Register every provider whose API key is present in the environment.
    pub fn from_env(usage_sink: Arc<U>) -> Self {
        let mut gateway = Self::new(usage_sink, GatewayConfig::default());
        for kind in ProviderKind::ALL {
            match OpenAiCompatAdapter::from_env(kind) {
                Ok(adapter) => gateway = gateway.with_provider(kind, Arc::new(adapter)),
                Err(err) => tracing::debug!(provider = kind.as_str(), %err, "provider not configured"),
            }
        }
        gateway
    }

    pub fn with_provider(mut self, kind: ProviderKind, provider: Arc<dyn ChatProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn has_provider(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let kind = req.model.provider;
        let provider = self.providers.get(&kind).ok_or_else(|| {
            ProviderError::config(format!("no credentials configured for {kind}"))
        })?;
        let limit = self
            .config
            .timeout_override
            .unwrap_or_else(|| kind.request_timeout());

        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            let start = Instant::now();
            let result = match timeout(limit, provider.chat(&req)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    provider: kind,
                    after: limit,
                }),
            };
            let latency = start.elapsed();

            match result {
                Ok(resp) => {
                    let outcome = CallOutcome::Success {
                        input_tokens: resp.input_tokens,
                        output_tokens: resp.output_tokens,
                    };
                    self.record_usage(&req, attempt, latency, outcome).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let outcome = CallOutcome::Failed { code: err.code() };
                    self.record_usage(&req, attempt, latency, outcome).await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    tracing::warn!(
                        provider = kind.as_str(),
                        model = req.model.model_id(),
                        sample_id = ?req.attribution.sample_id,
                        attempt,
                        error = %err,
                        "retrying provider call"
                    );
                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::upstream(kind, "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        attempt: u32,
        latency: Duration,
        outcome: CallOutcome,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider,
            req.model.model_id(),
            &req.attribution,
            outcome,
        )
        .attempt(attempt)
        .latency(latency.as_millis() as u64);

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}
