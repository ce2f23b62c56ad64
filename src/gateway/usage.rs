//! Per-attempt usage records.
//!
//! The gateway reports every attempt, failed ones included, to a `UsageSink`.
//! The CLI logs them with `TracingUsageSink`; tests mostly discard them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{Attribution, ProviderKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success { input_tokens: u32, output_tokens: u32 },
    Failed { code: &'static str },
}

/// One provider attempt.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: ProviderKind,
    pub model: String,
    pub run_id: Option<Uuid>,
    pub sample_id: Option<u64>,
    /// Code path that issued the call, e.g. "pipeline::stage2_repair".
    pub caller: &'static str,
    /// Zero-based position within the gateway retry loop.
    pub attempt: u32,
    pub latency_ms: u64,
    pub outcome: CallOutcome,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: ProviderKind,
        model: impl Into<String>,
        attribution: &Attribution,
        outcome: CallOutcome,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            run_id: attribution.run_id,
            sample_id: attribution.sample_id,
            caller: attribution.caller,
            attempt: 0,
            latency_ms: 0,
            outcome,
            timestamp: Utc::now(),
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CallOutcome::Success { .. })
    }

    pub fn total_tokens(&self) -> u32 {
        match self.outcome {
            CallOutcome::Success {
                input_tokens,
                output_tokens,
            } => input_tokens + output_tokens,
            CallOutcome::Failed { .. } => 0,
        }
    }
}

/// Receives usage records. Must not fail back into the gateway.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits each record as a `tracing` event under `scoring_harness::usage`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        let error_code = match record.outcome {
            CallOutcome::Failed { code } => Some(code),
            CallOutcome::Success { .. } => None,
        };
        tracing::info!(
            target: "scoring_harness::usage",
            provider = record.provider.as_str(),
            model = %record.model,
            caller = record.caller,
            run_id = ?record.run_id,
            sample_id = ?record.sample_id,
            attempt = record.attempt,
            tokens = record.total_tokens(),
            latency_ms = record.latency_ms,
            ok = record.is_success(),
            error_code = ?error_code,
            "provider call"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_takes_ids_from_attribution() {
        let run = Uuid::new_v4();
        let attribution = Attribution::new("pipeline::stage1")
            .with_run(run)
            .with_sample(4);
        let record = ProviderCallRecord::new(
            ProviderKind::Fireworks,
            "llama-v2-70b-chat",
            &attribution,
            CallOutcome::Success {
                input_tokens: 10,
                output_tokens: 5,
            },
        )
        .attempt(1);

        assert_eq!(record.run_id, Some(run));
        assert_eq!(record.sample_id, Some(4));
        assert_eq!(record.caller, "pipeline::stage1");
        assert_eq!(record.total_tokens(), 15);
        assert!(record.is_success());
    }

    #[test]
    fn failed_calls_count_no_tokens() {
        let record = ProviderCallRecord::new(
            ProviderKind::OpenAi,
            "gpt-4",
            &Attribution::new("test"),
            CallOutcome::Failed { code: "timeout" },
        );
        assert!(!record.is_success());
        assert_eq!(record.total_tokens(), 0);
    }
}
