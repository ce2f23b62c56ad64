//! Concurrent batch execution of prompt/context pairs.
//!
//! A failed call never fails the batch: it becomes an in-band error answer
//! for that sample.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{Attribution, ChatModel, ChatRequest, Message, SamplingParams};
use super::ChatGateway;
use crate::prompts::{add_llama_formatting, build_question};

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Answer text for a call that failed terminally.
pub fn error_answer(msg: impl std::fmt::Display) -> String {
    format!("An error has occurred: {msg}")
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub sample_id: u64,
    pub prompt: String,
    pub context: String,
    pub model: ChatModel,
    pub sampling: SamplingParams,
    /// Code path issuing the call, recorded in usage attribution.
    pub caller: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAnswer {
    pub sample_id: u64,
    pub answer: String,
}

/// Turns a batch of items into one answer per item, same order, same ids.
#[async_trait::async_trait]
pub trait AnswerSource: Send + Sync {
    async fn run(&self, items: Vec<BatchItem>) -> Vec<BatchAnswer>;
}

pub struct GatewayBatchRunner {
    gateway: Arc<dyn ChatGateway>,
    concurrency: usize,
    run_id: Option<Uuid>,
}

impl GatewayBatchRunner {
    pub fn new(gateway: Arc<dyn ChatGateway>, concurrency: usize) -> Self {
        Self {
            gateway,
            concurrency: concurrency.max(1),
            run_id: None,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    fn request_for(&self, item: &BatchItem) -> ChatRequest {
        let mut question = build_question(&item.prompt, &item.context);
        if item.model.is_llama() {
            question = add_llama_formatting(&question);
        }

        let mut attribution = Attribution::new(item.caller).with_sample(item.sample_id);
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }

        ChatRequest::new(item.model.clone(), vec![Message::user(question)], attribution)
            .sampling(item.sampling)
            .max_tokens(DEFAULT_MAX_TOKENS)
    }
}

#[async_trait::async_trait]
impl AnswerSource for GatewayBatchRunner {
    async fn run(&self, items: Vec<BatchItem>) -> Vec<BatchAnswer> {
        let total = items.len();
        let requests: Vec<(usize, u64, ChatRequest)> = items
            .iter()
            .enumerate()
            .map(|(idx, item)| (idx, item.sample_id, self.request_for(item)))
            .collect();

        let gateway = &self.gateway;
        let mut results: Vec<(usize, BatchAnswer)> = stream::iter(requests.into_iter().map(
            |(idx, sample_id, req)| async move {
                let answer = match gateway.chat(req).await {
                    Ok(resp) => resp.content,
                    Err(err) => {
                        tracing::warn!(sample_id, error = %err, code = err.code(), "provider call failed");
                        error_answer(err)
                    }
                };
                (idx, BatchAnswer { sample_id, answer })
            },
        ))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        results.sort_by_key(|(idx, _)| *idx);
        debug_assert_eq!(results.len(), total);
        results.into_iter().map(|(_, answer)| answer).collect()
    }
}
