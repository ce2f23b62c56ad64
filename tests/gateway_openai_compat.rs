use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scoring_harness::gateway::openai_compat::{ChatProvider, OpenAiCompatAdapter};
use scoring_harness::gateway::{
    validate_request, AnswerSource, Attribution, BatchItem, ChatModel, ChatRequest, FinishReason,
    GatewayBatchRunner, GatewayConfig, Message, NoopUsageSink, ProviderError, ProviderGateway,
    ProviderKind, SamplingParams,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(kind: ProviderKind, server: &MockServer) -> OpenAiCompatAdapter {
    OpenAiCompatAdapter::with_config(kind, "sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn request(kind: ProviderKind, model: &str) -> ChatRequest {
    ChatRequest::new(
        ChatModel::new(kind, model),
        vec![Message::user("Extract the trade.")],
        Attribution::new("test").with_sample(1),
    )
    .sampling(SamplingParams {
        seed: Some(1),
        temperature: Some(0.2),
        top_p: Some(0.85),
        top_k: Some(70),
    })
}

fn success_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 34 }
    })
}

#[tokio::test]
async fn parses_content_usage_and_finish_reason() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(success_body(r#"{"instrument_type": "Cap"}"#)),
        )
        .mount(&server)
        .await;

    let resp = adapter(ProviderKind::Fireworks, &server)
        .chat(&request(ProviderKind::Fireworks, "llama-v2-70b-chat"))
        .await
        .unwrap();

    assert_eq!(resp.content, r#"{"instrument_type": "Cap"}"#);
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 12);
    assert_eq!(resp.output_tokens, 34);
}

#[tokio::test]
async fn forwards_sampling_params_but_not_top_k_to_openai() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4", "seed": 1, "top_p": 0.85})))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body("ok")))
        .mount(&server)
        .await;

    let resp = adapter(ProviderKind::OpenAi, &server)
        .chat(&request(ProviderKind::OpenAi, "gpt-4"))
        .await
        .unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert!(body.get("top_k").is_none());
    assert_eq!(body["messages"][0]["role"], "user");
}

#[tokio::test]
async fn fireworks_catalogue_ids_are_sent_fully_qualified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(
            json!({"model": "accounts/fireworks/models/llama-v2-70b-chat", "top_k": 70}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let req = request(ProviderKind::Fireworks, "llama-v2-70b-chat");
    validate_request(ProviderKind::Fireworks, req.model.model_id(), &req.sampling).unwrap();

    let resp = adapter(ProviderKind::Fireworks, &server)
        .chat(&req)
        .await
        .unwrap();
    assert_eq!(resp.content, "ok");
}

#[tokio::test]
async fn rate_limit_and_server_errors_are_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_json(json!({"error": {"message": "overloaded", "code": 503}})),
        )
        .mount(&server)
        .await;

    let adapter = adapter(ProviderKind::OpenRouter, &server);
    let req = request(ProviderKind::OpenRouter, "openai/gpt-4");

    let first = adapter.chat(&req).await.unwrap_err();
    assert!(matches!(first, ProviderError::RateLimited { .. }));
    assert!(first.is_retryable());

    let second = adapter.chat(&req).await.unwrap_err();
    assert!(second.is_retryable());
    assert!(second.to_string().contains("overloaded"));
}

#[tokio::test]
async fn client_errors_are_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "invalid api key", "code": "invalid_api_key"}
        })))
        .mount(&server)
        .await;

    let err = adapter(ProviderKind::OpenAi, &server)
        .chat(&request(ProviderKind::OpenAi, "gpt-4"))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(
        err.context().and_then(|c| c.provider_code.as_deref()),
        Some("invalid_api_key")
    );
}

/// Fails with 500 for the first `failures` calls, then succeeds.
struct FlakyResponder {
    calls: Arc<AtomicUsize>,
    failures: usize,
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            ResponseTemplate::new(500)
        } else {
            ResponseTemplate::new(200).set_body_json(success_body(r#"{"ok": true}"#))
        }
    }
}

fn fast_retry_gateway(
    server: &MockServer,
    max_retries: u32,
) -> ProviderGateway<NoopUsageSink> {
    ProviderGateway::new(
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries,
            retry_base_delay: Duration::from_millis(1),
            timeout_override: None,
        },
    )
    .with_provider(
        ProviderKind::Fireworks,
        Arc::new(adapter(ProviderKind::Fireworks, server)),
    )
}

#[tokio::test]
async fn gateway_retries_transient_http_failures() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyResponder {
            calls: calls.clone(),
            failures: 2,
        })
        .mount(&server)
        .await;

    let gateway = fast_retry_gateway(&server, 2);
    let resp = gateway
        .chat(request(ProviderKind::Fireworks, "llama-v2-70b-chat"))
        .await
        .unwrap();
    assert_eq!(resp.content, r#"{"ok": true}"#);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn batch_runner_turns_terminal_failures_into_error_answers() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyResponder {
            calls: calls.clone(),
            failures: usize::MAX,
        })
        .mount(&server)
        .await;

    let runner = GatewayBatchRunner::new(Arc::new(fast_retry_gateway(&server, 1)), 4);
    let items = (1..=3)
        .map(|sample_id| BatchItem {
            sample_id,
            prompt: "Extract: {input}".to_string(),
            context: format!("trade {sample_id}"),
            model: ChatModel::new(ProviderKind::Fireworks, "llama-v2-70b-chat"),
            sampling: SamplingParams::default(),
            caller: "test",
        })
        .collect();

    let answers = runner.run(items).await;
    assert_eq!(answers.len(), 3);
    for (answer, expected_id) in answers.iter().zip(1..=3) {
        assert_eq!(answer.sample_id, expected_id);
        assert!(answer.answer.starts_with("An error has occurred: "), "{}", answer.answer);
    }
    // Two attempts per sample.
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}
