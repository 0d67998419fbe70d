//! End-to-end routing scenarios against scripted upstreams.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use mproxy_common::{GlobalConfig, RateLimitConfig};
use mproxy_core::access::{AccessManager, OpenAccess};
use mproxy_core::bootstrap::attach_client;
use mproxy_core::classify::RouteRequest;
use mproxy_core::engine::{Engine, GenerateOutcome};
use mproxy_core::state::{AppState, AppStateBuilder};
use mproxy_core::upstream::UpstreamClient;
use mproxy_core::GatewayError;
use mproxy_provider_core::{
    header_set, AmpMapping, ClientHandle, CooldownState, CredentialKind, ModelInfo, PayloadRules,
    ProviderResult, Proto, ResolverTables, ThinkingSupport, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamProvider, UpstreamTransportErrorKind,
};
use mproxy_transform::GenerateRequest;

struct TestProvider {
    tag: &'static str,
    proto: Proto,
    model_ids: Vec<&'static str>,
}

#[async_trait]
impl UpstreamProvider for TestProvider {
    fn name(&self) -> &'static str {
        self.tag
    }

    fn proto(&self) -> Proto {
        self.proto
    }

    fn models(&self, _client: &ClientHandle) -> Vec<ModelInfo> {
        self.model_ids
            .iter()
            .map(|id| ModelInfo {
                id: id.to_string(),
                display_name: id.to_string(),
                family: self.tag.to_string(),
                context_length: 200_000,
                max_output_tokens: 64_000,
                supported_methods: Vec::new(),
                thinking: ThinkingSupport::FixedBudget,
            })
            .collect()
    }

    async fn build_generate(
        &self,
        client: &ClientHandle,
        model: &str,
        body: Bytes,
        stream: bool,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let mut headers = Vec::new();
        header_set(&mut headers, "x-client", &client.client_id);
        Ok(UpstreamHttpRequest {
            method: "POST",
            url: format!("fake://{}/{model}", self.tag),
            headers,
            body: Some(body),
            is_stream: stream,
        })
    }
}

enum Scripted {
    Json(u16, serde_json::Value),
    Stream(Vec<&'static str>),
    Transport,
}

#[derive(Default)]
struct ScriptedUpstream {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<UpstreamHttpRequest>>,
}

impl ScriptedUpstream {
    fn push(&self, item: Scripted) {
        self.script.lock().unwrap().push_back(item);
    }

    fn requests(&self) -> Vec<UpstreamHttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl UpstreamClient for ScriptedUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.requests.lock().unwrap().push(req);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            match next {
                Scripted::Json(status, value) => Ok(UpstreamHttpResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from(serde_json::to_vec(&value).unwrap())),
                }),
                Scripted::Stream(chunks) => {
                    let (tx, rx) = tokio::sync::mpsc::channel(8);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            if tx.send(Bytes::from_static(chunk.as_bytes())).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(UpstreamHttpResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Scripted::Transport => Err(UpstreamFailure::Transport {
                    kind: UpstreamTransportErrorKind::Connect,
                    message: "connection refused".to_string(),
                }),
            }
        })
    }
}

fn test_global() -> GlobalConfig {
    GlobalConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        auth_dir: "unused".to_string(),
        api_keys: Vec::new(),
        management_key: None,
        proxy: None,
        routing: Default::default(),
        rate_limit: RateLimitConfig {
            // Keep tests fast; pacing behavior is covered in the limiter's
            // own suite.
            min_interval_ms: 1,
            max_interval_ms: 2,
            ..Default::default()
        },
    }
}

struct Harness {
    state: Arc<AppState>,
    engine: Engine,
    upstream: Arc<ScriptedUpstream>,
}

fn harness(providers: Vec<TestProvider>, tables: ResolverTables) -> Harness {
    let mut map: HashMap<String, Arc<dyn UpstreamProvider>> = HashMap::new();
    for provider in providers {
        map.insert(provider.tag.to_string(), Arc::new(provider));
    }
    let state = AppStateBuilder {
        global: test_global(),
        providers: map,
        rules: PayloadRules::default(),
        access: Arc::new(AccessManager::new(vec![Box::new(OpenAccess::new(true))])),
        store: None,
        resolver_tables: tables,
    }
    .build();
    let upstream = Arc::new(ScriptedUpstream::default());
    let engine = Engine::new(state.clone(), upstream.clone());
    Harness {
        state,
        engine,
        upstream,
    }
}

fn api_key_client(id: &str, tag: &str, proto: Proto) -> Arc<ClientHandle> {
    let mut client = ClientHandle::new(
        id.to_string(),
        tag,
        proto,
        CredentialKind::ApiKey,
        format!("{id}@example.com"),
        0,
        None,
    );
    client.api_key = Some("sk-test".to_string());
    Arc::new(client)
}

fn openai_route(model: &str, stream: bool) -> RouteRequest {
    let request: mproxy_protocol::openai::ChatCompletionRequest = serde_json::from_value(json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream,
    }))
    .unwrap();
    RouteRequest {
        caller: Proto::OpenAI,
        requested_model: model.to_string(),
        streaming: stream,
        request: GenerateRequest::OpenAI(request),
    }
}

fn claude_response_body() -> serde_json::Value {
    json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": "claude-sonnet-4-5",
        "content": [{"type": "text", "text": "hello there"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 12, "output_tokens": 5}
    })
}

// S1: one Ready Claude client; an OpenAI-shape request is translated out and
// the response translated back, with usage attributed.
#[tokio::test]
async fn simple_route_translates_both_directions() {
    let h = harness(
        vec![TestProvider {
            tag: "claude",
            proto: Proto::Claude,
            model_ids: vec!["claude-sonnet-4-5"],
        }],
        ResolverTables::default(),
    );
    attach_client(&h.state, api_key_client("c1", "claude", Proto::Claude));
    h.upstream.push(Scripted::Json(200, claude_response_body()));

    let outcome = h
        .engine
        .handle_generate(openai_route("claude-sonnet-4-5", false))
        .await
        .unwrap();
    let GenerateOutcome::Json { binding, body } = outcome else {
        panic!("expected json outcome");
    };
    assert_eq!(binding.provider, "claude");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "hello there");

    let requests = h.upstream.requests();
    assert_eq!(requests.len(), 1);
    // The upstream saw a Claude-dialect body.
    let sent: serde_json::Value =
        serde_json::from_slice(requests[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent["model"], "claude-sonnet-4-5");
    assert!(sent["messages"].is_array());
    assert!(sent["max_tokens"].is_u64());

    let usage = h.state.usage.snapshot();
    assert_eq!(usage["rows"][0]["requests"], 1);
    assert_eq!(usage["rows"][0]["input_tokens"], 12);
}

// S2: a thinking suffix on a Gemini model lands in
// generationConfig.thinkingConfig and is stripped from the upstream name.
#[tokio::test]
async fn thinking_suffix_sets_budget_and_strips_name() {
    let h = harness(
        vec![TestProvider {
            tag: "gemini",
            proto: Proto::Gemini,
            model_ids: vec!["gemini-2.5-pro"],
        }],
        ResolverTables::default(),
    );
    attach_client(&h.state, api_key_client("g1", "gemini", Proto::Gemini));
    h.upstream.push(Scripted::Json(
        200,
        json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "ok"}]},
                            "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1}
        }),
    ));

    let outcome = h
        .engine
        .handle_generate(openai_route("gemini-2.5-pro(8192)", false))
        .await
        .unwrap();
    assert!(matches!(outcome, GenerateOutcome::Json { .. }));

    let requests = h.upstream.requests();
    assert_eq!(requests[0].url, "fake://gemini/gemini-2.5-pro");
    let sent: serde_json::Value =
        serde_json::from_slice(requests[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(
        sent["generationConfig"]["thinkingConfig"]["thinkingBudget"],
        8192
    );
}

// S3: an Amp mapping reroutes a Claude name onto a Gemini-hosted sibling;
// the caller still gets its own dialect back.
#[tokio::test]
async fn amp_mapping_reroutes_to_gemini_sibling() {
    let h = harness(
        vec![TestProvider {
            tag: "gemini",
            proto: Proto::Gemini,
            model_ids: vec!["gemini-claude-opus-4-5-thinking"],
        }],
        ResolverTables {
            amp_mappings: vec![AmpMapping {
                from: "claude-opus-4-5".to_string(),
                to: "gemini-claude-opus-4-5-thinking".to_string(),
                is_regex: false,
            }],
            ..Default::default()
        },
    );
    attach_client(&h.state, api_key_client("g1", "gemini", Proto::Gemini));
    h.upstream.push(Scripted::Json(
        200,
        json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "mapped"}]},
                            "finishReason": "STOP"}]
        }),
    ));

    let outcome = h
        .engine
        .handle_generate(openai_route("claude-opus-4-5", false))
        .await
        .unwrap();
    let GenerateOutcome::Json { binding, body } = outcome else {
        panic!("expected json outcome");
    };
    assert_eq!(binding.provider, "gemini");
    assert_eq!(binding.model, "gemini-claude-opus-4-5-thinking");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "mapped");
}

// S4: a 429 marks the client's quota cooldown and the request fails over to
// the sibling; a follow-up request skips the cooling client entirely.
#[tokio::test]
async fn quota_failover_marks_and_skips_cooling_client() {
    let h = harness(
        vec![TestProvider {
            tag: "kiro",
            proto: Proto::Claude,
            model_ids: vec!["claude-sonnet-4-5"],
        }],
        ResolverTables::default(),
    );
    attach_client(&h.state, api_key_client("k1", "kiro", Proto::Claude));
    attach_client(&h.state, api_key_client("k2", "kiro", Proto::Claude));

    h.upstream.push(Scripted::Json(
        429,
        json!({"error": {"message": "too many requests for this resource"}}),
    ));
    h.upstream.push(Scripted::Json(200, claude_response_body()));

    let outcome = h
        .engine
        .handle_generate(openai_route("claude-sonnet-4-5", false))
        .await
        .unwrap();
    assert!(matches!(outcome, GenerateOutcome::Json { .. }));

    let requests = h.upstream.requests();
    assert_eq!(requests.len(), 2);
    let first = &requests[0].headers[0].1;
    let second = &requests[1].headers[0].1;
    assert_ne!(first, second);
    assert!(matches!(
        h.state.cooldown.state(first, "claude-sonnet-4-5"),
        CooldownState::Quota { .. }
    ));

    // Second request inside the window goes straight to the sibling.
    h.upstream.push(Scripted::Json(200, claude_response_body()));
    h.engine
        .handle_generate(openai_route("claude-sonnet-4-5", false))
        .await
        .unwrap();
    let requests = h.upstream.requests();
    assert_eq!(&requests[2].headers[0].1, second);
}

// S5: the first upstream attempt dies before any byte reaches the caller;
// the retry is invisible and the caller sees one clean stream.
#[tokio::test(start_paused = true)]
async fn stream_bootstrap_retries_transparently() {
    let h = harness(
        vec![TestProvider {
            tag: "claude",
            proto: Proto::Claude,
            model_ids: vec!["claude-sonnet-4-5"],
        }],
        ResolverTables::default(),
    );
    attach_client(&h.state, api_key_client("c1", "claude", Proto::Claude));
    attach_client(&h.state, api_key_client("c2", "claude", Proto::Claude));

    h.upstream
        .push(Scripted::Json(500, json!({"error": {"message": "boom"}})));
    h.upstream.push(Scripted::Stream(vec![
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_s\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-sonnet-4-5\",\"content\":[],\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":3}}}\n\n",
        "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"streamed\"}}\n\n",
        "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"input_tokens\":3,\"output_tokens\":2}}\n\n",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    ]));

    let outcome = h
        .engine
        .handle_generate(openai_route("claude-sonnet-4-5", true))
        .await
        .unwrap();
    let GenerateOutcome::Stream {
        content_type,
        mut body,
        ..
    } = outcome
    else {
        panic!("expected stream outcome");
    };
    assert_eq!(content_type, "text/event-stream");

    let mut collected = Vec::new();
    while let Some(chunk) = body.recv().await {
        collected.extend_from_slice(&chunk);
    }
    let text = String::from_utf8(collected).unwrap();
    assert!(text.contains("\"streamed\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));

    // Exactly two upstream calls: the failed bootstrap and the committed
    // stream. No call was issued after bytes reached the caller.
    assert_eq!(h.upstream.requests().len(), 2);
}

// Transient upstream failures exhaust their retry budget and surface as 502.
#[tokio::test(start_paused = true)]
async fn transport_failures_surface_after_retries() {
    let h = harness(
        vec![TestProvider {
            tag: "claude",
            proto: Proto::Claude,
            model_ids: vec!["claude-sonnet-4-5"],
        }],
        ResolverTables::default(),
    );
    attach_client(&h.state, api_key_client("c1", "claude", Proto::Claude));
    for _ in 0..4 {
        h.upstream.push(Scripted::Transport);
    }

    let err = h
        .engine
        .handle_generate(openai_route("claude-sonnet-4-5", false))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamTransient(_)));
}

// An expired OAuth token whose forced refresh fails never reaches the wire:
// the client is demoted and the caller sees a credential error.
#[tokio::test]
async fn expired_credential_fails_admission_after_failed_refresh() {
    let h = harness(
        vec![TestProvider {
            tag: "kiro",
            proto: Proto::Claude,
            model_ids: vec!["claude-sonnet-4-5"],
        }],
        ResolverTables::default(),
    );
    let token = mproxy_provider_core::OAuthToken {
        access_token: "stale".to_string(),
        refresh_token: "rt".to_string(),
        expires_at: time::OffsetDateTime::now_utc() - time::Duration::minutes(1),
        client_id: None,
        client_secret: None,
        start_url: None,
        region: None,
        profile_arn: None,
        auth_method: Some("social".to_string()),
        last_verified: None,
    };
    let client = Arc::new(ClientHandle::new(
        "k1".to_string(),
        "kiro",
        Proto::Claude,
        CredentialKind::OAuth,
        "user@example.com",
        0,
        Some(token),
    ));
    attach_client(&h.state, client);

    // TestProvider has no refresh support, so the forced refresh fails.
    let err = h
        .engine
        .handle_generate(openai_route("claude-sonnet-4-5", false))
        .await
        .unwrap_err();
    assert_eq!(err.status(), 401);
    // No upstream call was ever issued with the stale token.
    assert!(h.upstream.requests().is_empty());
    // The client is suspended for this model until an operator resets it.
    assert!(matches!(
        h.state.cooldown.state("k1", "claude-sonnet-4-5"),
        CooldownState::Suspended { .. }
    ));
}

// A model nobody registered fails fast with model_not_found.
#[tokio::test]
async fn unknown_model_is_not_found() {
    let h = harness(Vec::new(), ResolverTables::default());
    let err = h
        .engine
        .handle_generate(openai_route("no-such-model", false))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ModelNotFound(_)));
    assert_eq!(err.status(), 404);
}

// All candidates cooling: 503 with a Retry-After hint from the nearest
// cooldown end.
#[tokio::test]
async fn no_capacity_carries_retry_after_hint() {
    let h = harness(
        vec![TestProvider {
            tag: "claude",
            proto: Proto::Claude,
            model_ids: vec!["claude-sonnet-4-5"],
        }],
        ResolverTables::default(),
    );
    attach_client(&h.state, api_key_client("c1", "claude", Proto::Claude));
    h.state.cooldown.mark_quota("c1", "claude-sonnet-4-5");

    let err = h
        .engine
        .handle_generate(openai_route("claude-sonnet-4-5", false))
        .await
        .unwrap_err();
    let GatewayError::NoCapacity { retry_after } = err else {
        panic!("expected no-capacity error");
    };
    let hint = retry_after.expect("retry-after hint");
    assert!(hint <= std::time::Duration::from_secs(300));
    assert!(hint >= std::time::Duration::from_secs(240));
}
