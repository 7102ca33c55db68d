use ai_gateway::client::{ProviderClient, UpstreamReply, UpstreamStream, UpstreamTarget};
use ai_gateway::config::{AccessKey, GatewayConfig};
use ai_gateway::dispatch::{Caller, DispatchOutcome, Dispatcher, InboundCall};
use ai_gateway::providers::Provider;
use ai_gateway::usage::ANONYMOUS;
use ai_gateway::{build_router, AppState, GatewayError, SharedUsageLog};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// ────────────────────────────────────────────────────────────────
// Fake provider
// ────────────────────────────────────────────────────────────────

enum Canned {
    Reply(u16, Value),
    Stream(String),
}

#[derive(Default)]
struct Recorded {
    canned: VecDeque<Canned>,
    calls: Vec<(Provider, String, Value)>,
}

/// Answers calls from a queue and remembers what it was sent.
#[derive(Clone, Default)]
struct FakeClient(Arc<Mutex<Recorded>>);

impl FakeClient {
    fn replying(canned: Vec<Canned>) -> Self {
        let fake = Self::default();
        fake.0.lock().unwrap().canned = canned.into();
        fake
    }

    fn take(&self, target: &UpstreamTarget, body: &Bytes) -> Canned {
        let mut recorded = self.0.lock().unwrap();
        let sent: Value = serde_json::from_slice(body).unwrap();
        recorded
            .calls
            .push((target.provider, target.model.clone(), sent));
        recorded.canned.pop_front().expect("unexpected upstream call")
    }

    fn calls(&self) -> Vec<(Provider, String, Value)> {
        self.0.lock().unwrap().calls.clone()
    }
}

fn reply(status: u16, body: &Value) -> UpstreamReply {
    UpstreamReply {
        status,
        content_type: Some("application/json".to_string()),
        body: Bytes::from(serde_json::to_vec(body).unwrap()),
    }
}

impl ProviderClient for FakeClient {
    async fn send(
        &self,
        target: &UpstreamTarget,
        body: Bytes,
    ) -> ai_gateway::Result<UpstreamReply> {
        match self.take(target, &body) {
            Canned::Reply(status, value) => Ok(reply(status, &value)),
            Canned::Stream(_) => panic!("stream canned for a unary call"),
        }
    }

    async fn stream(
        &self,
        target: &UpstreamTarget,
        body: Bytes,
    ) -> ai_gateway::Result<UpstreamStream> {
        match self.take(target, &body) {
            Canned::Reply(status, value) => Ok(UpstreamStream::Failed(reply(status, &value))),
            Canned::Stream(text) => {
                // Deliver in small uneven pieces, as a network would.
                let chunks: Vec<Result<Bytes, GatewayError>> = text
                    .as_bytes()
                    .chunks(7)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(UpstreamStream::Open(futures::stream::iter(chunks).boxed()))
            }
        }
    }
}

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.providers.openai.api_key = Some("sk-openai".to_string());
    config.providers.anthropic.api_key = Some("sk-anthropic".to_string());
    config.providers.gemini.api_key = Some("sk-gemini".to_string());
    config
        .models
        .insert("fast".to_string(), "gpt-4o-mini".to_string());
    config
}

fn dispatcher(fake: &FakeClient) -> (Dispatcher<FakeClient, SharedUsageLog>, SharedUsageLog) {
    let usage = SharedUsageLog::in_memory();
    let dispatcher = Dispatcher::new(Arc::new(fake.clone()), Arc::new(config()), usage.clone());
    (dispatcher, usage)
}

fn openai_completion() -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4o-2024-08-06",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello!"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    })
}

async fn collect_stream(outcome: DispatchOutcome) -> String {
    let DispatchOutcome::Stream { body } = outcome else {
        panic!("expected a stream, got {outcome:?}");
    };
    let chunks: Vec<Bytes> = body.map(|c| c.unwrap()).collect().await;
    chunks
        .iter()
        .map(|c| String::from_utf8(c.to_vec()).unwrap())
        .collect()
}

fn json_body(outcome: DispatchOutcome) -> (u16, Value) {
    match outcome {
        DispatchOutcome::Json { status, body, .. } => {
            (status, serde_json::from_slice(&body).unwrap())
        }
        DispatchOutcome::Stream { .. } => panic!("expected a JSON body"),
    }
}

// ────────────────────────────────────────────────────────────────
// Dispatcher
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_identity_relay_rewrites_alias_only() {
    let fake = FakeClient::replying(vec![Canned::Reply(200, openai_completion())]);
    let (dispatcher, usage) = dispatcher(&fake);

    let body = json!({
        "model": "fast",
        "messages": [{"role": "user", "content": "Hi"}],
        "logit_bias": {"50256": -100}
    });
    let outcome = dispatcher
        .dispatch(InboundCall::new(Provider::OpenAi, body.to_string()))
        .await
        .unwrap();

    let (status, relayed) = json_body(outcome);
    assert_eq!(status, 200);
    assert_eq!(relayed, openai_completion());

    let calls = fake.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, Provider::OpenAi);
    assert_eq!(calls[0].2["model"], "gpt-4o-mini");
    // Fields the gateway does not model survive the identity path.
    assert_eq!(calls[0].2["logit_bias"]["50256"], -100);

    let totals = usage.totals(ANONYMOUS);
    assert_eq!(totals.requests, 1);
    assert_eq!(totals.total_tokens, 5);
}

#[tokio::test]
async fn test_messages_request_converted_for_chat_provider() {
    let fake = FakeClient::replying(vec![Canned::Reply(200, openai_completion())]);
    let (dispatcher, _usage) = dispatcher(&fake);

    let body = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hi"}],
        "max_tokens": 16
    });
    let outcome = dispatcher
        .dispatch(InboundCall::new(Provider::Anthropic, body.to_string()))
        .await
        .unwrap();

    let sent = &fake.calls()[0].2;
    assert_eq!(sent["messages"], json!([{"role": "user", "content": "Hi"}]));
    assert_eq!(sent["max_tokens"], 16);
    assert!(sent.get("system").is_none());

    let (status, message) = json_body(outcome);
    assert_eq!(status, 200);
    assert_eq!(message["type"], "message");
    assert_eq!(message["model"], "gpt-4o");
    assert_eq!(message["content"][0]["text"], "Hello!");
    assert_eq!(message["stop_reason"], "end_turn");
    assert_eq!(message["usage"]["input_tokens"], 3);
}

#[tokio::test]
async fn test_upstream_error_relayed_verbatim() {
    let error = json!({"error": {"message": "Rate limit reached", "type": "rate_limit_error"}});
    let fake = FakeClient::replying(vec![Canned::Reply(429, error.clone())]);
    let (dispatcher, usage) = dispatcher(&fake);

    let body = json!({
        "model": "gpt-4o",
        "max_tokens": 10,
        "messages": [{"role": "user", "content": "Hi"}]
    });
    let outcome = dispatcher
        .dispatch(InboundCall::new(Provider::Anthropic, body.to_string()))
        .await
        .unwrap();

    let (status, relayed) = json_body(outcome);
    assert_eq!(status, 429);
    assert_eq!(relayed, error);
    assert_eq!(usage.totals(ANONYMOUS).requests, 1);
}

#[tokio::test]
async fn test_bound_key_on_other_provider_is_rejected() {
    let fake = FakeClient::default();
    let (dispatcher, usage) = dispatcher(&fake);

    let caller = Caller {
        name: "team-a".to_string(),
        provider: Some(Provider::Anthropic),
    };
    let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "Hi"}]});
    let err = dispatcher
        .dispatch(InboundCall::new(Provider::OpenAi, body.to_string()).with_caller(caller))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::ProtocolMismatch { .. }));
    assert_eq!(err.status().as_u16(), 400);
    assert!(fake.calls().is_empty());
    assert_eq!(usage.totals("team-a").requests, 0);
}

#[tokio::test]
async fn test_malformed_body_is_invalid_request() {
    let fake = FakeClient::default();
    let (dispatcher, _usage) = dispatcher(&fake);

    let err = dispatcher
        .dispatch(InboundCall::new(Provider::Anthropic, "{\"model\":"))
        .await
        .unwrap_err();
    assert_eq!(err.status().as_u16(), 400);

    let err = dispatcher
        .dispatch(InboundCall::new(Provider::OpenAi, json!({"messages": []}).to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest { .. }));
}

#[tokio::test]
async fn test_unreadable_success_body_is_bad_gateway() {
    let fake = FakeClient::replying(vec![Canned::Reply(200, json!({"choices": "nope"}))]);
    let (dispatcher, _usage) = dispatcher(&fake);

    let body = json!({
        "model": "gpt-4o",
        "max_tokens": 10,
        "messages": [{"role": "user", "content": "Hi"}]
    });
    let err = dispatcher
        .dispatch(InboundCall::new(Provider::Anthropic, body.to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.status().as_u16(), 502);
}

const CHAT_STREAM: &str = concat!(
    "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",",
    "\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
    "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",",
    "\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
    "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",",
    "\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",",
    "\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":1,\"total_tokens\":6}}\n\n",
    "data: [DONE]\n\n",
);

#[tokio::test]
async fn test_chat_stream_converted_for_messages_caller() {
    let fake = FakeClient::replying(vec![Canned::Stream(CHAT_STREAM.to_string())]);
    let (dispatcher, usage) = dispatcher(&fake);

    let body = json!({
        "model": "gpt-4o",
        "max_tokens": 16,
        "stream": true,
        "messages": [{"role": "user", "content": "Hi"}]
    });
    let outcome = dispatcher
        .dispatch(InboundCall::new(Provider::Anthropic, body.to_string()))
        .await
        .unwrap();
    let text = collect_stream(outcome).await;

    let sent = &fake.calls()[0].2;
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["stream_options"]["include_usage"], true);

    let events: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .collect();
    assert_eq!(
        events,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "message_delta",
            "message_stop"
        ]
    );
    assert!(text.contains("\"text\":\"Hi\""));
    assert!(text.contains("\"stop_reason\":\"end_turn\""));

    let totals = usage.totals(ANONYMOUS);
    assert_eq!(totals.requests, 1);
    assert_eq!(totals.prompt_tokens, 5);
    assert_eq!(totals.completion_tokens, 1);
}

const MESSAGES_STREAM: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",",
    "\"content\":[],\"model\":\"claude-sonnet-4\",\"usage\":{\"input_tokens\":8,\"output_tokens\":1}}}\n\n",
    "event: content_block_start\n",
    "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    "event: ping\n",
    "data: {\"type\":\"ping\"}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Héllo\"}}\n\n",
    "event: content_block_stop\n",
    "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

#[tokio::test]
async fn test_messages_stream_converted_for_generate_content_caller() {
    let fake = FakeClient::replying(vec![Canned::Stream(MESSAGES_STREAM.to_string())]);
    let (dispatcher, usage) = dispatcher(&fake);

    let body = json!({"contents": [{"role": "user", "parts": [{"text": "Hi"}]}]});
    let outcome = dispatcher
        .dispatch(
            InboundCall::new(Provider::Gemini, body.to_string()).with_path("claude-sonnet-4", true),
        )
        .await
        .unwrap();
    let text = collect_stream(outcome).await;

    let (provider, model, sent) = fake.calls().remove(0);
    assert_eq!(provider, Provider::Anthropic);
    assert_eq!(model, "claude-sonnet-4");
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["max_tokens"], 4096);

    let frames: Vec<Value> = text
        .split("\n\n")
        .filter_map(|f| f.strip_prefix("data: "))
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["candidates"][0]["content"]["parts"][0]["text"], "Héllo");
    assert_eq!(frames[1]["candidates"][0]["finishReason"], "STOP");
    assert_eq!(frames[1]["usageMetadata"]["totalTokenCount"], 12);
    assert_eq!(usage.totals(ANONYMOUS).total_tokens, 12);
}

#[tokio::test]
async fn test_identity_stream_relayed_untouched() {
    let fake = FakeClient::replying(vec![Canned::Stream(CHAT_STREAM.to_string())]);
    let (dispatcher, usage) = dispatcher(&fake);

    let body = json!({
        "model": "gpt-4o",
        "stream": true,
        "messages": [{"role": "user", "content": "Hi"}]
    });
    let outcome = dispatcher
        .dispatch(InboundCall::new(Provider::OpenAi, body.to_string()))
        .await
        .unwrap();

    assert_eq!(collect_stream(outcome).await, CHAT_STREAM);
    assert_eq!(usage.totals(ANONYMOUS).total_tokens, 6);
}

#[tokio::test]
async fn test_abandoned_stream_still_records_once() {
    let fake = FakeClient::replying(vec![Canned::Stream(CHAT_STREAM.to_string())]);
    let (dispatcher, usage) = dispatcher(&fake);

    let body = json!({
        "model": "gpt-4o",
        "max_tokens": 16,
        "stream": true,
        "messages": [{"role": "user", "content": "Hi"}]
    });
    let outcome = dispatcher
        .dispatch(InboundCall::new(Provider::Anthropic, body.to_string()))
        .await
        .unwrap();

    let DispatchOutcome::Stream { mut body } = outcome else {
        panic!("expected a stream");
    };
    assert!(body.next().await.is_some());
    assert_eq!(usage.totals(ANONYMOUS).requests, 0);
    drop(body);
    assert_eq!(usage.totals(ANONYMOUS).requests, 1);
}

// ────────────────────────────────────────────────────────────────
// Server
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_server_roundtrip() {
    let message = json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": "claude-sonnet-4",
        "content": [{"type": "text", "text": "pong"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 4, "output_tokens": 1}
    });
    let fake = FakeClient::replying(vec![Canned::Reply(200, message)]);

    let mut config = config();
    config.access_keys.push(AccessKey {
        key: "gw-1".to_string(),
        name: "team".to_string(),
        provider: None,
    });
    let usage = SharedUsageLog::in_memory();
    let state = Arc::new(AppState::new(config, fake.clone(), usage));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();

    let health = client.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let req_body = json!({"contents": [{"role": "user", "parts": [{"text": "ping"}]}]});

    let denied = client
        .post(format!("http://{addr}/v1beta/models/claude-sonnet-4:generateContent"))
        .json(&req_body)
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);
    let denied: Value = denied.json().await.unwrap();
    assert_eq!(denied["error"]["status"], "UNAUTHENTICATED");

    let resp = client
        .post(format!("http://{addr}/v1beta/models/claude-sonnet-4:generateContent"))
        .header("x-goog-api-key", "gw-1")
        .json(&req_body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "pong");
    assert_eq!(body["candidates"][0]["finishReason"], "STOP");

    let usage: Value = client
        .get(format!("http://{addr}/v1/usage?key=gw-1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(usage["key"], "team");
    assert_eq!(usage["requests"], 1);
    assert_eq!(usage["total_tokens"], 5);

    let models: Value = client
        .get(format!("http://{addr}/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["data"][0]["id"], "fast");
    assert_eq!(models["data"][0]["owned_by"], "openai");
}
