//! End-to-end pipeline flows against mock upstreams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use http::{HeaderMap, Method, Uri};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use proxy::{MemoryLogSink, ProxyServer, RequestLogSink};

async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    address
}

fn proxy_for(yaml: &str) -> (Arc<ProxyServer>, Arc<MemoryLogSink>) {
    let config: config::Config = serde_yaml::from_str(yaml).unwrap();
    let sink = Arc::new(MemoryLogSink::new());
    let server = ProxyServer::new(&config, sink.clone(), None, None).unwrap();
    (Arc::new(server), sink)
}

async fn send_json(server: &ProxyServer, path: &str, body: Value) -> (u16, Value) {
    let response = send_raw(server, path, body).await;
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn send_raw(server: &ProxyServer, path: &str, body: Value) -> Response {
    let uri: Uri = path.parse().unwrap();
    server
        .handle(
            Method::POST,
            uri,
            HeaderMap::new(),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .await
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn codex_first_use_probing_flips_and_converts() {
    #[derive(Clone, Default)]
    struct Hits {
        responses: Arc<AtomicU32>,
        chat: Arc<AtomicU32>,
        chat_body: Arc<std::sync::Mutex<Option<Value>>>,
    }
    let hits = Hits::default();

    let app = Router::new()
        .route(
            "/responses",
            post(|State(hits): State<Hits>| async move {
                hits.responses.fetch_add(1, Ordering::SeqCst);
                (StatusCode::BAD_REQUEST, Json(json!({"error": {"message": "unknown endpoint"}})))
            }),
        )
        .route(
            "/chat/completions",
            post(|State(hits): State<Hits>, Json(body): Json<Value>| async move {
                hits.chat.fetch_add(1, Ordering::SeqCst);
                *hits.chat_body.lock().unwrap() = Some(body);
                Json(json!({
                    "id": "chatcmpl-1",
                    "model": "gpt-4o",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "hi there"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}
                }))
            }),
        )
        .with_state(hits.clone());

    let upstream = spawn_upstream(app).await;
    let (server, _sink) = proxy_for(&format!(
        r#"
endpoints:
  - name: probing
    url: http://{upstream}
    kind: openai
    auth:
      kind: auth_token
      value: t
"#
    ));

    let (status, _) = send_json(
        &server,
        "/responses",
        json!({
            "instructions": "be brief",
            "input": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}],
            "stream": false
        }),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(hits.responses.load(Ordering::SeqCst), 1);
    assert_eq!(hits.chat.load(Ordering::SeqCst), 1);
    assert_eq!(server.endpoints[0].native_codex_format(), Some(false));

    let converted = hits.chat_body.lock().unwrap().clone().unwrap();
    assert_eq!(
        converted["messages"],
        json!([{"role": "system", "content": "be brief"}, {"role": "user", "content": "hi"}])
    );
    assert_eq!(converted["stream"], json!(false));
    assert!(converted.get("input").is_none());

    // The verdict is sticky: the next request goes straight to chat.
    let (status, _) = send_json(
        &server,
        "/responses",
        json!({"instructions": "x", "input": [{"role": "user", "content": [{"type": "text", "text": "again"}]}]}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(hits.responses.load(Ordering::SeqCst), 1);
    assert_eq!(hits.chat.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn learned_parameter_is_stripped_and_retried() {
    #[derive(Clone, Default)]
    struct Seen {
        bodies: Arc<std::sync::Mutex<Vec<Value>>>,
    }
    let seen = Seen::default();

    let app = Router::new()
        .route(
            "/chat/completions",
            post(|State(seen): State<Seen>, Json(body): Json<Value>| async move {
                seen.bodies.lock().unwrap().push(body.clone());
                if body.get("tool_choice").is_some() || body.get("tools").is_some() {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": {"message": "tool_choice is not supported"}})),
                    )
                        .into_response();
                }
                Json(json!({
                    "id": "chatcmpl-2",
                    "model": "m",
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
                }))
                .into_response()
            }),
        )
        .with_state(seen.clone());

    let upstream = spawn_upstream(app).await;
    let (server, _sink) = proxy_for(&format!(
        r#"
endpoints:
  - name: learner
    url: http://{upstream}
    kind: openai
    auth:
      kind: auth_token
      value: t
"#
    ));

    let (status, _) = send_json(
        &server,
        "/chat/completions",
        json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "f"}}],
            "tool_choice": "auto"
        }),
    )
    .await;

    assert_eq!(status, 200);

    let learned = server.endpoints[0].learned_params();
    assert!(learned.contains("tools"));
    assert!(learned.contains("tool_choice"));

    // The retry carried the stripped body.
    let bodies = seen.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 2);
    assert!(bodies[1].get("tools").is_none());
    assert!(bodies[1].get("tool_choice").is_none());

    // Subsequent requests from any client are auto-stripped.
    let (status, _) = send_json(
        &server,
        "/chat/completions",
        json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "f"}}]
        }),
    )
    .await;
    assert_eq!(status, 200);
    let bodies = seen.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 3);
    assert!(bodies[2].get("tools").is_none());
}

#[tokio::test]
async fn blacklist_and_two_phase_failover() {
    let failing_hits = Arc::new(AtomicU32::new(0));
    let failing_hits_handler = Arc::clone(&failing_hits);

    let failing = Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = Arc::clone(&failing_hits_handler);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"})))
            }
        }),
    );

    let healthy = Router::new().route(
        "/v1/messages",
        post(|| async {
            Json(json!({
                "id": "msg_ok", "type": "message", "role": "assistant",
                "model": "claude-3-5-haiku-20241022",
                "content": [{"type": "text", "text": "served by backup"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 2, "output_tokens": 2}
            }))
        }),
    );

    let failing_addr = spawn_upstream(failing).await;
    let healthy_addr = spawn_upstream(healthy).await;

    let (server, sink) = proxy_for(&format!(
        r#"
endpoints:
  - name: fast-primary
    url: http://{failing_addr}
    kind: anthropic
    priority: 1
    tags: [fast]
    auth:
      kind: api_key
      value: k
  - name: backup
    url: http://{healthy_addr}
    kind: anthropic
    priority: 2
    auth:
      kind: api_key
      value: k
taggers:
  - name: everything-is-fast
    kind: model
    pattern: "*"
    tag: fast
"#
    ));

    let request = json!({
        "model": "claude-3-5-haiku-20241022",
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "hi"}]
    });

    // First tagged request: two in-place attempts on the primary, then
    // failover to the universal backup.
    let (status, body) = send_json(&server, "/v1/messages", request.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body["content"][0]["text"], json!("served by backup"));
    assert_eq!(failing_hits.load(Ordering::SeqCst), 2);

    // Second request pushes the primary past the failure threshold.
    let (status, _) = send_json(&server, "/v1/messages", request.clone()).await;
    assert_eq!(status, 200);
    assert!(!server.endpoints[0].is_available());
    let reason = server.endpoints[0].snapshot().blacklist.unwrap();
    assert!(!reason.causing_request_ids.is_empty());

    // Third request skips the blacklisted primary entirely, emitting a
    // virtual 503 log that names the causing request ids.
    let before = failing_hits.load(Ordering::SeqCst);
    let (status, _) = send_json(&server, "/v1/messages", request).await;
    assert_eq!(status, 200);
    assert_eq!(failing_hits.load(Ordering::SeqCst), before);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let logs = sink.get_logs(100, 0, false).await;
    let virtual_log = logs
        .iter()
        .find(|log| log.status_code == 503 && log.endpoint == "fast-primary")
        .expect("virtual blacklist log expected");
    assert_eq!(virtual_log.blacklist_causing_request_ids, reason.causing_request_ids);
}

#[tokio::test]
async fn anthropic_tool_call_round_trip_through_openai_endpoint() {
    let app = Router::new().route(
        "/chat/completions",
        post(|Json(body): Json<Value>| async move {
            // The converted request carries the tool schema.
            assert_eq!(body["tools"][0]["function"]["name"], json!("get_weather"));
            Json(json!({
                "id": "chatcmpl-3",
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_abc",
                            "type": "function",
                            "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 9, "completion_tokens": 5, "total_tokens": 14}
            }))
        }),
    );

    let upstream = spawn_upstream(app).await;
    let (server, _sink) = proxy_for(&format!(
        r#"
endpoints:
  - name: oa
    url: http://{upstream}
    kind: openai
    auth:
      kind: auth_token
      value: t
"#
    ));

    let (status, body) = send_json(
        &server,
        "/v1/messages",
        json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": "weather in paris?"}],
            "tools": [{"name": "get_weather", "description": "d", "input_schema": {"type": "object"}}]
        }),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["type"], json!("message"));
    assert_eq!(body["stop_reason"], json!("tool_use"));

    let block = &body["content"][0];
    assert_eq!(block["type"], json!("tool_use"));
    assert_eq!(block["id"], json!("call_abc"));
    assert_eq!(block["name"], json!("get_weather"));
    assert_eq!(block["input"], json!({"city": "Paris"}));
}

#[tokio::test]
async fn codex_sse_stream_is_reformatted_to_responses_events() {
    let app = Router::new()
        .route(
            "/responses",
            post(|| async { (StatusCode::NOT_FOUND, Json(json!({"error": {"message": "no such route"}}))) }),
        )
        .route(
            "/chat/completions",
            post(|| async {
                let body = concat!(
                    "data: {\"id\":\"chatcmpl-4\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hello\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"!\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
                    "data: [DONE]\n\n",
                );
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/event-stream")
                    .body(axum::body::Body::from(body))
                    .unwrap()
            }),
        );

    let upstream = spawn_upstream(app).await;
    let (server, _sink) = proxy_for(&format!(
        r#"
endpoints:
  - name: oa
    url: http://{upstream}
    kind: openai
    auth:
      kind: auth_token
      value: t
"#
    ));

    let response = send_raw(
        &server,
        "/responses",
        json!({
            "instructions": "be brief",
            "input": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}],
            "stream": true
        }),
    )
    .await;

    assert_eq!(response.status().as_u16(), 200);
    let text = body_text(response).await;

    let created = text.find("event: response.created").expect("response.created");
    let first_delta = text.find("event: response.output_text.delta").expect("first delta");
    let completed = text.find("event: response.completed").expect("response.completed");
    assert!(created < first_delta && first_delta < completed);
    assert!(text.contains(r#""delta":"Hello""#));
    assert!(text.contains(r#""delta":"!""#));
    assert!(!text.contains("[DONE]"));
}

#[tokio::test]
async fn anthropic_client_receives_converted_sse_from_openai_endpoint() {
    let app = Router::new().route(
        "/chat/completions",
        post(|| async {
            let body = concat!(
                "data: {\"id\":\"chatcmpl-5\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"}}]}\n\n",
                "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1}}\n\n",
                "data: [DONE]\n\n",
            );
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(axum::body::Body::from(body))
                .unwrap()
        }),
    );

    let upstream = spawn_upstream(app).await;
    let (server, _sink) = proxy_for(&format!(
        r#"
endpoints:
  - name: oa
    url: http://{upstream}
    kind: openai
    auth:
      kind: auth_token
      value: t
"#
    ));

    let response = send_raw(
        &server,
        "/v1/messages",
        json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 64,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;

    assert_eq!(response.status().as_u16(), 200);
    let text = body_text(response).await;

    assert!(text.contains("event: message_start"));
    assert!(text.contains(r#""text":"Hi""#));
    assert!(text.contains("event: message_delta"));
    assert!(text.contains("event: message_stop"));
    assert!(!text.contains("[DONE]"));
    // The model name the client sees is the one it asked for.
    assert!(text.contains("claude-sonnet-4-20250514"));
}

#[tokio::test]
async fn count_tokens_with_only_openai_candidates_is_404() {
    let (server, _sink) = proxy_for(
        r#"
endpoints:
  - name: oa
    url: http://127.0.0.1:9
    kind: openai
    auth:
      kind: auth_token
      value: t
"#,
    );

    let (status, body) = send_json(
        &server,
        "/v1/messages/count_tokens",
        json!({"model": "claude-3-opus", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;

    assert_eq!(status, 404);
    assert_eq!(body["type"], json!("count_tokens_unsupported"));
}

#[tokio::test]
async fn exhausted_pool_yields_502_envelope_with_diagnostics() {
    let failing = Router::new().route(
        "/v1/messages",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "down"}))) }),
    );
    let upstream = spawn_upstream(failing).await;

    let (server, _sink) = proxy_for(&format!(
        r#"
endpoints:
  - name: only
    url: http://{upstream}
    kind: anthropic
    auth:
      kind: api_key
      value: k
"#
    ));

    let (status, body) = send_json(
        &server,
        "/v1/messages",
        json!({"model": "m", "max_tokens": 5, "messages": [{"role": "user", "content": "x"}]}),
    )
    .await;

    assert_eq!(status, 502);
    assert_eq!(body["type"], json!("all_endpoints_failed"));
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("universal"));
    assert!(message.contains("active"));
}
