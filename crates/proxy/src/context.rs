//! Per-request state threaded through the pipeline.

use std::collections::HashSet;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::classify::Classification;
use crate::error::AttemptError;
use config::EndpointKind;

/// Extended-thinking parameters observed on the inbound request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThinkingInfo {
    /// Whether `thinking.type == "enabled"`.
    pub enabled: bool,
    /// Requested `budget_tokens`, when present.
    pub budget_tokens: Option<u64>,
}

/// State needed to run the inverse transform on the response.
///
/// Lives for one request-response round trip.
#[derive(Debug, Clone, Default)]
pub struct ConversionContext {
    /// Tool-use ids carried over into the converted request, in order.
    pub tool_call_ids: Vec<String>,
    /// Stop sequences from the original request.
    pub stop_sequences: Vec<String>,
    /// Whether the caller asked for a streaming response.
    pub streaming: bool,
    /// Type of the endpoint the request was converted for.
    pub endpoint_kind: Option<EndpointKind>,
}

/// One inbound request's mutable pipeline state.
#[derive(Debug)]
pub struct RequestContext {
    /// Unique id, also used for blacklist causality.
    pub request_id: String,
    /// Pipeline entry time.
    pub start: Instant,
    /// Inbound method.
    pub method: Method,
    /// Inbound path as received.
    pub inbound_path: String,
    /// Path with any leading `/v1` stripped; used for upstream composition.
    pub request_path: String,
    /// Raw query string, when present.
    pub query: Option<String>,
    /// Inbound headers.
    pub headers: HeaderMap,
    /// Cached inbound body.
    pub body: Bytes,
    /// Classification result.
    pub classification: Classification,
    /// Tags produced by the tagger pipeline.
    pub tags: Vec<String>,
    /// Global attempt counter, 1-indexed across endpoints.
    pub attempt: u32,
    /// Model requested by the client, recorded when a rewrite fires.
    pub original_model: Option<String>,
    /// Model actually sent upstream.
    pub rewritten_model: Option<String>,
    /// Thinking parameters, for logging and tagging.
    pub thinking: Option<ThinkingInfo>,
    /// Session identifier extracted from request metadata.
    pub session_id: Option<String>,
    /// Round-trip conversion state.
    pub conversion: ConversionContext,
    /// Last attempt failure, for the final envelope.
    pub last_error: Option<AttemptError>,
    /// Last upstream status code.
    pub last_status: Option<u16>,
    /// Endpoint ids for which an OAuth refresh was already attempted.
    pub oauth_refreshed: HashSet<String>,
    /// Set when `/count_tokens` skipped at least one OpenAI endpoint.
    pub count_tokens_skipped: bool,
}

impl RequestContext {
    /// Build the context for one inbound request.
    pub fn new(method: Method, path: &str, query: Option<String>, headers: HeaderMap, body: Bytes) -> Self {
        let request_path = path.strip_prefix("/v1").unwrap_or(path).to_string();
        let session_id = extract_session_id(&body);

        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            start: Instant::now(),
            method,
            inbound_path: path.to_string(),
            request_path,
            query,
            headers,
            body,
            classification: Classification {
                format: crate::classify::RequestFormat::Unknown,
                client: crate::classify::ClientType::Unknown,
                confidence: 0.0,
                detected_by: "none",
            },
            tags: Vec::new(),
            attempt: 0,
            original_model: None,
            rewritten_model: None,
            thinking: None,
            session_id,
            conversion: ConversionContext::default(),
            last_error: None,
            last_status: None,
            oauth_refreshed: HashSet::new(),
            count_tokens_skipped: false,
        }
    }

    /// Whether this is a `/count_tokens` request.
    pub fn is_count_tokens(&self) -> bool {
        self.request_path.trim_end_matches('/').ends_with("/count_tokens")
    }

    /// Elapsed time since pipeline entry, in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

fn extract_session_id(body: &[u8]) -> Option<String> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    json.get("metadata")?.get("user_id")?.as_str().map(str::to_string)
}
