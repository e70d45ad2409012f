//! The Switchyard request pipeline: classification, tagging, endpoint
//! selection, bidirectional format conversion, streaming response
//! rewriting, failure state, retry/failover, and health checking.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;

pub mod auth;
pub mod classify;
pub mod context;
pub mod convert;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod health;
pub mod logsink;
pub mod pipeline;
pub mod restore;
pub mod retry;
pub mod streaming;
pub mod tagger;
pub mod transform;
pub mod validate;
pub mod wildcard;

pub use error::{AttemptError, ErrorKind, ProxyError};
pub use health::HealthChecker;
pub use logsink::{MemoryLogSink, RequestLog, RequestLogSink};
pub use pipeline::ProxyServer;

async fn handler(State(server): State<Arc<ProxyServer>>, request: axum::extract::Request) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            log::warn!("failed to read request body: {err}");
            return ProxyError::InvalidRequest(format!("failed to read request body: {err}")).into_response();
        }
    };

    server.handle(parts.method, parts.uri, parts.headers, bytes).await
}

/// The inbound router: Anthropic-shaped traffic under `/v1`, Codex
/// traffic at `/responses`, direct OpenAI traffic at `/chat/completions`.
pub fn router(server: Arc<ProxyServer>) -> Router {
    Router::new()
        .route("/v1/{*path}", any(handler))
        .route("/responses", any(handler))
        .route("/chat/completions", any(handler))
        .with_state(server)
}
