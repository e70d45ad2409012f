use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Terminal classification of one upstream attempt.
///
/// The retry controller uses these to decide between retrying the same
/// endpoint and failing over to the next candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 4xx status or a pre-flight failure (conversion, auth, request construction).
    Client,
    /// 5xx status.
    Server,
    /// Connect, timeout, DNS or dial failure.
    Network,
    /// Response `usage` carried all-zero token counts.
    UsageValidation,
    /// SSE stream ended without a completion marker.
    SseValidation,
    /// Standard-response schema or response-conversion failure.
    OtherValidation,
    /// Response body read failed mid-stream.
    ResponseTimeout,
}

impl ErrorKind {
    /// Whether this failure is worth retrying on the same endpoint
    /// before failing over.
    pub fn retry_in_place(self) -> bool {
        matches!(
            self,
            Self::Server | Self::Network | Self::UsageValidation | Self::SseValidation
        )
    }

    /// Stable label recorded in request logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::Client => "client_error",
            Self::Server => "server_error",
            Self::Network => "network_error",
            Self::UsageValidation => "usage_validation_error",
            Self::SseValidation => "sse_validation_error",
            Self::OtherValidation => "other_validation_error",
            Self::ResponseTimeout => "response_timeout_error",
        }
    }
}

/// Classify an upstream HTTP status code.
pub fn classify_status(status: u16) -> ErrorKind {
    if (500..=599).contains(&status) {
        ErrorKind::Server
    } else {
        ErrorKind::Client
    }
}

/// One failed upstream attempt, as fed back into the retry controller.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} ({status:?}): {summary}")]
pub struct AttemptError {
    /// Failure category.
    pub kind: ErrorKind,
    /// HTTP status when the upstream produced one.
    pub status: Option<u16>,
    /// Short human-readable summary for logs and the final envelope.
    pub summary: String,
    /// Set for pre-flight failures (conversion, request construction)
    /// that abort the whole request when they happen on the first
    /// attempt.
    pub preflight: bool,
}

impl AttemptError {
    pub(crate) fn new(kind: ErrorKind, status: Option<u16>, summary: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            summary: summary.into(),
            preflight: false,
        }
    }

    pub(crate) fn preflight(summary: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Client,
            status: None,
            summary: summary.into(),
            preflight: true,
        }
    }

    pub(crate) fn network(summary: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, None, summary)
    }
}

/// Terminal pipeline errors surfaced to the caller.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No endpoint qualified for the request.
    #[error("no endpoint available: {diagnostics}")]
    NoEndpointAvailable {
        /// Request id for correlation.
        request_id: String,
        /// Tags the request required.
        tags: Vec<String>,
        /// Active-vs-total counts per selection tier.
        diagnostics: String,
    },

    /// Every candidate endpoint was tried and failed.
    #[error("all endpoints failed: {summary}")]
    AllEndpointsFailed {
        /// Request id for correlation.
        request_id: String,
        /// Tags the request required.
        tags: Vec<String>,
        /// Active-vs-total counts per selection tier.
        diagnostics: String,
        /// Blacklisted endpoints skipped during failover, with causal request ids.
        blacklisted: Vec<(String, Vec<String>)>,
        /// Last attempt's failure summary.
        summary: String,
    },

    /// `/count_tokens` had only OpenAI-typed candidates.
    #[error("count_tokens is not supported by any candidate endpoint")]
    CountTokensUnsupported,

    /// The inbound request could not be transformed at all.
    #[error("request rejected: {0}")]
    InvalidRequest(String),
}

#[derive(Serialize)]
struct ErrorEnvelope {
    r#type: &'static str,
    message: String,
}

impl ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::CountTokensUnsupported => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn envelope(&self) -> ErrorEnvelope {
        match self {
            Self::NoEndpointAvailable {
                request_id,
                tags,
                diagnostics,
            } => ErrorEnvelope {
                r#type: "no_endpoint_available",
                message: format!("request {request_id} (tags {tags:?}) matched no available endpoint; {diagnostics}"),
            },
            Self::AllEndpointsFailed {
                request_id,
                tags,
                diagnostics,
                blacklisted,
                summary,
            } => {
                let mut message =
                    format!("request {request_id} (tags {tags:?}) failed at every endpoint; {diagnostics}; last error: {summary}");
                if !blacklisted.is_empty() {
                    let names: Vec<String> = blacklisted
                        .iter()
                        .map(|(name, ids)| format!("{name} (caused by {})", ids.join(", ")))
                        .collect();
                    message.push_str(&format!("; blacklisted: {}", names.join("; ")));
                }
                ErrorEnvelope {
                    r#type: "all_endpoints_failed",
                    message,
                }
            }
            Self::CountTokensUnsupported => ErrorEnvelope {
                r#type: "count_tokens_unsupported",
                message: "count_tokens is not supported by any candidate endpoint".to_string(),
            },
            Self::InvalidRequest(message) => ErrorEnvelope {
                r#type: "invalid_request",
                message: message.clone(),
            },
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.envelope())).into_response()
    }
}
