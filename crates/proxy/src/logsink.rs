//! Request log records and the sink collaborator contract.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

/// One attempt's log record. Created per attempt, appended to the sink,
/// never mutated after emission.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RequestLog {
    /// Inbound request id.
    pub request_id: String,
    /// Global attempt number, 1-indexed.
    pub attempt_number: u32,
    /// Endpoint the attempt targeted.
    pub endpoint: String,
    /// Inbound HTTP method.
    pub method: String,
    /// Inbound path.
    pub path: String,
    /// Upstream status code; 0 when the attempt failed before a response.
    pub status_code: u16,
    /// Wall time of the attempt.
    pub duration_ms: u64,
    /// Headers as received from the client.
    pub request_headers: HashMap<String, String>,
    /// Headers as sent upstream.
    pub final_request_headers: HashMap<String, String>,
    /// Headers as received from upstream.
    pub response_headers: HashMap<String, String>,
    /// Body as received from the client.
    pub request_body: String,
    /// Body as sent upstream.
    pub final_request_body: String,
    /// Body as received from upstream (possibly truncated for streams).
    pub response_body: String,
    /// Body as returned to the client.
    pub final_response_body: String,
    /// Model requested by the client.
    pub model: Option<String>,
    /// Model sent upstream after rewrite.
    pub rewritten_model: Option<String>,
    /// Whether extended thinking was enabled.
    pub thinking_enabled: bool,
    /// Requested thinking budget.
    pub thinking_budget_tokens: Option<u64>,
    /// Tags attached by the tagger pipeline.
    pub tags: Vec<String>,
    /// Set when the declared content type was overridden.
    pub content_type_override: Option<String>,
    /// Whether the response streamed.
    pub is_streaming: bool,
    /// Terminal error label, when the attempt failed.
    pub error: Option<String>,
    /// For virtual blacklist entries: the request ids that caused the blacklist.
    pub blacklist_causing_request_ids: Vec<String>,
    /// Detected client type label.
    pub client_type: String,
    /// Detected request format label.
    pub request_format: String,
    /// Endpoint wire format label.
    pub target_format: String,
    /// Whether the body was format-converted.
    pub format_converted: bool,
    /// Classifier confidence.
    pub detection_confidence: f32,
    /// Which detector classified the request.
    pub detected_by: String,
    /// Session identifier, when the client supplied one.
    pub session_id: Option<String>,
    /// Record creation time.
    pub created_at: Option<jiff::Timestamp>,
}

impl RequestLog {
    /// Whether this record represents a failed attempt.
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.status_code >= 400
    }
}

/// The persistent log store collaborator.
///
/// `save_log` is fire-and-forget; failures must not block the pipeline.
#[async_trait]
pub trait RequestLogSink: Send + Sync {
    /// Append one record.
    async fn save_log(&self, log: RequestLog);
    /// Page through records, newest first.
    async fn get_logs(&self, limit: usize, offset: usize, failed_only: bool) -> Vec<RequestLog>;
    /// All attempts for one request id, in attempt order.
    async fn get_all_logs_by_request_id(&self, request_id: &str) -> Vec<RequestLog>;
    /// Drop records older than `days`. Returns the number removed.
    async fn cleanup_logs_by_days(&self, days: u32) -> usize;
}

/// In-memory sink; the default collaborator and the test double.
#[derive(Default)]
pub struct MemoryLogSink {
    logs: Mutex<Vec<RequestLog>>,
}

impl MemoryLogSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestLogSink for MemoryLogSink {
    async fn save_log(&self, log: RequestLog) {
        self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(log);
    }

    async fn get_logs(&self, limit: usize, offset: usize, failed_only: bool) -> Vec<RequestLog> {
        let logs = self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        logs.iter()
            .rev()
            .filter(|log| !failed_only || log.is_failure())
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn get_all_logs_by_request_id(&self, request_id: &str) -> Vec<RequestLog> {
        let logs = self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        logs.iter().filter(|log| log.request_id == request_id).cloned().collect()
    }

    async fn cleanup_logs_by_days(&self, days: u32) -> usize {
        let cutoff = jiff::Timestamp::now() - jiff::SignedDuration::from_hours(24 * i64::from(days));
        let mut logs = self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = logs.len();
        logs.retain(|log| log.created_at.is_none_or(|at| at >= cutoff));
        before - logs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: &str, status: u16) -> RequestLog {
        RequestLog {
            request_id: request_id.to_string(),
            status_code: status,
            created_at: Some(jiff::Timestamp::now()),
            ..RequestLog::default()
        }
    }

    #[tokio::test]
    async fn failed_only_filters() {
        let sink = MemoryLogSink::new();
        sink.save_log(record("a", 200)).await;
        sink.save_log(record("b", 502)).await;

        let failed = sink.get_logs(10, 0, true).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].request_id, "b");
    }

    #[tokio::test]
    async fn lookup_by_request_id() {
        let sink = MemoryLogSink::new();
        sink.save_log(record("a", 200)).await;
        sink.save_log(record("a", 500)).await;
        sink.save_log(record("b", 200)).await;

        assert_eq!(sink.get_all_logs_by_request_id("a").await.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_old_records() {
        let sink = MemoryLogSink::new();
        let mut old = record("a", 200);
        old.created_at = Some(jiff::Timestamp::now() - jiff::SignedDuration::from_hours(24 * 10));
        sink.save_log(old).await;
        sink.save_log(record("b", 200)).await;

        let removed = sink.cleanup_logs_by_days(7).await;
        assert_eq!(removed, 1);
        assert_eq!(sink.get_logs(10, 0, false).await.len(), 1);
    }
}
