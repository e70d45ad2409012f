//! Background health checker: a synthetic Anthropic request per
//! endpoint on a fixed interval, run through the live transform
//! pipeline.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::classify::{Classification, ClientType, RequestFormat};
use crate::context::RequestContext;
use crate::endpoint::{Endpoint, EndpointStatus, StatePersister};
use crate::pipeline::TrafficShape;
use crate::transform::{self, TransformEnv};
use crate::{dispatch, validate};
use config::{DefaultsConfig, ServerConfig};

/// Periodically probes every enabled endpoint.
pub struct HealthChecker {
    endpoints: Vec<Arc<Endpoint>>,
    defaults: DefaultsConfig,
    server: ServerConfig,
    shape: Arc<Mutex<TrafficShape>>,
    oauth_http: reqwest::Client,
    persister: Option<Arc<dyn StatePersister>>,
}

impl HealthChecker {
    /// Build a checker over the shared endpoint pool.
    pub fn new(
        endpoints: Vec<Arc<Endpoint>>,
        defaults: DefaultsConfig,
        server: ServerConfig,
        shape: Arc<Mutex<TrafficShape>>,
        oauth_http: reqwest::Client,
        persister: Option<Arc<dyn StatePersister>>,
    ) -> Self {
        Self {
            endpoints,
            defaults,
            server,
            shape,
            oauth_http,
            persister,
        }
    }

    /// Run sweeps until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.server.health_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.sweep().await,
            }
        }
    }

    async fn sweep(&self) {
        for endpoint in &self.endpoints {
            if !endpoint.enabled() {
                continue;
            }
            self.check(endpoint).await;
        }
    }

    /// Probe one endpoint; outcomes feed the same state machine as
    /// live traffic.
    pub async fn check(&self, endpoint: &Arc<Endpoint>) {
        // Endpoints sitting out a rate-limit window are skipped, with a
        // throttled log line.
        let now_unix = jiff::Timestamp::now().as_second();
        if endpoint.is_anthropic_domain()
            && let Some(reset) = endpoint.rate_limited_until(now_unix)
        {
            if endpoint.should_log_skip() {
                log::info!(
                    "skipping health check for endpoint '{}' until rate limit resets at {reset}",
                    endpoint.name
                );
            }
            return;
        }

        let was_inactive = endpoint.status() == EndpointStatus::Inactive;
        if was_inactive {
            endpoint.set_checking(true);
        }

        let healthy = self.probe(endpoint).await;

        if was_inactive {
            endpoint.set_checking(false);
        }

        let probe_id = format!("health-{}", uuid::Uuid::new_v4().simple());
        let outcome = endpoint.record_request(healthy, &probe_id, (!healthy).then_some("health check failed"));

        if let Some(reason) = outcome.became_inactive {
            log::warn!(
                "endpoint '{}' marked inactive by health checker (caused by {:?})",
                endpoint.name,
                reason.causing_request_ids
            );
        }
        if outcome.reactivated {
            log::info!("endpoint '{}' recovered; back in rotation", endpoint.name);
        }
    }

    async fn probe(&self, endpoint: &Arc<Endpoint>) -> bool {
        let shape = self
            .shape
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let body = json!({
            "model": shape.model.clone().unwrap_or_else(|| self.defaults.health_model.clone()),
            "max_tokens": self.defaults.health_max_tokens,
            "messages": [{"role": "user", "content": "hello"}],
            "system": [{"type": "text", "text": "Reply with a single word."}],
            "temperature": 0.0,
            "stream": shape.stream,
        });

        let mut headers = HeaderMap::new();
        if let Some(agent) = &shape.user_agent
            && let Ok(value) = agent.parse()
        {
            headers.insert(http::header::USER_AGENT, value);
        }
        let version = shape.anthropic_version.as_deref().unwrap_or("2023-06-01");
        if let Ok(value) = version.parse() {
            headers.insert("anthropic-version", value);
        }
        if let Some(beta) = &shape.anthropic_beta
            && let Ok(value) = beta.parse()
        {
            headers.insert("anthropic-beta", value);
        }

        let mut ctx = RequestContext::new(
            Method::POST,
            "/v1/messages",
            None,
            headers,
            Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
        );
        ctx.classification = Classification {
            format: RequestFormat::Anthropic,
            client: ClientType::ClaudeCode,
            confidence: 0.95,
            detected_by: "health",
        };

        let env = TransformEnv {
            endpoint,
            defaults: &self.defaults,
            oauth_http: &self.oauth_http,
            persister: self.persister.as_ref(),
            use_native_codex: false,
        };

        let prepared = match transform::prepare(&mut ctx, &env).await {
            Ok(prepared) => prepared,
            Err(err) => {
                log::warn!("health check for endpoint '{}' failed to prepare: {err}", endpoint.name);
                return false;
            }
        };

        let response = match dispatch::send(
            endpoint,
            Method::POST,
            &prepared.url,
            prepared.headers,
            prepared.body,
            self.server.response_header_timeout,
        )
        .await
        {
            Ok(response) => response,
            Err(err) => {
                log::debug!("health check for endpoint '{}' failed: {err}", endpoint.name);
                return false;
            }
        };

        if !response.status().is_success() {
            log::debug!(
                "health check for endpoint '{}' returned status {}",
                endpoint.name,
                response.status()
            );
            return false;
        }

        let Ok(body) = response.text().await else {
            return false;
        };

        probe_body_is_healthy(&body)
    }
}

/// A healthy probe body is either SSE-shaped or JSON carrying `content`
/// or `error`.
fn probe_body_is_healthy(body: &str) -> bool {
    if body.lines().any(|line| line.starts_with("event:") || line.starts_with("data:")) {
        return true;
    }

    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value.get("content").is_some() || value.get("error").is_some(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn sse_and_json_bodies_count_as_healthy() {
        assert!(probe_body_is_healthy("event: message_start\ndata: {}\n\n"));
        assert!(probe_body_is_healthy(r#"{"content": [{"type":"text","text":"hi"}]}"#));
        assert!(probe_body_is_healthy(r#"{"error": {"message": "overloaded"}}"#));
        assert!(!probe_body_is_healthy("<html>bad gateway</html>"));
        assert!(!probe_body_is_healthy(r#"{"unexpected": true}"#));
    }

    fn checker_for(endpoint: &Arc<Endpoint>) -> HealthChecker {
        HealthChecker::new(
            vec![Arc::clone(endpoint)],
            DefaultsConfig::default(),
            ServerConfig::default(),
            Arc::new(Mutex::new(TrafficShape::default())),
            reqwest::Client::new(),
            None,
        )
    }

    #[tokio::test]
    async fn successful_probe_reactivates_a_blacklisted_endpoint() {
        static HITS: AtomicU32 = AtomicU32::new(0);

        let app = Router::new().route(
            "/v1/messages",
            post(|| async {
                HITS.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!({
                    "id": "msg_1", "type": "message", "role": "assistant",
                    "model": "claude-3-5-haiku-20241022",
                    "content": [{"type": "text", "text": "hello"}],
                    "usage": {"input_tokens": 5, "output_tokens": 1}
                }))
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config: config::EndpointConfig = serde_yaml::from_str(&format!(
            r#"
name: recovering
url: http://{address}
kind: anthropic
auth:
  kind: api_key
  value: k
"#
        ))
        .unwrap();
        let endpoint = Arc::new(Endpoint::from_config(&config, &ServerConfig::default()).unwrap());

        for i in 0..3 {
            endpoint.record_request(false, &format!("r{i}"), Some("500"));
        }
        assert!(!endpoint.is_available());

        checker_for(&endpoint).check(&endpoint).await;

        assert!(HITS.load(Ordering::SeqCst) >= 1);
        assert!(endpoint.is_available());
        assert_eq!(endpoint.status(), EndpointStatus::Active);
    }

    #[tokio::test]
    async fn rate_limited_endpoint_is_skipped() {
        let config: config::EndpointConfig = serde_yaml::from_str(
            r#"
name: limited
url: https://api.anthropic.com
kind: anthropic
auth:
  kind: api_key
  value: k
"#,
        )
        .unwrap();
        let endpoint = Arc::new(Endpoint::from_config(&config, &ServerConfig::default()).unwrap());
        endpoint.update_rate_limit(Some(jiff::Timestamp::now().as_second() + 600), Some("allowed"));

        let before = endpoint.snapshot().total_requests;
        checker_for(&endpoint).check(&endpoint).await;

        // No probe happened at all: no request was recorded.
        assert_eq!(endpoint.snapshot().total_requests, before);
    }
}
