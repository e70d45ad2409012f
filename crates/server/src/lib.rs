//! Switchyard server assembly.
//!
//! Provides a reusable serve function for the binary and for
//! integration tests: builds the proxy pipeline, wires state
//! persistence back into the configuration file, spawns the health
//! checker, and drains on shutdown.

#![deny(missing_docs)]

mod persist;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use config::Config;
use proxy::{HealthChecker, MemoryLogSink, ProxyServer, RequestLogSink};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use persist::ConfigStatePersister;

/// Configuration for serving Switchyard.
pub struct ServeConfig {
    /// The socket address to bind.
    pub listen_address: SocketAddr,
    /// The deserialized YAML configuration.
    pub config: Config,
    /// Path of the configuration file, for OAuth/rate-limit write-back.
    /// `None` disables persistence (tests).
    pub config_path: Option<PathBuf>,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// Version string logged on startup.
    pub version: String,
    /// Sender for the bound address (useful when port 0 was requested).
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Start and run the proxy until the shutdown signal fires.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        config_path,
        shutdown_signal,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    log::info!("Switchyard {version}");

    let sink: Arc<dyn RequestLogSink> = Arc::new(MemoryLogSink::new());

    let persister = config_path.map(|path| {
        Arc::new(ConfigStatePersister::new(path, config.clone())) as Arc<dyn proxy::endpoint::StatePersister>
    });

    let server = Arc::new(ProxyServer::new(&config, sink, persister, None)?);

    let health = HealthChecker::new(
        server.endpoints.clone(),
        config.defaults.clone(),
        config.server.clone(),
        server.traffic_shape(),
        server.oauth_http().clone(),
        server.persister(),
    );
    tokio::spawn(health.run(shutdown_signal.clone()));

    let app = proxy::router(server);

    let listener = TcpListener::bind(listen_address).await?;
    let bound = listener.local_addr()?;
    log::info!("listening on {bound}");

    if let Some(sender) = bound_addr_sender {
        let _ = sender.send(bound);
    }

    let shutdown = shutdown_signal.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    log::info!("shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(upstream: SocketAddr) -> Config {
        serde_yaml::from_str(&format!(
            r#"
server:
  host: 127.0.0.1
  port: 0
  health_interval: 1h
endpoints:
  - name: upstream
    url: http://{upstream}
    kind: anthropic
    auth:
      kind: api_key
      value: key
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn serves_and_proxies_a_messages_request() {
        use axum::{Json, Router, routing::post};

        // Mock upstream speaking the Anthropic Messages API.
        let upstream_app = Router::new().route(
            "/v1/messages",
            post(|| async {
                Json(serde_json::json!({
                    "id": "msg_1", "type": "message", "role": "assistant",
                    "model": "claude-3-5-haiku-20241022",
                    "content": [{"type": "text", "text": "hello"}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 3, "output_tokens": 1}
                }))
            }),
        );
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(upstream_listener, upstream_app).await.unwrap();
        });

        let shutdown = CancellationToken::new();
        let (sender, receiver) = tokio::sync::oneshot::channel();

        let serve_config = ServeConfig {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            config: test_config(upstream_addr),
            config_path: None,
            shutdown_signal: shutdown.clone(),
            version: "test".to_string(),
            bound_addr_sender: Some(sender),
        };
        tokio::spawn(async move {
            serve(serve_config).await.unwrap();
        });

        let bound = receiver.await.unwrap();
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{bound}/v1/messages"))
            .json(&serde_json::json!({
                "model": "claude-3-5-haiku-20241022",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["type"], serde_json::json!("message"));
        assert_eq!(body["content"][0]["text"], serde_json::json!("hello"));

        shutdown.cancel();
    }
}
