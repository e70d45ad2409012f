//! HTTP server and pipeline-wide settings.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration_field;

/// Listener and pipeline timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Upper bound for the whole tagger pipeline.
    #[serde(with = "duration_field")]
    pub pipeline_timeout: Duration,
    /// Interval between health-check sweeps.
    #[serde(with = "duration_field")]
    pub health_interval: Duration,
    /// Upstream TCP/TLS connect timeout.
    #[serde(with = "duration_field")]
    pub connect_timeout: Duration,
    /// Time allowed for the upstream to produce response headers.
    #[serde(with = "duration_field")]
    pub response_header_timeout: Duration,
    /// Idle connection pool timeout.
    #[serde(with = "duration_field")]
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8087,
            pipeline_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl ServerConfig {
    /// The socket address to bind, or an error when the host does not parse.
    pub fn listen_address(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid server.host '{}': {err}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Models and parameters used when the configuration leaves them implicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Target of the implicit rewrite for claude-code clients on universal endpoints.
    pub claude_model: String,
    /// Target of the implicit rewrite for codex clients on universal endpoints.
    pub gpt_model: String,
    /// Model used by the health checker when no live traffic has been observed.
    pub health_model: String,
    /// `max_tokens` for synthetic health-check requests.
    pub health_max_tokens: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            claude_model: "claude-sonnet-4-20250514".to_string(),
            gpt_model: "gpt-5".to_string(),
            health_model: "claude-3-5-haiku-20241022".to_string(),
            health_max_tokens: 512,
        }
    }
}
