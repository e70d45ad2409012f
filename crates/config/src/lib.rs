//! Switchyard configuration structures mapping the switchyard.yaml file.

#![deny(missing_docs)]

mod endpoints;
mod loader;
mod persist;
mod server;
mod taggers;

pub use endpoints::{
    AuthConfig, EndpointConfig, EndpointKind, MaxTokensField, ProxyKind, RateLimitConfig, RewriteRuleConfig,
    UpstreamProxyConfig,
};
pub use loader::load;
pub use persist::ConfigPersister;
pub use server::{DefaultsConfig, ServerConfig};
pub use taggers::{TaggerConfig, TaggerKind};

use serde::{Deserialize, Serialize};

/// Main configuration structure for the Switchyard proxy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Fallback models and request defaults used by implicit rewrites and health checks.
    pub defaults: DefaultsConfig,
    /// Upstream endpoint pool, in declaration order.
    pub endpoints: Vec<EndpointConfig>,
    /// Tagger pipeline configuration.
    pub taggers: Vec<TaggerConfig>,
}

impl Config {
    /// Look up an endpoint configuration entry by name.
    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }
}

/// Serde adapter for human-readable duration fields ("5s", "300ms").
pub(crate) mod duration_field {
    use std::time::Duration;

    use serde::{Deserializer, Serializer};

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        duration_str::deserialize_duration(deserializer)
    }

    pub(crate) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = value.as_millis();
        if millis % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", millis / 1000))
        } else {
            serializer.serialize_str(&format!("{millis}ms"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_round_trips() {
        let yaml = indoc::indoc! {r#"
            endpoints:
              - name: primary
                url: https://api.anthropic.com
                kind: anthropic
                auth:
                  kind: api_key
                  value: sk-test
        "#};

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.server.port, 8087);

        let serialized = serde_yaml::to_string(&config).unwrap();
        let reparsed: Config = serde_yaml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.endpoints[0].name, "primary");
    }

    #[test]
    fn duration_fields_parse_human_notation() {
        let yaml = indoc::indoc! {r#"
            server:
              pipeline_timeout: 2s
              health_interval: 1m
            endpoints:
              - name: e
                url: https://example.com
                kind: openai
                auth:
                  kind: auth_token
                  value: tok
        "#};

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.pipeline_timeout.as_secs(), 2);
        assert_eq!(config.server.health_interval.as_secs(), 60);
    }
}
