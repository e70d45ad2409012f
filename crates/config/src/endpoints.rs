//! Upstream endpoint configuration.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Wire format spoken by an upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// Anthropic Messages API.
    Anthropic,
    /// OpenAI Chat Completions API (and `/responses` when supported natively).
    OpenAI,
}

/// Credential material for one upstream endpoint.
///
/// Stored as plain strings because the file is rewritten in place when
/// OAuth tokens rotate or rate-limit state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Injected as `x-api-key`.
    ApiKey {
        /// The key value.
        value: String,
    },
    /// Injected as `Authorization: Bearer <value>`.
    AuthToken {
        /// The token value.
        value: String,
    },
    /// OAuth credentials with refresh support.
    Oauth {
        /// Current access token.
        access_token: String,
        /// Refresh token used against `token_url`.
        refresh_token: String,
        /// Expiry of the access token, unix milliseconds. Zero means unknown.
        #[serde(default)]
        expires_at_ms: i64,
        /// Token refresh endpoint. Defaults to the Anthropic console endpoint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_url: Option<String>,
        /// OAuth client id sent with the refresh request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
}

/// One explicit model rewrite rule. Patterns use the wildcard grammar
/// (`*` any run, `?` any single character); first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRuleConfig {
    /// Wildcard pattern matched against the inbound model name.
    pub pattern: String,
    /// Replacement model name.
    pub target: String,
}

/// Outbound proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// HTTP CONNECT tunneling.
    Http,
    /// SOCKS5.
    Socks5,
}

/// Proxy descriptor for reaching one upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    /// Proxy protocol.
    pub kind: ProxyKind,
    /// `host:port` of the proxy server.
    pub address: String,
    /// Optional username for basic / user-pass auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional password for basic / user-pass auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Name of the request field carrying the output token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxTokensField {
    /// `max_tokens` (the default).
    #[default]
    MaxTokens,
    /// `max_completion_tokens`.
    MaxCompletionTokens,
    /// `max_output_tokens`.
    MaxOutputTokens,
}

impl MaxTokensField {
    /// The literal JSON key.
    pub fn key(self) -> &'static str {
        match self {
            Self::MaxTokens => "max_tokens",
            Self::MaxCompletionTokens => "max_completion_tokens",
            Self::MaxOutputTokens => "max_output_tokens",
        }
    }
}

/// Persisted upstream rate-limit observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Unix seconds at which the limit window resets.
    pub reset_unix: i64,
    /// Last observed `Anthropic-Ratelimit-Unified-Status` value.
    pub status: String,
}

/// Configuration of one upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique endpoint name.
    pub name: String,
    /// Base URL, without the `/v1` suffix for Anthropic endpoints.
    pub url: String,
    /// Wire format of the upstream.
    pub kind: EndpointKind,
    /// Credentials.
    pub auth: AuthConfig,
    /// Optional path prefix inserted between the base URL and the request path
    /// for OpenAI endpoints.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    /// Disabled endpoints are never selected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lower values are preferred.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Routing tags. An endpoint with no tags is universal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Explicit model rewrite rules, applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_rewrite: Vec<RewriteRuleConfig>,
    /// Optional proxy for reaching this upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<UpstreamProxyConfig>,
    /// Outbound header overrides. Empty value deletes the header.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub header_overrides: IndexMap<String, String>,
    /// Top-level body parameter overrides. Values are parsed as JSON with a
    /// string fallback; empty value deletes the key.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub parameter_overrides: IndexMap<String, String>,
    /// Which field name carries the token budget after conversion.
    #[serde(default)]
    pub max_tokens_field: MaxTokensField,
    /// Mark inactive as soon as the upstream reports `allowed_warning`.
    #[serde(default)]
    pub enhanced_protection: bool,
    /// Repair Python-style dict literals in streamed tool-call arguments.
    #[serde(default)]
    pub repair_python_arguments: bool,
    /// Persisted rate-limit observation, written back on change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i32 {
    100
}

impl EndpointConfig {
    /// Base URL with any trailing slash removed.
    pub fn trimmed_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_auth_round_trips() {
        let yaml = indoc::indoc! {r#"
            name: oauth-endpoint
            url: https://api.anthropic.com
            kind: anthropic
            auth:
              kind: oauth
              access_token: at
              refresh_token: rt
              expires_at_ms: 1700000000000
        "#};

        let endpoint: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        let AuthConfig::Oauth {
            access_token,
            refresh_token,
            expires_at_ms,
            ..
        } = &endpoint.auth
        else {
            unreachable!("expected oauth auth, got {:?}", endpoint.auth)
        };

        assert_eq!(access_token, "at");
        assert_eq!(refresh_token, "rt");
        assert_eq!(*expires_at_ms, 1_700_000_000_000);

        let serialized = serde_yaml::to_string(&endpoint).unwrap();
        assert!(serialized.contains("kind: oauth"));
    }

    #[test]
    fn defaults_apply() {
        let yaml = indoc::indoc! {r#"
            name: e
            url: https://example.com/
            kind: openai
            auth:
              kind: auth_token
              value: tok
        "#};

        let endpoint: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(endpoint.enabled);
        assert_eq!(endpoint.priority, 100);
        assert_eq!(endpoint.max_tokens_field, MaxTokensField::MaxTokens);
        assert_eq!(endpoint.trimmed_url(), "https://example.com");
    }
}
