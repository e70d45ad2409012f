//! Outbound auth header injection and the OAuth token lifecycle.

use std::sync::Arc;

use http::{HeaderMap, HeaderValue, header::AUTHORIZATION};
use serde::Deserialize;

use crate::endpoint::{AuthKind, Endpoint, OauthTokens, StatePersister};

/// Refresh when the access token expires within this window.
pub const OAUTH_EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;

const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_BETA_VALUE: &str = "oauth-2025-04-20";
const ANTHROPIC_BETA_HEADER: &str = "anthropic-beta";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

fn now_ms() -> i64 {
    jiff::Timestamp::now().as_millisecond()
}

/// Refresh the endpoint's OAuth tokens and persist the result.
///
/// Tries a JSON body first, falling back to form encoding when the
/// token endpoint rejects it.
pub async fn refresh_oauth(
    endpoint: &Endpoint,
    http: &reqwest::Client,
    persister: Option<&Arc<dyn StatePersister>>,
) -> anyhow::Result<OauthTokens> {
    let current = endpoint
        .oauth_tokens()
        .ok_or_else(|| anyhow::anyhow!("endpoint '{}' has no oauth credentials", endpoint.name))?;

    let token_url = current.token_url.clone().unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string());

    let mut payload = serde_json::json!({
        "grant_type": "refresh_token",
        "refresh_token": current.refresh_token,
    });
    if let Some(client_id) = &current.client_id {
        payload["client_id"] = serde_json::Value::String(client_id.clone());
    }

    let json_attempt = http.post(&token_url).json(&payload).send().await;

    let response = match json_attempt {
        Ok(response) if response.status().is_success() => response,
        _ => {
            // Some token endpoints only speak application/x-www-form-urlencoded.
            let mut form = vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", current.refresh_token.clone()),
            ];
            if let Some(client_id) = &current.client_id {
                form.push(("client_id", client_id.clone()));
            }
            let response = http.post(&token_url).form(&form).send().await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("token refresh failed with status {status}: {body}");
            }
            response
        }
    };

    let parsed: TokenResponse = response.json().await?;

    let tokens = OauthTokens {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token.unwrap_or(current.refresh_token),
        expires_at_ms: parsed
            .expires_in
            .map(|seconds| now_ms() + seconds * 1000)
            .unwrap_or(0),
        token_url: current.token_url,
        client_id: current.client_id,
    };

    endpoint.set_oauth_tokens(tokens.clone());
    if let Some(persister) = persister {
        persister.persist_oauth(&endpoint.name, &tokens);
    }

    log::info!("refreshed oauth token for endpoint '{}'", endpoint.name);
    Ok(tokens)
}

/// Whether the tokens are within the refresh window.
pub fn needs_refresh(tokens: &OauthTokens) -> bool {
    tokens.expires_at_ms > 0 && now_ms() + OAUTH_EXPIRY_BUFFER_MS >= tokens.expires_at_ms
}

/// Inject the endpoint's credentials into the outbound headers,
/// refreshing OAuth tokens that are expired or about to expire.
pub async fn inject_auth(
    headers: &mut HeaderMap,
    endpoint: &Endpoint,
    http: &reqwest::Client,
    persister: Option<&Arc<dyn StatePersister>>,
) -> anyhow::Result<()> {
    match &endpoint.auth {
        AuthKind::ApiKey(value) => {
            headers.remove(AUTHORIZATION);
            headers.insert("x-api-key", HeaderValue::from_str(value)?);
        }
        AuthKind::AuthToken(value) => {
            headers.remove("x-api-key");
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {value}"))?);
            apply_oauth_beta(headers, endpoint, value);
        }
        AuthKind::Oauth => {
            let mut tokens = endpoint
                .oauth_tokens()
                .ok_or_else(|| anyhow::anyhow!("endpoint '{}' has no oauth credentials", endpoint.name))?;

            if needs_refresh(&tokens) {
                tokens = refresh_oauth(endpoint, http, persister).await?;
            }

            headers.remove("x-api-key");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", tokens.access_token))?,
            );
            apply_oauth_beta(headers, endpoint, &tokens.access_token);
        }
    }

    Ok(())
}

/// `api.anthropic.com` requires the oauth beta flag for console-issued
/// bearer tokens.
fn apply_oauth_beta(headers: &mut HeaderMap, endpoint: &Endpoint, bearer: &str) {
    if !endpoint.is_anthropic_domain() || !bearer.starts_with("sk-ant-oat01") {
        return;
    }

    let merged = match headers.get(ANTHROPIC_BETA_HEADER).and_then(|v| v.to_str().ok()) {
        Some(existing) if existing.split(',').any(|beta| beta.trim() == OAUTH_BETA_VALUE) => return,
        Some(existing) => format!("{OAUTH_BETA_VALUE},{existing}"),
        None => OAUTH_BETA_VALUE.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&merged) {
        headers.insert(ANTHROPIC_BETA_HEADER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use config::{EndpointConfig, ServerConfig};

    fn endpoint_from(yaml: &str) -> Endpoint {
        let config: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        Endpoint::from_config(&config, &ServerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn api_key_is_injected_and_authorization_dropped() {
        let endpoint = endpoint_from(
            r#"
name: e
url: https://example.com
kind: anthropic
auth:
  kind: api_key
  value: sk-test
"#,
        );

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-token"));

        inject_auth(&mut headers, &endpoint, &reqwest::Client::new(), None)
            .await
            .unwrap();

        assert_eq!(headers.get("x-api-key").unwrap(), "sk-test");
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn oat_bearer_on_anthropic_gets_the_beta_flag() {
        let endpoint = endpoint_from(
            r#"
name: e
url: https://api.anthropic.com
kind: anthropic
auth:
  kind: auth_token
  value: sk-ant-oat01-abcdef
"#,
        );

        let mut headers = HeaderMap::new();
        headers.insert(ANTHROPIC_BETA_HEADER, HeaderValue::from_static("context-1m-2025-08-07"));

        inject_auth(&mut headers, &endpoint, &reqwest::Client::new(), None)
            .await
            .unwrap();

        assert_eq!(
            headers.get(ANTHROPIC_BETA_HEADER).unwrap(),
            "oauth-2025-04-20,context-1m-2025-08-07"
        );
    }

    #[tokio::test]
    async fn oat_bearer_on_other_domains_is_untouched() {
        let endpoint = endpoint_from(
            r#"
name: e
url: https://other.example.com
kind: anthropic
auth:
  kind: auth_token
  value: sk-ant-oat01-abcdef
"#,
        );

        let mut headers = HeaderMap::new();
        inject_auth(&mut headers, &endpoint, &reqwest::Client::new(), None)
            .await
            .unwrap();

        assert!(headers.get(ANTHROPIC_BETA_HEADER).is_none());
    }

    #[test]
    fn refresh_window_is_five_minutes() {
        let fresh = OauthTokens {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at_ms: now_ms() + 60 * 60 * 1000,
            token_url: None,
            client_id: None,
        };
        assert!(!needs_refresh(&fresh));

        let expiring = OauthTokens {
            expires_at_ms: now_ms() + 60 * 1000,
            ..fresh.clone()
        };
        assert!(needs_refresh(&expiring));

        let unknown_expiry = OauthTokens {
            expires_at_ms: 0,
            ..fresh
        };
        assert!(!needs_refresh(&unknown_expiry));
    }

    #[tokio::test]
    async fn refresh_updates_tokens_from_mock_server() {
        use axum::{Json, Router, routing::post};

        let app = Router::new().route(
            "/token",
            post(|| async {
                Json(serde_json::json!({
                    "access_token": "new-access",
                    "refresh_token": "new-refresh",
                    "expires_in": 3600
                }))
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let endpoint = endpoint_from(&format!(
            r#"
name: e
url: https://example.com
kind: anthropic
auth:
  kind: oauth
  access_token: old-access
  refresh_token: old-refresh
  expires_at_ms: 1
  token_url: http://{address}/token
"#
        ));

        let tokens = refresh_oauth(&endpoint, &reqwest::Client::new(), None).await.unwrap();
        assert_eq!(tokens.access_token, "new-access");
        assert_eq!(tokens.refresh_token, "new-refresh");
        assert!(tokens.expires_at_ms > now_ms());

        let stored = endpoint.oauth_tokens().unwrap();
        assert_eq!(stored.access_token, "new-access");
    }
}
