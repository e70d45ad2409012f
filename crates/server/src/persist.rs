//! Bridges the proxy's state-persistence callback onto the YAML
//! configuration file.

use std::path::PathBuf;

use config::{AuthConfig, Config, ConfigPersister, RateLimitConfig};
use proxy::endpoint::{OauthTokens, RateLimitState, StatePersister};

/// Writes refreshed OAuth tokens and rate-limit observations back into
/// the configuration file.
pub struct ConfigStatePersister {
    inner: ConfigPersister,
}

impl ConfigStatePersister {
    /// Build a persister over the loaded configuration.
    pub fn new(path: PathBuf, config: Config) -> Self {
        Self {
            inner: ConfigPersister::new(path, config),
        }
    }
}

impl StatePersister for ConfigStatePersister {
    fn persist_oauth(&self, endpoint_name: &str, tokens: &OauthTokens) {
        let result = self.inner.update_endpoint(endpoint_name, |endpoint| {
            if let AuthConfig::Oauth {
                access_token,
                refresh_token,
                expires_at_ms,
                ..
            } = &mut endpoint.auth
            {
                *access_token = tokens.access_token.clone();
                *refresh_token = tokens.refresh_token.clone();
                *expires_at_ms = tokens.expires_at_ms;
            }
        });

        if let Err(err) = result {
            log::warn!("failed to persist oauth tokens for endpoint '{endpoint_name}': {err}");
        }
    }

    fn persist_rate_limit(&self, endpoint_name: &str, state: &RateLimitState) {
        let result = self.inner.update_endpoint(endpoint_name, |endpoint| {
            endpoint.rate_limit = Some(RateLimitConfig {
                reset_unix: state.reset_unix,
                status: state.status.clone(),
            });
        });

        if let Err(err) = result {
            log::warn!("failed to persist rate limit for endpoint '{endpoint_name}': {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_refresh_is_written_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.yaml");

        let config: Config = serde_yaml::from_str(
            r#"
endpoints:
  - name: oauth-endpoint
    url: https://api.anthropic.com
    kind: anthropic
    auth:
      kind: oauth
      access_token: old
      refresh_token: old-refresh
"#,
        )
        .unwrap();

        let persister = ConfigStatePersister::new(path.clone(), config);
        persister.persist_oauth(
            "oauth-endpoint",
            &OauthTokens {
                access_token: "new".to_string(),
                refresh_token: "new-refresh".to_string(),
                expires_at_ms: 123,
                token_url: None,
                client_id: None,
            },
        );

        let written: Config = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let AuthConfig::Oauth { access_token, .. } = &written.endpoints[0].auth else {
            unreachable!("expected oauth auth")
        };
        assert_eq!(access_token, "new");
    }

    #[test]
    fn rate_limit_change_is_written_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.yaml");

        let config: Config = serde_yaml::from_str(
            r#"
endpoints:
  - name: e
    url: https://api.anthropic.com
    kind: anthropic
    auth:
      kind: api_key
      value: k
"#,
        )
        .unwrap();

        let persister = ConfigStatePersister::new(path.clone(), config);
        persister.persist_rate_limit(
            "e",
            &RateLimitState {
                reset_unix: 1_800_000_000,
                status: "allowed".to_string(),
            },
        );

        let written: Config = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let rate_limit = written.endpoints[0].rate_limit.as_ref().unwrap();
        assert_eq!(rate_limit.reset_unix, 1_800_000_000);
        assert_eq!(rate_limit.status, "allowed");
    }
}
