//! Upstream endpoints and their failure state machine.
//!
//! All mutable state sits behind one `Mutex` per endpoint. Transitions
//! compute the new state inside short critical sections; side effects
//! (logging, persistence) happen outside the lock from the returned
//! outcome values.

pub mod history;
pub mod selector;

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use sha2::{Digest as _, Sha256};

use crate::wildcard::Wildcard;
use config::{AuthConfig, EndpointConfig, EndpointKind, MaxTokensField, ServerConfig};
use history::RequestHistory;

/// Minimum spacing between "skipped due to rate limit" log lines.
const SKIP_LOG_INTERVAL: Duration = Duration::from_secs(300);

/// Endpoint lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    /// Selectable.
    Active,
    /// Blacklisted or disabled.
    Inactive,
    /// Being probed by the health checker.
    Checking,
}

/// Why an endpoint was taken out of rotation.
#[derive(Debug, Clone)]
pub struct BlacklistReason {
    /// Request ids whose failures caused the transition.
    pub causing_request_ids: Vec<String>,
    /// When the transition happened.
    pub blacklisted_at: jiff::Timestamp,
    /// Short description of the last failure.
    pub error_summary: String,
}

/// Last observed upstream rate-limit state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
    /// Unix seconds at which the window resets.
    pub reset_unix: i64,
    /// Last `Anthropic-Ratelimit-Unified-Status` value.
    pub status: String,
}

/// Live OAuth credential set.
#[derive(Debug, Clone)]
pub struct OauthTokens {
    /// Current access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// Access token expiry, unix milliseconds.
    pub expires_at_ms: i64,
    /// Refresh endpoint override.
    pub token_url: Option<String>,
    /// OAuth client id.
    pub client_id: Option<String>,
}

/// How requests authenticate against this endpoint.
#[derive(Debug, Clone)]
pub enum AuthKind {
    /// `x-api-key` header.
    ApiKey(String),
    /// `Authorization: Bearer` header.
    AuthToken(String),
    /// OAuth tokens held in mutable state.
    Oauth,
}

/// Compiled model rewrite rule.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    /// Pattern matched against the inbound model.
    pub pattern: Wildcard,
    /// Replacement model name.
    pub target: String,
}

/// Receives endpoint state that must outlive the process.
pub trait StatePersister: Send + Sync {
    /// Called after a successful OAuth refresh.
    fn persist_oauth(&self, endpoint_name: &str, tokens: &OauthTokens);
    /// Called when the observed rate-limit state changes.
    fn persist_rate_limit(&self, endpoint_name: &str, state: &RateLimitState);
}

#[derive(Debug)]
struct EndpointState {
    enabled: bool,
    status: EndpointStatus,
    failure_count: u32,
    total_requests: u64,
    success_requests: u64,
    successive_successes: u32,
    last_failure: Option<Instant>,
    history: RequestHistory,
    blacklist: Option<BlacklistReason>,
    rate_limit: Option<RateLimitState>,
    native_codex_format: Option<bool>,
    learned_unsupported_params: BTreeSet<String>,
    last_skip_log: Option<Instant>,
    oauth: Option<OauthTokens>,
}

/// Consistent read of the mutable endpoint state.
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    /// Whether the endpoint is enabled in configuration.
    pub enabled: bool,
    /// Lifecycle state.
    pub status: EndpointStatus,
    /// Current blacklist reason, if any.
    pub blacklist: Option<BlacklistReason>,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Total recorded requests.
    pub total_requests: u64,
    /// Total recorded successes.
    pub success_requests: u64,
    /// Consecutive successes since the last failure.
    pub successive_successes: u32,
    /// Last observed rate-limit state.
    pub rate_limit: Option<RateLimitState>,
    /// Codex native-format probe verdict.
    pub native_codex_format: Option<bool>,
    /// Parameters this endpoint has rejected with a 400.
    pub learned_unsupported_params: BTreeSet<String>,
}

/// Result of recording one request outcome.
#[derive(Debug, Default)]
pub struct RecordOutcome {
    /// Set when this outcome tripped the blacklist threshold.
    pub became_inactive: Option<BlacklistReason>,
    /// Set when a success brought an inactive endpoint back.
    pub reactivated: bool,
}

/// Result of folding new rate-limit headers into the state.
#[derive(Debug, Default)]
pub struct RateLimitUpdate {
    /// The state changed and should be persisted.
    pub changed: bool,
    /// Enhanced protection demands immediate deactivation.
    pub deactivate: bool,
}

/// One configured upstream.
pub struct Endpoint {
    /// Stable id, derived from the name.
    pub id: String,
    /// Configured name.
    pub name: String,
    /// Base URL without trailing slash.
    pub base_url: String,
    /// Wire format.
    pub kind: EndpointKind,
    /// Optional path prefix for OpenAI endpoints.
    pub path_prefix: String,
    /// Selection priority, lower preferred.
    pub priority: i32,
    /// Routing tags; empty means universal.
    pub tags: Vec<String>,
    /// Explicit model rewrite rules, in order.
    pub rewrite_rules: Vec<RewriteRule>,
    /// Outbound header overrides.
    pub header_overrides: IndexMap<String, String>,
    /// Body parameter overrides.
    pub parameter_overrides: IndexMap<String, String>,
    /// Which key carries the output token budget.
    pub max_tokens_field: MaxTokensField,
    /// Deactivate on `allowed_warning`.
    pub enhanced_protection: bool,
    /// Repair Python-style dict literals in streamed tool arguments.
    pub repair_python_arguments: bool,
    /// Credential scheme.
    pub auth: AuthKind,
    /// Per-endpoint HTTP client (proxy + timeouts baked in).
    pub client: reqwest::Client,
    host: Option<String>,
    state: Mutex<EndpointState>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Derive the stable endpoint id from its name.
pub fn endpoint_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

impl Endpoint {
    /// Build an endpoint from configuration, compiling rewrite rules and
    /// constructing its HTTP client.
    pub fn from_config(config: &EndpointConfig, server: &ServerConfig) -> anyhow::Result<Self> {
        let rewrite_rules = config
            .model_rewrite
            .iter()
            .map(|rule| {
                Ok(RewriteRule {
                    pattern: Wildcard::new(&rule.pattern).map_err(|err| {
                        anyhow::anyhow!("endpoint '{}': invalid rewrite pattern '{}': {err}", config.name, rule.pattern)
                    })?,
                    target: rule.target.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let (auth, oauth) = match &config.auth {
            AuthConfig::ApiKey { value } => (AuthKind::ApiKey(value.clone()), None),
            AuthConfig::AuthToken { value } => (AuthKind::AuthToken(value.clone()), None),
            AuthConfig::Oauth {
                access_token,
                refresh_token,
                expires_at_ms,
                token_url,
                client_id,
            } => (
                AuthKind::Oauth,
                Some(OauthTokens {
                    access_token: access_token.clone(),
                    refresh_token: refresh_token.clone(),
                    expires_at_ms: *expires_at_ms,
                    token_url: token_url.clone(),
                    client_id: client_id.clone(),
                }),
            ),
        };

        let host = url::Url::parse(&config.url).ok().and_then(|u| u.host_str().map(str::to_string));
        let client = crate::dispatch::build_client(config, server)?;

        Ok(Self {
            id: endpoint_id(&config.name),
            name: config.name.clone(),
            base_url: config.trimmed_url().to_string(),
            kind: config.kind,
            path_prefix: config.path_prefix.clone(),
            priority: config.priority,
            tags: config.tags.clone(),
            rewrite_rules,
            header_overrides: config.header_overrides.clone(),
            parameter_overrides: config.parameter_overrides.clone(),
            max_tokens_field: config.max_tokens_field,
            enhanced_protection: config.enhanced_protection,
            repair_python_arguments: config.repair_python_arguments,
            auth,
            client,
            host,
            state: Mutex::new(EndpointState {
                enabled: config.enabled,
                status: if config.enabled {
                    EndpointStatus::Active
                } else {
                    EndpointStatus::Inactive
                },
                failure_count: 0,
                total_requests: 0,
                success_requests: 0,
                successive_successes: 0,
                last_failure: None,
                history: RequestHistory::new(),
                blacklist: None,
                rate_limit: config.rate_limit.as_ref().map(|r| RateLimitState {
                    reset_unix: r.reset_unix,
                    status: r.status.clone(),
                }),
                native_codex_format: None,
                learned_unsupported_params: BTreeSet::new(),
                last_skip_log: None,
                oauth,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the upstream lives under `api.anthropic.com`.
    pub fn is_anthropic_domain(&self) -> bool {
        self.host
            .as_deref()
            .is_some_and(|host| host == "api.anthropic.com" || host.ends_with(".api.anthropic.com"))
    }

    /// Whether this endpoint may serve a request right now.
    pub fn is_available(&self) -> bool {
        let state = self.lock();
        state.enabled && state.status == EndpointStatus::Active && state.blacklist.is_none()
    }

    /// Consistent snapshot of mutable state.
    pub fn snapshot(&self) -> EndpointSnapshot {
        let state = self.lock();
        EndpointSnapshot {
            enabled: state.enabled,
            status: state.status,
            blacklist: state.blacklist.clone(),
            failure_count: state.failure_count,
            total_requests: state.total_requests,
            success_requests: state.success_requests,
            successive_successes: state.successive_successes,
            rate_limit: state.rate_limit.clone(),
            native_codex_format: state.native_codex_format,
            learned_unsupported_params: state.learned_unsupported_params.clone(),
        }
    }

    /// Record one request outcome. A success resets failures and
    /// reactivates a blacklisted endpoint; a failure may trip the
    /// blacklist threshold.
    pub fn record_request(&self, success: bool, request_id: &str, error_summary: Option<&str>) -> RecordOutcome {
        let now = Instant::now();
        let mut outcome = RecordOutcome::default();
        let mut state = self.lock();

        state.total_requests += 1;
        state.history.record(now, success, request_id);

        if success {
            state.success_requests += 1;
            state.failure_count = 0;
            if state.enabled && (state.status != EndpointStatus::Active || state.blacklist.is_some()) {
                apply_active(&mut state);
                outcome.reactivated = true;
                state.successive_successes = 1;
            } else {
                state.successive_successes += 1;
            }
        } else {
            state.failure_count += 1;
            state.successive_successes = 0;
            state.last_failure = Some(now);

            if state.blacklist.is_none() && state.history.should_mark_inactive(now) {
                let reason = BlacklistReason {
                    causing_request_ids: state.history.recent_failure_request_ids(now),
                    blacklisted_at: jiff::Timestamp::now(),
                    error_summary: error_summary.unwrap_or("consecutive failures").to_string(),
                };
                apply_inactive(&mut state, reason.clone());
                outcome.became_inactive = Some(reason);
            }
        }

        outcome
    }

    /// Force the endpoint out of rotation with an explicit reason.
    pub fn mark_inactive_with_reason(&self, reason: BlacklistReason) {
        let mut state = self.lock();
        apply_inactive(&mut state, reason);
    }

    /// Bring the endpoint back into rotation, clearing failure state.
    pub fn mark_active(&self) {
        let mut state = self.lock();
        if state.enabled {
            apply_active(&mut state);
        }
    }

    /// Lifecycle state.
    pub fn status(&self) -> EndpointStatus {
        self.lock().status
    }

    /// Transient checking marker, owned by the health checker.
    pub fn set_checking(&self, checking: bool) {
        let mut state = self.lock();
        match (checking, state.status) {
            (true, EndpointStatus::Inactive) => state.status = EndpointStatus::Checking,
            (false, EndpointStatus::Checking) => state.status = EndpointStatus::Inactive,
            _ => {}
        }
    }

    /// Fold new rate-limit headers into the state.
    pub fn update_rate_limit(&self, reset_unix: Option<i64>, status: Option<&str>) -> RateLimitUpdate {
        let mut update = RateLimitUpdate::default();
        let mut state = self.lock();

        let next = match (reset_unix, status) {
            (None, None) => return update,
            (reset, status) => RateLimitState {
                reset_unix: reset.or_else(|| state.rate_limit.as_ref().map(|r| r.reset_unix)).unwrap_or(0),
                status: status
                    .map(str::to_string)
                    .or_else(|| state.rate_limit.as_ref().map(|r| r.status.clone()))
                    .unwrap_or_default(),
            },
        };

        if state.rate_limit.as_ref() != Some(&next) {
            update.changed = true;
            state.rate_limit = Some(next.clone());
        }

        if self.enhanced_protection && next.status == "allowed_warning" {
            update.deactivate = true;
        }

        update
    }

    /// Seconds until the rate-limit window resets, when one is pending.
    pub fn rate_limited_until(&self, now_unix: i64) -> Option<i64> {
        let state = self.lock();
        let rate_limit = state.rate_limit.as_ref()?;
        (rate_limit.reset_unix > now_unix).then_some(rate_limit.reset_unix)
    }

    /// Current rate-limit state.
    pub fn rate_limit(&self) -> Option<RateLimitState> {
        self.lock().rate_limit.clone()
    }

    /// Throttled permission to log a rate-limit skip (at most every 5 min).
    pub fn should_log_skip(&self) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        let due = state
            .last_skip_log
            .is_none_or(|last| now.duration_since(last) >= SKIP_LOG_INTERVAL);
        if due {
            state.last_skip_log = Some(now);
        }
        due
    }

    /// Codex native-format probe verdict.
    pub fn native_codex_format(&self) -> Option<bool> {
        self.lock().native_codex_format
    }

    /// Record the probe verdict. Only the first call takes effect; the
    /// decision is sticky until restart.
    pub fn set_native_codex_format(&self, supported: bool) {
        let mut state = self.lock();
        if state.native_codex_format.is_none() {
            state.native_codex_format = Some(supported);
        }
    }

    /// Parameters this endpoint rejects.
    pub fn learned_params(&self) -> BTreeSet<String> {
        self.lock().learned_unsupported_params.clone()
    }

    /// Add newly learned unsupported parameters. Returns those not
    /// already known. The set only ever grows.
    pub fn learn_params(&self, params: &[String]) -> Vec<String> {
        let mut state = self.lock();
        params
            .iter()
            .filter(|param| state.learned_unsupported_params.insert((*param).clone()))
            .cloned()
            .collect()
    }

    /// Current OAuth tokens, when this endpoint uses OAuth.
    pub fn oauth_tokens(&self) -> Option<OauthTokens> {
        self.lock().oauth.clone()
    }

    /// Replace the OAuth tokens after a refresh.
    pub fn set_oauth_tokens(&self, tokens: OauthTokens) {
        self.lock().oauth = Some(tokens);
    }

    /// Whether the endpoint is enabled in configuration.
    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }
}

fn apply_active(state: &mut EndpointState) {
    state.status = EndpointStatus::Active;
    state.blacklist = None;
    state.failure_count = 0;
    state.successive_successes = 0;
    state.last_skip_log = None;
}

fn apply_inactive(state: &mut EndpointState, reason: BlacklistReason) {
    state.status = EndpointStatus::Inactive;
    state.blacklist = Some(reason);
}
