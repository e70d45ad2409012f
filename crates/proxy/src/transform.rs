//! The request transformer: model rewrite, format conversion, vendor
//! hacks, learned-parameter stripping, operator overrides, then auth
//! injection.

use std::sync::Arc;

use http::{HeaderMap, header};
use serde_json::Value;
use thiserror::Error;

use crate::classify::{ClientType, RequestFormat};
use crate::context::{RequestContext, ThinkingInfo};
use crate::convert::{self, ConvertError};
use crate::endpoint::{Endpoint, StatePersister};
use crate::{dispatch, retry};
use config::{DefaultsConfig, EndpointKind, MaxTokensField};

/// `user` values longer than this are replaced with an md5 digest.
const MAX_USER_LEN: usize = 64;

/// A request could not be prepared for an endpoint.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// Format conversion failed.
    #[error(transparent)]
    Conversion(#[from] ConvertError),
    /// Auth material could not be injected or refreshed.
    #[error("auth failed: {0}")]
    Auth(String),
}

/// The fully transformed request, ready for dispatch.
#[derive(Debug)]
pub struct PreparedRequest {
    /// Upstream URL.
    pub url: String,
    /// Path actually targeted (after conversion retargeting).
    pub target_path: String,
    /// Outbound headers with auth injected.
    pub headers: HeaderMap,
    /// Outbound body.
    pub body: Vec<u8>,
    /// Whether the body was format-converted.
    pub format_converted: bool,
}

/// Everything `prepare` needs besides the request itself.
pub struct TransformEnv<'a> {
    /// Target endpoint.
    pub endpoint: &'a Arc<Endpoint>,
    /// Implicit-rewrite and health defaults.
    pub defaults: &'a DefaultsConfig,
    /// Client used for OAuth refresh calls.
    pub oauth_http: &'a reqwest::Client,
    /// Receiver for refreshed tokens.
    pub persister: Option<&'a Arc<dyn StatePersister>>,
    /// Send `/responses` bodies natively instead of converting.
    pub use_native_codex: bool,
}

/// Run the transform chain for one endpoint attempt.
pub async fn prepare(ctx: &mut RequestContext, env: &TransformEnv<'_>) -> Result<PreparedRequest, PrepareError> {
    let endpoint = env.endpoint;
    let mut target_path = ctx.request_path.clone();
    let mut format_converted = false;

    let mut json: Option<Value> = if ctx.body.is_empty() {
        None
    } else {
        serde_json::from_slice(&ctx.body).ok()
    };

    if let Some(body) = json.as_mut() {
        apply_model_rewrite(ctx, endpoint, env.defaults, body);
        capture_thinking(ctx, body);

        // Anthropic-shaped bodies destined for OpenAI endpoints.
        if ctx.classification.format == RequestFormat::Anthropic && endpoint.kind == EndpointKind::OpenAI {
            let request: convert::anthropic::MessagesRequest =
                serde_json::from_value(body.clone()).map_err(|err| ConvertError::malformed("anthropic", err))?;
            let converted = convert::request::anthropic_to_openai(request, &mut ctx.conversion)?;
            *body = serde_json::to_value(&converted).map_err(|err| ConvertError::malformed("openai", err))?;
            if target_path.ends_with("/messages") {
                target_path = "/chat/completions".to_string();
            }
            format_converted = true;
        }

        // Codex Responses bodies for endpoints without native support.
        if endpoint.kind == EndpointKind::OpenAI && ctx.request_path == "/responses" && !env.use_native_codex {
            let request: convert::codex::ResponsesRequest =
                serde_json::from_value(body.clone()).map_err(|err| ConvertError::malformed("responses", err))?;
            let converted = convert::codex::responses_to_chat(request)?;
            *body = serde_json::to_value(&converted).map_err(|err| ConvertError::malformed("openai", err))?;
            target_path = "/chat/completions".to_string();
            format_converted = true;
        }

        if endpoint.kind == EndpointKind::OpenAI {
            rename_max_tokens(body, endpoint.max_tokens_field);
            apply_vendor_hacks(body);
        }

        let learned = endpoint.learned_params();
        if !learned.is_empty() {
            retry::strip_params(body, &learned);
        }

        apply_parameter_overrides(body, endpoint);
    }

    ctx.conversion.endpoint_kind = Some(endpoint.kind);

    let body_bytes = match &json {
        Some(body) => serde_json::to_vec(body).unwrap_or_else(|_| ctx.body.to_vec()),
        None => ctx.body.to_vec(),
    };

    let mut headers = outbound_headers(&ctx.headers);
    if json.is_some() {
        headers.insert(header::CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
    }
    apply_header_overrides(&mut headers, endpoint);
    crate::auth::inject_auth(&mut headers, endpoint, env.oauth_http, env.persister)
        .await
        .map_err(|err| PrepareError::Auth(err.to_string()))?;

    let url = dispatch::upstream_url(endpoint, &target_path, ctx.query.as_deref());

    Ok(PreparedRequest {
        url,
        target_path,
        headers,
        body: body_bytes,
        format_converted,
    })
}

fn apply_model_rewrite(ctx: &mut RequestContext, endpoint: &Endpoint, defaults: &DefaultsConfig, body: &mut Value) {
    let Some(model) = body.get("model").and_then(Value::as_str).map(str::to_string) else {
        return;
    };

    if ctx.original_model.is_none() {
        ctx.original_model = Some(model.clone());
    }

    let mut target = endpoint
        .rewrite_rules
        .iter()
        .find(|rule| rule.pattern.is_match(&model))
        .map(|rule| rule.target.clone());

    // Universal endpoints rewrite foreign model families implicitly.
    if target.is_none() && endpoint.rewrite_rules.is_empty() && endpoint.tags.is_empty() {
        target = match ctx.classification.client {
            ClientType::ClaudeCode if !model.starts_with("claude") => Some(defaults.claude_model.clone()),
            ClientType::Codex if !model.contains("gpt") => Some(defaults.gpt_model.clone()),
            _ => None,
        };
    }

    if let Some(target) = target
        && target != model
    {
        log::debug!("rewriting model '{model}' to '{target}' for endpoint '{}'", endpoint.name);
        body["model"] = Value::String(target.clone());
        ctx.rewritten_model = Some(target);
    }
}

fn capture_thinking(ctx: &mut RequestContext, body: &Value) {
    let Some(thinking) = body.get("thinking") else { return };
    ctx.thinking = Some(ThinkingInfo {
        enabled: thinking.get("type").and_then(Value::as_str) == Some("enabled"),
        budget_tokens: thinking.get("budget_tokens").and_then(Value::as_u64),
    });
}

fn rename_max_tokens(body: &mut Value, field: MaxTokensField) {
    if field == MaxTokensField::MaxTokens {
        return;
    }
    let Some(map) = body.as_object_mut() else { return };
    if let Some(value) = map.remove("max_tokens") {
        map.insert(field.key().to_string(), value);
    }
}

/// Provider-specific request fixes for OpenAI endpoints.
fn apply_vendor_hacks(body: &mut Value) {
    let Some(map) = body.as_object_mut() else { return };

    if let Some(user) = map.get("user").and_then(Value::as_str)
        && user.len() > MAX_USER_LEN
    {
        let hashed = format!("hashed-{:x}", md5::compute(user.as_bytes()));
        map.insert("user".to_string(), Value::String(hashed));
    }

    let is_gpt5 = map
        .get("model")
        .and_then(Value::as_str)
        .is_some_and(|model| model.contains("gpt-5"));
    if is_gpt5 {
        // gpt-5 rejects any temperature except the default.
        map.insert("temperature".to_string(), serde_json::json!(1.0));
        if let Some(value) = map.remove("max_tokens") {
            map.insert("max_completion_tokens".to_string(), value);
        }
    }
}

fn apply_parameter_overrides(body: &mut Value, endpoint: &Endpoint) {
    let Some(map) = body.as_object_mut() else { return };

    for (key, value) in &endpoint.parameter_overrides {
        if value.is_empty() {
            map.remove(key);
        } else {
            let parsed = serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.clone()));
            map.insert(key.clone(), parsed);
        }
    }
}

fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = inbound.clone();
    // Hop-by-hop and recomputed headers never go upstream.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONNECTION);
    headers.remove(header::ACCEPT_ENCODING);
    headers
}

fn apply_header_overrides(headers: &mut HeaderMap, endpoint: &Endpoint) {
    for (name, value) in &endpoint.header_overrides {
        let Ok(header_name) = name.parse::<http::HeaderName>() else {
            log::warn!("endpoint '{}': invalid override header name '{name}'", endpoint.name);
            continue;
        };
        if value.is_empty() {
            headers.remove(&header_name);
        } else if let Ok(header_value) = value.parse::<http::HeaderValue>() {
            headers.insert(header_name, header_value);
        } else {
            log::warn!("endpoint '{}': invalid override header value for '{name}'", endpoint.name);
        }
    }
}
