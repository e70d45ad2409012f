//! Retry policy constants and the 400 parameter-learning sub-policy.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Attempts allowed on one endpoint before failing over.
pub const PER_ENDPOINT_RETRY_CAP: u32 = 2;

/// Error-message keywords that indicate an unsupported parameter.
const LEARN_KEYWORDS: &[&str] = &[
    "tool",
    "function",
    "function_call",
    "tool_choice",
    "unsupported",
    "not supported",
    "invalid parameter",
    "unexpected parameter",
];

/// Request keys stripped when the error message points at tool support.
const TOOL_RELATED_KEYS: &[&str] = &["tools", "tool_choice", "functions", "function_call", "parallel_tool_calls"];

fn parameter_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"parameter[\s'":]*([A-Za-z_][A-Za-z0-9_]*)"#).expect("parameter regex is valid")
    })
}

fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let message = value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)?;
    Some(message.to_string())
}

/// Inspect a 400 response body and return the request keys to learn as
/// unsupported for this endpoint. Only keys actually present in the
/// request body are returned, so re-applying the strip is a no-op.
pub fn learnable_params(response_body: &str, request_body: &Value) -> Vec<String> {
    let Some(message) = error_message(response_body) else {
        return Vec::new();
    };
    let lowered = message.to_lowercase();

    if !LEARN_KEYWORDS.iter().any(|keyword| lowered.contains(keyword)) {
        return Vec::new();
    }

    let Some(request) = request_body.as_object() else {
        return Vec::new();
    };

    let mut params = Vec::new();

    // Explicit parameter names take precedence.
    for capture in parameter_regex().captures_iter(&message) {
        let name = capture[1].to_string();
        if request.contains_key(&name) && !params.contains(&name) {
            params.push(name);
        }
    }

    // Tool-support complaints strip the whole tool parameter family.
    if lowered.contains("tool") || lowered.contains("function") {
        for key in TOOL_RELATED_KEYS {
            if request.contains_key(*key) && !params.iter().any(|p| p == key) {
                params.push((*key).to_string());
            }
        }
    }

    params
}

/// Remove learned-unsupported keys from a request body. Idempotent.
pub fn strip_params(body: &mut Value, params: &std::collections::BTreeSet<String>) {
    if let Some(map) = body.as_object_mut() {
        map.retain(|key, _| !params.contains(key));
    }
}
