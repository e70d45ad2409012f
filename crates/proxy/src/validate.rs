//! Response validation: content-type auto-detection, SSE completeness,
//! and standard-response schema checks.

use serde_json::Value;

/// Effective body kind after auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// A single JSON document.
    Json,
    /// A Server-Sent Events stream.
    Sse,
}

/// Outcome of content-type auto-detection over a buffered body.
#[derive(Debug, Clone, Copy)]
pub struct ContentTypeDecision {
    /// What the body actually is.
    pub kind: BodyKind,
    /// Set when the declared content type was wrong; the value is the
    /// corrected content type, recorded in the request log.
    pub overridden_to: Option<&'static str>,
}

fn looks_like_sse(body: &str) -> bool {
    body.lines()
        .any(|line| line.starts_with("data:") || line.starts_with("event:"))
}

/// Decide the effective body kind, overriding a wrong declaration.
pub fn detect_content_type(declared: Option<&str>, body: &[u8]) -> ContentTypeDecision {
    let declared_sse = declared.is_some_and(|ct| ct.contains("text/event-stream"));
    let text = String::from_utf8_lossy(body);

    if declared_sse {
        // Declared a stream but sent a plain JSON document.
        if serde_json::from_slice::<Value>(body).is_ok() {
            return ContentTypeDecision {
                kind: BodyKind::Json,
                overridden_to: Some("application/json"),
            };
        }
        ContentTypeDecision {
            kind: BodyKind::Sse,
            overridden_to: None,
        }
    } else if serde_json::from_slice::<Value>(body).is_err() && looks_like_sse(&text) {
        // Declared JSON (or nothing) but sent an event stream.
        ContentTypeDecision {
            kind: BodyKind::Sse,
            overridden_to: Some("text/event-stream"),
        }
    } else {
        ContentTypeDecision {
            kind: BodyKind::Json,
            overridden_to: None,
        }
    }
}

/// Validate completeness of a buffered Anthropic SSE body: a stream
/// that opened with `message_start` must close with `message_stop`.
pub fn anthropic_sse_complete(body: &str) -> bool {
    let has_start = body.contains("message_start");
    let has_stop = body.contains("message_stop");
    !has_start || has_stop
}

/// Validate completeness of a buffered OpenAI SSE body: complete when
/// any choice carried a finish reason, a `response.completed` /
/// `response.done` event appeared, or the `[DONE]` marker was seen.
pub fn openai_sse_complete(body: &str) -> bool {
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            if line.starts_with("event:")
                && (line.contains("response.completed") || line.contains("response.done"))
            {
                return true;
            }
            continue;
        };
        let data = data.trim();

        if data == "[DONE]" {
            return true;
        }

        if let Ok(value) = serde_json::from_str::<Value>(data) {
            let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
            if event_type == "response.completed" || event_type == "response.done" {
                return true;
            }

            let finished = value
                .get("choices")
                .and_then(Value::as_array)
                .is_some_and(|choices| choices.iter().any(|c| c.get("finish_reason").is_some_and(|f| !f.is_null())));
            if finished {
                return true;
            }
        }
    }

    false
}

/// Standard-response check for Anthropic JSON bodies.
pub fn validate_anthropic_json(value: &Value) -> Result<(), String> {
    for field in ["id", "type", "content", "model"] {
        if value.get(field).is_none() {
            return Err(format!("anthropic response is missing '{field}'"));
        }
    }

    if value.get("type").and_then(Value::as_str) != Some("message") {
        return Err("anthropic response 'type' is not 'message'".to_string());
    }

    if let Some(role) = value.get("role").and_then(Value::as_str)
        && role != "assistant"
    {
        return Err(format!("anthropic response role is '{role}', expected 'assistant'"));
    }

    Ok(())
}

/// Standard-response check for OpenAI JSON bodies.
pub fn validate_openai_json(value: &Value) -> Result<(), String> {
    if value.get("error").is_some() {
        return Ok(());
    }
    if value.get("model").is_none() {
        return Err("openai response is missing 'model'".to_string());
    }
    if value.get("choices").is_none() {
        return Err("openai response is missing 'choices'".to_string());
    }
    Ok(())
}

/// Whether the response `usage` is present but carries all-zero token
/// counts, which marks a malformed upstream response.
pub fn usage_is_zeroed(value: &Value) -> bool {
    let Some(usage) = value.get("usage").and_then(Value::as_object) else {
        return false;
    };

    let read = |a: &str, b: &str| -> Option<u64> {
        usage
            .get(a)
            .or_else(|| usage.get(b))
            .and_then(Value::as_u64)
    };

    let input = read("input_tokens", "prompt_tokens");
    let output = read("output_tokens", "completion_tokens");

    matches!((input, output), (Some(0), Some(0)))
}
