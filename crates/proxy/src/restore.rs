//! Model-name restoration: rewriting the upstream's model field back to
//! the name the client originally requested.

use serde_json::Value;

/// Replace every `"model": <rewritten>` occurrence with the original
/// name, recursing through objects and arrays (SSE event payloads nest
/// the model inside `message` objects).
pub fn restore_model(value: &mut Value, rewritten: &str, original: &str) {
    match value {
        Value::Object(map) => {
            if let Some(model) = map.get_mut("model")
                && model.as_str() == Some(rewritten)
            {
                *model = Value::String(original.to_string());
            }
            for nested in map.values_mut() {
                restore_model(nested, rewritten, original);
            }
        }
        Value::Array(items) => {
            for item in items {
                restore_model(item, rewritten, original);
            }
        }
        _ => {}
    }
}

/// Restore the model inside one SSE `data:` payload, returning the
/// rewritten JSON when the payload parses and contained the model.
pub fn restore_model_in_sse_data(data: &str, rewritten: &str, original: &str) -> Option<String> {
    let mut value: Value = serde_json::from_str(data).ok()?;
    restore_model(&mut value, rewritten, original);
    serde_json::to_string(&value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn top_level_model_is_restored() {
        let mut value = json!({"model": "gpt-4o", "id": "x"});
        restore_model(&mut value, "gpt-4o", "claude-3-opus");
        assert_eq!(value["model"], json!("claude-3-opus"));
    }

    #[test]
    fn nested_model_in_sse_payload_is_restored() {
        let mut value = json!({
            "type": "message_start",
            "message": {"id": "m", "model": "gpt-4o", "content": []}
        });
        restore_model(&mut value, "gpt-4o", "claude-3-opus");
        assert_eq!(value["message"]["model"], json!("claude-3-opus"));
    }

    #[test]
    fn other_models_are_untouched() {
        let mut value = json!({"model": "gpt-4o-mini"});
        restore_model(&mut value, "gpt-4o", "claude-3-opus");
        assert_eq!(value["model"], json!("gpt-4o-mini"));
    }

    #[test]
    fn rewrite_then_restore_is_identity_for_the_client() {
        let requested = "claude-sonnet-4";
        let rewritten = "gpt-4o";

        let mut response = json!({"model": rewritten, "choices": []});
        restore_model(&mut response, rewritten, requested);
        assert_eq!(response["model"], json!(requested));
    }
}
