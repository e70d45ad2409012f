//! OpenAI Chat Completions → Anthropic Messages response conversion
//! (non-streaming).

use serde_json::Value;

use super::ConvertError;
use super::anthropic::{ContentBlock, MessagesResponse};
use super::openai::{ChatCompletionResponse, ChatContent, Usage};
use super::python_fix;

/// Map an OpenAI finish reason onto an Anthropic stop reason.
pub fn stop_reason_for(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    }
}

/// Convert a complete Chat Completions response into a Messages
/// response.
pub fn openai_to_anthropic(response: ChatCompletionResponse) -> Result<MessagesResponse, ConvertError> {
    let mut choices = response.choices;
    if choices.is_empty() {
        return Err(ConvertError::invalid("openai", "response has no choices"));
    }
    let choice = choices.remove(0);

    let mut content = Vec::new();

    if let Some(chat_content) = choice.message.content {
        let text = match chat_content {
            ChatContent::Text(text) => text,
            ChatContent::Parts(parts) => parts
                .into_iter()
                .filter_map(|part| match part {
                    super::openai::ContentPart::Text { text } => Some(text),
                    super::openai::ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        };
        // An empty text block is suppressed rather than emitted.
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
    }

    if let Some(tool_calls) = choice.message.tool_calls {
        for call in tool_calls {
            content.push(ContentBlock::tool_use(
                call.id,
                call.function.name,
                parse_arguments(&call.function.arguments),
            ));
        }
    }

    let usage = response.usage.map(|usage| Usage {
        input_tokens: usage.input_tokens.or(usage.prompt_tokens),
        output_tokens: usage.output_tokens.or(usage.completion_tokens),
        ..Usage::default()
    });

    Ok(MessagesResponse {
        id: response.id.unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model,
        content,
        stop_reason: Some(stop_reason_for(choice.finish_reason.as_deref()).to_string()),
        stop_sequence: None,
        usage,
        extra: serde_json::Map::new(),
    })
}

/// Parse a tool-call arguments string, attempting the Python-dict
/// repair before falling back to the raw string.
pub fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    if let Ok(value) = serde_json::from_str::<Value>(arguments) {
        return value;
    }

    if let Some(fixed) = python_fix::repair_python_json(arguments)
        && let Ok(value) = serde_json::from_str::<Value>(&fixed)
    {
        return value;
    }

    Value::String(arguments.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(response: Value) -> ChatCompletionResponse {
        serde_json::from_value(response).unwrap()
    }

    #[test]
    fn tool_calls_become_tool_use_blocks() {
        let response = parse(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }));

        let converted = openai_to_anthropic(response).unwrap();
        assert_eq!(converted.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(converted.content.len(), 1);

        let block = &converted.content[0];
        assert_eq!(block.id.as_deref(), Some("call_abc"));
        assert_eq!(block.name.as_deref(), Some("get_weather"));
        assert_eq!(block.input, Some(json!({"city": "Paris"})));

        let usage = converted.usage.unwrap();
        assert_eq!(usage.input_tokens, Some(10));
        assert_eq!(usage.output_tokens, Some(5));
    }

    #[test]
    fn empty_text_is_suppressed() {
        let response = parse(json!({
            "id": "chatcmpl-2",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": ""},
                "finish_reason": "stop"
            }]
        }));

        let converted = openai_to_anthropic(response).unwrap();
        assert!(converted.content.is_empty());
        assert_eq!(converted.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn length_maps_to_max_tokens() {
        assert_eq!(stop_reason_for(Some("length")), "max_tokens");
        assert_eq!(stop_reason_for(Some("stop")), "end_turn");
        assert_eq!(stop_reason_for(None), "end_turn");
    }

    #[test]
    fn python_style_arguments_are_repaired() {
        let value = parse_arguments("{'city': 'Paris'}");
        assert_eq!(value, json!({"city": "Paris"}));
    }

    #[test]
    fn unparseable_arguments_fall_back_to_raw_string() {
        let value = parse_arguments("not json at all");
        assert_eq!(value, json!("not json at all"));
    }

    #[test]
    fn no_choices_is_an_error() {
        let response = parse(json!({"id": "x", "model": "m", "choices": []}));
        assert!(openai_to_anthropic(response).is_err());
    }

    #[test]
    fn message_shape_matches_anthropic_schema() {
        let response = parse(json!({
            "id": "chatcmpl-3",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello"},
                "finish_reason": "stop"
            }]
        }));

        let converted = serde_json::to_value(openai_to_anthropic(response).unwrap()).unwrap();
        assert_eq!(converted["type"], json!("message"));
        assert_eq!(converted["role"], json!("assistant"));
        assert_eq!(converted["content"][0], json!({"type": "text", "text": "Hello"}));
    }
}
