//! Codex Responses ↔ Chat Completions conversion.
//!
//! Request side: `/responses` bodies are rewritten for endpoints that
//! cannot accept the native format. Response side: Chat Completions SSE
//! chunks are re-emitted as `response.*` events for codex clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::ConvertError;
use super::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatMessage, ChatRole};

/// Codex Responses API request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesRequest {
    /// System-level instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Conversation items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Vec<InputItem>>,
    /// Output include list; dropped on conversion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Value>,
    /// Model identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Streaming flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Fields preserved across conversion (tools, tool_choice,
    /// temperature, and anything else).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One Responses input item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputItem {
    /// Item type, typically "message".
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    /// Message role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content: a string or an array of typed text parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

fn item_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| {
                let part_type = part.get("type").and_then(Value::as_str).unwrap_or("text");
                matches!(part_type, "text" | "input_text" | "output_text")
                    .then(|| part.get("text").and_then(Value::as_str))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Convert a Responses request into a Chat Completions request for an
/// endpoint without native Codex support.
pub fn responses_to_chat(request: ResponsesRequest) -> Result<ChatCompletionRequest, ConvertError> {
    let mut messages = Vec::new();

    if let Some(instructions) = request.instructions
        && !instructions.is_empty()
    {
        messages.push(ChatMessage::text(ChatRole::System, instructions));
    }

    for item in request.input.unwrap_or_default() {
        let Some(content) = &item.content else { continue };
        let text = item_text(content);
        if text.is_empty() {
            continue;
        }
        let role = match item.role.as_deref() {
            Some("assistant") => ChatRole::Assistant,
            Some("system") => ChatRole::System,
            Some("user") | None => ChatRole::User,
            Some(other) => ChatRole::Other(other.to_string()),
        };
        messages.push(ChatMessage::text(role, text));
    }

    // The chat schema requires at least one message.
    if messages.is_empty() {
        messages.push(ChatMessage::text(ChatRole::User, "Hello"));
    }

    let mut extra = request.extra;
    // `include` and `input` have no chat-completions counterpart.
    extra.remove("include");
    extra.remove("input");

    Ok(ChatCompletionRequest {
        model: request.model.unwrap_or_default(),
        messages,
        stream: request.stream,
        extra,
        ..ChatCompletionRequest::default()
    })
}

/// Rewrites Chat Completions SSE chunks into the Responses event
/// stream for codex clients.
#[derive(Debug, Default)]
pub struct ChatToResponsesStream {
    started: bool,
    completed: bool,
    response_id: Option<String>,
    model: Option<String>,
}

/// One `response.*` SSE event.
#[derive(Debug, Clone)]
pub struct ResponsesEvent {
    /// SSE event name (also mirrored in the payload `type`).
    pub event: &'static str,
    /// Event payload.
    pub data: Value,
}

impl ResponsesEvent {
    /// Render as an SSE frame.
    pub fn to_sse_frame(&self) -> String {
        let data = sonic_rs::to_string(&self.data).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event, data)
    }
}

impl ChatToResponsesStream {
    /// A fresh converter for one stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `response.completed` event has been emitted.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Consume one chunk, producing zero or more events.
    pub fn on_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<ResponsesEvent> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            self.response_id = chunk.id.clone();
            self.model = chunk.model.clone();
            events.push(ResponsesEvent {
                event: "response.created",
                data: json!({
                    "type": "response.created",
                    "response": {
                        "id": self.response_id.clone().unwrap_or_default(),
                        "status": "in_progress",
                        "model": self.model.clone().unwrap_or_default(),
                    }
                }),
            });
        }

        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                events.push(ResponsesEvent {
                    event: "response.output_text.delta",
                    data: json!({
                        "type": "response.output_text.delta",
                        "delta": content,
                    }),
                });
            }

            if choice.finish_reason.is_some() && !self.completed {
                self.completed = true;
                events.push(ResponsesEvent {
                    event: "response.completed",
                    data: json!({
                        "type": "response.completed",
                        "response": {
                            "id": self.response_id.clone().unwrap_or_default(),
                            "status": "completed",
                            "model": self.model.clone().unwrap_or_default(),
                        }
                    }),
                });
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(value: Value) -> ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn instructions_become_system_message() {
        let request: ResponsesRequest = serde_json::from_value(json!({
            "instructions": "be brief",
            "input": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}],
            "stream": false
        }))
        .unwrap();

        let converted = responses_to_chat(request).unwrap();
        let value = serde_json::to_value(&converted).unwrap();
        assert_eq!(value["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(value["messages"][1], json!({"role": "user", "content": "hi"}));
        assert_eq!(value["stream"], json!(false));
        assert!(value.get("input").is_none());
        assert!(value.get("include").is_none());
    }

    #[test]
    fn tools_and_sampling_parameters_are_preserved() {
        let request: ResponsesRequest = serde_json::from_value(json!({
            "instructions": "x",
            "input": [],
            "include": ["usage"],
            "temperature": 0.3,
            "tools": [{"type": "function", "name": "f"}]
        }))
        .unwrap();

        let converted = responses_to_chat(request).unwrap();
        let value = serde_json::to_value(&converted).unwrap();
        assert_eq!(value["temperature"], json!(0.3));
        assert!(value.get("tools").is_some());
        assert!(value.get("include").is_none());
    }

    #[test]
    fn empty_input_injects_hello() {
        let request: ResponsesRequest = serde_json::from_value(json!({"input": []})).unwrap();
        let converted = responses_to_chat(request).unwrap();
        let value = serde_json::to_value(&converted).unwrap();
        assert_eq!(value["messages"], json!([{"role": "user", "content": "Hello"}]));
    }

    #[test]
    fn stream_reformats_to_responses_events() {
        let mut converter = ChatToResponsesStream::new();

        let first = converter.on_chunk(&chunk(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello"}}]
        })));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].event, "response.created");
        assert_eq!(first[1].event, "response.output_text.delta");
        assert_eq!(first[1].data["delta"], json!("Hello"));

        let second = converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {"content": "!"}}]
        })));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data["delta"], json!("!"));

        let done = converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        })));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].event, "response.completed");
        assert!(converter.is_completed());
    }

    #[test]
    fn completed_is_emitted_once() {
        let mut converter = ChatToResponsesStream::new();
        converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        })));
        let repeat = converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        })));
        assert!(repeat.is_empty());
    }
}
