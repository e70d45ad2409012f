//! Anthropic Messages wire types.
//!
//! Content blocks are a struct with a typed discriminant and optional
//! fields rather than a tagged enum, so unknown block types survive the
//! proxy unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::openai::Usage;

/// Content block discriminant. Unknown types are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Plain text.
    Text,
    /// Image input.
    Image,
    /// Tool invocation by the model.
    ToolUse,
    /// Tool result from the client.
    ToolResult,
    /// Extended thinking output.
    Thinking,
    /// Any other block type, preserved for forward compatibility.
    #[serde(untagged)]
    Other(String),
}

/// Image source within an image block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    /// Source type, typically "base64".
    #[serde(rename = "type")]
    pub source_type: String,
    /// Media type, e.g. "image/png".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Base64 payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// One content block. Field presence depends on `block_type`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentBlock {
    /// Block discriminant.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub block_type: Option<BlockType>,
    /// Text for text blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Source for image blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ImageSource>,
    /// Id for tool_use blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name for tool_use blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Input for tool_use blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Referenced call for tool_result blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    /// Result content for tool_result blocks: a string or a block array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// Error marker for tool_result blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Thinking text for thinking blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Fields the proxy does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContentBlock {
    /// A text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            block_type: Some(BlockType::Text),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// A tool_use block.
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            block_type: Some(BlockType::ToolUse),
            id: Some(id.into()),
            name: Some(name.into()),
            input: Some(input),
            ..Self::default()
        }
    }
}

/// Message content: a plain string or a block array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Structured blocks.
    Blocks(Vec<ContentBlock>),
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "user" or "assistant".
    pub role: String,
    /// Message content.
    pub content: MessageContent,
}

/// The system prompt: a plain string or text blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Plain text.
    Text(String),
    /// Text blocks.
    Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
    /// Flatten to plain text, joining blocks with newlines.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| block.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Request metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Opaque end-user identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Fields the proxy does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Fields the proxy does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Tool selection constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoice {
    /// "auto", "any", "tool" or "none".
    #[serde(rename = "type")]
    pub choice_type: String,
    /// Tool name when `choice_type == "tool"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Maps to OpenAI `parallel_tool_calls: false` when true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_parallel_tool_use: Option<bool>,
}

/// Extended thinking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thinking {
    /// "enabled" or "disabled".
    #[serde(rename = "type")]
    pub thinking_type: String,
    /// Token budget for thinking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
}

impl Thinking {
    /// Whether thinking is enabled.
    pub fn is_enabled(&self) -> bool {
        self.thinking_type == "enabled"
    }
}

/// Messages API request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// System prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    /// Output token budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Streaming flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Top-k sampling. Dropped on conversion; OpenAI has no equivalent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    /// Request metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Tool definitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Tool selection constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Extended thinking parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking>,
    /// Fields the proxy does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Messages API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Message id.
    pub id: String,
    /// Always "message".
    #[serde(rename = "type")]
    pub response_type: String,
    /// Always "assistant".
    pub role: String,
    /// Model that produced the response.
    pub model: String,
    /// Response content blocks.
    pub content: Vec<ContentBlock>,
    /// Why generation stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Which stop sequence fired, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    /// Usage accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Fields the proxy does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// SSE events emitted toward Anthropic-speaking clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Stream opener carrying the message shell.
    MessageStart {
        /// The message shell.
        message: Value,
    },
    /// Opens content block `index`.
    ContentBlockStart {
        /// Block index.
        index: usize,
        /// The opening block.
        content_block: Value,
    },
    /// Incremental update to block `index`.
    ContentBlockDelta {
        /// Block index.
        index: usize,
        /// The delta payload.
        delta: Value,
    },
    /// Closes content block `index`.
    ContentBlockStop {
        /// Block index.
        index: usize,
    },
    /// Stop reason and usage, before the stream ends.
    MessageDelta {
        /// Stop reason and stop sequence.
        delta: Value,
        /// Usage totals.
        usage: Value,
    },
    /// Terminates the stream. The Anthropic protocol has no `[DONE]`.
    MessageStop,
}

impl StreamEvent {
    /// The SSE event name for this payload.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
        }
    }

    /// Render as an SSE frame with explicit event name.
    pub fn to_sse_frame(&self) -> String {
        let data = sonic_rs::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_name(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_block_parses() {
        let block: ContentBlock = serde_json::from_value(json!({
            "type": "tool_result",
            "tool_use_id": "toolu_1",
            "content": "42"
        }))
        .unwrap();

        assert_eq!(block.block_type, Some(BlockType::ToolResult));
        assert_eq!(block.tool_use_id.as_deref(), Some("toolu_1"));
    }

    #[test]
    fn unknown_block_types_are_preserved() {
        let block: ContentBlock = serde_json::from_value(json!({
            "type": "server_tool_use",
            "id": "x"
        }))
        .unwrap();

        assert_eq!(block.block_type, Some(BlockType::Other("server_tool_use".to_string())));
        let back = serde_json::to_value(&block).unwrap();
        assert_eq!(back["type"], json!("server_tool_use"));
    }

    #[test]
    fn system_prompt_accepts_string_and_blocks() {
        let text: SystemPrompt = serde_json::from_value(json!("be brief")).unwrap();
        assert_eq!(text.to_text(), "be brief");

        let blocks: SystemPrompt =
            serde_json::from_value(json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])).unwrap();
        assert_eq!(blocks.to_text(), "a\nb");
    }

    #[test]
    fn stream_event_frames_carry_event_names() {
        let event = StreamEvent::MessageStop;
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("event: message_stop\n"));
        assert!(frame.contains(r#""type":"message_stop""#));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn request_round_trips_unknown_fields() {
        let raw = json!({
            "model": "claude-3-opus",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 512,
            "anthropic_beta": ["x"]
        });

        let request: MessagesRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.extra.get("anthropic_beta"), Some(&json!(["x"])));
    }
}
