//! Anthropic Messages → OpenAI Chat Completions request conversion.

use serde_json::{Value, json};

use super::ConvertError;
use super::anthropic::{BlockType, ContentBlock, MessageContent, MessagesRequest};
use super::openai::{
    ChatCompletionRequest, ChatContent, ChatMessage, ChatRole, ContentPart, FunctionCall, FunctionDefinition, ImageUrl,
    Tool, ToolCall,
};
use crate::context::ConversionContext;

/// Thinking budgets at or below this map to `reasoning_effort: low`.
const REASONING_LOW_MAX: u64 = 5000;
/// Thinking budgets at or below this map to `reasoning_effort: medium`.
const REASONING_MEDIUM_MAX: u64 = 15000;

/// Convert an Anthropic request for an OpenAI-typed endpoint.
///
/// Records the tool-use ids and stop sequences needed by the inverse
/// transform into `conversion`.
pub fn anthropic_to_openai(
    request: MessagesRequest,
    conversion: &mut ConversionContext,
) -> Result<ChatCompletionRequest, ConvertError> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        messages.push(ChatMessage::text(ChatRole::System, system.to_text()));
    }

    for message in request.messages {
        match message.content {
            MessageContent::Text(text) => {
                messages.push(ChatMessage::text(role_for(&message.role), text));
            }
            MessageContent::Blocks(blocks) => {
                convert_blocks(&message.role, blocks, &mut messages, conversion)?;
            }
        }
    }

    if let Some(stop) = &request.stop_sequences {
        conversion.stop_sequences = stop.clone();
    }
    conversion.streaming = request.stream.unwrap_or(false);

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| Tool {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                },
            })
            .collect()
    });

    let mut parallel_tool_calls = None;
    let tool_choice = request.tool_choice.map(|choice| {
        if choice.disable_parallel_tool_use == Some(true) {
            parallel_tool_calls = Some(false);
        }
        match choice.choice_type.as_str() {
            "any" => json!("required"),
            "tool" => json!({
                "type": "function",
                "function": {"name": choice.name.unwrap_or_default()}
            }),
            other => Value::String(other.to_string()),
        }
    });

    let mut reasoning_effort = None;
    let mut max_reasoning_tokens = None;
    if let Some(thinking) = &request.thinking
        && thinking.is_enabled()
    {
        reasoning_effort = Some(effort_for(thinking.budget_tokens).to_string());
        max_reasoning_tokens = thinking.budget_tokens;
    }

    if request.top_k.is_some() {
        log::debug!("dropping top_k on conversion; chat completions has no equivalent");
    }

    Ok(ChatCompletionRequest {
        model: request.model,
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences,
        stream: request.stream,
        user: request.metadata.and_then(|m| m.user_id),
        tools,
        tool_choice,
        parallel_tool_calls,
        reasoning_effort,
        max_reasoning_tokens,
        extra: serde_json::Map::new(),
    })
}

fn role_for(role: &str) -> ChatRole {
    match role {
        "assistant" => ChatRole::Assistant,
        "user" => ChatRole::User,
        other => ChatRole::Other(other.to_string()),
    }
}

fn convert_blocks(
    role: &str,
    blocks: Vec<ContentBlock>,
    messages: &mut Vec<ChatMessage>,
    conversion: &mut ConversionContext,
) -> Result<(), ConvertError> {
    if role == "assistant" {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();

        for block in blocks {
            match block.block_type {
                Some(BlockType::Text) => {
                    if let Some(text) = block.text {
                        text_parts.push(text);
                    }
                }
                Some(BlockType::ToolUse) => {
                    let id = block
                        .id
                        .ok_or_else(|| ConvertError::invalid("anthropic", "tool_use block is missing id"))?;
                    conversion.tool_call_ids.push(id.clone());
                    tool_calls.push(ToolCall {
                        id,
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: block.name.unwrap_or_default(),
                            arguments: block
                                .input
                                .map(|input| serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()))
                                .unwrap_or_else(|| "{}".to_string()),
                        },
                    });
                }
                // Thinking output has no chat-completions representation.
                Some(BlockType::Thinking) => {}
                _ => {}
            }
        }

        messages.push(ChatMessage {
            role: ChatRole::Assistant,
            content: if text_parts.is_empty() {
                None
            } else {
                Some(ChatContent::Text(text_parts.join("")))
            },
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            tool_call_id: None,
        });

        return Ok(());
    }

    // User messages: tool results become role:tool messages FIRST, then
    // the remaining text/image content becomes the user message.
    let mut parts = Vec::new();
    let mut has_image = false;

    for block in blocks {
        match block.block_type {
            Some(BlockType::ToolResult) => {
                let tool_use_id = block
                    .tool_use_id
                    .ok_or_else(|| ConvertError::invalid("anthropic", "tool_result block is missing tool_use_id"))?;
                messages.push(ChatMessage {
                    role: ChatRole::Tool,
                    content: Some(ChatContent::Text(tool_result_text(block.content))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id),
                });
            }
            Some(BlockType::Text) => {
                if let Some(text) = block.text {
                    parts.push(ContentPart::Text { text });
                }
            }
            Some(BlockType::Image) => {
                if let Some(source) = block.source {
                    let media_type = source.media_type.unwrap_or_else(|| "image/png".to_string());
                    let data = source.data.unwrap_or_default();
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:{media_type};base64,{data}"),
                        },
                    });
                    has_image = true;
                }
            }
            _ => {}
        }
    }

    if parts.is_empty() {
        return Ok(());
    }

    let content = if has_image {
        ChatContent::Parts(parts)
    } else {
        let text: Vec<String> = parts
            .into_iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect();
        ChatContent::Text(text.join("\n"))
    };

    messages.push(ChatMessage {
        role: role_for(role),
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
    });

    Ok(())
}

fn tool_result_text(content: Option<Value>) -> String {
    match content {
        Some(Value::String(text)) => text,
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn effort_for(budget: Option<u64>) -> &'static str {
    match budget {
        Some(budget) if budget <= REASONING_LOW_MAX => "low",
        Some(budget) if budget <= REASONING_MEDIUM_MAX => "medium",
        Some(_) => "high",
        None => "medium",
    }
}
