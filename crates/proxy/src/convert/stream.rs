//! Streaming OpenAI → Anthropic conversion.
//!
//! Chat Completions chunks are folded into the Anthropic event sequence
//! incrementally: `message_start`, `content_block_start` / `..._delta` /
//! `..._stop` per block, `message_delta`, `message_stop`. Tool-call
//! arguments pass through an [`ArgumentsBuffer`] that releases safe
//! prefixes at JSON boundary characters.

use serde_json::json;

use super::anthropic::StreamEvent;
use super::openai::{ChatCompletionChunk, Usage};
use super::python_fix::PythonDictFixer;
use super::response::stop_reason_for;

/// Buffered arguments are force-released beyond this size.
const ARGUMENTS_RELEASE_THRESHOLD: usize = 256;

/// Accumulates tool-call argument fragments and releases prefixes that
/// are safe to emit: up to the last JSON boundary character, or
/// everything once the buffer exceeds a threshold.
#[derive(Debug, Default)]
pub struct ArgumentsBuffer {
    buf: String,
}

impl ArgumentsBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a fragment, returning any releasable prefix.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.buf.push_str(fragment);

        if self.buf.len() > ARGUMENTS_RELEASE_THRESHOLD {
            return Some(std::mem::take(&mut self.buf));
        }

        let boundary = self.buf.rfind(|c| matches!(c, ',' | '}' | ']'))?;
        let released: String = self.buf.drain(..=boundary).collect();
        Some(released)
    }

    /// Drain whatever remains.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

#[derive(Debug)]
enum OpenBlock {
    Text {
        index: usize,
    },
    ToolUse {
        index: usize,
        call_index: u32,
        args: ArgumentsBuffer,
        fixer: Option<PythonDictFixer>,
    },
}

/// Folds Chat Completions chunks into Anthropic stream events.
#[derive(Debug)]
pub struct OpenAiToAnthropicStream {
    started: bool,
    next_index: usize,
    open: Option<OpenBlock>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    python_fix: bool,
    message_id: String,
    model: String,
}

impl OpenAiToAnthropicStream {
    /// A fresh converter. `model` is the name reported in
    /// `message_start` (after restoration). `python_fix` gates the
    /// Python-dict repair shim for tool arguments.
    pub fn new(model: impl Into<String>, python_fix: bool) -> Self {
        Self {
            started: false,
            next_index: 0,
            open: None,
            finish_reason: None,
            usage: None,
            python_fix,
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
        }
    }

    /// Whether any chunk carried a finish reason.
    pub fn has_finish_reason(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Whether `message_start` has been emitted.
    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Consume one chunk, producing the events it unlocks.
    pub fn on_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            if let Some(id) = &chunk.id {
                self.message_id = id.clone();
            }
            if self.model.is_empty()
                && let Some(model) = &chunk.model
            {
                self.model = model.clone();
            }
            events.push(StreamEvent::MessageStart {
                message: json!({
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                }),
            });
        }

        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(content) = &choice.delta.content
            && !content.is_empty()
        {
            self.ensure_text_block(&mut events);
            let index = match &self.open {
                Some(OpenBlock::Text { index }) => *index,
                _ => 0,
            };
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: json!({"type": "text_delta", "text": content}),
            });
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for call in tool_calls {
                if let Some(id) = &call.id {
                    // Opening fragment: a new tool_use block.
                    let name = call
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    self.close_open_block(&mut events);
                    let index = self.next_index;
                    self.next_index += 1;
                    events.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
                    });
                    self.open = Some(OpenBlock::ToolUse {
                        index,
                        call_index: call.index,
                        args: ArgumentsBuffer::new(),
                        fixer: self.python_fix.then(PythonDictFixer::new),
                    });
                }

                let Some(fragment) = call.function.as_ref().and_then(|f| f.arguments.as_deref()) else {
                    continue;
                };
                if fragment.is_empty() {
                    continue;
                }

                if let Some(OpenBlock::ToolUse {
                    index,
                    call_index,
                    args,
                    fixer,
                }) = &mut self.open
                {
                    if *call_index != call.index && call.id.is_none() {
                        log::warn!("tool-call fragment for index {} while block {} is open", call.index, call_index);
                    }
                    let released = match fixer {
                        Some(fixer) => fixer.push(fragment),
                        None => args.push(fragment),
                    };
                    if let Some(partial) = released {
                        events.push(StreamEvent::ContentBlockDelta {
                            index: *index,
                            delta: json!({"type": "input_json_delta", "partial_json": partial}),
                        });
                    }
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            self.finish_reason = Some(reason.clone());
        }

        events
    }

    /// Close the stream, emitting the trailing event sequence.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if !self.started {
            return events;
        }

        self.close_open_block(&mut events);

        let usage = self.usage.as_ref().map_or_else(
            || json!({"input_tokens": 0, "output_tokens": 0}),
            |usage| {
                json!({
                    "input_tokens": usage.input_tokens.or(usage.prompt_tokens).unwrap_or(0),
                    "output_tokens": usage.output_tokens.or(usage.completion_tokens).unwrap_or(0),
                })
            },
        );

        events.push(StreamEvent::MessageDelta {
            delta: json!({
                "stop_reason": stop_reason_for(self.finish_reason.as_deref()),
                "stop_sequence": null,
            }),
            usage,
        });
        events.push(StreamEvent::MessageStop);

        events
    }

    fn ensure_text_block(&mut self, events: &mut Vec<StreamEvent>) {
        if matches!(self.open, Some(OpenBlock::Text { .. })) {
            return;
        }
        self.close_open_block(events);
        let index = self.next_index;
        self.next_index += 1;
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: json!({"type": "text", "text": ""}),
        });
        self.open = Some(OpenBlock::Text { index });
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        match self.open.take() {
            None => {}
            Some(OpenBlock::Text { index }) => {
                events.push(StreamEvent::ContentBlockStop { index });
            }
            Some(OpenBlock::ToolUse {
                index,
                mut args,
                mut fixer,
                ..
            }) => {
                let remainder = match &mut fixer {
                    Some(fixer) => fixer.flush(),
                    None => args.flush(),
                };
                if let Some(partial) = remainder {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: json!({"type": "input_json_delta", "partial_json": partial}),
                    });
                }
                events.push(StreamEvent::ContentBlockStop { index });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn chunk(value: Value) -> ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    fn event_types(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    #[test]
    fn text_stream_produces_the_full_event_sequence() {
        let mut converter = OpenAiToAnthropicStream::new("claude-3-opus", false);

        let first = converter.on_chunk(&chunk(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello"}}]
        })));
        assert_eq!(event_types(&first), vec!["message_start", "content_block_start", "content_block_delta"]);

        let more = converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {"content": " world"}}]
        })));
        assert_eq!(event_types(&more), vec!["content_block_delta"]);

        converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        })));
        assert!(converter.has_finish_reason());

        let tail = converter.finish();
        assert_eq!(event_types(&tail), vec!["content_block_stop", "message_delta", "message_stop"]);
    }

    #[test]
    fn message_start_reports_the_restored_model() {
        let mut converter = OpenAiToAnthropicStream::new("claude-3-opus", false);
        let events = converter.on_chunk(&chunk(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": "x"}}]
        })));

        let StreamEvent::MessageStart { message } = &events[0] else {
            unreachable!("first event must be message_start")
        };
        assert_eq!(message["model"], json!("claude-3-opus"));
        assert_eq!(message["id"], json!("chatcmpl-1"));
    }

    #[test]
    fn tool_call_fragments_accumulate_into_input_json_deltas() {
        let mut converter = OpenAiToAnthropicStream::new("m", false);

        converter.on_chunk(&chunk(json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "get_weather", "arguments": ""}}
            ]}}]
        })));

        let partials = converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"city\":\"Paris\"},"}}
            ]}}]
        })));

        let delta_payloads: Vec<&Value> = partials
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentBlockDelta { delta, .. } => Some(delta),
                _ => None,
            })
            .collect();
        assert!(!delta_payloads.is_empty());
        assert_eq!(delta_payloads[0]["type"], json!("input_json_delta"));

        converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]
        })));
        let tail = converter.finish();
        assert_eq!(event_types(&tail), vec!["content_block_stop", "message_delta", "message_stop"]);

        let StreamEvent::MessageDelta { delta, .. } = &tail[1] else {
            unreachable!("expected message_delta")
        };
        assert_eq!(delta["stop_reason"], json!("tool_use"));
    }

    #[test]
    fn text_then_tool_call_closes_the_text_block_first() {
        let mut converter = OpenAiToAnthropicStream::new("m", false);

        converter.on_chunk(&chunk(json!({
            "id": "c",
            "choices": [{"index": 0, "delta": {"content": "thinking"}}]
        })));
        let events = converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "f", "arguments": "{}"}}
            ]}}]
        })));

        let types = event_types(&events);
        assert_eq!(types[0], "content_block_stop");
        assert_eq!(types[1], "content_block_start");
    }

    #[test]
    fn usage_flows_into_message_delta() {
        let mut converter = OpenAiToAnthropicStream::new("m", false);
        converter.on_chunk(&chunk(json!({
            "id": "c",
            "choices": [{"index": 0, "delta": {"content": "x"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        })));

        let tail = converter.finish();
        let StreamEvent::MessageDelta { usage, .. } = &tail[1] else {
            unreachable!("expected message_delta")
        };
        assert_eq!(usage["input_tokens"], json!(12));
        assert_eq!(usage["output_tokens"], json!(3));
    }

    #[test]
    fn arguments_buffer_releases_at_boundaries() {
        let mut buffer = ArgumentsBuffer::new();
        assert_eq!(buffer.push("{\"a"), None);
        assert_eq!(buffer.push("\":1,"), Some("{\"a\":1,".to_string()));
        assert_eq!(buffer.push("\"b\":2"), None);
        assert_eq!(buffer.push("}"), Some("\"b\":2}".to_string()));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn arguments_buffer_force_releases_past_threshold() {
        let mut buffer = ArgumentsBuffer::new();
        let long = "x".repeat(ARGUMENTS_RELEASE_THRESHOLD + 1);
        assert_eq!(buffer.push(&long), Some(long));
    }

    #[test]
    fn python_dict_arguments_are_repaired_across_chunks() {
        let mut converter = OpenAiToAnthropicStream::new("m", true);

        converter.on_chunk(&chunk(json!({
            "id": "c",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "f", "arguments": "{'city': 'Pa"}}
            ]}}]
        })));
        let events = converter.on_chunk(&chunk(json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "ris'}"}}
            ]}}]
        })));

        let StreamEvent::ContentBlockDelta { delta, .. } = &events[0] else {
            unreachable!("expected input_json_delta")
        };
        let repaired: Value = serde_json::from_str(delta["partial_json"].as_str().unwrap()).unwrap();
        assert_eq!(repaired, json!({"city": "Paris"}));
    }
}
