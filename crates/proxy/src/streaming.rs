//! Streaming response forwarding: SSE event processing per response
//! route, with end-of-stream bookkeeping (health recording and log
//! emission) attached to the stream itself.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use eventsource_stream::Event;
use futures::Stream;
use futures::StreamExt as _;
use serde_json::Value;

use crate::convert::codex::ChatToResponsesStream;
use crate::convert::openai::ChatCompletionChunk;
use crate::convert::stream::OpenAiToAnthropicStream;
use crate::endpoint::Endpoint;
use crate::logsink::{RequestLog, RequestLogSink};
use crate::restore;

/// Restore pair: (rewritten, original).
pub type ModelRestore = Option<(String, String)>;

/// Per-route SSE event processing state.
pub enum StreamProcessor {
    /// Anthropic upstream forwarded to an Anthropic-speaking client.
    AnthropicPassthrough {
        /// Saw `message_start`.
        saw_start: bool,
        /// Saw `message_stop`.
        saw_stop: bool,
        /// Model restoration pair.
        restore: ModelRestore,
    },
    /// OpenAI upstream forwarded unconverted.
    OpenAiPassthrough {
        /// Any completion marker observed.
        complete: bool,
        /// Model restoration pair.
        restore: ModelRestore,
    },
    /// OpenAI chunks re-emitted as Anthropic events.
    ToAnthropic {
        /// Chunk-folding converter.
        converter: OpenAiToAnthropicStream,
        /// Saw the `[DONE]` marker.
        saw_done: bool,
    },
    /// OpenAI chunks re-emitted as Codex Responses events.
    ToResponses {
        /// Chunk converter.
        converter: ChatToResponsesStream,
        /// Saw the `[DONE]` marker.
        saw_done: bool,
        /// Model restoration pair.
        restore: ModelRestore,
    },
}

fn passthrough_frame(event: &Event, restore: &ModelRestore) -> Bytes {
    let data = match restore {
        Some((rewritten, original)) => {
            restore::restore_model_in_sse_data(&event.data, rewritten, original).unwrap_or_else(|| event.data.clone())
        }
        None => event.data.clone(),
    };

    let frame = if event.event == "message" {
        format!("data: {data}\n\n")
    } else {
        format!("event: {}\ndata: {data}\n\n", event.event)
    };
    Bytes::from(frame)
}

fn parse_chunk(data: &str) -> Option<ChatCompletionChunk> {
    match serde_json::from_str(data) {
        Ok(chunk) => Some(chunk),
        Err(err) => {
            log::warn!("unparseable chat completion chunk: {err}");
            None
        }
    }
}

impl StreamProcessor {
    /// Process one upstream SSE event into client-bound frames.
    pub fn on_event(&mut self, event: &Event) -> Vec<Bytes> {
        match self {
            Self::AnthropicPassthrough {
                saw_start,
                saw_stop,
                restore,
            } => {
                if event.data.contains("message_start") || event.event == "message_start" {
                    *saw_start = true;
                }
                if event.data.contains("message_stop") || event.event == "message_stop" {
                    *saw_stop = true;
                }
                vec![passthrough_frame(event, restore)]
            }
            Self::OpenAiPassthrough { complete, restore } => {
                let data = event.data.trim();
                if data == "[DONE]" {
                    *complete = true;
                    return vec![Bytes::from("data: [DONE]\n\n")];
                }
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
                    let finished = value
                        .get("choices")
                        .and_then(Value::as_array)
                        .is_some_and(|choices| {
                            choices.iter().any(|c| c.get("finish_reason").is_some_and(|f| !f.is_null()))
                        });
                    if finished || event_type == "response.completed" || event_type == "response.done" {
                        *complete = true;
                    }
                }
                vec![passthrough_frame(event, restore)]
            }
            Self::ToAnthropic { converter, saw_done } => {
                let data = event.data.trim();
                if data == "[DONE]" {
                    *saw_done = true;
                    return Vec::new();
                }
                let Some(chunk) = parse_chunk(data) else {
                    return Vec::new();
                };
                converter
                    .on_chunk(&chunk)
                    .iter()
                    .map(|event| Bytes::from(event.to_sse_frame()))
                    .collect()
            }
            Self::ToResponses {
                converter,
                saw_done,
                restore,
            } => {
                let data = event.data.trim();
                if data == "[DONE]" {
                    *saw_done = true;
                    return Vec::new();
                }
                let Some(chunk) = parse_chunk(data) else {
                    return Vec::new();
                };
                converter
                    .on_chunk(&chunk)
                    .iter()
                    .map(|event| {
                        let mut data = event.data.clone();
                        if let Some((rewritten, original)) = restore {
                            restore::restore_model(&mut data, rewritten, original);
                        }
                        let payload = sonic_rs::to_string(&data).unwrap_or_else(|_| "{}".to_string());
                        Bytes::from(format!("event: {}\ndata: {payload}\n\n", event.event))
                    })
                    .collect()
            }
        }
    }

    /// Close the stream: trailing frames plus the completeness verdict.
    pub fn on_end(&mut self) -> (Vec<Bytes>, bool) {
        match self {
            Self::AnthropicPassthrough { saw_start, saw_stop, .. } => (Vec::new(), !*saw_start || *saw_stop),
            Self::OpenAiPassthrough { complete, .. } => (Vec::new(), *complete),
            Self::ToAnthropic { converter, saw_done } => {
                let complete = converter.has_finish_reason() || *saw_done;
                if complete && converter.has_started() {
                    let frames = converter
                        .finish()
                        .iter()
                        .map(|event| Bytes::from(event.to_sse_frame()))
                        .collect();
                    (frames, true)
                } else {
                    // A truncated upstream yields a truncated client
                    // stream: no message_stop.
                    (Vec::new(), false)
                }
            }
            Self::ToResponses {
                converter, saw_done, ..
            } => {
                if converter.is_completed() {
                    (Vec::new(), true)
                } else if *saw_done {
                    let synthetic = crate::convert::codex::ResponsesEvent {
                        event: "response.completed",
                        data: serde_json::json!({"type": "response.completed", "response": {"status": "completed"}}),
                    };
                    (vec![Bytes::from(synthetic.to_sse_frame())], true)
                } else {
                    (Vec::new(), false)
                }
            }
        }
    }
}

/// End-of-stream bookkeeping. Exactly one of `finish` (natural end) or
/// `Drop` (client disconnect) emits the log.
pub struct StreamFinalizer {
    endpoint: Arc<Endpoint>,
    sink: Arc<dyn RequestLogSink>,
    log: Option<RequestLog>,
    request_id: String,
    started_at: std::time::Instant,
}

impl StreamFinalizer {
    /// Arm the finalizer with the attempt's log template.
    pub fn new(endpoint: Arc<Endpoint>, sink: Arc<dyn RequestLogSink>, log: RequestLog) -> Self {
        let request_id = log.request_id.clone();
        Self {
            endpoint,
            sink,
            log: Some(log),
            request_id,
            started_at: std::time::Instant::now(),
        }
    }

    fn finish(&mut self, complete: bool) {
        let Some(mut log) = self.log.take() else { return };
        log.duration_ms += self.started_at.elapsed().as_millis() as u64;

        if complete {
            self.endpoint.record_request(true, &self.request_id, None);
        } else {
            log.error = Some("sse_validation_error".to_string());
            let outcome = self
                .endpoint
                .record_request(false, &self.request_id, Some("incomplete SSE stream"));
            if let Some(reason) = outcome.became_inactive {
                log::warn!(
                    "endpoint '{}' marked inactive after incomplete stream (caused by {:?})",
                    self.endpoint.name,
                    reason.causing_request_ids
                );
            }
        }

        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            sink.save_log(log).await;
        });
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        // The client went away mid-stream. Record the partial log; the
        // endpoint did nothing wrong, so health state is untouched and
        // there is no retry.
        let Some(mut log) = self.log.take() else { return };
        log.duration_ms += self.started_at.elapsed().as_millis() as u64;
        log.error = Some("client_disconnected".to_string());
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            sink.save_log(log).await;
        });
    }
}

type UpstreamEvents =
    Pin<Box<dyn Stream<Item = Result<Event, eventsource_stream::EventStreamError<reqwest::Error>>> + Send>>;

struct ForwardState {
    upstream: UpstreamEvents,
    processor: StreamProcessor,
    finalizer: StreamFinalizer,
    pending: VecDeque<Bytes>,
    frames_emitted: usize,
    done: bool,
}

/// Build the client-bound byte stream for one upstream SSE response.
///
/// The stream owns all end-of-stream bookkeeping. If it yields no frame
/// at all, no log is emitted and the caller treats the attempt as an
/// SSE validation failure (retryable, since nothing reached the
/// client).
pub fn forward_sse(
    upstream: UpstreamEvents,
    processor: StreamProcessor,
    finalizer: StreamFinalizer,
) -> impl Stream<Item = Bytes> + Send {
    let state = ForwardState {
        upstream,
        processor,
        finalizer,
        pending: VecDeque::new(),
        frames_emitted: 0,
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                state.frames_emitted += 1;
                return Some((frame, state));
            }
            if state.done {
                return None;
            }

            match state.upstream.next().await {
                Some(Ok(event)) => {
                    state.pending.extend(state.processor.on_event(&event));
                }
                Some(Err(err)) => {
                    log::warn!("upstream stream error: {err}");
                    state.done = true;
                    if state.frames_emitted > 0 {
                        state.finalizer.finish(false);
                    } else {
                        state.finalizer.log = None;
                    }
                }
                None => {
                    state.done = true;
                    let (frames, complete) = state.processor.on_end();
                    state.pending.extend(frames);
                    if state.frames_emitted > 0 || !state.pending.is_empty() {
                        state.finalizer.finish(complete);
                    } else {
                        // Nothing reached the client; the pipeline
                        // records this attempt and may retry.
                        state.finalizer.log = None;
                    }
                }
            }
        }
    })
}
