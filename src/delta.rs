//! Incremental chunk encoding of a session's event sequence.
//!
//! Stage reports carry the *full* content of their tag each time. Clients
//! want only what is new, so the encoder remembers what it already sent per
//! tag and emits the appended suffix. Final results and fallbacks are
//! free-form and are compared against everything delivered so far.
//!
//! When a tag's new content does not extend what was previously sent, the
//! full new content is re-emitted rather than slicing at a stale offset.

use std::collections::HashMap;

use futures::StreamExt;
use futures::stream::BoxStream;
use kag_bridge_common::chat::completion_id;
use kag_bridge_common::{ChatCompletionChunk, Event, EventOrigin, FinishReason};

/// SSE payload that follows the terminal chunk.
pub const DONE_MARKER: &str = "[DONE]";

/// Per-session memory of delivered content.
#[derive(Debug, Default)]
pub struct DeltaState {
    last_by_tag: HashMap<String, String>,
    cursor: String,
}

impl DeltaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to deliver for `event`, or `None` if it adds nothing.
    pub fn delta_for(&mut self, event: &Event) -> Option<String> {
        let delta = match event.origin {
            EventOrigin::Stage => self.stage_delta(&event.tag, &event.content),
            EventOrigin::Result | EventOrigin::Fallback => self.free_form_delta(&event.content),
        };
        delta.filter(|d| !d.is_empty())
    }

    fn stage_delta(&mut self, tag: &str, content: &str) -> Option<String> {
        let previous = self.last_by_tag.get(tag).map(String::as_str).unwrap_or("");
        if content == previous {
            return None;
        }
        let delta = match content.strip_prefix(previous) {
            Some(suffix) => suffix.to_string(),
            None => {
                tracing::debug!(tag, "Content no longer extends previous report; re-sending in full");
                content.to_string()
            }
        };
        self.last_by_tag.insert(tag.to_string(), content.to_string());
        self.cursor = content.to_string();
        Some(delta)
    }

    fn free_form_delta(&mut self, content: &str) -> Option<String> {
        if content.is_empty() {
            return None;
        }
        // Longest already-delivered text that this content extends.
        let delivered = std::iter::once(self.cursor.as_str())
            .chain(self.last_by_tag.values().map(String::as_str))
            .filter(|sent| content.starts_with(sent))
            .map(str::len)
            .max()
            .unwrap_or(0);
        self.cursor = content.to_string();
        Some(content[delivered..].to_string())
    }
}

/// Turns events into `chat.completion.chunk` frames: one start chunk, content
/// deltas, and exactly one terminal chunk.
pub struct DeltaStreamEncoder {
    id: String,
    model: String,
    state: DeltaState,
    failed: bool,
}

impl DeltaStreamEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_id(completion_id(), model)
    }

    pub fn with_id(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            state: DeltaState::new(),
            failed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) -> ChatCompletionChunk {
        ChatCompletionChunk::start(&self.id, &self.model)
    }

    /// Encode one event. An error event terminates the session.
    pub fn encode(&mut self, event: &Event) -> Option<ChatCompletionChunk> {
        if self.failed {
            return None;
        }
        if event.is_error() {
            self.failed = true;
            let text = if event.content.is_empty() {
                "Error: pipeline failed".to_string()
            } else {
                event.content.clone()
            };
            return Some(ChatCompletionChunk::content(&self.id, &self.model, text));
        }
        self.state
            .delta_for(event)
            .map(|delta| ChatCompletionChunk::content(&self.id, &self.model, delta))
    }

    pub fn is_terminated(&self) -> bool {
        self.failed
    }

    pub fn finish(&self) -> ChatCompletionChunk {
        let reason = if self.failed {
            FinishReason::Error
        } else {
            FinishReason::Stop
        };
        ChatCompletionChunk::stop(&self.id, &self.model, reason)
    }

    /// Frame a whole event sequence. Dropping the returned stream drops
    /// `events`, which is how client disconnects reach the session.
    pub fn encode_stream(
        mut self,
        mut events: BoxStream<'static, Event>,
    ) -> BoxStream<'static, ChatCompletionChunk> {
        async_stream::stream! {
            yield self.start();
            while let Some(event) = events.next().await {
                if let Some(chunk) = self.encode(&event) {
                    yield chunk;
                }
                if self.is_terminated() {
                    break;
                }
            }
            yield self.finish();
        }
        .boxed()
    }
}

/// Flattened result for non-streaming responses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    pub content: String,
    pub failed: bool,
}

impl Aggregate {
    pub fn finish_reason(&self) -> FinishReason {
        if self.failed {
            FinishReason::Error
        } else {
            FinishReason::Stop
        }
    }
}

/// Collect a whole event sequence into one string, in arrival order.
pub async fn aggregate(mut events: BoxStream<'static, Event>) -> Aggregate {
    let mut state = DeltaState::new();
    let mut out = Aggregate::default();
    while let Some(event) = events.next().await {
        if event.is_error() {
            out.content.push_str(&event.content);
            out.failed = true;
            break;
        }
        if let Some(delta) = state.delta_for(&event) {
            out.content.push_str(&delta);
        }
    }
    out
}
