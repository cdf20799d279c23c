//! Shared domain types for kag-bridge: the progress [`Event`] produced while a
//! solver pipeline runs, and the OpenAI-compatible chat payloads it is
//! eventually framed into.

pub mod chat;
pub mod event;

pub use chat::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatMessage, DeltaMessage,
    FinishReason, ModelCard, ModelList, Role, Usage,
};
pub use event::{Event, EventOrigin, EventStatus};
