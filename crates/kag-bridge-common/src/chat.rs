//! OpenAI-compatible chat completion payloads.
//!
//! Requests are accepted loosely (unknown fields ignored, optional knobs
//! defaulted); responses are emitted in the exact shape streaming clients
//! expect, including explicit `null` finish reasons on intermediate chunks.

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const COMPLETION_OBJECT: &str = "chat.completion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
        }
    }
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_p() -> f32 {
    0.8
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ChatCompletionRequest {
    /// Project key addressed by this request.
    ///
    /// `"openspg/CsQa"` addresses `CsQa`; without a `/` in the model name the
    /// explicit `project_id` wins, falling back to `"0"`.
    pub fn project_key(&self) -> String {
        if self.model.contains('/') {
            if let Some(last) = self.model.rsplit('/').next() {
                return last.to_string();
            }
        }
        self.project_id.clone().unwrap_or_else(|| "0".to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: DeltaMessage,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    fn single(id: &str, model: &str, delta: DeltaMessage, finish_reason: Option<FinishReason>) -> Self {
        Self {
            id: id.to_string(),
            object: CHUNK_OBJECT.to_string(),
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Role announcement that opens every stream.
    pub fn start(id: &str, model: &str) -> Self {
        Self::single(
            id,
            model,
            DeltaMessage {
                role: Some(Role::Assistant),
                content: Some(String::new()),
            },
            None,
        )
    }

    pub fn content(id: &str, model: &str, content: impl Into<String>) -> Self {
        Self::single(
            id,
            model,
            DeltaMessage {
                role: None,
                content: Some(content.into()),
            },
            None,
        )
    }

    /// Terminal chunk: empty delta plus the finish reason.
    pub fn stop(id: &str, model: &str, reason: FinishReason) -> Self {
        Self::single(id, model, DeltaMessage::default(), Some(reason))
    }

    pub fn delta_content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.delta.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first().and_then(|c| c.finish_reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    /// Character-count usage, matching what the knowledge-base service reports.
    pub fn from_text(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = prompt.chars().count();
        let completion_tokens = completion.chars().count();
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

impl ChatCompletion {
    pub fn single(
        id: impl Into<String>,
        model: impl Into<String>,
        content: impl Into<String>,
        finish_reason: FinishReason,
        usage: Usage,
    ) -> Self {
        Self {
            id: id.into(),
            object: COMPLETION_OBJECT.to_string(),
            created: Utc::now().timestamp(),
            model: model.into(),
            choices: vec![CompletionChoice {
                index: 0,
                message: ChatMessage::assistant(content),
                finish_reason: Some(finish_reason),
            }],
            usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelCard {
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created: Utc::now().timestamp(),
            owned_by: owned_by.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

impl ModelList {
    pub fn new(data: Vec<ModelCard>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

/// Fresh identifier shared by every chunk of one completion.
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn project_key_from_namespaced_model() {
        let req = request(serde_json::json!({
            "model": "openspg/CsQa",
            "messages": [{"role": "user", "content": "hi"}],
            "project_id": "7"
        }));
        assert_eq!(req.project_key(), "CsQa");
    }

    #[test]
    fn project_key_falls_back_to_project_id_then_zero() {
        let req = request(serde_json::json!({"model": "kag", "project_id": "7"}));
        assert_eq!(req.project_key(), "7");
        let req = request(serde_json::json!({"model": "kag"}));
        assert_eq!(req.project_key(), "0");
    }

    #[test]
    fn request_defaults_knobs() {
        let req = request(serde_json::json!({"model": "m", "messages": []}));
        assert!(!req.stream);
        assert_eq!(req.temperature, 0.8);
        assert!(req.max_tokens.is_none());
    }

    #[test]
    fn start_chunk_announces_assistant_with_empty_content() {
        let chunk = ChatCompletionChunk::start("chatcmpl-1", "kag");
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(value["choices"][0]["delta"]["content"], "");
        assert!(value["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn stop_chunk_has_empty_delta() {
        let chunk = ChatCompletionChunk::stop("chatcmpl-1", "kag", FinishReason::Stop);
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn usage_counts_characters() {
        let usage = Usage::from_text("héllo", "wörld!");
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 6);
        assert_eq!(usage.total_tokens, 11);
    }

    #[test]
    fn completion_ids_are_unique() {
        let a = completion_id();
        let b = completion_id();
        assert!(a.starts_with("chatcmpl-"));
        assert_ne!(a, b);
    }
}
