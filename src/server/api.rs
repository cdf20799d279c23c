use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{self, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{StreamExt, stream};
use kag_bridge_common::chat::completion_id;
use kag_bridge_common::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ModelCard, ModelList, Role, Usage,
};
use serde_json::json;

use crate::delta::{DONE_MARKER, DeltaStreamEncoder, aggregate};
use crate::service::PipelineInvoker;
use crate::util::truncate_for_log;

pub const MODEL_OWNER: &str = "openspg";
pub const DEFAULT_MODEL_ID: &str = "openspg/default";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub invoker: PipelineInvoker,
    /// Accepted bearer keys; empty disables authentication.
    pub api_keys: HashSet<String>,
    /// `model` reported on streamed chunks.
    pub model_name: String,
    pub keep_alive: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "authentication_error", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = self.parts();
        let body = json!({
            "error": {
                "message": message,
                "type": kind,
                "param": null,
                "code": kind,
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// OpenAI-compatible routes, relative to `{servlet}/openspg/v1`.
pub fn openai_router() -> Router<SharedState> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/models", get(list_models))
}

// ── Handlers ──────────────────────────────────────────────────────────

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// The query is the content of the final message, which must come from the user.
fn extract_query(request: &ChatCompletionRequest) -> Result<String, ApiError> {
    let last = request
        .messages
        .last()
        .ok_or_else(|| ApiError::BadRequest("No messages provided".into()))?;
    if last.role != Role::User {
        return Err(ApiError::BadRequest(
            "Last message must be from the user".into(),
        ));
    }
    Ok(last.content.clone())
}

async fn chat_completions(
    State(state): State<SharedState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let query = extract_query(&request)?;
    let project_key = request.project_key();
    tracing::info!(
        project = %project_key,
        stream = request.stream,
        query = %truncate_for_log(&query, 100),
        "Chat completion request"
    );

    let events = state.invoker.invoke(&query, &project_key);

    if request.stream {
        let chunks = DeltaStreamEncoder::new(state.model_name.clone()).encode_stream(events);
        let frames = chunks
            .map(|chunk| Ok::<_, Infallible>(chunk_frame(&chunk)))
            .chain(stream::once(async {
                Ok::<_, Infallible>(sse::Event::default().data(DONE_MARKER))
            }));
        let sse = Sse::new(frames).keep_alive(KeepAlive::new().interval(state.keep_alive));
        return Ok(sse.into_response());
    }

    let result = aggregate(events).await;
    let model = if request.model.is_empty() {
        format!("kag-{}", project_key)
    } else {
        request.model.clone()
    };
    let usage = Usage::from_text(&query, &result.content);
    let finish_reason = result.finish_reason();
    let completion = ChatCompletion::single(completion_id(), model, result.content, finish_reason, usage);
    Ok(Json(completion).into_response())
}

fn chunk_frame(chunk: &ChatCompletionChunk) -> sse::Event {
    match sse::Event::default().json_data(chunk) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize chunk");
            sse::Event::default().comment("serialization error")
        }
    }
}

/// Catalog projects as `openspg/<name>` models.
async fn list_models(State(state): State<SharedState>) -> Json<ModelList> {
    let catalog = state.invoker.catalog();
    if catalog.is_empty()
        && let Err(e) = catalog.refresh(state.invoker.projects().as_ref()).await
    {
        tracing::warn!(error = %e, "Failed to list projects; returning default model");
        return Json(ModelList::new(vec![ModelCard::new(DEFAULT_MODEL_ID, MODEL_OWNER)]));
    }

    let cards = catalog
        .names()
        .into_iter()
        .map(|name| ModelCard::new(format!("{}/{}", MODEL_OWNER, name), MODEL_OWNER))
        .collect();
    Json(ModelList::new(cards))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kag_bridge_common::ChatMessage;

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        serde_json::from_value(json!({"model": "openspg/CsQa", "messages": messages})).unwrap()
    }

    fn user(content: &str) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }

    #[test]
    fn test_extract_query_uses_last_user_message() {
        let req = request(vec![user("first"), ChatMessage::assistant("reply"), user("second")]);
        assert_eq!(extract_query(&req).unwrap(), "second");
    }

    #[test]
    fn test_extract_query_rejects_empty_messages() {
        let err = extract_query(&request(vec![])).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "No messages provided"));
    }

    #[test]
    fn test_extract_query_rejects_trailing_assistant() {
        let err = extract_query(&request(vec![user("q"), ChatMessage::assistant("a")])).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "Last message must be from the user"));
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unauthorized("x".into()).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Internal("x".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
