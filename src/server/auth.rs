use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};

use super::api::{ApiError, SharedState};

/// Key presented in `Authorization`, with or without the `Bearer ` scheme.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim_start();
    let key = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!key.is_empty()).then_some(key)
}

/// Reject requests without a configured key. Open when no keys are set.
pub async fn require_api_key(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.api_keys.is_empty() {
        return Ok(next.run(request).await);
    }
    let authorized = presented_key(request.headers()).is_some_and(|key| state.api_keys.contains(key));
    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Rejected request with missing or unknown API key");
        return Err(ApiError::Unauthorized("Unauthorized access".into()));
    }
    Ok(next.run(request).await)
}
