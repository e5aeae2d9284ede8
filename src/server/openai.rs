use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures::{stream, StreamExt};

use super::AppState;
use crate::proxy::{ChunkStream, ProxyOutcome, StreamEvent};
use crate::types::{
    openai::{ChatCompletionRequest, ModelsResponse},
    ProxyError, Result,
};

pub async fn chat_completions(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = payload.map_err(|e| ProxyError::InvalidRequest(e.body_text()))?;
    request.validate().map_err(ProxyError::InvalidRequest)?;

    let models = &state.config.models;
    if !models.is_empty() && !models.contains(&request.model) {
        return Err(ProxyError::ModelNotFound(request.model));
    }

    tracing::info!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "Chat completion request"
    );

    match state.orchestrator.handle(request).await? {
        ProxyOutcome::Complete(response) => Ok(Json(response).into_response()),
        ProxyOutcome::Stream(events) => sse_response(events),
    }
}

fn sse_frame<T: serde::Serialize>(payload: &T) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string(payload).map(|json| format!("data: {}\n\n", json))
}

/// Encode a committed reply as `text/event-stream`. A truncated reply ends
/// with an error envelope; every reply ends with `data: [DONE]`.
fn sse_response(events: ChunkStream) -> Result<Response> {
    let frames = events
        .map(|event| match event {
            StreamEvent::Chunk(chunk) => sse_frame(&chunk),
            StreamEvent::Truncated(error) => sse_frame(&error.to_error_response()),
        })
        .chain(stream::once(async { Ok("data: [DONE]\n\n".to_string()) }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(frames))
        .map_err(|e| ProxyError::Internal(format!("Failed to build response: {}", e)))
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse::from_ids(
        &state.config.models,
        Utc::now().timestamp(),
    ))
}
