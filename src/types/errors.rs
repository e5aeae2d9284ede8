use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use super::openai::ErrorResponse;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model '{0}' is not available")]
    ModelNotFound(String),

    #[error("No healthy upstream credentials available")]
    NoHealthyCredentials,

    #[error("Upstream request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: String },

    #[error("Upstream rejected the request with status {status}")]
    UpstreamClient { status: u16 },

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("Upstream stream ended prematurely: {0}")]
    StreamTruncated(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing API key. Provide one in the Authorization header or the api_key parameter.")]
    MissingApiKey,

    #[error("Invalid API key provided.")]
    InvalidApiKey,

    #[error("Token '{0}' not found in pool")]
    TokenNotFound(usize),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::NoHealthyCredentials => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::RetriesExhausted { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamClient { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
            ProxyError::StreamTruncated(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::MissingApiKey | ProxyError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ProxyError::TokenNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI error `type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::NoHealthyCredentials => "service_unavailable",
            ProxyError::RetriesExhausted { .. }
            | ProxyError::UpstreamClient { .. }
            | ProxyError::MalformedResponse(_)
            | ProxyError::StreamTruncated(_) => "upstream_error",
            ProxyError::InvalidRequest(_)
            | ProxyError::ModelNotFound(_)
            | ProxyError::TokenNotFound(_) => "invalid_request_error",
            ProxyError::MissingApiKey | ProxyError::InvalidApiKey => "authentication_error",
            ProxyError::Config(_) | ProxyError::Internal(_) => "server_error",
        }
    }

    /// OpenAI error `code` field.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "configuration_error",
            ProxyError::ModelNotFound(_) => "model_not_found",
            ProxyError::NoHealthyCredentials => "no_healthy_credentials",
            ProxyError::RetriesExhausted { .. } => "retries_exhausted",
            ProxyError::UpstreamClient { .. } => "upstream_client_error",
            ProxyError::MalformedResponse(_) => "malformed_response",
            ProxyError::StreamTruncated(_) => "stream_truncated",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::MissingApiKey => "missing_api_key",
            ProxyError::InvalidApiKey => "invalid_api_key",
            ProxyError::TokenNotFound(_) => "token_not_found",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.to_string(), self.error_type(), Some(self.error_code()))
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(
                code = self.error_code(),
                status = status.as_u16(),
                message = %self,
                "Request failed"
            );
        } else {
            tracing::warn!(
                code = self.error_code(),
                status = status.as_u16(),
                message = %self,
                "Request rejected"
            );
        }

        (status, Json(self.to_error_response())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
