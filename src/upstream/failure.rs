use thiserror::Error;

/// Outcome of a failed upstream call, classified once at the client boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamFailure {
    #[error("upstream request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned HTTP {status}")]
    Http { status: u16 },

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl UpstreamFailure {
    /// Timeouts, network errors and 5xx are worth another attempt with a
    /// different token. Everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamFailure::Timeout | UpstreamFailure::Network(_) => true,
            UpstreamFailure::Http { status } => (500..600).contains(status),
            UpstreamFailure::Malformed(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamFailure::Timeout => "timeout",
            UpstreamFailure::Network(_) => "network_error",
            UpstreamFailure::Http { .. } => "http_error",
            UpstreamFailure::Malformed(_) => "malformed_response",
        }
    }
}

impl From<reqwest::Error> for UpstreamFailure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamFailure::Timeout
        } else {
            UpstreamFailure::Network(e.to_string())
        }
    }
}
