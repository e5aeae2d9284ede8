use axum::{
    extract::{Query, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, Uri},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

use super::AppState;
use crate::types::{ProxyError, Result};

/// Paths served without an API key.
const EXEMPT_PATHS: [&str; 2] = ["/", "/health"];

#[derive(Debug, Deserialize)]
struct KeyQuery {
    api_key: Option<String>,
}

/// Reject requests without a valid client API key. With an empty allowlist
/// any non-empty key is accepted.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    let auth = &state.config.auth;
    if !auth.require_api_key || EXEMPT_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let key = extract_api_key(request.headers(), request.uri()).ok_or(ProxyError::MissingApiKey)?;

    if !auth.api_keys.is_empty() && !auth.api_keys.iter().any(|k| *k == key) {
        tracing::warn!(
            path = %request.uri().path(),
            "Rejected request with unknown API key"
        );
        return Err(ProxyError::InvalidApiKey);
    }

    Ok(next.run(request).await)
}

/// `Authorization: Bearer`, then `api_key` query, then `X-API-Key` /
/// `api-key` headers.
fn extract_api_key(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| {
            Query::<KeyQuery>::try_from_uri(uri)
                .ok()
                .and_then(|Query(q)| q.api_key)
        })
        .or_else(|| header("x-api-key"))
        .or_else(|| header("api-key"))
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-one"));
        assert_eq!(
            extract_api_key(&headers, &uri("/v1/models")).as_deref(),
            Some("sk-one")
        );
    }

    #[test]
    fn test_extract_query_param() {
        assert_eq!(
            extract_api_key(&HeaderMap::new(), &uri("/v1/models?api_key=sk-two")).as_deref(),
            Some("sk-two")
        );
    }

    #[test]
    fn test_extract_alternate_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-three"));
        assert_eq!(
            extract_api_key(&headers, &uri("/")).as_deref(),
            Some("sk-three")
        );

        let mut headers = HeaderMap::new();
        headers.insert("api-key", HeaderValue::from_static("sk-four"));
        assert_eq!(
            extract_api_key(&headers, &uri("/")).as_deref(),
            Some("sk-four")
        );
    }

    #[test]
    fn test_bearer_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-header"));
        assert_eq!(
            extract_api_key(&headers, &uri("/x?api_key=sk-query")).as_deref(),
            Some("sk-header")
        );
    }

    #[test]
    fn test_blank_key_is_missing() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(extract_api_key(&headers, &uri("/")), None);
        assert_eq!(extract_api_key(&HeaderMap::new(), &uri("/x?api_key=")), None);
    }
}
