use crate::config::LoggingConfig;
use chrono::{DateTime, Utc};
use http::header::HeaderMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

const MAX_LOGGED_BODY: usize = 2048;

#[derive(Debug, Serialize)]
pub struct UpstreamRequestLog {
    pub timestamp: DateTime<Utc>,
    pub call: &'static str,
    pub endpoint: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamResponseLog {
    pub timestamp: DateTime<Utc>,
    pub call: &'static str,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestLogger {
    config: LoggingConfig,
}

impl RequestLogger {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    pub fn log_upstream_request(
        &self,
        call: &'static str,
        endpoint: &str,
        token: &str,
        headers: &HeaderMap,
        body: Option<&str>,
    ) {
        if !self.config.enabled {
            return;
        }

        let log = UpstreamRequestLog {
            timestamp: Utc::now(),
            call,
            endpoint: endpoint.to_string(),
            token: token.to_string(),
            headers: if self.config.include_headers {
                Some(Self::headers_to_map(headers))
            } else {
                None
            },
            body: self.body_for_log(body),
        };

        tracing::debug!(log = ?log, "Upstream request");
    }

    pub fn log_upstream_response(
        &self,
        call: &'static str,
        status_code: Option<u16>,
        elapsed: Duration,
        body: Option<&str>,
        error: Option<&str>,
    ) {
        if !self.config.enabled {
            return;
        }

        let log = UpstreamResponseLog {
            timestamp: Utc::now(),
            call,
            status_code,
            duration_ms: elapsed.as_millis() as u64,
            body: self.body_for_log(body),
            error: error.map(|s| s.to_string()),
        };

        match status_code {
            Some(status) if status < 400 => tracing::debug!(log = ?log, "Upstream response"),
            _ => tracing::warn!(log = ?log, "Upstream response"),
        }
    }

    fn body_for_log(&self, body: Option<&str>) -> Option<String> {
        if self.config.include_body {
            body.map(truncate_body)
        } else {
            None
        }
    }

    fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                let key = name.to_string();
                let val = if Self::is_sensitive_header(&key) {
                    "[REDACTED]".to_string()
                } else {
                    value.to_str().unwrap_or("<invalid>").to_string()
                };
                (key, val)
            })
            .collect()
    }

    fn is_sensitive_header(name: &str) -> bool {
        let lower = name.to_lowercase();
        lower.contains("authorization")
            || lower.contains("api-key")
            || lower.contains("api_key")
            || lower.contains("apikey")
            || lower.contains("token")
            || lower.contains("cookie")
            || lower.contains("password")
            || lower.contains("secret")
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_LOGGED_BODY {
        return body.to_string();
    }
    let mut end = MAX_LOGGED_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[{} bytes truncated]", &body[..end], body.len() - end)
}
