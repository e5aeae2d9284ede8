use crate::config::{UpstreamConfig, CONVERSATION_PLACEHOLDER};
use crate::types::{ProxyError, Result};
use http::header::{HeaderMap, HeaderName, HeaderValue, REFERER};
use std::str::FromStr;

use super::UpstreamFailure;

/// Static upstream headers plus the conversation-scoped `Referer`.
#[derive(Debug, Clone)]
pub struct HeaderTemplate {
    defaults: HeaderMap,
    referer_template: String,
}

impl HeaderTemplate {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut defaults = HeaderMap::new();

        for (key, value) in &config.headers {
            let name = HeaderName::from_str(key)
                .map_err(|e| ProxyError::Config(format!("Invalid header name '{}': {}", key, e)))?;
            let val = HeaderValue::from_str(value).map_err(|e| {
                ProxyError::Config(format!("Invalid header value for '{}': {}", key, e))
            })?;
            defaults.insert(name, val);
        }

        Ok(Self {
            defaults,
            referer_template: config.referer_template.clone(),
        })
    }

    pub fn referer(&self, conversation_id: &str) -> String {
        self.referer_template
            .replace(CONVERSATION_PLACEHOLDER, conversation_id)
    }

    /// Headers for a chat call in `conversation_id`. Deterministic, no side
    /// effects.
    pub fn build_headers(
        &self,
        conversation_id: &str,
    ) -> std::result::Result<HeaderMap, UpstreamFailure> {
        let referer = HeaderValue::from_str(&self.referer(conversation_id)).map_err(|_| {
            UpstreamFailure::Malformed(format!(
                "conversation id {:?} cannot be used in a header",
                conversation_id
            ))
        })?;

        let mut headers = self.defaults.clone();
        headers.insert(REFERER, referer);
        Ok(headers)
    }

    pub fn defaults(&self) -> &HeaderMap {
        &self.defaults
    }
}
