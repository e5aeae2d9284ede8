use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Placeholder substituted with the upstream conversation id in
/// [`UpstreamConfig::referer_template`].
pub const CONVERSATION_PLACEHOLDER: &str = "{conversation_id}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3333
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub include_headers: bool,
    #[serde(default)]
    pub include_body: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_headers: true,
            include_body: false,
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub require_api_key: bool,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_api_key: true,
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub conversation_url: String,
    pub chat_url: String,
    /// URL template for the `Referer` header of chat calls. Must contain
    /// `{conversation_id}`.
    pub referer_template: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    /// Static headers sent with every upstream call.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_timeout() -> u64 {
    30
}

impl UpstreamConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub tokens: Vec<String>,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Upper bound on the cooldown multiplier (`consecutive_failures` is
    /// clamped to this value).
    #[serde(default = "default_cooldown_cap")]
    pub cooldown_cap: u32,
    /// A token is disabled once its consecutive failures exceed this
    /// value. `None` keeps failing tokens cycling through cooldown forever.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: Option<u32>,
}

impl PoolConfig {
    pub fn cooldown_base(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_cooldown_cap() -> u32 {
    10
}

fn default_failure_threshold() -> Option<u32> {
    Some(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: false,
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    10000
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.tokens.is_empty() {
            return Err("At least one upstream token must be configured".to_string());
        }

        if let Some(idx) = self.pool.tokens.iter().position(|t| t.trim().is_empty()) {
            return Err(format!("Upstream token {} is empty", idx));
        }

        if self.upstream.conversation_url.is_empty() {
            return Err("Upstream conversation_url is empty".to_string());
        }

        if self.upstream.chat_url.is_empty() {
            return Err("Upstream chat_url is empty".to_string());
        }

        if !self
            .upstream
            .referer_template
            .contains(CONVERSATION_PLACEHOLDER)
        {
            return Err(format!(
                "Upstream referer_template must contain '{}'",
                CONVERSATION_PLACEHOLDER
            ));
        }

        if self.upstream.timeout_seconds == 0 {
            return Err("Upstream has invalid timeout (must be > 0)".to_string());
        }

        for (name, value) in &self.upstream.headers {
            http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("Invalid upstream header name '{}': {}", name, e))?;
            http::HeaderValue::from_str(value)
                .map_err(|e| format!("Invalid upstream header value for '{}': {}", name, e))?;
        }

        if self.retry.max_attempts == 0 {
            return Err("Invalid retry max_attempts (must be > 0)".to_string());
        }

        if self.pool.cooldown_cap == 0 {
            return Err("Invalid pool cooldown_cap (must be > 0)".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_config() -> Config {
        Config {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            auth: AuthConfig::default(),
            upstream: UpstreamConfig {
                conversation_url: "https://upstream.test/conversation".to_string(),
                chat_url: "https://upstream.test/chat".to_string(),
                referer_template: "https://upstream.test/c/{conversation_id}".to_string(),
                timeout_seconds: 30,
                ssl_verify: true,
                headers: BTreeMap::new(),
            },
            pool: PoolConfig {
                tokens: vec!["tok-a".to_string(), "tok-b".to_string()],
                cooldown_seconds: 30,
                cooldown_cap: 10,
                failure_threshold: Some(5),
            },
            retry: RetryConfig::default(),
            models: vec!["claude-4-default".to_string()],
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_empty_pool_rejected() {
        let mut config = sample_config();
        config.pool.tokens.clear();
        let err = config.validate().unwrap_err();
        assert!(err.contains("At least one upstream token"));
    }

    #[test]
    fn test_blank_token_rejected() {
        let mut config = sample_config();
        config.pool.tokens.push("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_referer_template_requires_placeholder() {
        let mut config = sample_config();
        config.upstream.referer_template = "https://upstream.test/".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.contains("{conversation_id}"));
    }

    #[test]
    fn test_invalid_static_header_rejected() {
        let mut config = sample_config();
        config
            .upstream
            .headers
            .insert("bad header".to_string(), "x".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_and_attempts_rejected() {
        let mut config = sample_config();
        config.upstream.timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let yaml = r#"
upstream:
  conversation_url: https://upstream.test/conversation
  chat_url: https://upstream.test/chat
  referer_template: "https://upstream.test/c/{conversation_id}"
pool:
  tokens: ["one"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 3333);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.pool.failure_threshold, Some(5));
        assert!(config.auth.require_api_key);
        assert!(config.models.is_empty());
        assert!(config.validate().is_ok());
    }
}

#[cfg(test)]
pub(crate) use tests::sample_config;
