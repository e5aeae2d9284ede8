use super::models::Config;
use crate::types::ProxyError;
use crate::types::Result;
use regex::Regex;
use std::fs;
use std::path::Path;

/// Environment variable holding a JSON array of upstream tokens. When set it
/// replaces `pool.tokens` from the file.
pub const TOKEN_POOL_ENV: &str = "TOKEN_POOL";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path.as_ref())
        .map_err(|e| ProxyError::Config(format!("Failed to read config file: {}", e)))?;

    let mut config = parse_config(&content, path.as_ref())?;

    if let Ok(raw) = std::env::var(TOKEN_POOL_ENV) {
        config.pool.tokens = parse_token_pool(&raw)?;
        tracing::info!(
            count = config.pool.tokens.len(),
            "Token pool taken from {}",
            TOKEN_POOL_ENV
        );
    }

    config
        .validate()
        .map_err(|e| ProxyError::Config(format!("Invalid configuration: {}", e)))?;

    Ok(config)
}

fn parse_config(content: &str, path: &Path) -> Result<Config> {
    let expanded = expand_env_vars(content);

    // YAML unless the file says otherwise
    if path.extension().and_then(|s| s.to_str()) == Some("json") {
        serde_json::from_str(&expanded)
            .map_err(|e| ProxyError::Config(format!("Failed to parse JSON config: {}", e)))
    } else {
        serde_yaml::from_str(&expanded)
            .map_err(|e| ProxyError::Config(format!("Failed to parse YAML config: {}", e)))
    }
}

fn parse_token_pool(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str::<Vec<String>>(raw).map_err(|e| {
        ProxyError::Config(format!(
            "{} must be a JSON array of strings: {}",
            TOKEN_POOL_ENV, e
        ))
    })
}

fn expand_env_vars(content: &str) -> String {
    // Match ${VAR_NAME} or ${VAR_NAME:-default}
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default_value = caps.get(3).map(|m| m.as_str());

        std::env::var(var_name)
            .ok()
            .or_else(|| default_value.map(|s| s.to_string()))
            .unwrap_or_else(|| {
                tracing::warn!(
                    "Environment variable '{}' not found and no default provided",
                    var_name
                );
                String::new()
            })
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const YAML: &str = r#"
server:
  port: ${RELAY_TEST_PORT:-4444}
upstream:
  conversation_url: https://upstream.test/conversation
  chat_url: https://upstream.test/chat
  referer_template: "https://upstream.test/c/{conversation_id}"
pool:
  tokens: ${RELAY_TEST_TOKENS}
"#;

    #[test]
    fn test_expand_env_vars_simple() {
        std::env::set_var("RELAY_TEST_VAR", "test_value");
        let output = expand_env_vars("key: ${RELAY_TEST_VAR}");
        assert_eq!(output, "key: test_value");
        std::env::remove_var("RELAY_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        std::env::remove_var("RELAY_MISSING_VAR");
        let output = expand_env_vars("key: ${RELAY_MISSING_VAR:-default_value}");
        assert_eq!(output, "key: default_value");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        std::env::remove_var("RELAY_MISSING");
        let output = expand_env_vars("key: ${RELAY_MISSING}");
        assert_eq!(output, "key: ");
    }

    #[test]
    fn test_expand_leaves_referer_placeholder_alone() {
        let input = "referer_template: \"https://x/{conversation_id}\"";
        assert_eq!(expand_env_vars(input), input);
    }

    #[test]
    fn test_parse_config_with_flow_sequence_from_env() {
        std::env::set_var("RELAY_TEST_TOKENS", r#"["t1", "t2"]"#);
        let config = parse_config(YAML, &PathBuf::from("config.yaml")).unwrap();
        std::env::remove_var("RELAY_TEST_TOKENS");

        assert_eq!(config.server.port, 4444);
        assert_eq!(config.pool.tokens, vec!["t1", "t2"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_token_pool() {
        assert_eq!(parse_token_pool(r#"["a","b"]"#).unwrap(), vec!["a", "b"]);
        assert!(matches!(
            parse_token_pool("a,b"),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("/nonexistent/relay-config.yaml");
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }
}
