pub mod loader;
pub mod models;

pub use loader::load_config;
pub use models::{
    AuthConfig, Config, LoggingConfig, PoolConfig, RetryConfig, ServerConfig, UpstreamConfig,
    CONVERSATION_PLACEHOLDER,
};

#[cfg(test)]
pub(crate) use models::sample_config;
