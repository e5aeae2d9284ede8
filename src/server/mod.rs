pub mod auth;
pub mod health;
pub mod openai;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::config::Config;
use crate::proxy::ProxyOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ProxyOrchestrator>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/v1/models", get(openai::list_models))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/admin/tokens/:id/reset", post(health::reset_token))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .with_state(state)
}
