use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use super::AppState;
use crate::pool::{PoolError, PoolSummary, TokenId, TokenSnapshot};
use crate::proxy::StatsSnapshot;
use crate::types::{ProxyError, Result};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub pool: PoolSummary,
    pub stats: StatsSnapshot,
}

pub async fn root() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "health": "/health",
    }))
}

/// Read-only: reports cooldowns as they stand without recovering tokens.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let pool = state.orchestrator.pool().summary();
    let status = if pool.available > 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        timestamp: Utc::now(),
        pool,
        stats: state.orchestrator.stats().snapshot(),
    })
}

pub async fn reset_token(
    State(state): State<AppState>,
    Path(id): Path<TokenId>,
) -> Result<Json<TokenSnapshot>> {
    let pool = state.orchestrator.pool();
    pool.reset(id).map_err(|e| match e {
        PoolError::UnknownToken(id) => ProxyError::TokenNotFound(id),
        other => ProxyError::Internal(other.to_string()),
    })?;

    pool.summary()
        .tokens
        .into_iter()
        .find(|t| t.id == id)
        .map(Json)
        .ok_or(ProxyError::TokenNotFound(id))
}
