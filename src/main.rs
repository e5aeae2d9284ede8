use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod logging;
mod pool;
mod proxy;
mod server;
mod types;
mod upstream;

use config::{load_config, LoggingConfig};
use logging::RequestLogger;
use pool::CredentialPool;
use proxy::{ProxyOrchestrator, ProxyStats};
use server::AppState;
use upstream::UpstreamClient;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_tracing(&config.logging);
    tracing::info!(
        path = %config_path,
        tokens = config.pool.tokens.len(),
        models = config.models.len(),
        "Configuration loaded"
    );

    let pool = Arc::new(CredentialPool::new(&config.pool)?);
    tracing::info!(tokens = pool.len(), "Credential pool initialized");

    let upstream = UpstreamClient::new(
        Arc::new(config.upstream.clone()),
        RequestLogger::new(config.logging.clone()),
    )?;

    let orchestrator = ProxyOrchestrator::new(
        pool,
        Arc::new(upstream),
        config.retry.clone(),
        Arc::new(ProxyStats::new()),
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);

    if config.auth.require_api_key && config.auth.api_keys.is_empty() {
        tracing::warn!("API key required but no keys configured; any non-empty key is accepted");
    }

    let app = server::build_router(AppState {
        orchestrator: Arc::new(orchestrator),
        config: Arc::new(config),
    })
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http());

    // Start server
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("token_relay={},tower_http=info", logging.level).into()
    });

    let json = logging.json.then(|| tracing_subscriber::fmt::layer().json());
    let text = (!logging.json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
