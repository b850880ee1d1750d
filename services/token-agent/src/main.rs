//! Token Agent
//!
//! Single-binary service that:
//! 1. Loads config and starts a `TokenProvider` over a projected token file
//! 2. Keeps the token fresh in the background
//! 3. Serves the current token, health and Prometheus metrics on localhost

mod config;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use credential::{CredentialClient, FileCredential};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use token_refresher::TokenProvider;
use token_refresher::schedule::unix_seconds;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Requests beyond this are queued, not rejected.
const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    provider: Arc<TokenProvider>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/token", get(token_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-agent");

    // Install Prometheus metrics recorder before the first refresh is recorded
    let prometheus = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.agent.listen_addr,
        audience = %config.agent.audience,
        token_file = %config.credential.token_file.display(),
        refresh_percentage = config.refresh.refresh_percentage,
        "configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let credential_config = config.credential.clone();
    let provider = TokenProvider::builder()
        .audience(config.agent.audience.clone())
        .config(config.refresh.clone())
        .credential_factory(move || {
            let client = FileCredential::new(
                credential_config.token_file.clone(),
                credential_config.lifetime(),
            )?;
            Ok(Arc::new(client) as Arc<dyn CredentialClient>)
        })
        .cancellation(&shutdown)
        .build()
        .await
        .context("failed to initialize token provider")?;
    let provider = Arc::new(provider);

    let app = build_router(AppState {
        provider: provider.clone(),
        prometheus,
        started_at: Instant::now(),
    });

    let listener = TcpListener::bind(config.agent.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.agent.listen_addr))?;
    info!(addr = %config.agent.listen_addr, "accepting requests");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    provider.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 while the last refresh succeeded, 503 once it failed.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let token = state.provider.state();
    let uptime = state.started_at.elapsed().as_secs();

    let mut body = serde_json::json!({
        "audience": state.provider.audience(),
        "refreshing": state.provider.is_refreshing(),
        "expires_at": unix_seconds(token.expires_on()),
        "next_refresh_at": token.next_refresh().map(unix_seconds),
        "uptime_seconds": uptime,
    });

    let status_code = match token.last_error() {
        None => {
            body["status"] = "healthy".into();
            StatusCode::OK
        }
        Some(err) => {
            body["status"] = "degraded".into();
            body["last_error"] = err.to_string().into();
            StatusCode::SERVICE_UNAVAILABLE
        }
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Current token. A stale token is still served while it has not expired;
/// an expired token after a failed refresh yields 503.
async fn token_handler(State(state): State<AppState>) -> impl IntoResponse {
    let token = state.provider.state();

    let (status_code, body) = match token.last_error() {
        Some(err) if token.is_expired(SystemTime::now()) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "error": err.to_string(),
                "expired_at": unix_seconds(token.expires_on()),
            }),
        ),
        err => (
            StatusCode::OK,
            serde_json::json!({
                "access_token": token.token(),
                "token_type": "Bearer",
                "expires_on": unix_seconds(token.expires_on()),
                "stale": err.is_some(),
            }),
        ),
    };

    (
        status_code,
        [
            (axum::http::header::CONTENT_TYPE, "application/json"),
            (axum::http::header::CACHE_CONTROL, "no-store"),
        ],
        body.to_string(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
