use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod api;
mod classifier;
mod config;
mod context;
mod dispatch;
mod error;
mod registry;
mod router;
mod session;
mod stats;
mod usecase;

pub use config::Config;
pub use error::GatewayError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /health and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ai_gateway=info,tower_http=warn".into()),
        )
        .init();

    // Load config — file if present, environment alone otherwise
    let config_path = std::env::var("AIG_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/ai-gateway/config.toml"));

    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file — starting from environment");
        Config::from_env().context("Failed to build config from environment")?
    };
    let config = Arc::new(config);

    info!(
        port = config.gateway.port,
        backends = config.backends.len(),
        session_ttl_secs = config.session.ttl_seconds,
        "ai-gateway starting"
    );

    let state = Arc::new(router::RouterState::new(Arc::clone(&config)));

    // Background tasks: backend health prober + session sweeper
    tokio::spawn(registry::run_prober(
        Arc::clone(&state.registry),
        Duration::from_secs(config.health.probe_interval_seconds),
        Duration::from_millis(config.health.probe_timeout_ms),
    ));
    tokio::spawn(sweeper(
        Arc::clone(&state.sessions),
        Duration::from_secs(config.session.sweep_interval_seconds),
    ));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.port).parse()?;
    info!(%addr, "gateway API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = api::routes::router(state).layer(
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
    );

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("gateway API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
/// Invoked via `ai-gateway --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("AIG_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8000);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: evict expired session bindings every `interval`.
///
/// Expiry is also enforced lazily on read, so the sweeper only bounds how
/// long a dead binding can occupy memory.
async fn sweeper(sessions: Arc<session::SessionStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // Initial tick fires immediately; skip it so startup does no work.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let removed = sessions.sweep().await;
        if removed > 0 {
            info!(removed, "session sweep");
        }
    }
}
