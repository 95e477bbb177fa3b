mod config;
mod git;
mod http;
mod metrics;
mod mirror;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::http::packcache::PackCache;
use crate::metrics::MetricsRegistry;
use crate::mirror::{MirrorManager, Status};

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
pub struct AppState {
    pub config: Arc<Config>,
    pub mirror: Arc<MirrorManager>,
    pub metrics: MetricsRegistry,
    /// Ensure status recorded by info/refs, consumed by the following
    /// upload-pack POST for the same repo.
    pub statuses: Mutex<HashMap<String, Status>>,
    pub pack_cache: PackCache,
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr = state.config.listen_addr.clone();
    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("gitmirrord/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let mirror = Arc::new(MirrorManager::new(&config, http_client)?);

    // One-shot maintenance mode: optimise and exit.
    if config.is_maintenance_run() {
        let mode = config.maintenance_mode;
        tracing::info!(repo = %config.maintenance_repo, ?mode, "running one-shot maintenance");
        if config.maintenance_repo == "all" {
            mirror.maintain_all(mode).await?;
        } else {
            mirror.maintain_repo(&config.maintenance_repo, mode).await?;
        }
        return Ok(());
    }

    tracing::info!(
        mirror_dir = %config.mirror_dir,
        allowed_upstreams = ?config.allowed_upstreams,
        stale_after = ?config.sync_stale_after,
        "starting gitmirrord"
    );

    let state = Arc::new(AppState {
        config: Arc::new(config),
        mirror,
        metrics: MetricsRegistry::new(),
        statuses: Mutex::new(HashMap::new()),
        pack_cache: PackCache::new(),
    });

    run_http_server(state).await?;

    tracing::info!("gitmirrord shut down cleanly");
    Ok(())
}
