//! Engram HTTP server.
//!
//! Startup order: load env → init tracing → build providers → open the
//! service (stores + engines) → gate on store health → spawn background
//! tasks → serve until ctrl-c/SIGTERM, then stop background work.

mod background;
mod error;
mod providers;
mod routes;
mod settings;
mod state;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use engram_core::{EngramConfig, EngramService};

use crate::settings::ServerSettings;
use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "engram-server", version, about = "Persistent memory service for conversational agents")]
struct Cli {
    /// Custom data directory (overrides ENGRAM_DATA_DIR)
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Bind address override, e.g. 0.0.0.0:3900
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // .env is optional; real deployments use actual environment variables
    let _ = dotenvy::dotenv();

    let settings = ServerSettings::from_env();
    init_tracing(settings.json_logs);

    let mut config = EngramConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = Some(data_dir);
    }

    let (oracle, embedder) = providers::build_providers(&settings, config.embedding_dimension);

    info!("engram-server v{} starting", env!("CARGO_PKG_VERSION"));
    let service = match EngramService::open(config, oracle, embedder) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("failed to open the memory service: {e}");
            std::process::exit(1);
        }
    };

    // Startup dependency gate: every store must answer its health probe
    let health = service.health_full();
    for (store, status) in &health.stores {
        if status.ok {
            info!(store = %store, latency_ms = status.latency_ms, "store healthy");
        } else {
            error!(
                store = %store,
                detail = status.detail.as_deref().unwrap_or("unknown"),
                "store unhealthy"
            );
        }
    }
    if !health.ok {
        error!("startup health checks failed");
        std::process::exit(1);
    }

    let state = AppState::new(service);
    let shutdown_tx = background::spawn(state.clone(), settings.maintenance_interval_hours);

    let app = routes::router(state, &settings.cors_origins);

    let addr = match cli
        .bind
        .as_deref()
        .map(str::parse)
        .unwrap_or_else(|| settings.addr())
    {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid bind address: {e}");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!("listening on http://{addr}");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {e}");
    }

    // Stop background loops before the stores drop
    if shutdown_tx.send(true).is_err() {
        warn!("background tasks already stopped");
    }
    info!("engram-server shutting down");
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Graceful shutdown on ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl+c: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!("failed to listen for SIGTERM: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl+c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
