//! Gemini Relay
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Gemini API keys with per-tier rate limits
//! 2. Listens for prompts on `POST /generate`
//! 3. Walks a pro-then-flash retry ladder, reserving a key per attempt
//! 4. Returns the generated text (or the last failure) to the caller

mod api;
mod config;
mod error;
mod metrics;

use anyhow::{Context, Result};
use completion::GeminiClient;
use dispatch::Dispatcher;
use key_pool::{KeyPool, SnapshotStore};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{AppState, ServiceMetrics};
use crate::config::Config;

/// How long in-flight requests may run after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

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

    info!("starting gemini-relay");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        keys = config.api_keys.len(),
        error_mode = ?config.server.error_mode,
        snapshot = config.pool.snapshot_path.is_some(),
        "configuration loaded"
    );

    let state = build_state(&config, prometheus_handle)
        .await
        .context("failed to initialize relay")?;
    let pool = state.pool.clone();
    let in_flight = state.metrics.in_flight.clone();

    let app = api::build_router(state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: notify the
    // server to stop accepting, then race the drain against the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    pool.flush().await;

    info!("shutdown complete");
    Ok(())
}

/// Wire the key pool, upstream client and dispatcher together.
///
/// An unreadable usage snapshot is logged and skipped; the pool then starts
/// from zero usage.
async fn build_state(config: &Config, prometheus: PrometheusHandle) -> error::Result<AppState> {
    let mut pool = KeyPool::new(config.api_keys.clone(), config.pool_settings())?;
    if let Some(path) = &config.pool.snapshot_path {
        pool = pool.with_snapshot(SnapshotStore::new(path));
        if let Err(e) = pool.restore_snapshot().await {
            warn!(error = %e, path = %path.display(), "ignoring unreadable usage snapshot");
        }
    }
    let pool = Arc::new(pool);

    let client = reqwest::Client::builder().build()?;
    let backend = Arc::new(GeminiClient::new(client, config.upstream.base_url.clone()));
    let dispatcher = Dispatcher::new(
        pool.clone(),
        backend,
        config.ladder()?,
        config.dispatch_settings(),
    );
    info!(
        max_attempts = dispatcher.max_attempts(),
        keys = pool.len(),
        pro_limits = ?pool.settings().limits.pro,
        flash_limits = ?pool.settings().limits.flash,
        "dispatcher ready"
    );

    Ok(AppState {
        dispatcher: Arc::new(dispatcher),
        pool,
        metrics: ServiceMetrics::new(),
        prometheus,
        error_mode: config.server.error_mode,
    })
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
                error!(error = %e, "failed to install SIGTERM handler");
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
