//! mf-server: HTTP facade over the mediaforge job scheduler.
//!
//! This crate ties the other mf-* crates into a running service. It
//! provides:
//!
//! - Axum-based HTTP API for submitting, inspecting, cancelling and purging
//!   jobs, plus artifact downloads
//! - Startup sweep of orphaned workspaces and a janitor task that expires
//!   old terminal jobs
//! - Graceful shutdown via signal handling

pub mod context;
pub mod error;
pub mod middleware;
pub mod router;
pub mod routes;

use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mf_core::config::Config;

use crate::context::AppContext;

/// How often expired jobs are reaped.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Start the mediaforge server.
///
/// Builds the [`AppContext`], clears workspaces left behind by a previous
/// process, and serves HTTP until a shutdown signal arrives. Running jobs
/// are cancelled and the worker pool is joined before returning.
pub async fn start(config: Config) -> mf_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    std::fs::create_dir_all(&config.workspace.output_root)?;
    if let Some(ref uploads) = config.workspace.uploads_root {
        if !uploads.is_dir() {
            tracing::warn!("Uploads directory {} does not exist", uploads.display());
        }
    }

    let ctx = AppContext::from_config(config.clone())?;

    match ctx.workspaces.sweep_orphans() {
        Ok(0) => {}
        Ok(n) => tracing::info!("Removed {n} orphaned workspace(s)"),
        Err(e) => tracing::warn!("Orphan sweep failed: {e}"),
    }

    for info in ctx.tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}", info.name);
        }
    }

    let cancel = CancellationToken::new();
    let janitor = tokio::spawn(run_janitor(ctx.clone(), cancel.clone()));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| mf_core::Error::Internal(format!("Invalid server address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| mf_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;

    tracing::info!("Starting server on {addr}");

    let app = router::build_router(ctx.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;

    cancel.cancel();
    let _ = janitor.await;
    ctx.scheduler.shutdown().await;

    served.map_err(|e| mf_core::Error::Internal(format!("Server error: {e}")))?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Periodically drop terminal jobs past their retention.
async fn run_janitor(ctx: AppContext, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ctx.scheduler.reap_expired(chrono::Utc::now()).await;
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
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
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
