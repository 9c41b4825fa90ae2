use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::{poller, server};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(config: Config) -> Result<()> {
    let engine = Engine::from_config(&config).await.context("starting engine")?;
    info!(
        db_path = %config.db_path().display(),
        providers = engine.registry().list().len(),
        platforms = engine.platforms().len(),
        feeds = engine.feeds().sources().len(),
        "engine ready"
    );

    if config.server.api_token.is_none() {
        warn!("no [server].api_token configured, the API is open to anyone who can reach it");
    }

    let cancel = CancellationToken::new();
    let poller_handle = tokio::spawn(poller::polling_loop(engine.clone(), cancel.clone()));

    let router = server::build_router(server::AppState {
        engine: engine.clone(),
        api_token: config.server.api_token.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding to {}", config.server.listen))?;

    info!(listen = %config.server.listen, "HTTP server listening");

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await?;
    info!("shutdown signal received");

    cancel.cancel();
    shutdown(&engine, poller_handle, server_handle).await;

    engine.pool().close().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown(
    engine: &Arc<Engine>,
    poller_handle: tokio::task::JoinHandle<()>,
    server_handle: tokio::task::JoinHandle<std::io::Result<()>>,
) {
    let cancelled = engine.cancel_all();
    if cancelled > 0 {
        info!(sessions = cancelled, "cancelled running generation sessions");
    }

    let finished = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = poller_handle.await;
        match server_handle.await {
            Ok(Err(e)) => warn!(error = %e, "HTTP server exited with error"),
            Err(e) => warn!(error = %e, "HTTP server task failed"),
            Ok(Ok(())) => {}
        }
    })
    .await;
    if finished.is_err() {
        warn!(timeout = ?SHUTDOWN_TIMEOUT, "shutdown timed out, abandoning remaining tasks");
    }
}

async fn wait_for_shutdown() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    Ok(())
}
