//! Artifact Proxy - caching download proxy
//!
//! Serves artifacts from a local store, fetching misses from a prioritized
//! list of mirrors and storing them while they stream to the client. Old
//! entries are purged on a fixed interval.

mod config;
mod error;
mod logging;
mod mirrors;
mod proxy;
mod server;
mod types;

use crate::config::Args;
use crate::error::{ProxyError, Result};
use crate::mirrors::Mirrors;
use crate::proxy::Downloader;
use crate::server::{start_server, ServerState, SharedState};
use artifact_store::{ArtifactStore, PurgeScheduler};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    logging::init(config.debug, config.json_log)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Starting Artifact Proxy..."
    );
    info!("Listen: {}", config.listen);
    info!("Store root: {:?}", config.cache_root);
    info!("Mirrors file: {:?}", config.mirrors_file);

    if let Some(pidfile) = &config.pidfile {
        write_pidfile(pidfile).await?;
    }

    let result = run(&config).await;

    if let Some(pidfile) = &config.pidfile {
        if let Err(e) = tokio::fs::remove_file(pidfile).await {
            warn!(path = ?pidfile, error = %e, "Failed to remove pid file");
        }
    }

    if let Err(e) = &result {
        error!(error = %e, "Artifact Proxy stopped with an error");
    } else {
        info!("Artifact Proxy stopped");
    }
    result
}

async fn run(config: &config::ProxyConfig) -> Result<()> {
    let mirrors = Mirrors::load(&config.mirrors_file).await?;
    if mirrors.is_empty() {
        return Err(ProxyError::Config(format!(
            "no mirrors listed in {}",
            config.mirrors_file.display()
        )));
    }

    let store = Arc::new(ArtifactStore::new(
        config.cache_root.clone(),
        info_span!("store"),
    ));
    store.init().await?;

    let scheduler = PurgeScheduler::new(
        store.clone(),
        config.purge_interval,
        config.purge_selector,
        info_span!("purge"),
    )
    .start();

    let downloader = Downloader::new(
        store.clone(),
        mirrors,
        config.client_timeout,
        info_span!("download"),
    )?;

    let state: SharedState = Arc::new(ServerState::new(store, downloader));

    let stop = CancellationToken::new();
    let server = start_server(
        state,
        config.listen,
        &config.static_dir,
        stop.clone(),
        config.shutdown_grace,
    );
    tokio::pin!(server);

    let failed_early = tokio::select! {
        served = &mut server => Some(served),
        _ = shutdown_signal() => None,
    };

    // No purge may run once shutdown has begun.
    scheduler.shutdown().await;

    let served = match failed_early {
        Some(served) => served,
        None => {
            stop.cancel();
            tokio::select! {
                served = &mut server => served,
                _ = shutdown_signal() => {
                    warn!("Second shutdown signal, exiting without waiting for downloads");
                    Ok(())
                }
            }
        }
    };

    served.map_err(ProxyError::from)
}

async fn write_pidfile(path: &Path) -> Result<()> {
    tokio::fs::write(path, format!("{}\n", std::process::id()))
        .await
        .map_err(|e| ProxyError::Config(format!("cannot write pid file {}: {}", path.display(), e)))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received");
}
