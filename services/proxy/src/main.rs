//! veil
//!
//! SNI-concealing TLS forwarding proxy. Depending on `VEIL_MODE` the
//! process runs the client-facing edge, the target-facing bridge, or both.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use veil_proxy::{
    bridge::{api, Bridge},
    config::{Config, Mode},
    edge::EdgeListener,
    oob::{InProcessOob, OobChannel, RemoteOob},
    reaper::SessionReaper,
    session::SessionStore,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn spawn_reaper(
    name: &'static str,
    store: &Arc<SessionStore>,
    config: &Config,
    shutdown_rx: &watch::Receiver<bool>,
) -> JoinHandle<()> {
    let reaper = SessionReaper::new(name, Arc::clone(store), config.reaper());
    let shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move { reaper.run(shutdown_rx).await })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to VEIL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(mode = %config.mode, "Starting veil");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dialer = Arc::new(config.dialer());
    let mut reapers = Vec::new();
    let mut stores = Vec::new();

    let bridge = match config.mode {
        Mode::Bridge | Mode::Combined => {
            let store = Arc::new(SessionStore::new());
            reapers.push(spawn_reaper("bridge", &store, &config, &shutdown_rx));
            stores.push(Arc::clone(&store));
            Some(Arc::new(Bridge::new(store, Arc::clone(&dialer), config.bridge())))
        }
        Mode::Edge => None,
    };

    let mut server_handle: JoinHandle<std::io::Result<()>> = match (config.mode, &bridge) {
        (Mode::Bridge, Some(bridge)) => {
            let app = api::create_router(Arc::clone(bridge));
            let listener = tokio::net::TcpListener::bind(config.bridge_listen_addr)
                .await
                .with_context(|| format!("Failed to bind {}", config.bridge_listen_addr))?;
            info!(addr = %config.bridge_listen_addr, "Bridge listening for control connections");

            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        loop {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                            if shutdown_rx.changed().await.is_err() {
                                break;
                            }
                        }
                        info!("Bridge HTTP server shutting down");
                    })
                    .await
            })
        }
        _ => {
            let oob: Arc<dyn OobChannel> = match &bridge {
                Some(bridge) => Arc::new(InProcessOob::new(Arc::clone(bridge))),
                None => {
                    info!(bridge_url = %config.bridge_url, "Using remote bridge");
                    Arc::new(RemoteOob::new(config.remote_oob())?)
                }
            };

            let store = Arc::new(SessionStore::new());
            reapers.push(spawn_reaper("edge", &store, &config, &shutdown_rx));
            stores.push(Arc::clone(&store));

            let listener = EdgeListener::bind(config.edge(), oob, Arc::clone(&dialer), store)
                .await
                .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
            tokio::spawn(Arc::new(listener).run())
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if config.mode == Mode::Bridge
        && !server_handle.is_finished()
        && tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server_handle)
            .await
            .is_err()
    {
        warn!("Bridge HTTP server did not shut down in time");
    }
    // The edge accept loop has no drain phase.
    server_handle.abort();

    for handle in reapers {
        if let Err(e) = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            warn!(error = %e, "Session reaper did not shut down in time");
        }
    }

    for store in stores {
        let closed = store.close_all().await;
        if closed > 0 {
            info!(closed, "Closed remaining sessions");
        }
    }

    info!("veil shutdown complete");
    Ok(())
}
