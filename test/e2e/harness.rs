//! Shared setup for the end-to-end scenarios.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use veil_proxy::bridge::{api, Bridge, BridgeConfig};
use veil_proxy::dialer::TargetDialer;
use veil_proxy::edge::{EdgeConfig, EdgeListener};
use veil_proxy::handoff::Strategy;
use veil_proxy::handshake::HandshakeConfig;
use veil_proxy::oob::{InProcessOob, OobChannel, RemoteOob, RemoteOobConfig};
use veil_proxy::session::SessionStore;

static INIT: Once = Once::new();

/// Installs the ring crypto provider and a test log writer, once.
pub fn init() {
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn dialer_for(hosts: &[(&str, SocketAddr)]) -> Arc<TargetDialer> {
    let overrides: HashMap<String, SocketAddr> = hosts
        .iter()
        .map(|(host, addr)| (host.to_string(), *addr))
        .collect();
    Arc::new(TargetDialer::new(443, Duration::from_secs(1)).with_overrides(overrides))
}

/// Bridge HTTP control surface on an ephemeral port.
pub struct BridgeServer {
    pub base_url: String,
    pub bridge: Arc<Bridge>,
    task: JoinHandle<io::Result<()>>,
}

impl BridgeServer {
    pub async fn spawn(dialer: Arc<TargetDialer>) -> io::Result<Self> {
        let bridge = Arc::new(Bridge::new(
            Arc::new(SessionStore::new()),
            dialer,
            BridgeConfig::default(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = api::create_router(Arc::clone(&bridge));
        let task = tokio::spawn(async move { axum::serve(listener, app).await });
        Ok(Self {
            base_url: format!("http://{addr}"),
            bridge,
            task,
        })
    }

    pub fn oob(&self) -> RemoteOob {
        remote_oob(&self.base_url)
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A bridge reached by direct calls, for edge and bridge in one process.
pub fn in_process_oob(dialer: Arc<TargetDialer>) -> (Arc<Bridge>, Arc<InProcessOob>) {
    let bridge = Arc::new(Bridge::new(
        Arc::new(SessionStore::new()),
        dialer,
        BridgeConfig::default(),
    ));
    let oob = Arc::new(InProcessOob::new(Arc::clone(&bridge)));
    (bridge, oob)
}

pub fn remote_oob(base_url: &str) -> RemoteOob {
    RemoteOob::new(RemoteOobConfig {
        base_url: base_url.to_string(),
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_millis(500),
    })
    .expect("build remote OOB client")
}

/// A base URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub struct EdgeHandle {
    pub addr: SocketAddr,
    pub listener: Arc<EdgeListener>,
    task: JoinHandle<io::Result<()>>,
}

impl EdgeHandle {
    pub async fn spawn(
        oob: Arc<dyn OobChannel>,
        dialer: Arc<TargetDialer>,
        handoff: &[Strategy],
    ) -> io::Result<Self> {
        let config = EdgeConfig {
            handshake: HandshakeConfig {
                poll_wait: Duration::from_millis(100),
                ..HandshakeConfig::default()
            },
            handoff: handoff.to_vec(),
            ..EdgeConfig::new("127.0.0.1:0".parse().unwrap())
        };
        let listener =
            Arc::new(EdgeListener::bind(config, oob, dialer, Arc::new(SessionStore::new())).await?);
        let addr = listener.local_addr()?;
        let task = tokio::spawn(Arc::clone(&listener).run());
        Ok(Self {
            addr,
            listener,
            task,
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        self.listener.store()
    }
}

impl Drop for EdgeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
