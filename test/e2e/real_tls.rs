//! A real TLS 1.3 session through the edge.
//!
//! The origin is a rustls server with a self-signed certificate; the client
//! is a rustls client that trusts it. Neither knows about the proxy, so a
//! handoff that drops or reorders a single record fails the handshake or
//! the first read.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p veil-e2e --test real_tls
//! ```

mod harness;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harness::{dialer_for, in_process_oob, init, BridgeServer, EdgeHandle};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use veil_proxy::handoff::Strategy;

const SERVER_NAME: &str = "secure.test";

/// rustls server answering every read with `pong:` and the bytes read.
struct TlsOrigin {
    addr: SocketAddr,
    cert_der: Vec<u8>,
    connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsOrigin {
    async fn spawn() -> io::Result<Self> {
        init();

        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .map_err(io::Error::other)?;
        let cert_der = cert.cert.der().to_vec();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(vec![CertificateDer::from(cert_der.clone())], key)
            .map_err(io::Error::other)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let accepted = Arc::clone(&connections);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        accepted.fetch_add(1, Ordering::Relaxed);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let Ok(mut tls) = acceptor.accept(stream).await else {
                                return;
                            };
                            let mut buf = vec![0u8; 4096];
                            loop {
                                let n = match tls.read(&mut buf).await {
                                    Ok(0) | Err(_) => return,
                                    Ok(n) => n,
                                };
                                let mut reply = b"pong:".to_vec();
                                reply.extend_from_slice(&buf[..n]);
                                if tls.write_all(&reply).await.is_err() {
                                    return;
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_der,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for TlsOrigin {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn tls_client(
    proxy: SocketAddr,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(proxy).await?;
    let server_name = ServerName::try_from(SERVER_NAME.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    connector.connect(server_name, stream).await
}

async fn exchange(
    stream: &mut tokio_rustls::client::TlsStream<TcpStream>,
    message: &[u8],
) -> io::Result<Vec<u8>> {
    stream.write_all(message).await?;
    let mut reply = vec![0u8; message.len() + 5];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply"))??;
    Ok(reply)
}

async fn assert_session_works(proxy: SocketAddr, origin: &TlsOrigin) {
    let mut client = timeout(Duration::from_secs(10), tls_client(proxy, &origin.cert_der))
        .await
        .expect("handshake within deadline")
        .expect("TLS handshake through the edge");

    let (_, connection) = client.get_ref();
    assert_eq!(
        connection.protocol_version(),
        Some(rustls::ProtocolVersion::TLSv1_3)
    );

    assert_eq!(exchange(&mut client, b"ping").await.unwrap(), b"pong:ping");
    assert_eq!(
        exchange(&mut client, b"second message").await.unwrap(),
        b"pong:second message"
    );
    assert_eq!(origin.connections.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn takeover_carries_a_real_session() {
    let origin = TlsOrigin::spawn().await.unwrap();
    let dialer = dialer_for(&[(SERVER_NAME, origin.addr)]);
    let (bridge, oob) = in_process_oob(dialer.clone());
    let edge = EdgeHandle::spawn(oob, dialer, &[Strategy::Takeover])
        .await
        .unwrap();

    assert_session_works(edge.addr, &origin).await;

    let stats = edge.listener.stats();
    assert_eq!(stats.handshakes_relayed.load(Ordering::Relaxed), 1);
    assert_eq!(stats.handoffs_failed.load(Ordering::Relaxed), 0);
    assert_eq!(bridge.store().len(), 1);
}

#[tokio::test]
async fn relay_tunnel_carries_a_real_session() {
    let origin = TlsOrigin::spawn().await.unwrap();
    let dialer = dialer_for(&[(SERVER_NAME, origin.addr)]);
    let (_bridge, oob) = in_process_oob(dialer.clone());
    let edge = EdgeHandle::spawn(oob, dialer, &[Strategy::Relay])
        .await
        .unwrap();

    assert_session_works(edge.addr, &origin).await;
    assert_eq!(
        edge.listener
            .stats()
            .handshakes_relayed
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn remote_bridge_carries_a_real_session() {
    let origin = TlsOrigin::spawn().await.unwrap();
    let dialer = dialer_for(&[(SERVER_NAME, origin.addr)]);
    let bridge = BridgeServer::spawn(dialer.clone()).await.unwrap();
    let edge = EdgeHandle::spawn(
        Arc::new(bridge.oob()),
        dialer,
        &[Strategy::Takeover, Strategy::Relay],
    )
    .await
    .unwrap();

    assert_session_works(edge.addr, &origin).await;
    assert_eq!(
        edge.listener
            .stats()
            .direct_fallbacks
            .load(Ordering::Relaxed),
        0
    );
}
