//! Scripted TCP targets.
//!
//! A [`ScriptedTarget`] stands in for a TLS origin server. When a connection
//! opens with a ClientHello record it answers with the scripted flight, then
//! echoes every later byte back. Connections that open with anything else
//! are echoed from the first byte, which is what a direct-to-target handoff
//! looks like from the origin's side.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};

/// Reads exactly one TLS record (header plus declared body).
pub async fn read_record<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut record = header.to_vec();
    record.resize(5 + len, 0);
    stream.read_exact(&mut record[5..]).await?;
    Ok(record)
}

/// What the target sends back after a ClientHello.
#[derive(Debug, Clone, Default)]
pub struct TargetScript {
    /// Written in order, one `write_all` each, right after the ClientHello.
    pub flight: Vec<Vec<u8>>,
    /// Pause between flight writes.
    pub flight_gap: Duration,
    /// Written after the first post-handshake client bytes arrive, before
    /// echoing them (session tickets, for instance).
    pub after_client_finished: Vec<Vec<u8>>,
}

impl TargetScript {
    pub fn with_flight(flight: Vec<Vec<u8>>) -> Self {
        Self {
            flight,
            ..Self::default()
        }
    }
}

#[allow(dead_code)]
pub struct ScriptedTarget {
    pub addr: SocketAddr,
    connections: Arc<AtomicU64>,
    hellos: Arc<Mutex<Vec<Vec<u8>>>>,
    received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ScriptedTarget {
    pub async fn spawn(script: TargetScript) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let hellos = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_count = Arc::clone(&connections);
        let hello_log = Arc::clone(&hellos);
        let received_log = Arc::clone(&received);
        let script = Arc::new(script);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        conn_count.fetch_add(1, Ordering::Relaxed);
                        let script = Arc::clone(&script);
                        let hello_log = Arc::clone(&hello_log);
                        let received_log = Arc::clone(&received_log);
                        tokio::spawn(async move {
                            let _ = serve(stream, script, hello_log, received_log).await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            hellos,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// ClientHello records seen, in arrival order.
    pub async fn client_hellos(&self) -> Vec<Vec<u8>> {
        self.hellos.lock().await.clone()
    }

    /// Every byte received after the ClientHello, across all connections.
    pub async fn received(&self) -> Vec<u8> {
        self.received.lock().await.clone()
    }
}

impl Drop for ScriptedTarget {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve(
    mut stream: tokio::net::TcpStream,
    script: Arc<TargetScript>,
    hellos: Arc<Mutex<Vec<Vec<u8>>>>,
    received: Arc<Mutex<Vec<u8>>>,
) -> io::Result<()> {
    let mut first = [0u8; 1];
    stream.peek(&mut first).await?;

    let mut after_finished = Vec::new();
    if first[0] == 0x16 {
        let hello = read_record(&mut stream).await?;
        hellos.lock().await.push(hello);
        for chunk in &script.flight {
            stream.write_all(chunk).await?;
            stream.flush().await?;
            if !script.flight_gap.is_zero() {
                tokio::time::sleep(script.flight_gap).await;
            }
        }
        after_finished = script.after_client_finished.clone();
    }

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        received.lock().await.extend_from_slice(&buf[..n]);
        for chunk in after_finished.drain(..) {
            stream.write_all(&chunk).await?;
        }
        stream.write_all(&buf[..n]).await?;
    }
}
