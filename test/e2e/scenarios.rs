//! End-to-end scenarios over the HTTP control transport.
//!
//! - A: a ClientHello relayed through the bridge, completion observed, and
//!   target details reported
//! - B: bridge unreachable, the edge goes direct and the session is still
//!   tracked and reaped
//! - C: an idle session is reaped and its target connection closed once
//!
//! ## Running
//!
//! ```bash
//! cargo test -p veil-e2e --test scenarios
//! ```

mod harness;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use harness::{dead_url, dialer_for, init, remote_oob, BridgeServer, EdgeHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use veil_id::SessionId;
use veil_proxy::handoff::{Strategy, DEFAULT_ORDER};
use veil_proxy::oob::{OobChannel, OobError};
use veil_proxy::reaper::{ReaperConfig, SessionReaper};
use veil_testing::target::{read_record, ScriptedTarget, TargetScript};
use veil_testing::tls;

fn origin_script() -> TargetScript {
    TargetScript {
        after_client_finished: vec![tls::new_session_ticket()],
        ..TargetScript::with_flight(vec![
            tls::ServerHelloBuilder::tls13().build(),
            tls::application_data(64),
        ])
    }
}

#[tokio::test]
async fn scenario_a_handshake_over_control_channel() {
    init();
    let origin = ScriptedTarget::spawn(origin_script()).await.unwrap();
    let bridge = BridgeServer::spawn(dialer_for(&[("example.com", origin.addr)]))
        .await
        .unwrap();
    let oob = bridge.oob();

    let id = SessionId::new();
    let hello = tls::ClientHelloBuilder::new()
        .sni("example.com")
        .total_len(200)
        .build();
    assert_eq!(hello.len(), 200);
    oob.initiate_handshake(id, "example.com", &hello).await.unwrap();

    let first = oob
        .next_server_message(id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(first.data, tls::ServerHelloBuilder::tls13().build());
    assert!(!first.handshake_complete);
    assert!(matches!(
        oob.target_info(id).await,
        Err(OobError::HandshakeIncomplete(_))
    ));

    let second = oob
        .next_server_message(id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(second.data, tls::application_data(64));

    assert!(oob.send_client_message(id, &tls::finished()).await.unwrap());
    let info = oob.target_info(id).await.unwrap();
    assert!(!info.target_ip.is_empty());
    assert_eq!(info.target_port, origin.addr.port());
    assert_eq!(info.sni, "example.com");
    assert_eq!(info.tls_version, "1.3");

    // Takeover: whatever the origin sends after Finished arrives raw.
    let mut stream = oob.adopt_connection(id).await.unwrap();
    assert_eq!(read_record(&mut stream).await.unwrap(), tls::new_session_ticket());
    assert_eq!(read_record(&mut stream).await.unwrap(), tls::finished());

    let ping = tls::application_data(16);
    stream.write_all(&ping).await.unwrap();
    assert_eq!(read_record(&mut stream).await.unwrap(), ping);
    assert_eq!(origin.client_hellos().await, vec![hello]);
}

#[tokio::test]
async fn scenario_a_through_edge() {
    init();
    let origin = ScriptedTarget::spawn(origin_script()).await.unwrap();
    let dialer = dialer_for(&[("example.com", origin.addr)]);
    let bridge = BridgeServer::spawn(dialer.clone()).await.unwrap();
    let edge = EdgeHandle::spawn(
        Arc::new(bridge.oob()),
        dialer,
        &[Strategy::Takeover, Strategy::Relay],
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(edge.addr).await.unwrap();
    client
        .write_all(&tls::ClientHelloBuilder::new().sni("example.com").build())
        .await
        .unwrap();
    assert_eq!(
        read_record(&mut client).await.unwrap(),
        tls::ServerHelloBuilder::tls13().build()
    );
    assert_eq!(read_record(&mut client).await.unwrap(), tls::application_data(64));
    client.write_all(&tls::finished()).await.unwrap();

    assert_eq!(read_record(&mut client).await.unwrap(), tls::new_session_ticket());
    assert_eq!(read_record(&mut client).await.unwrap(), tls::finished());
    assert_eq!(origin.connection_count(), 1);
    assert_eq!(
        edge.listener
            .stats()
            .handshakes_relayed
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn scenario_b_unreachable_bridge_goes_direct_and_is_reaped() {
    init();
    let origin = ScriptedTarget::spawn(origin_script()).await.unwrap();
    let edge = EdgeHandle::spawn(
        Arc::new(remote_oob(&dead_url().await)),
        dialer_for(&[("example.com", origin.addr)]),
        &DEFAULT_ORDER,
    )
    .await
    .unwrap();

    let reaper = SessionReaper::new(
        "edge",
        edge.store().clone(),
        ReaperConfig {
            interval: Duration::from_millis(100),
            idle_threshold: Duration::from_millis(500),
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper_task = tokio::spawn(async move { reaper.run(shutdown_rx).await });

    let mut client = TcpStream::connect(edge.addr).await.unwrap();
    client
        .write_all(&tls::ClientHelloBuilder::new().sni("example.com").build())
        .await
        .unwrap();
    assert_eq!(
        read_record(&mut client).await.unwrap(),
        tls::ServerHelloBuilder::tls13().build()
    );
    assert_eq!(read_record(&mut client).await.unwrap(), tls::application_data(64));

    // Not concealed, but recorded.
    assert_eq!(origin.client_hellos().await.len(), 1);
    assert_eq!(edge.store().len(), 1);
    assert_eq!(
        edge.listener.stats().direct_fallbacks.load(Ordering::Relaxed),
        1
    );

    // Idle past the threshold: the reaper closes the connection.
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("reaper closes the idle connection")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let stats = edge.store().stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.connections_closed, 1);

    shutdown_tx.send(true).unwrap();
    reaper_task.await.unwrap();
}

#[tokio::test]
async fn scenario_c_idle_session_closed_exactly_once() {
    init();

    // An origin that reports when its connection is closed.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _hello = read_record(&mut socket).await.unwrap();
        socket
            .write_all(&tls::ServerHelloBuilder::tls13().build())
            .await
            .unwrap();
        let mut sink = Vec::new();
        let _ = socket.read_to_end(&mut sink).await;
        let _ = closed_tx.send(());
    });

    let bridge = BridgeServer::spawn(dialer_for(&[("idle.test", origin_addr)]))
        .await
        .unwrap();
    let oob = bridge.oob();
    let id = SessionId::new();
    oob.initiate_handshake(id, "idle.test", &tls::ClientHelloBuilder::new().sni("idle.test").build())
        .await
        .unwrap();
    let first = oob
        .next_server_message(id, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!first.is_empty());

    let store = bridge.bridge.store().clone();
    let reaper = SessionReaper::new(
        "bridge",
        store.clone(),
        ReaperConfig {
            interval: Duration::from_secs(60),
            idle_threshold: Duration::from_millis(200),
        },
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(reaper.sweep().await, 1);

    tokio::time::timeout(Duration::from_secs(2), closed_rx)
        .await
        .expect("origin connection closed")
        .unwrap();
    assert!(matches!(
        oob.next_server_message(id, Duration::ZERO).await,
        Err(OobError::SessionNotFound(_))
    ));

    // Later cleanup finds nothing left to close.
    assert_eq!(reaper.sweep().await, 0);
    oob.close_session(id).await;
    oob.release_connection(id).await;
    let stats = store.stats();
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.removed, 1);
}
