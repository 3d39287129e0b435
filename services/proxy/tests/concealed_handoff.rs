mod harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{
    client_handshake, dialer_for, eventually, origin_script, ping_until_echo, BridgeServer,
    ProxyHandle, ORIGIN,
};
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use veil_proxy::handoff::{Strategy, DEFAULT_ORDER};
use veil_proxy::oob::{RemoteOob, RemoteOobConfig};
use veil_testing::target::ScriptedTarget;
use veil_testing::tls;

#[rstest]
#[case::direct(Strategy::Direct, 2)]
#[case::takeover(Strategy::Takeover, 1)]
#[case::relay(Strategy::Relay, 1)]
#[tokio::test]
async fn handshake_is_relayed_then_handed_off(
    #[case] strategy: Strategy,
    #[case] origin_connections: u64,
) {
    let origin = ScriptedTarget::spawn(origin_script()).await.unwrap();
    let proxy = ProxyHandle::combined(dialer_for(&[(ORIGIN, origin.addr)]), &[strategy])
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client_handshake(&mut client, Some(ORIGIN)).await.unwrap();
    let seen = ping_until_echo(&mut client).await.unwrap();

    let hello = tls::ClientHelloBuilder::new().sni(ORIGIN).build();
    assert_eq!(origin.client_hellos().await, vec![hello]);
    assert_eq!(origin.connection_count(), origin_connections);
    if strategy != Strategy::Direct {
        // The ticket written after Finished reaches the client on the
        // connection that carried the handshake.
        assert!(seen.contains(&tls::new_session_ticket()));
    }

    let stats = proxy.listener.stats();
    assert_eq!(stats.sni_found.load(Ordering::Relaxed), 1);
    assert_eq!(stats.handshakes_relayed.load(Ordering::Relaxed), 1);
    assert_eq!(stats.direct_fallbacks.load(Ordering::Relaxed), 0);
    assert_eq!(proxy.edge_store().len(), 1);

    drop(client);
    let store = proxy.edge_store().clone();
    assert!(eventually(Duration::from_secs(2), || store.is_empty()).await);
}

#[tokio::test]
async fn default_order_prefers_direct_for_tls13() {
    let origin = ScriptedTarget::spawn(origin_script()).await.unwrap();
    let proxy = ProxyHandle::combined(dialer_for(&[(ORIGIN, origin.addr)]), &DEFAULT_ORDER)
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client_handshake(&mut client, Some(ORIGIN)).await.unwrap();
    ping_until_echo(&mut client).await.unwrap();

    assert_eq!(origin.connection_count(), 2);
    // The bridge let go of its target connection once the edge went direct.
    let bridge = proxy.bridge.clone().unwrap();
    let bridge_store = bridge.store().clone();
    assert!(eventually(Duration::from_secs(2), || bridge_store.is_empty()).await);
}

#[tokio::test]
async fn connect_preamble_supplies_missing_sni() {
    let origin = ScriptedTarget::spawn(origin_script()).await.unwrap();
    let proxy = ProxyHandle::combined(dialer_for(&[(ORIGIN, origin.addr)]), &[Strategy::Takeover])
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT origin.test:443 HTTP/1.1\r\nHost: origin.test:443\r\n\r\n")
        .await
        .unwrap();
    let mut reply = [0u8; 39];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

    client_handshake(&mut client, None).await.unwrap();
    ping_until_echo(&mut client).await.unwrap();

    let stats = proxy.listener.stats();
    assert_eq!(stats.sni_missing.load(Ordering::Relaxed), 1);
    assert_eq!(stats.handshakes_relayed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn remote_bridge_relays_and_tunnels() {
    let origin = ScriptedTarget::spawn(origin_script()).await.unwrap();
    let dialer = dialer_for(&[(ORIGIN, origin.addr)]);
    let bridge = BridgeServer::spawn(dialer.clone()).await.unwrap();
    let oob = RemoteOob::new(RemoteOobConfig {
        base_url: bridge.base_url.clone(),
        ..RemoteOobConfig::default()
    })
    .unwrap();
    let proxy = ProxyHandle::edge(
        std::sync::Arc::new(oob),
        dialer,
        &[Strategy::Takeover, Strategy::Relay],
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client_handshake(&mut client, Some(ORIGIN)).await.unwrap();
    let seen = ping_until_echo(&mut client).await.unwrap();
    assert!(seen.contains(&tls::new_session_ticket()));
    assert_eq!(origin.connection_count(), 1);

    // The upgraded control connection now carries the session.
    assert_eq!(bridge.bridge.store().len(), 1);
    drop(client);
    let bridge_store = bridge.bridge.store().clone();
    assert!(eventually(Duration::from_secs(2), || bridge_store.is_empty()).await);
}
