//! Helpers for loopback overlay tests

#![allow(dead_code)]

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use xor_overlay::{NetworkConfig, PeerId, PeerNetwork};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Loopback node with a fixed id and an OS-assigned port
pub fn config(id: u128) -> NetworkConfig {
    NetworkConfig {
        local_address: "127.0.0.1".to_string(),
        local_port: 0,
        local_id: Some(PeerId::from_u128(id)),
        lookup_count: 8,
        lookup_delay: Duration::from_millis(1),
        prefer_ipv4: true,
        ..Default::default()
    }
}

pub fn node(id: u128) -> PeerNetwork {
    PeerNetwork::with_config(config(id))
}

/// Collect delivered messages
pub fn record(network: &PeerNetwork) -> mpsc::UnboundedReceiver<(PeerId, Bytes)> {
    let (tx, rx) = mpsc::unbounded_channel();
    network.set_message_handler(move |source: PeerId, payload: Bytes| {
        let _ = tx.send((source, payload));
    });
    rx
}

pub async fn recv(rx: &mut mpsc::UnboundedReceiver<(PeerId, Bytes)>) -> Option<(PeerId, Bytes)> {
    tokio::time::timeout(TIMEOUT, rx.recv()).await.ok().flatten()
}

/// Poll `check` until it holds or `TIMEOUT` passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn handshaken(network: &PeerNetwork) -> usize {
    network
        .peers()
        .iter()
        .filter(|peer| peer.state == xor_overlay::peer::PeerState::Connected)
        .count()
}

/// A loopback port with nothing listening on it
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
