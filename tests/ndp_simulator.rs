//! Node discovery simulations
//!
//! Several discovery services on localhost ports, bootstrapped from one
//! another, exercising verification, bans and convergence.

use sec_p2p::discovery::{Discovery, DiscoveryConfig, DiscoveryEvent};
use sec_p2p::routing::Endpoint;
use sec_p2p::KeyPair;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

fn local_config(timeout: Duration) -> DiscoveryConfig {
    DiscoveryConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        tcp_port: None,
        timeout,
        ..Default::default()
    }
}

async fn start_node() -> (Discovery, Endpoint) {
    let discovery = Discovery::new(KeyPair::generate(), local_config(Duration::from_millis(500)));
    let addr = discovery.bind().await.unwrap();
    (discovery, Endpoint::new(addr.ip(), addr.port(), None))
}

async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check().await
}

// =============================================================================
// Verification
// =============================================================================

#[tokio::test]
async fn test_unresponsive_peer_times_out() {
    let discovery = Discovery::new(KeyPair::generate(), local_config(Duration::from_millis(100)));
    discovery.bind().await.unwrap();

    // Bound but silent
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let endpoint = Endpoint::new(silent_addr.ip(), silent_addr.port(), None);

    let started = Instant::now();
    let err = discovery.add_peer(endpoint).await.unwrap_err();
    assert!(err.is_timeout(), "expected a timeout, got {}", err);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(discovery.peer_count().await, 0);

    discovery.destroy().await;
}

#[tokio::test]
async fn test_ping_is_answered_both_ways() {
    let (a, _) = start_node().await;
    let (b, b_endpoint) = start_node().await;

    a.add_peer(b_endpoint).await.unwrap();
    assert!(a.get_peer(&b.id()).await.is_some());

    // b verifies a in turn after being pinged
    let b_ref = &b;
    let a_id = a.id();
    let verified = eventually(Duration::from_secs(3), || async move {
        b_ref.get_peer(&a_id).await.is_some()
    })
    .await;
    assert!(verified);

    a.destroy().await;
    b.destroy().await;
}

// =============================================================================
// Bans
// =============================================================================

#[tokio::test]
async fn test_ban_removes_peer() {
    let (a, _) = start_node().await;
    let (b, b_endpoint) = start_node().await;
    let (c, c_endpoint) = start_node().await;

    a.add_peer(b_endpoint).await.unwrap();
    a.add_peer(c_endpoint).await.unwrap();
    let before = a.peer_count().await;
    let mut events = a.subscribe();

    a.ban_peer(&b.id(), Duration::from_secs(60)).await;

    let removed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(DiscoveryEvent::PeerRemoved(record)) = events.recv().await {
                return record;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(removed.id, b.id());
    assert!(a.is_banned(&b.id()).await);
    assert_eq!(a.peer_count().await, before - 1);

    // A banned endpoint cannot be re-added
    assert!(a.add_peer(b_endpoint).await.is_err());
    assert!(a.get_peer(&b.id()).await.is_none());

    a.destroy().await;
    b.destroy().await;
    c.destroy().await;
}

// =============================================================================
// Convergence
// =============================================================================

#[tokio::test]
async fn test_six_nodes_converge() {
    const NODES: usize = 6;

    let mut nodes = Vec::new();
    for _ in 0..NODES {
        nodes.push(start_node().await);
    }

    // The first two nodes pair up, the rest bootstrap from the second
    let seed = nodes[1].1;
    nodes[0].0.add_peer(seed).await.unwrap();
    for (node, _) in &nodes[2..] {
        node.bootstrap(seed).await.unwrap();
    }
    for (node, _) in &nodes {
        node.refresh().await;
    }

    for (node, _) in &nodes {
        let converged = eventually(Duration::from_secs(10), || async move {
            node.peer_count().await == NODES - 1
        })
        .await;
        assert!(
            converged,
            "{} knows {} peers",
            node.id(),
            node.peer_count().await
        );
    }

    for (node, _) in &nodes {
        node.destroy().await;
    }
}

#[tokio::test]
async fn test_destroyed_node_stops_answering() {
    let (a, _) = start_node().await;
    let (b, b_endpoint) = start_node().await;
    let mut events = b.subscribe();

    b.destroy().await;
    assert!(matches!(events.recv().await.unwrap(), DiscoveryEvent::Closed));

    let err = a.add_peer(b_endpoint).await.unwrap_err();
    assert!(err.is_timeout());

    a.destroy().await;
}
