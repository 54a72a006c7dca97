//! SEC envelope simulations
//!
//! Two transport managers with a live session, exchanging status and
//! messages through their SEC envelopes.

use bytes::Bytes;
use rlp::RlpStream;
use sec_p2p::rlpx::{Capability, DisconnectReason, Peer, Rlpx, RlpxConfig, RlpxEvent};
use sec_p2p::sec::{self, MessageCode, ProtocolError, Sec, SecEvent, Status};
use sec_p2p::KeyPair;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

struct Pair {
    a: Rlpx,
    b: Rlpx,
    /// `b` as seen from `a`
    peer_on_a: Peer,
    /// `a` as seen from `b`
    peer_on_b: Peer,
    a_events: broadcast::Receiver<RlpxEvent>,
    b_events: broadcast::Receiver<RlpxEvent>,
}

impl Pair {
    async fn connect(capabilities: Vec<Capability>) -> Self {
        let config = RlpxConfig {
            capabilities,
            ..Default::default()
        };
        let a = Rlpx::new(KeyPair::generate(), config.clone(), None);
        let b = Rlpx::new(KeyPair::generate(), config, None);
        let a_addr = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        b.connect(a.id(), a_addr).await.unwrap();
        let peer_on_b = added(&mut b_events).await;
        let peer_on_a = added(&mut a_events).await;

        Self {
            a,
            b,
            peer_on_a,
            peer_on_b,
            a_events,
            b_events,
        }
    }

    fn sec_a(&self) -> &Sec {
        self.peer_on_a.sec().unwrap()
    }

    fn sec_b(&self) -> &Sec {
        self.peer_on_b.sec().unwrap()
    }

    async fn destroy(self) {
        self.a.destroy().await;
        self.b.destroy().await;
    }
}

async fn added(events: &mut broadcast::Receiver<RlpxEvent>) -> Peer {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(RlpxEvent::PeerAdded(peer)) = events.recv().await {
                return peer;
            }
        }
    })
    .await
    .expect("no peer added in time")
}

async fn next_sec_event(events: &mut broadcast::Receiver<SecEvent>) -> Option<SecEvent> {
    tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .ok()
        .and_then(Result::ok)
}

async fn peer_error(events: &mut broadcast::Receiver<RlpxEvent>) -> String {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(RlpxEvent::PeerError { error, .. }) = events.recv().await {
                return error;
            }
        }
    })
    .await
    .expect("no peer error in time")
}

/// Wait until `sec` has received a STATUS
async fn status_received(sec: &Sec) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while sec.message_count(MessageCode::Status) == 0 {
        assert!(Instant::now() < deadline, "no STATUS received");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn status(network_id: u64, genesis_hash: [u8; 32]) -> Status {
    Status {
        network_id,
        total_difficulty: vec![0x04, 0x00, 0x00, 0x00, 0x00],
        best_hash: [0xd4; 32],
        genesis_hash,
        chain_id: 1,
    }
}

fn empty_list() -> Bytes {
    Bytes::from_static(&[0xc0])
}

// =============================================================================
// Status handshake
// =============================================================================

#[tokio::test]
async fn test_status_exchange() {
    let pair = Pair::connect(sec::capabilities()).await;
    let mut a_sec_events = pair.sec_a().subscribe();
    let mut b_sec_events = pair.sec_b().subscribe();
    let local = status(1, [0xd4; 32]);

    pair.sec_a().send_status(local.clone()).unwrap();
    pair.sec_b().send_status(local.clone()).unwrap();

    for events in [&mut a_sec_events, &mut b_sec_events] {
        match next_sec_event(events).await {
            Some(SecEvent::Status(remote)) => assert_eq!(remote, local),
            other => panic!("expected a status, got {:?}", other),
        }
        // Exactly one notification per side
        let extra = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(extra.is_err());
    }

    pair.destroy().await;
}

#[tokio::test]
async fn test_network_id_mismatch() {
    let mut pair = Pair::connect(sec::capabilities()).await;

    pair.sec_b().send_status(status(2, [0xd4; 32])).unwrap();
    status_received(pair.sec_a()).await;

    let err = pair.sec_a().send_status(status(1, [0xd4; 32])).unwrap_err();
    assert_eq!(err.to_string(), "NetworkId mismatch: 1 / 2");
    assert_eq!(peer_error(&mut pair.a_events).await, "NetworkId mismatch: 1 / 2");

    // The failing side disconnects with PROTOCOL_ERROR
    let reason = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(RlpxEvent::PeerRemoved { reason, .. }) = pair.b_events.recv().await {
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reason, DisconnectReason::ProtocolError);

    pair.destroy().await;
}

#[tokio::test]
async fn test_genesis_mismatch() {
    let mut pair = Pair::connect(sec::capabilities()).await;

    pair.sec_a().send_status(status(1, [0xd4; 32])).unwrap();
    pair.sec_b().send_status(status(1, [0u8; 32])).unwrap();

    // `a` already holds its own status when the remote one arrives
    let error = peer_error(&mut pair.a_events).await;
    assert_eq!(
        error,
        format!("Genesis block mismatch: {} / {}", "d4".repeat(32), "00".repeat(32))
    );

    pair.destroy().await;
}

#[tokio::test]
async fn test_status_timeout_disconnects() {
    let capabilities = sec::capabilities();
    let config = RlpxConfig {
        capabilities,
        status_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let a = Rlpx::new(KeyPair::generate(), config.clone(), None);
    let b = Rlpx::new(KeyPair::generate(), config, None);
    let a_addr = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mut b_events = b.subscribe();

    b.connect(a.id(), a_addr).await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(RlpxEvent::PeerRemoved { reason, .. }) = b_events.recv().await {
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reason, DisconnectReason::Timeout);

    a.destroy().await;
    b.destroy().await;
}

// =============================================================================
// Messages
// =============================================================================

#[tokio::test]
async fn test_send_message_validation() {
    let pair = Pair::connect(vec![Capability::new(sec::PROTOCOL_NAME, 1, 8)]).await;
    let sec = pair.sec_a();
    assert_eq!(sec.version(), 1);

    let err = sec.send_message(0x00, empty_list()).unwrap_err();
    assert_eq!(err, ProtocolError::StatusViaSendMessage);

    let err = sec.send_message(0x08, empty_list()).unwrap_err();
    assert_eq!(err.to_string(), "Code 8 not allowed with version 1");

    let err = sec.send_message(0x42, empty_list()).unwrap_err();
    assert_eq!(err.to_string(), "Unknown code 66");

    // None of the rejected messages reached the remote
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pair.sec_b().message_count(MessageCode::Status), 0);
    assert_eq!(pair.sec_b().message_count(MessageCode::GetNodeData), 0);

    pair.destroy().await;
}

#[tokio::test]
async fn test_message_delivery() {
    let pair = Pair::connect(sec::capabilities()).await;
    let mut b_sec_events = pair.sec_b().subscribe();

    let local = status(1, [0xd4; 32]);
    pair.sec_a().send_status(local.clone()).unwrap();
    pair.sec_b().send_status(local).unwrap();
    assert!(matches!(
        next_sec_event(&mut b_sec_events).await,
        Some(SecEvent::Status(_))
    ));

    let mut stream = RlpStream::new_list(2);
    stream.append(&1u64);
    stream.append(&b"transaction".to_vec());
    let payload = Bytes::from(stream.out().to_vec());

    pair.sec_a().send_message(MessageCode::Tx.code(), payload.clone()).unwrap();
    pair.sec_a()
        .send_message(MessageCode::GetNodeData.code(), empty_list())
        .unwrap();

    match next_sec_event(&mut b_sec_events).await {
        Some(SecEvent::Message { code, payload: received }) => {
            assert_eq!(code, MessageCode::Tx);
            assert_eq!(received, payload);
        }
        other => panic!("expected TX, got {:?}", other),
    }
    match next_sec_event(&mut b_sec_events).await {
        Some(SecEvent::Message { code, .. }) => assert_eq!(code, MessageCode::GetNodeData),
        other => panic!("expected GET_NODE_DATA, got {:?}", other),
    }
    assert_eq!(pair.sec_b().message_count(MessageCode::Tx), 1);

    pair.destroy().await;
}
