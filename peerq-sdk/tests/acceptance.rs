//! Acceptance tests: full clients against the in-process signaling
//! server and the loopback RTC engine.
//!
//! Covers the end-to-end flows: join + relay, P2P file transfer,
//! full-state catch-up on room join, match supersession, reconnect
//! resync, outbound queue bounding, and the encrypted 1:1 room.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use common::TestHarness;
use peerq_sdk::client::{Client, ClientEvent, ClientEventKind};
use peerq_sdk::e2e::{E2eEvent, E2eEventKind, E2eRoom, E2eState};
use peerq_sdk::error::Error;
use peerq_sdk::room::DirectRoom;
use peerq_sdk::rtc::PeerConnectionState;
use peerq_sdk::sync::{SyncConfig, SyncRoom};
use peerq_sdk::transfer::{
    Direction, FileTransfer, MemorySource, OutgoingFile, TransferEvent, TransferEventKind,
};

const WAIT: Duration = Duration::from_millis(50);

async fn settle() {
    tokio::time::sleep(WAIT).await;
}

/// Drive the two clients into a connected P2P session.
async fn establish_p2p(a: &Client, b_fp: &str) {
    let peer = a.connect_peer(b_fp, "").await.expect("connect_peer failed");
    for _ in 0..40 {
        if peer.connection_state() == PeerConnectionState::Connected {
            return;
        }
        settle().await;
    }
    panic!("P2P session did not connect");
}

// ═══════════════════════════════════════════════════════════════════
// Scenario: two clients join a namespace and relay through the server
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn two_clients_join_and_relay() {
    let harness = TestHarness::new();
    let (a, a_fp) = harness.online_client("alice").await;
    let (b, b_fp) = harness.online_client("bob").await;

    a.join("ns").await.unwrap();
    let peers = b.join("ns").await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].fingerprint, a_fp);

    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
    b.events().on(ClientEventKind::Relay, move |ev| {
        if let ClientEvent::Relay { from, payload } = ev {
            let _ = relay_tx.send((from.clone(), payload.clone()));
        }
        Ok(())
    });

    a.relay(&b_fp, json!({"hello": "world"})).unwrap();

    let (from, payload) = tokio::time::timeout(Duration::from_secs(1), relay_rx.recv())
        .await
        .expect("relay did not arrive")
        .unwrap();
    assert_eq!(from, a_fp);
    assert_eq!(payload, json!({"hello": "world"}));
}

// ═══════════════════════════════════════════════════════════════════
// Scenario: peer-to-peer file transfer with auto-accept
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn p2p_file_transfer_reassembles_byte_exact() {
    let harness = TestHarness::new();
    let (a, _a_fp) = harness.online_client("alice").await;
    let (b, b_fp) = harness.online_client("bob").await;
    a.join("share").await.unwrap();
    b.join("share").await.unwrap();

    let sender = FileTransfer::new(a.clone());
    let receiver = FileTransfer::new(b.clone());

    establish_p2p(&a, &b_fp).await;
    settle().await;

    // Auto-accept and record the receiver-side event order.
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    {
        let events = receiver.events().clone();
        let receiver = receiver.clone();
        let order = order.clone();
        events.on(TransferEventKind::Incoming, move |ev| {
            if let TransferEvent::Incoming { meta, .. } = ev {
                order.lock().push("incoming".to_string());
                let receiver = receiver.clone();
                let id = meta.id.clone();
                tokio::spawn(async move {
                    receiver.accept(&id).await.expect("accept failed");
                });
            }
            Ok(())
        });
    }
    {
        let order = order.clone();
        receiver
            .events()
            .on(TransferEventKind::Progress, move |ev| {
                if let TransferEvent::Progress {
                    direction: Direction::Receive,
                    chunks,
                    total,
                    percent,
                    ..
                } = ev
                {
                    order
                        .lock()
                        .push(format!("progress {chunks}/{total} {percent:.0}%"));
                }
                Ok(())
            });
    }
    {
        let order = order.clone();
        receiver
            .events()
            .on(TransferEventKind::Complete, move |ev| {
                if let TransferEvent::Complete {
                    direction: Direction::Receive,
                    file,
                    peer,
                    ..
                } = ev
                {
                    order.lock().push("complete".to_string());
                    let _ = done_tx.send((file.clone(), peer.clone()));
                }
                Ok(())
            });
    }

    let pattern: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
    let sent_id = sender
        .send_file(
            &b_fp,
            OutgoingFile {
                source: Arc::new(MemorySource::new(pattern.clone())),
                filename: "pattern.bin".to_string(),
                mime: "application/octet-stream".to_string(),
            },
        )
        .await
        .expect("send failed");
    assert!(!sent_id.is_empty());

    let (file, _peer) = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("transfer did not complete")
        .unwrap();
    let file = file.expect("receive side must carry the blob");
    assert_eq!(file.data.len(), 200);
    assert_eq!(file.data, pattern);

    let order = order.lock().clone();
    assert_eq!(
        order,
        vec!["incoming", "progress 1/1 100%", "complete"],
        "receiver event order"
    );
}

#[tokio::test]
async fn empty_file_transfer_completes_with_empty_blob() {
    let harness = TestHarness::new();
    let (a, _a_fp) = harness.online_client("alice").await;
    let (b, b_fp) = harness.online_client("bob").await;
    a.join("share").await.unwrap();
    b.join("share").await.unwrap();

    let sender = FileTransfer::new(a.clone());
    let receiver = FileTransfer::new(b.clone());
    establish_p2p(&a, &b_fp).await;
    settle().await;

    {
        let events = receiver.events().clone();
        let receiver = receiver.clone();
        events.on(TransferEventKind::Incoming, move |ev| {
            if let TransferEvent::Incoming { meta, .. } = ev {
                assert_eq!(meta.total_chunks, 0);
                let receiver = receiver.clone();
                let id = meta.id.clone();
                tokio::spawn(async move { receiver.accept(&id).await });
            }
            Ok(())
        });
    }
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    receiver
        .events()
        .on(TransferEventKind::Complete, move |ev| {
            if let TransferEvent::Complete { file: Some(file), .. } = ev {
                let _ = done_tx.send(file.data.clone());
            }
            Ok(())
        });

    sender
        .send_file(
            &b_fp,
            OutgoingFile {
                source: Arc::new(MemorySource::new(Vec::new())),
                filename: "empty".to_string(),
                mime: "application/octet-stream".to_string(),
            },
        )
        .await
        .expect("empty send failed");

    let data = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("empty transfer did not complete")
        .unwrap();
    assert!(data.is_empty());
}

// ═══════════════════════════════════════════════════════════════════
// Scenario: replicated state catches a late joiner up
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_state_reaches_late_joiner() {
    let harness = TestHarness::new();
    let (a, _a_fp) = harness.online_client("alice").await;
    let (b, _b_fp) = harness.online_client("bob").await;

    a.join("doc").await.unwrap();
    let doc_a = SyncRoom::new(a.clone(), "doc", SyncConfig::default()).unwrap();
    doc_a.set("x", json!(10)).unwrap();
    doc_a.set("y", json!(20)).unwrap();

    let doc_b = SyncRoom::new(b.clone(), "doc", SyncConfig::default()).unwrap();
    b.join("doc").await.unwrap();

    for _ in 0..40 {
        if doc_b.get_all().len() == 2 {
            break;
        }
        settle().await;
    }
    assert_eq!(doc_b.get("x"), Some(json!(10)));
    assert_eq!(doc_b.get("y"), Some(json!(20)));
}

#[tokio::test]
async fn deletes_propagate_as_tombstones() {
    let harness = TestHarness::new();
    let (a, _a_fp) = harness.online_client("alice").await;
    let (b, _b_fp) = harness.online_client("bob").await;

    a.join("doc").await.unwrap();
    b.join("doc").await.unwrap();
    let doc_a = SyncRoom::new(a.clone(), "doc", SyncConfig::default()).unwrap();
    let doc_b = SyncRoom::new(b.clone(), "doc", SyncConfig::default()).unwrap();

    doc_a.set("k", json!("v")).unwrap();
    settle().await;
    assert_eq!(doc_b.get("k"), Some(json!("v")));

    doc_a.delete("k").unwrap();
    settle().await;
    assert_eq!(doc_b.get("k"), None);
    assert!(doc_b.get_all().is_empty());
}

// ═══════════════════════════════════════════════════════════════════
// Scenario: match supersession
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_match_supersedes_first() {
    let harness = TestHarness::new();
    let (a, _a_fp) = harness.online_client("alice").await;

    // group_size 3 keeps the server silent with only one client waiting.
    let first = {
        let a = a.clone();
        tokio::spawn(async move { a.match_peers("game", json!({}), 3).await })
    };
    settle().await;
    let second = {
        let a = a.clone();
        tokio::spawn(async move { a.match_peers("game", json!({}), 3).await })
    };
    settle().await;

    let err = first.await.unwrap().unwrap_err();
    assert!(
        err.to_string().contains("superseded"),
        "first match should supersede, got: {err}"
    );

    // The second stays pending until cancelled.
    a.cancel_match("game");
    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn match_resolves_when_group_fills() {
    let harness = TestHarness::new();
    let (a, a_fp) = harness.online_client("alice").await;
    let (b, b_fp) = harness.online_client("bob").await;

    let a_match = {
        let a = a.clone();
        tokio::spawn(async move { a.match_peers("duel", json!({}), 2).await })
    };
    settle().await;
    let b_match = {
        let b = b.clone();
        tokio::spawn(async move { b.match_peers("duel", json!({}), 2).await })
    };

    let a_result = a_match.await.unwrap().unwrap();
    let b_result = b_match.await.unwrap().unwrap();
    assert_eq!(a_result.session_id, b_result.session_id);
    assert_eq!(a_result.peers[0].fingerprint, b_fp);
    assert_eq!(b_result.peers[0].fingerprint, a_fp);
}

// ═══════════════════════════════════════════════════════════════════
// Scenario: reconnect re-registers, rejoins, then emits reconnected
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reconnect_restores_registration_and_namespaces() {
    let harness = TestHarness::new();
    let (a, a_fp) = harness.online_client("alice").await;
    a.join("ns1").await.unwrap();
    a.join("ns2").await.unwrap();

    let reconnected = Arc::new(AtomicU32::new(0));
    {
        let reconnected = reconnected.clone();
        a.events().on(ClientEventKind::Reconnected, move |_| {
            reconnected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    harness.server.drop_client(&a_fp);

    for _ in 0..60 {
        if reconnected.load(Ordering::SeqCst) > 0 {
            break;
        }
        settle().await;
    }
    assert_eq!(reconnected.load(Ordering::SeqCst), 1);

    // The same identity key keeps the same fingerprint, and both
    // namespaces were rejoined: a fresh client sees us in each.
    assert_eq!(a.fingerprint().as_deref(), Some(a_fp.as_str()));
    let (probe, _) = harness.online_client("probe").await;
    for ns in ["ns1", "ns2"] {
        let peers = probe.discover(ns, 10).await.unwrap();
        assert!(
            peers.iter().any(|p| p.fingerprint == a_fp),
            "expected {a_fp} in {ns} after reconnect"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════
// Boundary: outbound queue cap
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn outbound_queue_never_exceeds_cap() {
    use peerq_sdk::protocol::{Envelope, MessageType};
    use peerq_sdk::socket::SocketEvent;
    use peerq_sdk::transport::{Transport, TransportConfig, OUTBOUND_QUEUE_LIMIT};

    let (connector, mut accept_rx) = peerq_sdk::loopback::LoopbackConnector::new();
    let transport = Transport::new(
        connector,
        TransportConfig {
            url: "loop://sig".to_string(),
            ..TransportConfig::default()
        },
    );

    // Queue well past the cap while idle, then connect and count what
    // actually reaches the server.
    for i in 0..OUTBOUND_QUEUE_LIMIT + 77 {
        transport
            .send(Envelope::new(MessageType::Relay).with_to(format!("peer-{i}")))
            .unwrap();
    }
    transport.connect().await.unwrap();

    let (_sink, mut stream) = tokio::time::timeout(Duration::from_secs(1), accept_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let mut seen = 0usize;
    loop {
        match tokio::time::timeout(Duration::from_millis(200), stream.recv()).await {
            Ok(Some(SocketEvent::Message(_))) => seen += 1,
            _ => break,
        }
    }
    assert_eq!(seen, OUTBOUND_QUEUE_LIMIT);
}

// ═══════════════════════════════════════════════════════════════════
// Scenario: encrypted 1:1 room
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn e2e_room_handshakes_and_exchanges_encrypted_payloads() {
    let harness = TestHarness::new();
    let (a, _a_fp) = harness.online_client("alice").await;
    let (b, _b_fp) = harness.online_client("bob").await;

    let room_a = DirectRoom::new(a.clone(), "vault");
    let room_b = DirectRoom::new(b.clone(), "vault");
    room_a.create().await.unwrap();
    room_b.join().await.unwrap();

    let secure_a = E2eRoom::new(room_a);
    let secure_b = E2eRoom::new(room_b);

    let (data_tx, mut data_rx) = mpsc::unbounded_channel::<Value>();
    secure_b.events().on(E2eEventKind::Data, move |ev| {
        if let E2eEvent::Data(value) = ev {
            let _ = data_tx.send(value.clone());
        }
        Ok(())
    });

    for _ in 0..60 {
        if secure_a.state() == E2eState::Ready && secure_b.state() == E2eState::Ready {
            break;
        }
        settle().await;
    }
    assert_eq!(secure_a.state(), E2eState::Ready);
    assert_eq!(secure_b.state(), E2eState::Ready);

    secure_a
        .send(json!({"note": "for your eyes only"}))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
        .await
        .expect("encrypted payload did not arrive")
        .unwrap();
    assert_eq!(received, json!({"note": "for your eyes only"}));

    // The bytes on the room channel were marked encrypted, not plain.
    // (A plaintext fallback would have carried `_plain`.)
    secure_a.close().await;
}
