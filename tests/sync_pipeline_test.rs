//! Sync pipeline integration tests
//!
//! Drives the sync engine and coordinator directly, with no transport
//! underneath: a test harness feeds `TransportEvent`s and inspects the
//! `TransportCommand`s coming back. Covers:
//! - merge idempotence and commutativity under reordering
//! - vote last-writer-wins and toggle suppression
//! - broadcast dedup, offline queuing, delta sync
//! - the signature gate end-to-end

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use agora_node::content::identity::Keystore;
use agora_node::content::{now_ms, Post, RecordBatch, TargetType, Vote, ANONYMOUS};
use agora_node::events::{DomainEvent, EventBus};
use agora_node::p2p::LocalBus;
use agora_node::store::ContentStore;
use agora_node::sync::coordinator::AppCommand;
use agora_node::sync::engine::SyncEngine;
use agora_node::sync::queue::OfflineQueue;
use agora_node::sync::{SyncCoordinator, TransportCommand, TransportEvent, WireMessage};

fn post(id: &str, created_at: u64) -> Post {
    Post {
        id: id.into(),
        title: format!("title {}", id),
        body: "body".into(),
        author: ANONYMOUS.into(),
        author_display_name: String::new(),
        community_id: "c-1".into(),
        created_at,
        content_hash: String::new(),
        signature: String::new(),
    }
}

fn vote(target: &str, voter: &str, value: i32, created_at: u64) -> Vote {
    Vote {
        id: format!("v-{}-{}", voter, created_at),
        target_id: target.into(),
        target_type: TargetType::Post,
        voter: voter.into(),
        value,
        created_at,
        signature: String::new(),
    }
}

fn make_engine() -> SyncEngine {
    let store = Arc::new(Mutex::new(ContentStore::open_in_memory().unwrap()));
    SyncEngine::new(store, EventBus::default(), Duration::from_secs(30))
}

struct Harness {
    coordinator: SyncCoordinator,
    commands_tx: mpsc::Sender<TransportCommand>,
    commands_rx: mpsc::Receiver<TransportCommand>,
    events: EventBus,
}

impl Harness {
    fn new(peer_id: &str) -> Self {
        let events = EventBus::default();
        let store = Arc::new(Mutex::new(ContentStore::open_in_memory().unwrap()));
        let engine = SyncEngine::new(store, events.clone(), Duration::from_secs(30));
        let coordinator = SyncCoordinator::new(
            peer_id.to_string(),
            engine,
            OfflineQueue::default(),
            events.clone(),
            LocalBus::default(),
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        let (commands_tx, commands_rx) = mpsc::channel(64);
        Self {
            coordinator,
            commands_tx,
            commands_rx,
            events,
        }
    }

    async fn feed(&mut self, event: TransportEvent) {
        let tx = self.commands_tx.clone();
        self.coordinator.handle_transport_event(event, &tx).await;
    }

    async fn publish(&mut self, message: WireMessage) {
        let tx = self.commands_tx.clone();
        self.coordinator
            .handle_app_command(AppCommand::Publish { message }, &tx)
            .await;
    }

    fn drain_commands(&mut self) -> Vec<TransportCommand> {
        let mut out = Vec::new();
        while let Ok(command) = self.commands_rx.try_recv() {
            out.push(command);
        }
        out
    }
}

// =============================================================================
// Merge semantics: idempotence and commutativity
// =============================================================================

#[tokio::test]
async fn test_sync_response_idempotent() {
    let engine = make_engine();
    let batch = RecordBatch {
        posts: vec![post("p1", 100), post("p2", 200)],
        votes: vec![vote("p1", "alice", 1, 150)],
        ..Default::default()
    };

    let first = engine.apply_batch(batch.clone()).await.unwrap();
    assert_eq!(first.merged(), 3);

    for _ in 0..4 {
        let again = engine.apply_batch(batch.clone()).await.unwrap();
        assert_eq!(again.merged(), 0, "reapplication must change nothing");
    }

    let snapshot = engine.build_sync_response(None).await.unwrap();
    assert_eq!(snapshot.len(), 3);
}

#[tokio::test]
async fn test_merge_commutes_under_reordering() {
    let batch_ab = RecordBatch {
        posts: vec![post("a", 100), post("b", 200)],
        ..Default::default()
    };
    let batch_c = RecordBatch {
        posts: vec![post("c", 300)],
        votes: vec![vote("a", "alice", 1, 400)],
        ..Default::default()
    };

    // [A,B] then [C]
    let one = make_engine();
    one.apply_batch(batch_ab.clone()).await.unwrap();
    one.apply_batch(batch_c.clone()).await.unwrap();

    // [C] then [A,B] then [A,B] again
    let two = make_engine();
    two.apply_batch(batch_c.clone()).await.unwrap();
    two.apply_batch(batch_ab.clone()).await.unwrap();
    two.apply_batch(batch_ab).await.unwrap();

    let left = one.build_sync_response(None).await.unwrap();
    let right = two.build_sync_response(None).await.unwrap();
    assert_eq!(left, right, "merge order must not matter");
}

// =============================================================================
// Vote conflict resolution
// =============================================================================

#[tokio::test]
async fn test_vote_lww_converges_either_order() {
    let v1 = vote("p1", "alice", 1, 100);
    let v2 = vote("p1", "alice", -1, 200);

    for (first, second) in [(v1.clone(), v2.clone()), (v2, v1)] {
        let engine = make_engine();
        engine
            .apply_batch(RecordBatch {
                votes: vec![first],
                ..Default::default()
            })
            .await
            .unwrap();
        engine
            .apply_batch(RecordBatch {
                votes: vec![second],
                ..Default::default()
            })
            .await
            .unwrap();

        let snapshot = engine.build_sync_response(None).await.unwrap();
        assert_eq!(snapshot.votes.len(), 1);
        assert_eq!(snapshot.votes[0].value, -1, "newest vote wins regardless of order");
        assert_eq!(snapshot.votes[0].created_at, 200);
    }
}

#[tokio::test]
async fn test_vote_toggle_resubmission_suppressed() {
    let engine = make_engine();
    engine
        .apply_batch(RecordBatch {
            votes: vec![vote("p1", "alice", 1, 100)],
            ..Default::default()
        })
        .await
        .unwrap();

    // Same direction again, later timestamp
    let stats = engine
        .apply_batch(RecordBatch {
            votes: vec![vote("p1", "alice", 1, 999)],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stats.merged(), 0);

    let snapshot = engine.build_sync_response(None).await.unwrap();
    assert_eq!(snapshot.votes.len(), 1, "no second record");
    assert_eq!(snapshot.votes[0].created_at, 100, "created_at untouched");
}

// =============================================================================
// Validator and signature gate, end to end
// =============================================================================

#[tokio::test]
async fn test_bounds_and_timestamp_rejection() {
    let engine = make_engine();
    let now = now_ms();

    let mut far_future = post("p-future", now + 60 * 60 * 1000);
    far_future.title = "from the future".into();
    let near_future = post("p-soon", now + 60 * 1000);

    let mut oversized = post("p-big", now);
    oversized.body = "x".repeat(40_001);
    let mut at_limit = post("p-limit", now);
    at_limit.body = "x".repeat(40_000);

    let stats = engine
        .apply_batch(RecordBatch {
            posts: vec![far_future, near_future, oversized, at_limit],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stats.merged(), 2);

    let snapshot = engine.build_sync_response(None).await.unwrap();
    let ids: Vec<&str> = snapshot.posts.iter().map(|p| p.id.as_str()).collect();
    assert!(ids.contains(&"p-soon"));
    assert!(ids.contains(&"p-limit"));
    assert!(!ids.contains(&"p-future"));
    assert!(!ids.contains(&"p-big"));
}

#[tokio::test]
async fn test_signature_gate_via_inbound_broadcast() {
    let mut harness = Harness::new("local");
    harness
        .feed(TransportEvent::PeerDiscovered {
            peer_id: "remote".into(),
        })
        .await;
    harness
        .feed(TransportEvent::ConnectionEstablished {
            peer_id: "remote".into(),
        })
        .await;
    harness.drain_commands();

    let keystore = Keystore::generate();

    // Forged: claims a real identity with a garbage signature
    let mut forged = post("p-forged", now_ms());
    forged.author = keystore.address();
    forged.signature = "deadbeef".into();
    harness
        .feed(TransportEvent::InboundRequest {
            peer_id: "remote".into(),
            request: WireMessage::NewPost { data: forged },
            channel: 1,
        })
        .await;

    // Genuine: properly stamped by the key owner
    let mut genuine = post("p-genuine", now_ms());
    keystore.stamp_post(&mut genuine).unwrap();
    harness
        .feed(TransportEvent::InboundRequest {
            peer_id: "remote".into(),
            request: WireMessage::NewPost { data: genuine },
            channel: 2,
        })
        .await;

    // Ask the coordinator for a full sync of what it kept
    harness
        .feed(TransportEvent::InboundRequest {
            peer_id: "remote".into(),
            request: WireMessage::SyncRequest { since: None },
            channel: 3,
        })
        .await;

    let commands = harness.drain_commands();
    let sync_data = commands
        .iter()
        .find_map(|c| match c {
            TransportCommand::SendResponse {
                channel: 3,
                message: WireMessage::SyncResponse { data },
            } => Some(data.clone()),
            _ => None,
        })
        .expect("sync response for channel 3");

    assert_eq!(sync_data.posts.len(), 1);
    assert_eq!(sync_data.posts[0].id, "p-genuine");
}

// =============================================================================
// Broadcast dedup
// =============================================================================

#[tokio::test]
async fn test_duplicate_broadcast_one_write_one_event() {
    let mut harness = Harness::new("local");
    let mut events = harness.events.subscribe();

    for peer in ["peer-a", "peer-b"] {
        harness
            .feed(TransportEvent::PeerDiscovered {
                peer_id: peer.into(),
            })
            .await;
        harness
            .feed(TransportEvent::ConnectionEstablished {
                peer_id: peer.into(),
            })
            .await;
    }
    harness.drain_commands();
    // Ignore connection events
    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, DomainEvent::PeerConnected { .. }));
    }

    // The same NEW_POST floods in from both peers within the TTL window
    let message = WireMessage::NewPost {
        data: post("p-x", now_ms()),
    };
    for (peer, channel) in [("peer-a", 1u64), ("peer-b", 2u64)] {
        harness
            .feed(TransportEvent::InboundRequest {
                peer_id: peer.into(),
                request: message.clone(),
                channel,
            })
            .await;
    }

    // Exactly one downstream notification
    let mut accepted = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DomainEvent::RecordAccepted { .. }) {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);

    // The first delivery is forwarded to the other peer; the duplicate is not
    let forwards = harness
        .drain_commands()
        .iter()
        .filter(|c| {
            matches!(
                c,
                TransportCommand::SendRequest {
                    message: WireMessage::NewPost { .. },
                    ..
                }
            )
        })
        .count();
    assert_eq!(forwards, 1, "flooded onward exactly once");
}

// =============================================================================
// Offline queue
// =============================================================================

#[tokio::test]
async fn test_offline_publish_flushes_on_reconnect() {
    let mut harness = Harness::new("local");

    // No peers connected: three posts queue up
    for i in 0..3 {
        harness
            .publish(WireMessage::NewPost {
                data: post(&format!("p-off-{}", i), now_ms()),
            })
            .await;
    }
    assert_eq!(harness.coordinator.queued_len(), 3);
    assert!(harness.drain_commands().is_empty(), "nothing sent while offline");

    // A peer connects; the queue flushes to it in one cycle
    harness
        .feed(TransportEvent::PeerDiscovered {
            peer_id: "late-peer".into(),
        })
        .await;
    harness
        .feed(TransportEvent::ConnectionEstablished {
            peer_id: "late-peer".into(),
        })
        .await;

    assert_eq!(harness.coordinator.queued_len(), 0);
    let commands = harness.drain_commands();
    let flushed: Vec<String> = commands
        .iter()
        .filter_map(|c| match c {
            TransportCommand::SendRequest {
                peer_id,
                message: WireMessage::NewPost { data },
            } => {
                assert_eq!(peer_id, "late-peer");
                Some(data.id.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(flushed, vec!["p-off-0", "p-off-1", "p-off-2"]);
}

// =============================================================================
// Delta sync
// =============================================================================

#[tokio::test]
async fn test_delta_sync_returns_only_new_records() {
    // Peer B's dataset: 10 posts up to T0, then 2 more afterwards
    let remote = make_engine();
    let t0 = 10_000u64;
    let mut old_posts = Vec::new();
    for i in 0..10 {
        old_posts.push(post(&format!("p-old-{}", i), 1_000 + i as u64));
    }
    remote
        .apply_batch(RecordBatch {
            posts: old_posts,
            ..Default::default()
        })
        .await
        .unwrap();
    remote
        .apply_batch(RecordBatch {
            posts: vec![post("p-new-1", t0 + 1_000), post("p-new-2", t0 + 2_000)],
            ..Default::default()
        })
        .await
        .unwrap();

    // First contact: full sync
    let full = remote.build_sync_response(None).await.unwrap();
    assert_eq!(full.posts.len(), 12);

    // Reconnect with the T0 watermark: exactly the two new posts
    let delta = remote.build_sync_response(Some(t0)).await.unwrap();
    let ids: Vec<&str> = delta.posts.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p-new-1", "p-new-2"]);
}

// =============================================================================
// Peer list exchange
// =============================================================================

#[tokio::test]
async fn test_peer_list_triggers_dials_to_unknown_peers() {
    let mut harness = Harness::new("local");
    harness
        .feed(TransportEvent::PeerDiscovered {
            peer_id: "peer-a".into(),
        })
        .await;
    harness.drain_commands();

    harness
        .feed(TransportEvent::InboundRequest {
            peer_id: "peer-a".into(),
            request: WireMessage::PeerList {
                data: vec![
                    "peer-a".into(), // already known: skipped
                    "local".into(),  // ourselves: skipped
                    "peer-b".into(), // new: dialed
                ],
            },
            channel: 1,
        })
        .await;

    let commands = harness.drain_commands();
    let dials: Vec<String> = commands
        .iter()
        .filter_map(|c| match c {
            TransportCommand::Dial { peer_id } => Some(peer_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(dials, vec!["peer-b"]);
}
