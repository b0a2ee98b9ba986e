//! Integration tests for the GossipSub router.
//!
//! These tests run several routers on an in-memory network and validate
//! end-to-end delivery, mesh maintenance, IDONTWANT bookkeeping and scoring.

use std::time::Duration;

use meshsub::{
    validate_topic_score_params, CacheConfig, ControlGraft, ControlIHave, ControlMessage, ControlPrune,
    GossipSub, GossipSubConfig, GossipSubEvent, Identity, Keypair, MemoryNetwork, MeshConfig, Message,
    MessageId, PeerRecord, PeerScoreParams, PublishError, PublishOptions, RawPeer, Rpc, ScoreParamsError,
    SubOpts, TopicScoreParams, ValidationResult,
};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const POLL: Duration = Duration::from_millis(20);
const QUIET_PERIOD: Duration = Duration::from_millis(500);
const TOPIC: &str = "Z";

// =============================================================================
// Helper Functions
// =============================================================================

fn fast_config() -> GossipSubConfig {
    GossipSubConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_initial_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

async fn spawn_nodes(net: &MemoryNetwork, count: usize, config: &GossipSubConfig) -> Vec<GossipSub> {
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let node = net
            .spawn_node(Keypair::generate(), config.clone())
            .await
            .expect("spawn failed");
        nodes.push(node);
    }
    nodes
}

async fn connect_all(net: &MemoryNetwork, nodes: &[GossipSub]) {
    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            net.connect(&a.local_identity(), &b.local_identity())
                .await
                .expect("connect failed");
        }
    }
}

async fn wait_for_mesh(node: &GossipSub, topic: &str, size: usize) {
    timeout(TEST_TIMEOUT, async {
        while node.mesh_peers(topic).await.len() < size {
            sleep(POLL).await;
        }
    })
    .await
    .expect("mesh did not form in time");
}

async fn next_message(rx: &mut broadcast::Receiver<GossipSubEvent>) -> Message {
    timeout(TEST_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(GossipSubEvent::Message { message, .. }) => return message,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no message delivered in time")
}

/// Messages delivered on `rx` during a quiet period.
async fn drain_messages(rx: &mut broadcast::Receiver<GossipSubEvent>) -> usize {
    sleep(QUIET_PERIOD).await;
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, GossipSubEvent::Message { .. }) {
            count += 1;
        }
    }
    count
}

/// Scores only move when the test moves them.
fn frozen_score_config() -> GossipSubConfig {
    let mut config = fast_config();
    config.score_params.decay_interval = Duration::from_secs(3600);
    config
}

fn control(control: ControlMessage) -> Rpc {
    Rpc::with_control(control)
}

fn prune(topic: &str, peers: Vec<PeerRecord>, backoff_secs: u64) -> Rpc {
    control(ControlMessage {
        prune: vec![ControlPrune { topic: topic.to_string(), peers, backoff_secs: Some(backoff_secs) }],
        ..Default::default()
    })
}

/// Frames from the router until one matches `pred`.
async fn recv_until<F>(peer: &mut RawPeer, mut pred: F) -> Rpc
where
    F: FnMut(&Rpc) -> bool,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            match peer.recv().await.expect("read failed") {
                Some(rpc) if pred(&rpc) => return rpc,
                Some(_) => continue,
                None => panic!("router closed its stream"),
            }
        }
    })
    .await
    .expect("expected frame never arrived")
}

async fn wait_for_removal(node: &GossipSub, peer: &Identity) {
    timeout(TEST_TIMEOUT, async {
        while node.get_peers().await.contains(peer) {
            sleep(POLL).await;
        }
    })
    .await
    .expect("peer was never removed");
}

async fn stop_all(nodes: &[GossipSub]) {
    for node in nodes {
        node.stop().await;
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// A line A - B - C: a message published at A reaches B and C exactly once.
#[tokio::test]
async fn line_topology_delivers_exactly_once() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 3, &fast_config()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    net.connect(&a.local_identity(), &b.local_identity()).await.expect("a-b");
    net.connect(&b.local_identity(), &c.local_identity()).await.expect("b-c");

    for node in &nodes {
        node.subscribe(TOPIC).await.expect("subscribe failed");
    }
    wait_for_mesh(a, TOPIC, 1).await;
    wait_for_mesh(b, TOPIC, 2).await;
    wait_for_mesh(c, TOPIC, 1).await;

    let mut rx_b = b.subscribe_events();
    let mut rx_c = c.subscribe_events();

    let result = a
        .publish(TOPIC, b"hey".to_vec(), PublishOptions::default())
        .await
        .expect("publish failed");
    assert_eq!(result.recipients, vec![b.local_identity()]);

    let at_b = next_message(&mut rx_b).await;
    let at_c = next_message(&mut rx_c).await;
    assert_eq!(at_b.data, b"hey".to_vec());
    assert_eq!(at_c.data, b"hey".to_vec());
    assert_eq!(at_c.from, Some(a.local_identity()));

    assert_eq!(drain_messages(&mut rx_b).await, 0, "B saw a duplicate");
    assert_eq!(drain_messages(&mut rx_c).await, 0, "C saw a duplicate");

    stop_all(&nodes).await;
}

/// Publishing without subscribers fails unless explicitly allowed.
#[tokio::test]
async fn publish_to_zero_peers_policy() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2, &fast_config()).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    net.connect(&a.local_identity(), &b.local_identity()).await.expect("connect");

    // B never subscribes.
    let err = a
        .publish(TOPIC, b"nobody".to_vec(), PublishOptions::default())
        .await
        .expect_err("publish should fail");
    assert!(matches!(
        err.downcast_ref::<PublishError>(),
        Some(PublishError::NoPeersSubscribedToTopic)
    ));

    let result = a
        .publish(
            TOPIC,
            b"nobody".to_vec(),
            PublishOptions { allow_publish_to_zero_topic_peers: true },
        )
        .await
        .expect("publish should be allowed");
    assert!(result.recipients.is_empty());

    stop_all(&nodes).await;
}

/// A rejecting validator drops the message and costs the sender score.
#[tokio::test]
async fn validator_rejection_penalizes_sender() {
    let mut config = fast_config();
    let mut score_params = PeerScoreParams::default();
    score_params.topics.insert(
        TOPIC.to_string(),
        TopicScoreParams {
            time_in_mesh_weight: 0.0,
            mesh_message_deliveries_weight: 0.0,
            mesh_failure_penalty_weight: 0.0,
            ..Default::default()
        },
    );
    config.score_params = score_params;

    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2, &config).await;
    let (a, c) = (&nodes[0], &nodes[1]);
    net.connect(&a.local_identity(), &c.local_identity()).await.expect("connect");

    c.set_topic_validator(TOPIC, |_: &meshsub::Identity, _: &Message| ValidationResult::Reject)
        .await
        .expect("set validator");
    a.subscribe(TOPIC).await.expect("subscribe a");
    c.subscribe(TOPIC).await.expect("subscribe c");
    wait_for_mesh(a, TOPIC, 1).await;

    let mut rx_c = c.subscribe_events();
    for i in 0..5u8 {
        a.publish(TOPIC, vec![i], PublishOptions::default())
            .await
            .expect("publish failed");
    }

    timeout(TEST_TIMEOUT, async {
        while c.score_of(&a.local_identity()).await >= 0.0 {
            sleep(POLL).await;
        }
    })
    .await
    .expect("sender score never went negative");
    assert_eq!(drain_messages(&mut rx_c).await, 0);

    stop_all(&nodes).await;
}

// =============================================================================
// IDONTWANT
// =============================================================================

/// Large messages trigger IDONTWANT; per-peer counts stay capped and reset
/// every heartbeat.
#[tokio::test]
async fn idontwant_counts_capped_and_reset() {
    const MAX: usize = 10;
    let config = GossipSubConfig {
        idontwant_max_messages: MAX,
        heartbeat_interval: Duration::from_millis(300),
        ..fast_config()
    };
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 4, &config).await;
    connect_all(&net, &nodes).await;

    for node in &nodes {
        node.subscribe(TOPIC).await.expect("subscribe failed");
    }
    for node in &nodes {
        wait_for_mesh(node, TOPIC, 3).await;
    }

    let mut receivers: Vec<_> = nodes[1..].iter().map(|n| n.subscribe_events()).collect();
    let publisher = &nodes[0];
    for i in 0..(2 * MAX) {
        let mut data = vec![0u8; config.idontwant_min_data_size + 1];
        data[..8].copy_from_slice(&(i as u64).to_be_bytes());
        publisher
            .publish(TOPIC, data, PublishOptions::default())
            .await
            .expect("publish failed");
    }

    // Every receiver gets all messages.
    for rx in &mut receivers {
        for _ in 0..(2 * MAX) {
            next_message(rx).await;
        }
    }

    let mut seen_any = false;
    for node in &nodes[1..] {
        for peer in &nodes {
            if peer.local_identity() == node.local_identity() {
                continue;
            }
            let count = node.idontwant_count_of(&peer.local_identity()).await;
            let len = node.idontwant_len_of(&peer.local_identity()).await;
            assert!(count <= MAX, "count {count} exceeds cap");
            assert!(len <= MAX, "set size {len} exceeds cap");
            seen_any |= len > 0;
        }
    }
    assert!(seen_any, "no IDONTWANT was recorded");

    // Wait for one full heartbeat after traffic settled.
    sleep(QUIET_PERIOD).await;
    let mut events = nodes[1].subscribe_events();
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(GossipSubEvent::Heartbeat { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("no heartbeat");
    for peer in &nodes {
        assert_eq!(nodes[1].idontwant_count_of(&peer.local_identity()).await, 0);
    }

    stop_all(&nodes).await;
}

// =============================================================================
// Mesh Maintenance
// =============================================================================

/// In a fully connected network every mesh settles within [d_lo, d_hi].
#[tokio::test]
async fn mesh_sizes_settle_within_bounds() {
    let mesh = MeshConfig {
        d: 4,
        d_lo: 3,
        d_hi: 6,
        d_score: 2,
        d_out: 1,
        d_lazy: 3,
        ..Default::default()
    };
    let config = GossipSubConfig { mesh: mesh.clone(), ..fast_config() };
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 9, &config).await;
    connect_all(&net, &nodes).await;
    for node in &nodes {
        node.subscribe(TOPIC).await.expect("subscribe failed");
    }

    timeout(TEST_TIMEOUT, async {
        loop {
            let mut settled = true;
            for node in &nodes {
                let size = node.mesh_peers(TOPIC).await.len();
                if size < mesh.d_lo || size > mesh.d_hi {
                    settled = false;
                    break;
                }
            }
            if settled {
                return;
            }
            sleep(POLL).await;
        }
    })
    .await
    .expect("meshes never settled within bounds");

    stop_all(&nodes).await;
}

/// Unsubscribing prunes the mesh link and removes peer-store tags on both sides.
#[tokio::test]
async fn unsubscribe_prunes_and_untags() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2, &fast_config()).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let (id_a, id_b) = (a.local_identity(), b.local_identity());
    net.connect(&id_a, &id_b).await.expect("connect");

    a.subscribe(TOPIC).await.expect("subscribe a");
    b.subscribe(TOPIC).await.expect("subscribe b");
    wait_for_mesh(a, TOPIC, 1).await;
    wait_for_mesh(b, TOPIC, 1).await;

    timeout(TEST_TIMEOUT, async {
        while net.tags(&id_a, &id_b).await.get(TOPIC).is_none() {
            sleep(POLL).await;
        }
    })
    .await
    .expect("mesh peer never tagged");

    b.unsubscribe(TOPIC).await.expect("unsubscribe");
    timeout(TEST_TIMEOUT, async {
        while net.tags(&id_b, &id_a).await.get(TOPIC).is_some() {
            sleep(POLL).await;
        }
    })
    .await
    .expect("local tag never removed");

    timeout(TEST_TIMEOUT, async {
        while !a.mesh_peers(TOPIC).await.is_empty() || net.tags(&id_a, &id_b).await.get(TOPIC).is_some() {
            sleep(POLL).await;
        }
    })
    .await
    .expect("PRUNE was not applied");
    assert!(!a.get_subscribers(TOPIC).await.contains(&id_b));

    stop_all(&nodes).await;
}

/// Disconnecting a peer removes it from every mesh and the peer list.
#[tokio::test]
async fn disconnect_removes_peer_state() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2, &fast_config()).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    net.connect(&a.local_identity(), &b.local_identity()).await.expect("connect");
    a.subscribe(TOPIC).await.expect("subscribe a");
    b.subscribe(TOPIC).await.expect("subscribe b");
    wait_for_mesh(a, TOPIC, 1).await;

    net.disconnect(&a.local_identity(), &b.local_identity()).await.expect("disconnect");
    assert!(a.mesh_peers(TOPIC).await.is_empty());
    assert!(a.get_peers().await.is_empty());
    assert!(a.get_subscribers(TOPIC).await.is_empty());

    stop_all(&nodes).await;
}

/// Publishing to an unjoined topic goes through fanout.
#[tokio::test]
async fn publish_without_joining_uses_fanout() {
    let config = GossipSubConfig { flood_publish: false, ..fast_config() };
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 3, &config).await;
    connect_all(&net, &nodes).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    b.subscribe(TOPIC).await.expect("subscribe b");
    c.subscribe(TOPIC).await.expect("subscribe c");
    timeout(TEST_TIMEOUT, async {
        while a.get_subscribers(TOPIC).await.len() < 2 {
            sleep(POLL).await;
        }
    })
    .await
    .expect("subscriptions never announced");

    let mut rx_b = b.subscribe_events();
    let result = a
        .publish(TOPIC, b"fan".to_vec(), PublishOptions::default())
        .await
        .expect("publish failed");
    assert_eq!(result.recipients.len(), 2);
    assert_eq!(a.fanout_peers(TOPIC).await.len(), 2);
    assert!(a.mesh_peers(TOPIC).await.is_empty());
    assert_eq!(next_message(&mut rx_b).await.data, b"fan".to_vec());

    stop_all(&nodes).await;
}

/// Subscription announcements surface as events on the remote side.
#[tokio::test]
async fn subscription_changes_are_reported() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2, &fast_config()).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let mut events = a.subscribe_events();
    net.connect(&a.local_identity(), &b.local_identity()).await.expect("connect");

    b.subscribe(TOPIC).await.expect("subscribe");
    let (peer, topic, subscribed) = timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(GossipSubEvent::SubscriptionChange { peer, topic, subscribed }) = events.recv().await {
                return (peer, topic, subscribed);
            }
        }
    })
    .await
    .expect("no subscription event");
    assert_eq!(peer, b.local_identity());
    assert_eq!(topic, TOPIC);
    assert!(subscribed);

    stop_all(&nodes).await;
}

// =============================================================================
// Gossip
// =============================================================================

/// An IHAVE for an unseen id is answered with IWANT. When the message never
/// follows, the peer takes a behaviour penalty at a later heartbeat.
#[tokio::test]
async fn unanswered_iwant_costs_behaviour_penalty() {
    let config = GossipSubConfig { iwant_followup_time: Duration::from_millis(200), ..frozen_score_config() };
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 1, &config).await;
    let r = &nodes[0];
    r.subscribe(TOPIC).await.expect("subscribe");
    let mut p = net.attach_raw(Keypair::generate(), &r.local_identity()).await.expect("attach");

    let id: MessageId = [0x42; 32];
    p.send(&control(ControlMessage {
        ihave: vec![ControlIHave { topic: TOPIC.to_string(), message_ids: vec![id] }],
        ..Default::default()
    }))
    .await
    .expect("send IHAVE");

    recv_until(&mut p, |rpc| {
        rpc.control
            .as_ref()
            .is_some_and(|c| c.iwant.iter().any(|w| w.message_ids.contains(&id)))
    })
    .await;
    assert_eq!(r.score_of(&p.identity()).await, 0.0);

    timeout(TEST_TIMEOUT, async {
        while r.score_of(&p.identity()).await >= 0.0 {
            sleep(POLL).await;
        }
    })
    .await
    .expect("broken promise never penalized");
    // One broken promise: -10 * 1^2.
    assert_eq!(r.score_of(&p.identity()).await, -10.0);

    stop_all(&nodes).await;
}

/// Messages still in the newest cache window are advertised at the next
/// heartbeat, even when only one window is gossiped.
#[tokio::test]
async fn newest_window_is_gossiped_before_rotation() {
    let config = GossipSubConfig {
        cache: CacheConfig { mcache_gossip: 1, ..Default::default() },
        ..fast_config()
    };
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2, &config).await;
    let (q, r) = (&nodes[0], &nodes[1]);
    net.connect(&q.local_identity(), &r.local_identity()).await.expect("connect");
    q.subscribe(TOPIC).await.expect("subscribe q");
    r.subscribe(TOPIC).await.expect("subscribe r");
    wait_for_mesh(r, TOPIC, 1).await;

    // P subscribes but backs R off, so it stays out of R's mesh and only
    // hears about messages through gossip.
    let mut p = net.attach_raw(Keypair::generate(), &r.local_identity()).await.expect("attach");
    let mut hello = prune(TOPIC, Vec::new(), 60);
    hello.subscriptions = vec![SubOpts { topic: TOPIC.to_string(), subscribe: true }];
    p.send(&hello).await.expect("send");
    timeout(TEST_TIMEOUT, async {
        while !r.get_subscribers(TOPIC).await.contains(&p.identity()) {
            sleep(POLL).await;
        }
    })
    .await
    .expect("subscription never seen");

    let published = q
        .publish(TOPIC, b"gossip me".to_vec(), PublishOptions::default())
        .await
        .expect("publish");
    let rpc = recv_until(&mut p, |rpc| {
        !rpc.messages.is_empty()
            || rpc.control.as_ref().is_some_and(|c| {
                c.ihave.iter().any(|h| h.topic == TOPIC && h.message_ids.contains(&published.id))
            })
    })
    .await;
    assert!(rpc.messages.is_empty(), "P was sent the full message outside the mesh");
    assert!(!r.mesh_peers(TOPIC).await.contains(&p.identity()));

    stop_all(&nodes).await;
}

// =============================================================================
// GRAFT / PRUNE
// =============================================================================

/// GRAFT inside a backoff costs one penalty, two when it lands within the
/// flood threshold of the backoff start.
#[tokio::test]
async fn graft_during_backoff_is_penalized() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 1, &frozen_score_config()).await;
    let r = &nodes[0];
    r.subscribe(TOPIC).await.expect("subscribe");

    let graft = control(ControlMessage {
        graft: vec![ControlGraft { topic: TOPIC.to_string() }],
        ..Default::default()
    });
    let refused = |rpc: &Rpc| rpc.control.as_ref().is_some_and(|c| c.prune.iter().any(|p| p.topic == TOPIC));

    // Long backoff: the GRAFT arrives right after it started, inside the flood window.
    let mut flooder = net.attach_raw(Keypair::generate(), &r.local_identity()).await.expect("attach");
    flooder.send(&prune(TOPIC, Vec::new(), 60)).await.expect("send PRUNE");
    flooder.send(&graft).await.expect("send GRAFT");
    recv_until(&mut flooder, refused).await;
    assert_eq!(r.score_of(&flooder.identity()).await, -40.0);

    // One-second backoff: still backed off, but the flood window already closed.
    let mut eager = net.attach_raw(Keypair::generate(), &r.local_identity()).await.expect("attach");
    eager.send(&prune(TOPIC, Vec::new(), 1)).await.expect("send PRUNE");
    eager.send(&graft).await.expect("send GRAFT");
    recv_until(&mut eager, refused).await;
    assert_eq!(r.score_of(&eager.identity()).await, -10.0);

    assert!(r.mesh_peers(TOPIC).await.is_empty());
    stop_all(&nodes).await;
}

/// Peer exchange records are surfaced only when the pruning peer scores at
/// least `accept_px_threshold`.
#[tokio::test]
async fn peer_exchange_requires_accept_px_score() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 1, &frozen_score_config()).await;
    let r = &nodes[0];
    r.subscribe(TOPIC).await.expect("subscribe");
    let mut events = r.subscribe_events();
    let mut p = net.attach_raw(Keypair::generate(), &r.local_identity()).await.expect("attach");

    let offered = Keypair::generate().identity();
    let records = vec![PeerRecord { peer: offered, signed_record: None }];

    // Score 0 is below the default threshold of 10.
    p.send(&prune(TOPIC, records.clone(), 60)).await.expect("send");
    sleep(QUIET_PERIOD).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, GossipSubEvent::PeerExchange { .. }), "PX accepted from a zero-score peer");
    }

    // Application score 2 with weight 10 lifts P to 20.
    assert!(r.set_application_score(p.identity(), 2.0).await.expect("set score"));
    p.send(&prune(TOPIC, records, 60)).await.expect("send");
    let (from, topic, peers) = timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(GossipSubEvent::PeerExchange { from, topic, peers }) = events.recv().await {
                return (from, topic, peers);
            }
        }
    })
    .await
    .expect("no peer exchange event");
    assert_eq!(from, p.identity());
    assert_eq!(topic, TOPIC);
    assert_eq!(peers.iter().map(|record| record.peer).collect::<Vec<_>>(), vec![offered]);

    stop_all(&nodes).await;
}

// =============================================================================
// Invalid Input
// =============================================================================

/// A message with a forged signature counts as an invalid delivery and is
/// neither delivered nor forwarded.
#[tokio::test]
async fn forged_signature_penalized_and_dropped() {
    let mut config = frozen_score_config();
    config.score_params.topics.insert(
        TOPIC.to_string(),
        TopicScoreParams {
            time_in_mesh_weight: 0.0,
            mesh_message_deliveries_weight: 0.0,
            mesh_failure_penalty_weight: 0.0,
            ..Default::default()
        },
    );
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2, &config).await;
    let (q, r) = (&nodes[0], &nodes[1]);
    net.connect(&q.local_identity(), &r.local_identity()).await.expect("connect");
    q.subscribe(TOPIC).await.expect("subscribe q");
    r.subscribe(TOPIC).await.expect("subscribe r");
    wait_for_mesh(r, TOPIC, 1).await;

    let mut p = net.attach_raw(Keypair::generate(), &r.local_identity()).await.expect("attach");
    let mut rx_q = q.subscribe_events();
    let mut rx_r = r.subscribe_events();
    let forged = Message {
        from: Some(p.identity()),
        seqno: Some(1),
        topic: TOPIC.to_string(),
        data: b"forged".to_vec(),
        signature: Some(vec![7u8; 64]),
    };
    p.send(&Rpc::with_messages(vec![forged])).await.expect("send");

    timeout(TEST_TIMEOUT, async {
        while r.score_of(&p.identity()).await >= 0.0 {
            sleep(POLL).await;
        }
    })
    .await
    .expect("invalid delivery never scored");
    assert_eq!(drain_messages(&mut rx_r).await, 0);
    assert_eq!(drain_messages(&mut rx_q).await, 0);

    stop_all(&nodes).await;
}

/// An oversized frame header drops the peer and leaves it with a retained
/// negative score.
#[tokio::test]
async fn oversized_frame_drops_and_penalizes_peer() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 1, &frozen_score_config()).await;
    let r = &nodes[0];
    let mut p = net.attach_raw(Keypair::generate(), &r.local_identity()).await.expect("attach");
    assert!(r.get_peers().await.contains(&p.identity()));

    p.send_raw(&u32::MAX.to_be_bytes()).await.expect("send");
    wait_for_removal(r, &p.identity()).await;
    assert_eq!(r.score_of(&p.identity()).await, -10.0);

    stop_all(&nodes).await;
}

// =============================================================================
// Stream Failures
// =============================================================================

/// A write to a peer whose stream is gone removes that peer.
#[tokio::test]
async fn broken_outbound_stream_removes_peer() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 1, &fast_config()).await;
    let r = &nodes[0];
    r.subscribe(TOPIC).await.expect("subscribe");
    let mut p = net.attach_raw(Keypair::generate(), &r.local_identity()).await.expect("attach");

    recv_until(&mut p, |rpc| rpc.subscriptions.iter().any(|s| s.topic == TOPIC)).await;
    p.close_inbound().await;
    r.subscribe("other").await.expect("subscribe other");

    wait_for_removal(r, &p.identity()).await;
    stop_all(&nodes).await;
}

/// A peer whose stream cannot be opened is dropped, and comes back once the
/// network heals and it reconnects.
#[tokio::test]
async fn failed_stream_open_drops_peer_until_reconnect() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2, &fast_config()).await;
    let (q, r) = (&nodes[0], &nodes[1]);
    let (id_q, id_r) = (q.local_identity(), r.local_identity());

    net.set_failure(id_q, true).await;
    net.connect(&id_r, &id_q).await.expect("connect");
    wait_for_removal(r, &id_q).await;
    sleep(QUIET_PERIOD).await;
    assert!(!r.get_peers().await.contains(&id_q));

    net.set_failure(id_q, false).await;
    net.connect(&id_r, &id_q).await.expect("reconnect");
    timeout(TEST_TIMEOUT, async {
        while !r.get_peers().await.contains(&id_q) {
            sleep(POLL).await;
        }
    })
    .await
    .expect("peer never came back");

    stop_all(&nodes).await;
}

// =============================================================================
// Parameter Validation
// =============================================================================

#[test]
fn negative_topic_weight_is_invalid() {
    let params = TopicScoreParams { topic_weight: -1.0, ..Default::default() };
    assert_eq!(validate_topic_score_params(&params), Err(ScoreParamsError::TopicWeight));
}

#[test]
fn invalid_cache_config_rejected() {
    let config = GossipSubConfig {
        cache: CacheConfig { mcache_gossip: 10, mcache_length: 3, ..Default::default() },
        ..Default::default()
    };
    assert!(config.validate().is_err());
}
