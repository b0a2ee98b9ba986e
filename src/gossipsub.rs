//! # GossipSub Router
//!
//! Scored topic meshes with lazy IHAVE/IWANT repair and IDONTWANT
//! suppression (GossipSub v1.1 / v1.2).
//!
//! ## Protocol Overview
//!
//! | Set | Purpose | Traffic |
//! |-----|---------|---------|
//! | Mesh | Topics we joined | Full messages |
//! | Fanout | Topics we only publish to | Full messages (our publishes) |
//! | Gossip targets | Non-mesh subscribers | IHAVE announcements |
//!
//! ## Message Flow
//!
//! 1. **Publish**: sign, cache, send to flood / mesh / fanout peers
//! 2. **Receive**: dedup, structural checks, IDONTWANT to mesh, topic validator
//! 3. **Accept**: deliver locally, forward to mesh minus sources and IDONTWANT holders
//! 4. **Heartbeat**: rotate cache, rebalance meshes, gossip, decay scores, flush control
//!
//! ## Architecture
//!
//! The public [`GossipSub`] handle is cheap to clone and talks to a single
//! actor task over a bounded channel. The actor owns every piece of router
//! state, so no locks are taken. Per-peer reader and writer tasks move frames
//! between streams and the actor; writers use bounded queues that drop on
//! overflow so a slow peer never stalls the router. Mesh tags reach the
//! host's peer store through a separate ordered task for the same reason.
//!
//! ## Security Measures
//!
//! - Signatures verified before anything is forwarded
//! - Graylisted peers' RPCs ignored wholesale
//! - GRAFT during backoff penalized, doubly so shortly after our PRUNE
//! - IHAVE, IWANT and IDONTWANT all bounded per peer per heartbeat
//! - Broken IWANT promises penalized
//! - Oversized or undecodable frames penalized and the peer dropped

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, GossipSubConfig, MESH_TAG_VALUE};
use crate::control::{ControlBuffer, GossipPromises, IDontWantTable, IHaveLimits};
use crate::crypto::{sign_with_domain, verify_with_domain, SignatureError, GOSSIPSUB_SIGNATURE_DOMAIN};
use crate::identity::{Identity, Keypair};
use crate::mcache::{MessageCache, SeenCache};
use crate::mesh::{MeshChanges, MeshState};
use crate::messages::{
    message_id, read_frame, write_frame, CodecError, ControlGraft, ControlIDontWant, ControlIHave,
    ControlIWant, ControlMessage, ControlPrune, Message, MessageId, PeerRecord, Rpc, SignaturePolicy,
    SubOpts,
};
use crate::protocols::{
    BoxedStream, ConnectionDirectory, ConnectionInfo, Direction, PeerMetadataStore, PeerTag,
    StreamProvider, TopicValidator, ValidationResult,
};
use crate::score::{PeerScore, RejectReason};

// ============================================================================
// Limits
// ============================================================================

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Deadline for writing one frame to a peer.
/// SECURITY: A stalled peer cannot pin its writer task forever.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame allowance on top of the largest payload for envelope fields.
pub const FRAME_OVERHEAD: usize = 64 * 1024;

/// Longest backoff honoured from a remote PRUNE.
/// SECURITY: Bounds `Instant` arithmetic on attacker-supplied values.
pub const MAX_REMOTE_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

const COMMAND_CHANNEL_SIZE: usize = 1024;
const TAG_QUEUE_SIZE: usize = 1024;

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

// ============================================================================
// Public Types
// ============================================================================

/// Router notifications, broadcast to every [`GossipSub::subscribe_events`] receiver.
#[derive(Clone, Debug)]
pub enum GossipSubEvent {
    /// A validated message on a topic we subscribe to.
    Message {
        propagation_source: Identity,
        id: MessageId,
        message: Message,
    },
    SubscriptionChange {
        peer: Identity,
        topic: String,
        subscribed: bool,
    },
    Heartbeat {
        tick: u64,
    },
    Graft {
        peer: Identity,
        topic: String,
    },
    Prune {
        peer: Identity,
        topic: String,
    },
    /// Peers suggested by a PRUNE from a well-scored peer.
    PeerExchange {
        from: Identity,
        topic: String,
        peers: Vec<PeerRecord>,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Succeed even when nobody receives the message.
    pub allow_publish_to_zero_topic_peers: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishResult {
    pub id: MessageId,
    /// Peers the message was actually queued to. May be empty.
    pub recipients: Vec<Identity>,
}

/// Structured rejection of a local publish before anything is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRejection {
    /// Payload exceeds `GossipSubConfig::max_transmit_size`.
    MessageTooLarge,
    /// Topic name exceeds `MAX_TOPIC_LENGTH`.
    TopicTooLong,
    /// Topic name is empty or contains non-printable characters.
    InvalidTopic,
}

impl std::fmt::Display for MessageRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge => write!(f, "message size exceeds maximum allowed"),
            Self::TopicTooLong => write!(f, "topic name exceeds maximum length"),
            Self::InvalidTopic => write!(f, "topic name is invalid (empty or contains non-ASCII characters)"),
        }
    }
}

impl std::error::Error for MessageRejection {}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("message has already been published")]
    Duplicate,
    #[error("no peers subscribed to topic")]
    NoPeersSubscribedToTopic,
    #[error(transparent)]
    Rejected(#[from] MessageRejection),
}

/// Host collaborators the router talks to.
#[derive(Clone)]
pub struct GossipSubServices {
    pub streams: Arc<dyn StreamProvider>,
    pub connections: Arc<dyn ConnectionDirectory>,
    pub peer_store: Arc<dyn PeerMetadataStore>,
}

/// Why an inbound message failed structural checks.
#[derive(Debug, Error)]
enum InvalidMessage {
    #[error("payload of {0} bytes exceeds inbound limit")]
    TooLarge(usize),
    #[error("invalid topic")]
    InvalidTopic,
    #[error("missing author, seqno or signature")]
    MissingAuthor,
    #[error("author is not an Ed25519 key")]
    InvalidAuthor,
    #[error("unsigned policy but author fields present")]
    UnexpectedAuthor,
    #[error("bad signature: {0}")]
    Signature(SignatureError),
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<anyhow::Result<()>>),
    Unsubscribe(String, oneshot::Sender<anyhow::Result<()>>),
    Publish(String, Vec<u8>, PublishOptions, oneshot::Sender<anyhow::Result<PublishResult>>),
    GetTopics(oneshot::Sender<Vec<String>>),
    GetSubscribers(String, oneshot::Sender<Vec<Identity>>),
    GetPeers(oneshot::Sender<Vec<Identity>>),
    PeerConnected(Identity, Option<ConnectionInfo>, oneshot::Sender<()>),
    PeerDisconnected(Identity, oneshot::Sender<()>),
    IncomingStream(Identity, BoxedStream, oneshot::Sender<()>),
    SetTopicValidator(String, Option<Arc<dyn TopicValidator>>, oneshot::Sender<()>),
    SetApplicationScore(Identity, f64, oneshot::Sender<bool>),
    MeshPeers(String, oneshot::Sender<Vec<Identity>>),
    FanoutPeers(String, oneshot::Sender<Vec<Identity>>),
    ScoreOf(Identity, oneshot::Sender<f64>),
    IDontWantCountOf(Identity, oneshot::Sender<usize>),
    IDontWantLenOf(Identity, oneshot::Sender<usize>),
    Stop(oneshot::Sender<()>),

    // Posted by per-peer tasks.
    InboundRpc(Identity, Rpc),
    StreamOpened {
        peer: Identity,
        conn_id: u64,
        result: anyhow::Result<BoxedStream>,
    },
    StreamFailed {
        peer: Identity,
        conn_id: u64,
    },
    /// The reader hit an oversized or undecodable frame.
    MalformedFrame {
        peer: Identity,
        conn_id: u64,
    },
}

// ============================================================================
// GossipSub Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct GossipSub {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<GossipSubEvent>,
    connections: Arc<dyn ConnectionDirectory>,
    local_identity: Identity,
}

impl GossipSub {
    /// Validate `config` and start the router actor on the current runtime.
    pub fn spawn(keypair: Keypair, config: GossipSubConfig, services: GossipSubServices) -> Result<Self, ConfigError> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(config.event_buffer);
        let local_identity = keypair.identity();
        let connections = services.connections.clone();

        let (tag_tx, tag_rx) = mpsc::channel(TAG_QUEUE_SIZE);
        tokio::spawn(tag_loop(services.peer_store.clone(), tag_rx));
        let actor = GossipSubActor::new(keypair, config, services, events.clone(), cmd_tx.downgrade(), tag_tx);
        tokio::spawn(actor.run(cmd_rx));

        Ok(Self {
            cmd_tx,
            events,
            connections,
            local_identity,
        })
    }

    pub fn local_identity(&self) -> Identity {
        self.local_identity
    }

    /// New receiver for router events. Lagging receivers lose the oldest events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<GossipSubEvent> {
        self.events.subscribe()
    }

    pub async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Subscribe(topic.to_string(), tx)).await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?
    }

    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Unsubscribe(topic.to_string(), tx)).await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?
    }

    /// Publish `data` on `topic`.
    ///
    /// Failures that callers may want to match on are [`PublishError`] values
    /// inside the returned `anyhow::Error`.
    pub async fn publish(&self, topic: &str, data: Vec<u8>, options: PublishOptions) -> anyhow::Result<PublishResult> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Publish(topic.to_string(), data, options, tx)).await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?
    }

    /// Topics we are subscribed to.
    pub async fn get_topics(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetTopics(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Remote peers known to subscribe to `topic`.
    pub async fn get_subscribers(&self, topic: &str) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetSubscribers(topic.to_string(), tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Peers the router currently tracks.
    pub async fn get_peers(&self) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// The host connected to `peer`; the router opens its outbound stream.
    pub async fn peer_connected(&self, peer: Identity) -> anyhow::Result<()> {
        let info = self.connections.connection(&peer).await;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::PeerConnected(peer, info, tx)).await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    pub async fn peer_disconnected(&self, peer: Identity) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::PeerDisconnected(peer, tx)).await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    /// Hand over a stream the remote peer opened for this protocol.
    pub async fn handle_incoming_stream(&self, peer: Identity, stream: BoxedStream) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::IncomingStream(peer, stream, tx)).await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    pub async fn set_topic_validator<V: TopicValidator>(&self, topic: &str, validator: V) -> anyhow::Result<()> {
        self.replace_topic_validator(topic, Some(Arc::new(validator))).await
    }

    pub async fn remove_topic_validator(&self, topic: &str) -> anyhow::Result<()> {
        self.replace_topic_validator(topic, None).await
    }

    async fn replace_topic_validator(&self, topic: &str, validator: Option<Arc<dyn TopicValidator>>) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::SetTopicValidator(topic.to_string(), validator, tx)).await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    /// Set the application-specific score component (P5). Returns `false`
    /// for unknown peers.
    pub async fn set_application_score(&self, peer: Identity, score: f64) -> anyhow::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::SetApplicationScore(peer, score, tx)).await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::MeshPeers(topic.to_string(), tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn fanout_peers(&self, topic: &str) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::FanoutPeers(topic.to_string(), tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn score_of(&self, peer: &Identity) -> f64 {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ScoreOf(*peer, tx)).await.is_err() {
            return 0.0;
        }
        rx.await.unwrap_or_default()
    }

    /// IDONTWANT ids accepted from `peer` since the last heartbeat.
    pub async fn idontwant_count_of(&self, peer: &Identity) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::IDontWantCountOf(*peer, tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    /// IDONTWANT ids currently remembered for `peer`.
    pub async fn idontwant_len_of(&self, peer: &Identity) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::IDontWantLenOf(*peer, tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the router. Pending control is flushed best-effort; unresponsive
    /// peers are not waited on.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Per-peer Connection State
// ============================================================================

enum Outbound {
    /// Stream open in flight; frames wait here.
    Opening(Vec<Rpc>),
    Open(mpsc::Sender<Rpc>),
}

struct PeerConnection {
    conn_id: u64,
    remote_ip: Option<IpAddr>,
    outbound: Outbound,
    reader: Option<JoinHandle<()>>,
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn write_loop(
    peer: Identity,
    conn_id: u64,
    mut stream: BoxedStream,
    mut rx: mpsc::Receiver<Rpc>,
    max_frame_size: usize,
    cmd_tx: mpsc::WeakSender<Command>,
) {
    while let Some(rpc) = rx.recv().await {
        match tokio::time::timeout(WRITE_TIMEOUT, write_frame(&mut stream, &rpc, max_frame_size)).await {
            Ok(Ok(())) => {}
            Ok(Err(CodecError::Io(e))) => {
                debug!(peer = %peer.short(), error = %e, "outbound stream failed");
                report_stream_failure(&cmd_tx, peer, conn_id).await;
                return;
            }
            Ok(Err(e)) => {
                warn!(peer = %peer.short(), error = %e, "dropping unencodable frame");
            }
            Err(_) => {
                warn!(peer = %peer.short(), "outbound write timed out");
                report_stream_failure(&cmd_tx, peer, conn_id).await;
                return;
            }
        }
    }
    let _ = tokio::time::timeout(WRITE_TIMEOUT, stream.shutdown()).await;
}

async fn read_loop(
    peer: Identity,
    conn_id: u64,
    mut stream: BoxedStream,
    max_frame_size: usize,
    cmd_tx: mpsc::WeakSender<Command>,
) {
    loop {
        match read_frame(&mut stream, max_frame_size).await {
            Ok(Some(rpc)) => {
                let Some(tx) = cmd_tx.upgrade() else {
                    return;
                };
                if tx.send(Command::InboundRpc(peer, rpc)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                trace!(peer = %peer.short(), "inbound stream closed");
                return;
            }
            Err(CodecError::Io(e)) => {
                debug!(peer = %peer.short(), error = %e, "inbound stream failed");
                report_stream_failure(&cmd_tx, peer, conn_id).await;
                return;
            }
            Err(e) => {
                // Framing is lost after an undecodable or oversized frame.
                warn!(peer = %peer.short(), error = %e, "malformed inbound frame");
                if let Some(tx) = cmd_tx.upgrade() {
                    let _ = tx.send(Command::MalformedFrame { peer, conn_id }).await;
                }
                return;
            }
        }
    }
}

async fn report_stream_failure(cmd_tx: &mpsc::WeakSender<Command>, peer: Identity, conn_id: u64) {
    if let Some(tx) = cmd_tx.upgrade() {
        let _ = tx.send(Command::StreamFailed { peer, conn_id }).await;
    }
}

/// Mesh tag updates for the host's peer store, applied in order by
/// [`tag_loop`] off the actor task.
enum TagOp {
    Tag(Identity, String),
    Untag(Identity, String),
}

async fn tag_loop(store: Arc<dyn PeerMetadataStore>, mut rx: mpsc::Receiver<TagOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            TagOp::Tag(peer, topic) => {
                let tag = PeerTag { value: MESH_TAG_VALUE, ttl: None };
                store.tag_peer(&peer, &topic, tag).await;
            }
            TagOp::Untag(peer, topic) => store.untag_peer(&peer, &topic).await,
        }
    }
}

// ============================================================================
// GossipSub Actor (owns state)
// ============================================================================

struct GossipSubActor {
    keypair: Keypair,
    local_identity: Identity,
    config: GossipSubConfig,
    streams: Arc<dyn StreamProvider>,
    tags: mpsc::Sender<TagOp>,
    events: broadcast::Sender<GossipSubEvent>,
    self_tx: mpsc::WeakSender<Command>,

    peers: HashMap<Identity, PeerConnection>,
    next_conn_id: u64,
    subscriptions: HashSet<String>,
    validators: HashMap<String, Arc<dyn TopicValidator>>,
    mesh: MeshState,
    score: PeerScore,
    mcache: MessageCache,
    seen: SeenCache,
    control: ControlBuffer,
    idontwants: IDontWantTable,
    promises: GossipPromises,
    ihave_limits: IHaveLimits,
    seqno: u64,
    tick: u64,
}

impl GossipSubActor {
    fn new(
        keypair: Keypair,
        config: GossipSubConfig,
        services: GossipSubServices,
        events: broadcast::Sender<GossipSubEvent>,
        self_tx: mpsc::WeakSender<Command>,
        tags: mpsc::Sender<TagOp>,
    ) -> Self {
        let now = Instant::now();
        let local_identity = keypair.identity();
        Self {
            local_identity,
            keypair,
            streams: services.streams,
            tags,
            events,
            self_tx,
            peers: HashMap::new(),
            next_conn_id: 0,
            subscriptions: HashSet::new(),
            validators: HashMap::new(),
            mesh: MeshState::new(config.mesh.clone()),
            score: PeerScore::new(config.score_params.clone(), now),
            mcache: MessageCache::new(config.cache.mcache_length, config.cache.mcache_gossip),
            seen: SeenCache::new(config.cache.seen_ttl),
            control: ControlBuffer::new(),
            idontwants: IDontWantTable::new(config.idontwant_max_messages, config.cache.mcache_length as u64),
            promises: GossipPromises::new(config.iwant_followup_time),
            ihave_limits: IHaveLimits::new(config.max_ihave_messages, config.max_ihave_length),
            seqno: rand::random::<u64>() >> 1,
            tick: 0,
            config,
        }
    }

    fn max_frame_size(&self) -> usize {
        self.config.max_inbound_data_length.max(self.config.max_transmit_size) + FRAME_OVERHEAD
    }

    fn emit(&self, event: GossipSubEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn peer_score(&self, peer: &Identity) -> f64 {
        self.score.score(peer, Instant::now())
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let start = tokio::time::Instant::now() + self.config.heartbeat_initial_delay;
        let mut heartbeat_interval = tokio::time::interval_at(start, self.config.heartbeat_interval);
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Stop(reply)) => {
                            debug!("GossipSub actor stopping");
                            self.shutdown();
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("GossipSub handle dropped, actor quitting");
                            self.shutdown();
                            break;
                        }
                    }
                }
                _ = heartbeat_interval.tick() => {
                    self.heartbeat();
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe(topic, reply) => {
                let _ = reply.send(self.handle_subscribe(&topic));
            }
            Command::Unsubscribe(topic, reply) => {
                let _ = reply.send(self.handle_unsubscribe(&topic));
            }
            Command::Publish(topic, data, options, reply) => {
                let _ = reply.send(self.handle_publish(&topic, data, options));
            }
            Command::GetTopics(reply) => {
                let _ = reply.send(self.subscriptions.iter().cloned().collect());
            }
            Command::GetSubscribers(topic, reply) => {
                let _ = reply.send(self.mesh.topic_peers(&topic));
            }
            Command::GetPeers(reply) => {
                let _ = reply.send(self.peers.keys().copied().collect());
            }
            Command::PeerConnected(peer, info, reply) => {
                self.add_peer(peer, info);
                let _ = reply.send(());
            }
            Command::PeerDisconnected(peer, reply) => {
                self.remove_peer(&peer);
                let _ = reply.send(());
            }
            Command::IncomingStream(peer, stream, reply) => {
                self.handle_incoming_stream(peer, stream);
                let _ = reply.send(());
            }
            Command::SetTopicValidator(topic, validator, reply) => {
                match validator {
                    Some(v) => self.validators.insert(topic, v),
                    None => self.validators.remove(&topic),
                };
                let _ = reply.send(());
            }
            Command::SetApplicationScore(peer, value, reply) => {
                let _ = reply.send(self.score.set_application_score(&peer, value));
            }
            Command::MeshPeers(topic, reply) => {
                let _ = reply.send(self.mesh.mesh_peers(&topic));
            }
            Command::FanoutPeers(topic, reply) => {
                let _ = reply.send(self.mesh.fanout_peers(&topic));
            }
            Command::ScoreOf(peer, reply) => {
                let _ = reply.send(self.peer_score(&peer));
            }
            Command::IDontWantCountOf(peer, reply) => {
                let _ = reply.send(self.idontwants.count_of(&peer));
            }
            Command::IDontWantLenOf(peer, reply) => {
                let _ = reply.send(self.idontwants.len_of(&peer));
            }
            Command::InboundRpc(peer, rpc) => {
                self.handle_rpc(peer, rpc);
            }
            Command::StreamOpened { peer, conn_id, result } => {
                self.handle_stream_opened(peer, conn_id, result);
            }
            Command::StreamFailed { peer, conn_id } => {
                if self.peers.get(&peer).is_some_and(|c| c.conn_id == conn_id) {
                    warn!(peer = %peer.short(), "stream failed, dropping peer");
                    self.remove_peer(&peer);
                }
            }
            Command::MalformedFrame { peer, conn_id } => {
                if self.peers.get(&peer).is_some_and(|c| c.conn_id == conn_id) {
                    // Penalize before removal so the negative score is retained.
                    self.score.add_penalty(&peer, 1.0);
                    self.remove_peer(&peer);
                }
            }
            Command::Stop(reply) => {
                let _ = reply.send(());
            }
        }
    }

    // ========================================================================
    // Peer Lifecycle
    // ========================================================================

    fn add_peer(&mut self, peer: Identity, info: Option<ConnectionInfo>) {
        if peer == self.local_identity {
            return;
        }
        let outbound = info.as_ref().is_some_and(|i| i.direction == Direction::Outbound);
        let ip: Option<IpAddr> = info.as_ref().and_then(|i| i.remote_ip);

        if let Some(conn) = self.peers.get_mut(&peer) {
            // Refresh details learned after an early inbound stream, or a
            // new address for a live peer.
            if info.is_some() {
                self.mesh.add_peer(peer, outbound);
            }
            if let Some(ip) = ip
                && conn.remote_ip != Some(ip)
            {
                if let Some(old) = conn.remote_ip.replace(ip) {
                    self.score.remove_ip(&peer, &old);
                }
                self.score.add_ip(&peer, ip);
            }
            return;
        }

        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;
        self.peers.insert(
            peer,
            PeerConnection {
                conn_id,
                remote_ip: ip,
                outbound: Outbound::Opening(Vec::new()),
                reader: None,
            },
        );
        self.mesh.add_peer(peer, outbound);
        self.score.add_peer(peer);
        if let Some(ip) = ip {
            self.score.add_ip(&peer, ip);
        }
        debug!(peer = %peer.short(), outbound, "peer connected");

        let streams = self.streams.clone();
        let cmd_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = streams.open_stream(&peer).await;
            if let Some(tx) = cmd_tx.upgrade() {
                let _ = tx.send(Command::StreamOpened { peer, conn_id, result }).await;
            }
        });
    }

    fn remove_peer(&mut self, peer: &Identity) {
        let Some(conn) = self.peers.remove(peer) else {
            return;
        };
        drop(conn);

        let left = self.mesh.remove_peer(peer);
        for topic in &left {
            self.untag_mesh_peer(peer, topic);
        }
        self.score.remove_peer(peer, Instant::now());
        self.control.remove_peer(peer);
        self.idontwants.remove_peer(peer);
        self.ihave_limits.remove_peer(peer);
        debug!(peer = %peer.short(), meshes = left.len(), "peer removed");
    }

    fn handle_incoming_stream(&mut self, peer: Identity, stream: BoxedStream) {
        if !self.peers.contains_key(&peer) {
            self.add_peer(peer, None);
        }
        let max_frame_size = self.max_frame_size();
        let cmd_tx = self.self_tx.clone();
        let Some(conn) = self.peers.get_mut(&peer) else {
            return;
        };
        if let Some(old) = conn.reader.take() {
            old.abort();
        }
        let conn_id = conn.conn_id;
        conn.reader = Some(tokio::spawn(read_loop(peer, conn_id, stream, max_frame_size, cmd_tx)));
        trace!(peer = %peer.short(), "inbound stream attached");
    }

    fn handle_stream_opened(&mut self, peer: Identity, conn_id: u64, result: anyhow::Result<BoxedStream>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                if self.peers.get(&peer).is_some_and(|c| c.conn_id == conn_id) {
                    warn!(peer = %peer.short(), error = %e, "failed to open stream, dropping peer");
                    self.remove_peer(&peer);
                }
                return;
            }
        };

        let queue_size = self.config.outbound_queue_size;
        let max_frame_size = self.max_frame_size();
        let cmd_tx = self.self_tx.clone();
        let Some(conn) = self.peers.get_mut(&peer) else {
            return;
        };
        if conn.conn_id != conn_id {
            return;
        }

        let (tx, rx) = mpsc::channel(queue_size);
        tokio::spawn(write_loop(peer, conn_id, stream, rx, max_frame_size, cmd_tx));
        let queued = match std::mem::replace(&mut conn.outbound, Outbound::Open(tx)) {
            Outbound::Opening(queued) => queued,
            Outbound::Open(_) => Vec::new(),
        };

        // Announce our subscriptions first.
        if !self.subscriptions.is_empty() {
            let subs = self
                .subscriptions
                .iter()
                .map(|topic| SubOpts { topic: topic.clone(), subscribe: true })
                .collect();
            self.send_rpc(&peer, Rpc::with_subscriptions(subs));
        }
        for rpc in queued {
            self.send_rpc(&peer, rpc);
        }
        trace!(peer = %peer.short(), "outbound stream open");
    }

    /// Queue one frame, piggybacking pending control. Returns `false` if the
    /// frame was dropped.
    fn send_rpc(&mut self, peer: &Identity, mut rpc: Rpc) -> bool {
        let mesh = &self.mesh;
        if let Some(pending) = self.control.take(peer, |topic| mesh.in_mesh(topic, peer)) {
            match rpc.control.as_mut() {
                Some(control) => control.extend(pending),
                None => rpc.control = Some(pending),
            }
        }
        if rpc.is_empty() {
            return false;
        }

        let queue_size = self.config.outbound_queue_size;
        let Some(conn) = self.peers.get_mut(peer) else {
            return false;
        };
        match &mut conn.outbound {
            Outbound::Open(tx) => match tx.try_send(rpc) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %peer.short(), "outbound queue full, dropping frame");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            },
            Outbound::Opening(queued) => {
                if queued.len() >= queue_size {
                    return false;
                }
                queued.push(rpc);
                true
            }
        }
    }

    fn tag_mesh_peer(&self, peer: &Identity, topic: &str) {
        self.queue_tag(TagOp::Tag(*peer, topic.to_string()));
    }

    fn untag_mesh_peer(&self, peer: &Identity, topic: &str) {
        self.queue_tag(TagOp::Untag(*peer, topic.to_string()));
    }

    fn queue_tag(&self, op: TagOp) {
        if !self.config.tag_mesh_peers {
            return;
        }
        if let Err(TrySendError::Full(_)) = self.tags.try_send(op) {
            warn!("peer store is behind, dropping mesh tag update");
        }
    }

    fn shutdown(&mut self) {
        for peer in self.control.pending_peers() {
            self.send_rpc(&peer, Rpc::default());
        }
        // Dropping the queues lets writers drain and close; readers abort on drop.
        self.peers.clear();
        self.mesh.clear();
        self.score.clear();
        self.mcache.clear();
        self.seen.clear();
        self.control.clear();
        self.idontwants.clear();
        self.promises.clear();
        self.subscriptions.clear();
        self.validators.clear();
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    fn handle_subscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        if topic.len() > MAX_TOPIC_LENGTH {
            anyhow::bail!("topic length {} exceeds maximum {}", topic.len(), MAX_TOPIC_LENGTH);
        }
        if !is_valid_topic(topic) {
            anyhow::bail!("invalid topic name");
        }
        if !self.subscriptions.insert(topic.to_string()) {
            return Ok(());
        }

        self.announce_subscription(topic, true);

        let now = Instant::now();
        let grafted = {
            let score = &self.score;
            let score_fn = |p: &Identity| score.score(p, now);
            self.mesh.join(topic, &score_fn, now)
        };
        for peer in grafted {
            self.score.graft(&peer, topic, now);
            let graft = ControlMessage {
                graft: vec![ControlGraft { topic: topic.to_string() }],
                ..Default::default()
            };
            self.send_rpc(&peer, Rpc::with_control(graft));
            self.tag_mesh_peer(&peer, topic);
            self.emit(GossipSubEvent::Graft { peer, topic: topic.to_string() });
        }

        debug!(topic = %topic, mesh = self.mesh.mesh_peers(topic).len(), "subscribed");
        Ok(())
    }

    fn handle_unsubscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        if !self.subscriptions.remove(topic) {
            return Ok(());
        }

        self.announce_subscription(topic, false);

        let now = Instant::now();
        let pruned = self.mesh.leave(topic, now);
        for peer in pruned {
            self.score.prune(&peer, topic);
            let prune = self.make_prune(&peer, topic, self.config.mesh.do_px, true);
            self.send_rpc(&peer, Rpc::with_control(ControlMessage { prune: vec![prune], ..Default::default() }));
            self.untag_mesh_peer(&peer, topic);
            self.emit(GossipSubEvent::Prune { peer, topic: topic.to_string() });
        }

        debug!(topic = %topic, "unsubscribed");
        Ok(())
    }

    fn announce_subscription(&mut self, topic: &str, subscribe: bool) {
        let peers: Vec<Identity> = self.peers.keys().copied().collect();
        for peer in peers {
            let sub = SubOpts { topic: topic.to_string(), subscribe };
            self.send_rpc(&peer, Rpc::with_subscriptions(vec![sub]));
        }
    }

    // ========================================================================
    // Publish
    // ========================================================================

    fn handle_publish(&mut self, topic: &str, data: Vec<u8>, options: PublishOptions) -> anyhow::Result<PublishResult> {
        if data.len() > self.config.max_transmit_size {
            return Err(PublishError::from(MessageRejection::MessageTooLarge).into());
        }
        if topic.len() > MAX_TOPIC_LENGTH {
            return Err(PublishError::from(MessageRejection::TopicTooLong).into());
        }
        if !is_valid_topic(topic) {
            return Err(PublishError::from(MessageRejection::InvalidTopic).into());
        }

        let message = self.build_message(topic, data);
        let id = message_id(&message, self.config.signature_policy);
        let now = Instant::now();
        if self.seen.contains(&id, now) || self.mcache.contains(&id) {
            return Err(PublishError::Duplicate.into());
        }

        let recipients = self.select_publish_peers(topic, now);
        let will_send_to_self = self.config.emit_self && self.subscriptions.contains(topic);
        let allow_zero = options.allow_publish_to_zero_topic_peers || self.config.allow_publish_to_zero_topic_peers;
        if recipients.is_empty() && !allow_zero && !will_send_to_self {
            return Err(PublishError::NoPeersSubscribedToTopic.into());
        }

        self.seen.put(id, now);
        self.mcache.put(id, message.clone());

        let mut sent = Vec::with_capacity(recipients.len());
        for peer in recipients {
            if self.send_rpc(&peer, Rpc::with_messages(vec![message.clone()])) {
                sent.push(peer);
            }
        }

        if will_send_to_self {
            self.emit(GossipSubEvent::Message {
                propagation_source: self.local_identity,
                id,
                message,
            });
        }

        debug!(
            topic = %topic,
            msg_id = %hex::encode(&id[..8]),
            recipients = sent.len(),
            "published message"
        );
        Ok(PublishResult { id, recipients: sent })
    }

    fn build_message(&mut self, topic: &str, data: Vec<u8>) -> Message {
        match self.config.signature_policy {
            SignaturePolicy::StrictSign => {
                self.seqno = self.seqno.wrapping_add(1);
                let mut message = Message {
                    from: Some(self.local_identity),
                    seqno: Some(self.seqno),
                    topic: topic.to_string(),
                    data,
                    signature: None,
                };
                if let Some(payload) = message.signed_payload() {
                    message.signature = Some(sign_with_domain(&self.keypair, GOSSIPSUB_SIGNATURE_DOMAIN, &payload));
                }
                message
            }
            SignaturePolicy::StrictNoSign => Message {
                from: None,
                seqno: None,
                topic: topic.to_string(),
                data,
                signature: None,
            },
        }
    }

    fn select_publish_peers(&mut self, topic: &str, now: Instant) -> Vec<Identity> {
        let threshold = self.config.score_thresholds.publish_threshold;
        let score = &self.score;
        let score_fn = |p: &Identity| score.score(p, now);

        if self.config.flood_publish {
            return self
                .mesh
                .topic_peers(topic)
                .into_iter()
                .filter(|p| score_fn(p) >= threshold)
                .collect();
        }

        if self.mesh.has_mesh(topic) {
            let mut peers: HashSet<Identity> = self.mesh.mesh_peers(topic).into_iter().collect();
            let d = self.mesh.config().d;
            if peers.len() < d {
                let extra = self
                    .mesh
                    .random_peers(topic, d - peers.len(), |p| !peers.contains(p) && score_fn(p) >= threshold);
                peers.extend(extra);
            }
            return peers.into_iter().collect();
        }

        self.mesh.fanout_for_publish(topic, threshold, &score_fn, now)
    }

    // ========================================================================
    // Inbound RPC
    // ========================================================================

    fn handle_rpc(&mut self, from: Identity, rpc: Rpc) {
        if !self.peers.contains_key(&from) {
            return;
        }
        let score = self.peer_score(&from);
        if score < self.config.score_thresholds.graylist_threshold {
            debug!(peer = %from.short(), score, "ignoring RPC from graylisted peer");
            return;
        }

        for sub in rpc.subscriptions {
            self.handle_subscription(from, sub);
        }

        for message in rpc.messages {
            self.handle_received_message(from, message);
        }

        if let Some(control) = rpc.control {
            self.handle_control(from, control);
        }
    }

    fn handle_subscription(&mut self, from: Identity, sub: SubOpts) {
        if !is_valid_topic(&sub.topic) {
            return;
        }
        if sub.subscribe {
            if self.mesh.add_subscription(from, &sub.topic) {
                trace!(peer = %from.short(), topic = %sub.topic, "peer subscribed");
                self.emit(GossipSubEvent::SubscriptionChange { peer: from, topic: sub.topic, subscribed: true });
            }
        } else if self.mesh.is_subscribed(&from, &sub.topic) {
            if self.mesh.remove_subscription(&from, &sub.topic) {
                self.score.prune(&from, &sub.topic);
                self.untag_mesh_peer(&from, &sub.topic);
            }
            trace!(peer = %from.short(), topic = %sub.topic, "peer unsubscribed");
            self.emit(GossipSubEvent::SubscriptionChange { peer: from, topic: sub.topic, subscribed: false });
        }
    }

    fn validate_structure(&self, message: &Message) -> Result<(), InvalidMessage> {
        if message.data.len() > self.config.max_inbound_data_length {
            return Err(InvalidMessage::TooLarge(message.data.len()));
        }
        if !is_valid_topic(&message.topic) {
            return Err(InvalidMessage::InvalidTopic);
        }
        match self.config.signature_policy {
            SignaturePolicy::StrictSign => {
                let (Some(from), Some(signature)) = (message.from.as_ref(), message.signature.as_ref()) else {
                    return Err(InvalidMessage::MissingAuthor);
                };
                if !from.is_valid() {
                    return Err(InvalidMessage::InvalidAuthor);
                }
                let payload = message.signed_payload().ok_or(InvalidMessage::MissingAuthor)?;
                verify_with_domain(from, GOSSIPSUB_SIGNATURE_DOMAIN, &payload, signature)
                    .map_err(InvalidMessage::Signature)
            }
            SignaturePolicy::StrictNoSign => {
                if message.from.is_some() || message.seqno.is_some() || message.signature.is_some() {
                    return Err(InvalidMessage::UnexpectedAuthor);
                }
                Ok(())
            }
        }
    }

    fn handle_received_message(&mut self, from: Identity, message: Message) {
        let topic = message.topic.clone();
        if !self.subscriptions.contains(&topic) && !self.config.can_relay_message {
            trace!(peer = %from.short(), topic = %topic, "ignoring message on unsubscribed topic");
            return;
        }

        let now = Instant::now();
        let id = message_id(&message, self.config.signature_policy);

        if self.seen.contains(&id, now) || self.mcache.contains(&id) {
            self.score.duplicate_message(&from, id, &topic, now);
            self.mcache.observe_duplicate(&id, from);
            trace!(peer = %from.short(), msg_id = %hex::encode(&id[..8]), "duplicate message");
            return;
        }
        self.seen.put(id, now);
        self.score.validate_message(id, now);

        if let Err(reason) = self.validate_structure(&message) {
            warn!(peer = %from.short(), topic = %topic, error = %reason, "invalid message");
            self.score.reject_message(&from, id, &topic, RejectReason::Error, now);
            return;
        }

        if message.data.len() > self.config.idontwant_min_data_size {
            self.send_idontwant(&topic, id, &from, message.from.as_ref());
        }

        let verdict = self
            .validators
            .get(&topic)
            .map(|v| v.validate(&from, &message))
            .unwrap_or(ValidationResult::Accept);
        match verdict {
            ValidationResult::Accept => {}
            ValidationResult::Reject => {
                debug!(peer = %from.short(), topic = %topic, "message rejected by validator");
                self.promises.fulfil(&id);
                self.score.reject_message(&from, id, &topic, RejectReason::Reject, now);
                return;
            }
            ValidationResult::Ignore => {
                trace!(peer = %from.short(), topic = %topic, "message ignored by validator");
                self.promises.fulfil(&id);
                self.score.reject_message(&from, id, &topic, RejectReason::Ignore, now);
                return;
            }
        }

        self.promises.fulfil(&id);
        self.score.deliver_message(&from, id, &topic, now);
        self.mcache.put(id, message.clone());
        self.mcache.observe_duplicate(&id, from);

        if self.subscriptions.contains(&topic) {
            self.emit(GossipSubEvent::Message {
                propagation_source: from,
                id,
                message: message.clone(),
            });
        }

        self.forward_message(&from, id, message);
    }

    fn send_idontwant(&mut self, topic: &str, id: MessageId, from: &Identity, origin: Option<&Identity>) {
        for peer in self.mesh.mesh_peers(topic) {
            if peer == *from || Some(&peer) == origin {
                continue;
            }
            let control = ControlMessage {
                idontwant: vec![ControlIDontWant { message_ids: vec![id] }],
                ..Default::default()
            };
            self.send_rpc(&peer, Rpc::with_control(control));
        }
    }

    fn forward_message(&mut self, propagation_source: &Identity, id: MessageId, message: Message) {
        let topic = message.topic.clone();
        let mut targets = self.mesh.mesh_peers(&topic);
        if targets.is_empty() && !self.mesh.has_mesh(&topic) {
            targets = self.mesh.fanout_peers(&topic);
        }

        let already_have = self.mcache.originating_peers(&id).cloned().unwrap_or_default();
        let mut forwarded = 0usize;
        for peer in targets {
            if peer == *propagation_source
                || Some(&peer) == message.from.as_ref()
                || already_have.contains(&peer)
                || self.idontwants.contains(&peer, &id)
            {
                continue;
            }
            if self.send_rpc(&peer, Rpc::with_messages(vec![message.clone()])) {
                forwarded += 1;
            }
        }
        trace!(topic = %topic, msg_id = %hex::encode(&id[..8]), forwarded, "forwarded message");
    }

    // ========================================================================
    // Control Handling
    // ========================================================================

    fn handle_control(&mut self, from: Identity, control: ControlMessage) {
        let iwant = self.handle_ihave(&from, control.ihave);
        let messages = self.handle_iwant(&from, control.iwant);
        let prune = self.handle_graft(&from, control.graft);
        self.handle_prune(&from, control.prune);
        self.handle_idontwant(&from, control.idontwant);

        if iwant.is_empty() && messages.is_empty() && prune.is_empty() {
            return;
        }
        let reply = Rpc {
            subscriptions: Vec::new(),
            messages,
            control: Some(ControlMessage { iwant, prune, ..Default::default() }),
        };
        self.send_rpc(&from, reply);
    }

    fn handle_ihave(&mut self, from: &Identity, ihave: Vec<ControlIHave>) -> Vec<ControlIWant> {
        if ihave.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();
        let score = self.score.score(from, now);
        if score < self.config.score_thresholds.gossip_threshold {
            trace!(peer = %from.short(), score, "ignoring IHAVE below gossip threshold");
            return Vec::new();
        }
        if !self.ihave_limits.admit(from) {
            debug!(peer = %from.short(), "IHAVE flood limit reached");
            return Vec::new();
        }

        let mut wanted: HashSet<MessageId> = HashSet::new();
        for entry in ihave {
            if !self.mesh.has_mesh(&entry.topic) {
                continue;
            }
            for id in entry.message_ids {
                if !self.seen.contains(&id, now) && !self.mcache.contains(&id) {
                    wanted.insert(id);
                }
            }
        }
        if wanted.is_empty() {
            return Vec::new();
        }

        let budget = self.ihave_limits.remaining_asks(from);
        let mut ids: Vec<MessageId> = wanted.into_iter().collect();
        ids.shuffle(&mut rand::thread_rng());
        ids.truncate(budget);
        if ids.is_empty() {
            return Vec::new();
        }

        self.ihave_limits.record_asks(from, ids.len());
        self.promises.add_promise(*from, &ids, now);
        trace!(peer = %from.short(), count = ids.len(), "requesting messages via IWANT");
        vec![ControlIWant { message_ids: ids }]
    }

    fn handle_iwant(&mut self, from: &Identity, iwant: Vec<ControlIWant>) -> Vec<Message> {
        if iwant.is_empty() {
            return Vec::new();
        }
        let score = self.peer_score(from);
        if score < self.config.score_thresholds.gossip_threshold {
            trace!(peer = %from.short(), score, "ignoring IWANT below gossip threshold");
            return Vec::new();
        }

        let limit = self.config.cache.gossip_retransmission;
        let mut out: HashMap<MessageId, Message> = HashMap::new();
        for entry in iwant {
            for id in entry.message_ids {
                let Some((message, count)) = self.mcache.get_for_iwant(&id, *from) else {
                    continue;
                };
                if count > limit {
                    trace!(peer = %from.short(), msg_id = %hex::encode(&id[..8]), "IWANT retransmission limit reached");
                    continue;
                }
                out.insert(id, message.clone());
            }
        }
        out.into_values().collect()
    }

    fn handle_graft(&mut self, from: &Identity, graft: Vec<ControlGraft>) -> Vec<ControlPrune> {
        if graft.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();
        let score = self.peer_score(from);
        let mut do_px = self.config.mesh.do_px;
        let mut rejected: Vec<String> = Vec::new();

        for ControlGraft { topic } in graft {
            if !self.mesh.has_mesh(&topic) {
                // Unknown topic: do not leak peers via PX.
                do_px = false;
                continue;
            }
            if self.mesh.in_mesh(&topic, from) {
                continue;
            }

            if let Some(expiry) = self.mesh.backoff_expiry(&topic, from)
                && now < expiry
            {
                debug!(peer = %from.short(), topic = %topic, "GRAFT during backoff");
                self.score.add_penalty(from, 1.0);
                do_px = false;
                let flood_cutoff = (expiry + self.config.mesh.graft_flood_threshold)
                    .checked_sub(self.config.mesh.prune_backoff);
                if flood_cutoff.is_some_and(|cutoff| now < cutoff) {
                    self.score.add_penalty(from, 1.0);
                }
                self.mesh.add_prune_backoff(&topic, *from, now);
                rejected.push(topic);
                continue;
            }

            if score < 0.0 {
                debug!(peer = %from.short(), topic = %topic, score, "GRAFT from negative-score peer");
                do_px = false;
                self.mesh.add_prune_backoff(&topic, *from, now);
                rejected.push(topic);
                continue;
            }

            if self.mesh.mesh_peers(&topic).len() >= self.config.mesh.d_hi && !self.mesh.is_outbound(from) {
                trace!(peer = %from.short(), topic = %topic, "mesh full, refusing GRAFT");
                self.mesh.add_prune_backoff(&topic, *from, now);
                rejected.push(topic);
                continue;
            }

            if self.mesh.graft(&topic, *from) {
                self.score.graft(from, &topic, now);
                self.tag_mesh_peer(from, &topic);
                trace!(peer = %from.short(), topic = %topic, "accepted GRAFT");
                self.emit(GossipSubEvent::Graft { peer: *from, topic });
            }
        }

        rejected
            .into_iter()
            .map(|topic| self.make_prune(from, &topic, do_px, false))
            .collect()
    }

    fn handle_prune(&mut self, from: &Identity, prune: Vec<ControlPrune>) {
        if prune.is_empty() {
            return;
        }
        let now = Instant::now();
        let score = self.peer_score(from);

        for ControlPrune { topic, peers, backoff_secs } in prune {
            if !self.mesh.has_mesh(&topic) {
                continue;
            }
            if self.mesh.prune(&topic, from) {
                self.score.prune(from, &topic);
                self.untag_mesh_peer(from, &topic);
                self.emit(GossipSubEvent::Prune { peer: *from, topic: topic.clone() });
            }
            match backoff_secs {
                Some(secs) => {
                    let backoff = Duration::from_secs(secs).min(MAX_REMOTE_BACKOFF);
                    self.mesh.add_backoff(&topic, *from, backoff, now);
                }
                None => self.mesh.add_prune_backoff(&topic, *from, now),
            }
            trace!(peer = %from.short(), topic = %topic, "received PRUNE");

            if peers.is_empty() {
                continue;
            }
            if score < self.config.score_thresholds.accept_px_threshold {
                trace!(peer = %from.short(), score, "ignoring PX below threshold");
                continue;
            }
            let peers: Vec<PeerRecord> = peers
                .into_iter()
                .filter(|r| r.peer != self.local_identity)
                .take(self.config.mesh.prune_peers)
                .collect();
            if !peers.is_empty() {
                debug!(peer = %from.short(), topic = %topic, count = peers.len(), "peer exchange received");
                self.emit(GossipSubEvent::PeerExchange { from: *from, topic, peers });
            }
        }
    }

    fn handle_idontwant(&mut self, from: &Identity, idontwant: Vec<ControlIDontWant>) {
        for entry in idontwant {
            let accepted = self.idontwants.record(*from, &entry.message_ids, self.tick);
            if accepted < entry.message_ids.len() {
                trace!(
                    peer = %from.short(),
                    dropped = entry.message_ids.len() - accepted,
                    "IDONTWANT limit reached"
                );
            }
        }
    }

    fn make_prune(&self, peer: &Identity, topic: &str, do_px: bool, on_unsubscribe: bool) -> ControlPrune {
        let backoff = if on_unsubscribe {
            self.config.mesh.unsubscribe_backoff
        } else {
            self.config.mesh.prune_backoff
        };
        let peers = if do_px {
            let now = Instant::now();
            let score = &self.score;
            let score_fn = |p: &Identity| score.score(p, now);
            self.mesh
                .px_candidates(topic, peer, &score_fn)
                .into_iter()
                .map(|p| PeerRecord { peer: p, signed_record: None })
                .collect()
        } else {
            Vec::new()
        };
        ControlPrune {
            topic: topic.to_string(),
            peers,
            backoff_secs: Some(backoff.as_secs()),
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn heartbeat(&mut self) {
        self.tick += 1;
        let tick = self.tick;
        let now = Instant::now();

        for topic in self.mesh.mesh_topics() {
            let changes = {
                let score = &self.score;
                let score_fn = |p: &Identity| score.score(p, now);
                let threshold = self.config.score_thresholds.opportunistic_graft_threshold;
                self.mesh.maintain(&topic, tick, threshold, &score_fn, now)
            };
            self.apply_mesh_changes(&topic, changes, now);

            let exclude: HashSet<Identity> = self.mesh.mesh_peers(&topic).into_iter().collect();
            self.emit_gossip(&topic, &exclude, now);
        }

        self.mesh.expire_fanout(now);
        for topic in self.mesh.fanout_topics() {
            {
                let score = &self.score;
                let score_fn = |p: &Identity| score.score(p, now);
                let threshold = self.config.score_thresholds.publish_threshold;
                self.mesh.maintain_fanout(&topic, threshold, &score_fn);
            }
            let exclude: HashSet<Identity> = self.mesh.fanout_peers(&topic).into_iter().collect();
            self.emit_gossip(&topic, &exclude, now);
        }

        self.score.refresh_if_due(now);
        for (peer, broken) in self.promises.take_broken(now) {
            debug!(peer = %peer.short(), broken, "peer broke IWANT promises");
            self.score.add_penalty(&peer, broken as f64);
        }

        self.idontwants.reset_counts();
        self.idontwants.expire(tick);
        self.ihave_limits.reset();
        self.seen.prune(now);
        if self.config.mesh.prune_backoff_ticks > 0 && tick % self.config.mesh.prune_backoff_ticks == 0 {
            self.mesh.sweep_backoff(now);
        }

        for peer in self.control.pending_peers() {
            self.send_rpc(&peer, Rpc::default());
        }

        // Rotate only after gossip, so the newest window is still advertised.
        self.mcache.shift();

        trace!(tick, "heartbeat");
        self.emit(GossipSubEvent::Heartbeat { tick });
    }

    fn apply_mesh_changes(&mut self, topic: &str, changes: MeshChanges, now: Instant) {
        for peer in changes.graft {
            self.score.graft(&peer, topic, now);
            self.control.push_control(
                peer,
                ControlMessage {
                    graft: vec![ControlGraft { topic: topic.to_string() }],
                    ..Default::default()
                },
            );
            self.tag_mesh_peer(&peer, topic);
            self.emit(GossipSubEvent::Graft { peer, topic: topic.to_string() });
        }

        for (peer, px) in changes.prune {
            self.score.prune(&peer, topic);
            let prune = self.make_prune(&peer, topic, px && self.config.mesh.do_px, false);
            self.control.push_control(peer, ControlMessage { prune: vec![prune], ..Default::default() });
            self.untag_mesh_peer(&peer, topic);
            self.emit(GossipSubEvent::Prune { peer, topic: topic.to_string() });
        }
    }

    fn emit_gossip(&mut self, topic: &str, exclude: &HashSet<Identity>, now: Instant) {
        let topics: HashSet<String> = [topic.to_string()].into_iter().collect();
        let Some(ids) = self.mcache.gossip_ids(&topics).remove(topic) else {
            return;
        };
        if ids.is_empty() {
            return;
        }

        let targets = {
            let score = &self.score;
            let score_fn = |p: &Identity| score.score(p, now);
            let threshold = self.config.score_thresholds.gossip_threshold;
            self.mesh.gossip_targets(topic, exclude, threshold, &score_fn)
        };

        let max_ids = self.config.max_ihave_length;
        for peer in targets {
            let mut peer_ids = ids.clone();
            if peer_ids.len() > max_ids {
                peer_ids.shuffle(&mut rand::thread_rng());
                peer_ids.truncate(max_ids);
            }
            self.control.push_gossip(peer, ControlIHave { topic: topic.to_string(), message_ids: peer_ids });
        }
    }
}
