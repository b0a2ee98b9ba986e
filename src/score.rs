//! # Peer Scoring (GossipSub v1.1)
//!
//! Every connected peer carries a scalar score built from per-topic counters
//! and a few global terms:
//!
//! ```text
//! score = min(Σ_topic topic_weight · topic_score, topic_score_cap)
//!       + app_specific_weight        · app_score                       (P5)
//!       + ip_colocation_factor_weight · Σ_ip max(0, peers_on_ip − θ)²   (P6)
//!       + behaviour_penalty_weight   · max(0, penalty − θ)²            (P7)
//!
//! topic_score = w1 · min(mesh_time / quantum, cap)                     (P1)
//!             + w2 · first_message_deliveries                          (P2)
//!             + w3 · deficit²   (active and below threshold)           (P3)
//!             + w3b · mesh_failure_penalty                             (P3b)
//!             + w4 · invalid_message_deliveries²                       (P4)
//! ```
//!
//! Counters decay multiplicatively once per `decay_interval` and snap to zero
//! below `decay_to_zero`. Only topics listed in [`PeerScoreParams::topics`]
//! contribute.
//!
//! ## Retention
//!
//! A disconnecting peer with a non-positive score keeps its record for
//! `retain_score`, so reconnecting does not launder a bad score.
//!
//! ## Thresholds
//!
//! | Threshold | Below it |
//! |-----------|----------|
//! | `gossip_threshold` | no IHAVE/IWANT exchanged |
//! | `publish_threshold` | not a publish / fanout target |
//! | `graylist_threshold` | RPCs ignored entirely |
//! | `accept_px_threshold` | PRUNE peer exchange ignored |
//! | `opportunistic_graft_threshold` | median mesh score triggers opportunistic graft |

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use thiserror::Error;
use tracing::trace;

use crate::identity::Identity;
use crate::messages::MessageId;

// ============================================================================
// Default Parameters
// ============================================================================

pub const DEFAULT_TOPIC_SCORE_CAP: f64 = 10.0;
pub const DEFAULT_APP_SPECIFIC_WEIGHT: f64 = 10.0;
pub const DEFAULT_IP_COLOCATION_FACTOR_WEIGHT: f64 = -5.0;
pub const DEFAULT_IP_COLOCATION_FACTOR_THRESHOLD: f64 = 10.0;
pub const DEFAULT_BEHAVIOUR_PENALTY_WEIGHT: f64 = -10.0;
pub const DEFAULT_BEHAVIOUR_PENALTY_THRESHOLD: f64 = 0.0;
pub const DEFAULT_BEHAVIOUR_PENALTY_DECAY: f64 = 0.2;
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DECAY_TO_ZERO: f64 = 0.1;
pub const DEFAULT_RETAIN_SCORE: Duration = Duration::from_secs(3600);

pub const DEFAULT_TOPIC_WEIGHT: f64 = 0.5;
pub const DEFAULT_TIME_IN_MESH_WEIGHT: f64 = 1.0;
pub const DEFAULT_TIME_IN_MESH_QUANTUM: Duration = Duration::from_secs(1);
pub const DEFAULT_TIME_IN_MESH_CAP: f64 = 3600.0;
pub const DEFAULT_FIRST_MESSAGE_DELIVERIES_WEIGHT: f64 = 1.0;
pub const DEFAULT_FIRST_MESSAGE_DELIVERIES_DECAY: f64 = 0.5;
pub const DEFAULT_FIRST_MESSAGE_DELIVERIES_CAP: f64 = 2000.0;
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_WEIGHT: f64 = -1.0;
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_DECAY: f64 = 0.5;
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_CAP: f64 = 100.0;
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_THRESHOLD: f64 = 20.0;
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_WINDOW: Duration = Duration::from_millis(10);
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_ACTIVATION: Duration = Duration::from_secs(5);
pub const DEFAULT_MESH_FAILURE_PENALTY_WEIGHT: f64 = -1.0;
pub const DEFAULT_MESH_FAILURE_PENALTY_DECAY: f64 = 0.5;
pub const DEFAULT_INVALID_MESSAGE_DELIVERIES_WEIGHT: f64 = -1.0;
pub const DEFAULT_INVALID_MESSAGE_DELIVERIES_DECAY: f64 = 0.3;

pub const DEFAULT_GOSSIP_THRESHOLD: f64 = -10.0;
pub const DEFAULT_PUBLISH_THRESHOLD: f64 = -50.0;
pub const DEFAULT_GRAYLIST_THRESHOLD: f64 = -80.0;
pub const DEFAULT_ACCEPT_PX_THRESHOLD: f64 = 10.0;
pub const DEFAULT_OPPORTUNISTIC_GRAFT_THRESHOLD: f64 = 20.0;

/// Maximum delivery records kept for duplicate attribution.
/// SECURITY: Bounds the per-message bookkeeping under id flooding.
pub const MAX_DELIVERY_RECORDS: usize = 100_000;

/// Delivery records older than this are swept on refresh.
pub const DELIVERY_RECORD_TTL: Duration = Duration::from_secs(120);

// ============================================================================
// Parameter Types
// ============================================================================

/// Scoring parameters for one topic.
#[derive(Clone, Debug, PartialEq)]
pub struct TopicScoreParams {
    pub topic_weight: f64,

    // P1
    pub time_in_mesh_weight: f64,
    pub time_in_mesh_quantum: Duration,
    pub time_in_mesh_cap: f64,

    // P2
    pub first_message_deliveries_weight: f64,
    pub first_message_deliveries_decay: f64,
    pub first_message_deliveries_cap: f64,

    // P3
    pub mesh_message_deliveries_weight: f64,
    pub mesh_message_deliveries_decay: f64,
    pub mesh_message_deliveries_cap: f64,
    pub mesh_message_deliveries_threshold: f64,
    /// Duplicates arriving later than this after validation do not count.
    pub mesh_message_deliveries_window: Duration,
    pub mesh_message_deliveries_activation: Duration,

    // P3b
    pub mesh_failure_penalty_weight: f64,
    pub mesh_failure_penalty_decay: f64,

    // P4
    pub invalid_message_deliveries_weight: f64,
    pub invalid_message_deliveries_decay: f64,
}

impl Default for TopicScoreParams {
    fn default() -> Self {
        Self {
            topic_weight: DEFAULT_TOPIC_WEIGHT,
            time_in_mesh_weight: DEFAULT_TIME_IN_MESH_WEIGHT,
            time_in_mesh_quantum: DEFAULT_TIME_IN_MESH_QUANTUM,
            time_in_mesh_cap: DEFAULT_TIME_IN_MESH_CAP,
            first_message_deliveries_weight: DEFAULT_FIRST_MESSAGE_DELIVERIES_WEIGHT,
            first_message_deliveries_decay: DEFAULT_FIRST_MESSAGE_DELIVERIES_DECAY,
            first_message_deliveries_cap: DEFAULT_FIRST_MESSAGE_DELIVERIES_CAP,
            mesh_message_deliveries_weight: DEFAULT_MESH_MESSAGE_DELIVERIES_WEIGHT,
            mesh_message_deliveries_decay: DEFAULT_MESH_MESSAGE_DELIVERIES_DECAY,
            mesh_message_deliveries_cap: DEFAULT_MESH_MESSAGE_DELIVERIES_CAP,
            mesh_message_deliveries_threshold: DEFAULT_MESH_MESSAGE_DELIVERIES_THRESHOLD,
            mesh_message_deliveries_window: DEFAULT_MESH_MESSAGE_DELIVERIES_WINDOW,
            mesh_message_deliveries_activation: DEFAULT_MESH_MESSAGE_DELIVERIES_ACTIVATION,
            mesh_failure_penalty_weight: DEFAULT_MESH_FAILURE_PENALTY_WEIGHT,
            mesh_failure_penalty_decay: DEFAULT_MESH_FAILURE_PENALTY_DECAY,
            invalid_message_deliveries_weight: DEFAULT_INVALID_MESSAGE_DELIVERIES_WEIGHT,
            invalid_message_deliveries_decay: DEFAULT_INVALID_MESSAGE_DELIVERIES_DECAY,
        }
    }
}

impl TopicScoreParams {
    pub fn validate(&self) -> Result<(), ScoreParamsError> {
        validate_topic_score_params(self)
    }
}

/// Global scoring parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerScoreParams {
    /// Per-topic parameters. Topics absent here do not affect the score.
    pub topics: HashMap<String, TopicScoreParams>,
    /// Cap on the aggregate positive topic contribution (0 = uncapped).
    pub topic_score_cap: f64,
    pub app_specific_weight: f64,
    pub ip_colocation_factor_weight: f64,
    pub ip_colocation_factor_threshold: f64,
    /// IPs exempt from colocation counting.
    pub ip_colocation_factor_whitelist: HashSet<IpAddr>,
    pub behaviour_penalty_weight: f64,
    pub behaviour_penalty_threshold: f64,
    pub behaviour_penalty_decay: f64,
    pub decay_interval: Duration,
    pub decay_to_zero: f64,
    /// How long a disconnected peer's non-positive score is remembered.
    pub retain_score: Duration,
}

impl Default for PeerScoreParams {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            topic_score_cap: DEFAULT_TOPIC_SCORE_CAP,
            app_specific_weight: DEFAULT_APP_SPECIFIC_WEIGHT,
            ip_colocation_factor_weight: DEFAULT_IP_COLOCATION_FACTOR_WEIGHT,
            ip_colocation_factor_threshold: DEFAULT_IP_COLOCATION_FACTOR_THRESHOLD,
            ip_colocation_factor_whitelist: HashSet::new(),
            behaviour_penalty_weight: DEFAULT_BEHAVIOUR_PENALTY_WEIGHT,
            behaviour_penalty_threshold: DEFAULT_BEHAVIOUR_PENALTY_THRESHOLD,
            behaviour_penalty_decay: DEFAULT_BEHAVIOUR_PENALTY_DECAY,
            decay_interval: DEFAULT_DECAY_INTERVAL,
            decay_to_zero: DEFAULT_DECAY_TO_ZERO,
            retain_score: DEFAULT_RETAIN_SCORE,
        }
    }
}

impl PeerScoreParams {
    pub fn validate(&self) -> Result<(), ScoreParamsError> {
        validate_peer_score_params(self)
    }
}

/// Score cutoffs gating protocol participation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeerScoreThresholds {
    pub gossip_threshold: f64,
    pub publish_threshold: f64,
    pub graylist_threshold: f64,
    pub accept_px_threshold: f64,
    pub opportunistic_graft_threshold: f64,
}

impl Default for PeerScoreThresholds {
    fn default() -> Self {
        Self {
            gossip_threshold: DEFAULT_GOSSIP_THRESHOLD,
            publish_threshold: DEFAULT_PUBLISH_THRESHOLD,
            graylist_threshold: DEFAULT_GRAYLIST_THRESHOLD,
            accept_px_threshold: DEFAULT_ACCEPT_PX_THRESHOLD,
            opportunistic_graft_threshold: DEFAULT_OPPORTUNISTIC_GRAFT_THRESHOLD,
        }
    }
}

impl PeerScoreThresholds {
    pub fn validate(&self) -> Result<(), ThresholdsError> {
        if !(self.gossip_threshold <= 0.0) {
            return Err(ThresholdsError::GossipThreshold);
        }
        if !(self.publish_threshold <= 0.0 && self.publish_threshold <= self.gossip_threshold) {
            return Err(ThresholdsError::PublishThreshold);
        }
        if !(self.graylist_threshold <= 0.0 && self.graylist_threshold <= self.publish_threshold) {
            return Err(ThresholdsError::GraylistThreshold);
        }
        if !(self.accept_px_threshold >= 0.0) {
            return Err(ThresholdsError::AcceptPxThreshold);
        }
        if !(self.opportunistic_graft_threshold >= 0.0) {
            return Err(ThresholdsError::OpportunisticGraftThreshold);
        }
        Ok(())
    }
}

// ============================================================================
// Validation
// ============================================================================

/// One variant per violated scoring rule.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreParamsError {
    #[error("invalid score parameters for topic {topic}: {source}")]
    Topic {
        topic: String,
        #[source]
        source: Box<ScoreParamsError>,
    },
    #[error("invalid topic score cap; must be positive (or 0 for no cap)")]
    TopicScoreCap,
    #[error("invalid IPColocationFactorWeight; must be negative (or 0 to disable)")]
    IpColocationFactorWeight,
    #[error("invalid IPColocationFactorThreshold; must be at least 1")]
    IpColocationFactorThreshold,
    #[error("invalid BehaviourPenaltyWeight; must be negative (or 0 to disable)")]
    BehaviourPenaltyWeight,
    #[error("invalid BehaviourPenaltyDecay; must be in (0, 1]")]
    BehaviourPenaltyDecay,
    #[error("invalid DecayInterval; must be at least 1s")]
    DecayInterval,
    #[error("invalid DecayToZero; must be between 0 and 1")]
    DecayToZero,
    #[error("invalid topic weight; must be >= 0")]
    TopicWeight,
    #[error("invalid TimeInMeshQuantum; must be non zero")]
    TimeInMeshQuantum,
    #[error("invalid TimeInMeshWeight; must be positive (or 0 to disable)")]
    TimeInMeshWeight,
    #[error("invalid TimeInMeshCap; must be positive")]
    TimeInMeshCap,
    #[error("invalid FirstMessageDeliveriesWeight; must be positive (or 0 to disable)")]
    FirstMessageDeliveriesWeight,
    #[error("invalid FirstMessageDeliveriesDecay; must be in (0, 1]")]
    FirstMessageDeliveriesDecay,
    #[error("invalid FirstMessageDeliveriesCap; must be positive")]
    FirstMessageDeliveriesCap,
    #[error("invalid MeshMessageDeliveriesWeight; must be negative (or 0 to disable)")]
    MeshMessageDeliveriesWeight,
    #[error("invalid MeshMessageDeliveriesDecay; must be in (0, 1]")]
    MeshMessageDeliveriesDecay,
    #[error("invalid MeshMessageDeliveriesCap; must be positive")]
    MeshMessageDeliveriesCap,
    #[error("invalid MeshMessageDeliveriesThreshold; must be positive")]
    MeshMessageDeliveriesThreshold,
    #[error("invalid MeshMessageDeliveriesActivation; must be at least 1s")]
    MeshMessageDeliveriesActivation,
    #[error("invalid MeshFailurePenaltyWeight; must be negative (or 0 to disable)")]
    MeshFailurePenaltyWeight,
    #[error("invalid MeshFailurePenaltyDecay; must be in (0, 1]")]
    MeshFailurePenaltyDecay,
    #[error("invalid InvalidMessageDeliveriesWeight; must be negative (or 0 to disable)")]
    InvalidMessageDeliveriesWeight,
    #[error("invalid InvalidMessageDeliveriesDecay; must be in (0, 1]")]
    InvalidMessageDeliveriesDecay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThresholdsError {
    #[error("invalid gossip threshold; it must be <= 0")]
    GossipThreshold,
    #[error("invalid publish threshold; it must be <= 0 and <= gossip threshold")]
    PublishThreshold,
    #[error("invalid graylist threshold; it must be <= 0 and <= publish threshold")]
    GraylistThreshold,
    #[error("invalid accept PX threshold; it must be >= 0")]
    AcceptPxThreshold,
    #[error("invalid opportunistic grafting threshold; it must be >= 0")]
    OpportunisticGraftThreshold,
}

#[inline]
fn is_decay(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

/// Check every global rule, then every configured topic.
pub fn validate_peer_score_params(p: &PeerScoreParams) -> Result<(), ScoreParamsError> {
    for (topic, params) in &p.topics {
        validate_topic_score_params(params).map_err(|e| ScoreParamsError::Topic {
            topic: topic.clone(),
            source: Box::new(e),
        })?;
    }

    if !(p.topic_score_cap >= 0.0) {
        return Err(ScoreParamsError::TopicScoreCap);
    }

    if !(p.ip_colocation_factor_weight <= 0.0) {
        return Err(ScoreParamsError::IpColocationFactorWeight);
    }
    if p.ip_colocation_factor_weight != 0.0 && !(p.ip_colocation_factor_threshold >= 1.0) {
        return Err(ScoreParamsError::IpColocationFactorThreshold);
    }

    if !(p.behaviour_penalty_weight <= 0.0) {
        return Err(ScoreParamsError::BehaviourPenaltyWeight);
    }
    if p.behaviour_penalty_weight != 0.0 && !is_decay(p.behaviour_penalty_decay) {
        return Err(ScoreParamsError::BehaviourPenaltyDecay);
    }

    if p.decay_interval < Duration::from_secs(1) {
        return Err(ScoreParamsError::DecayInterval);
    }
    if !(p.decay_to_zero > 0.0 && p.decay_to_zero < 1.0) {
        return Err(ScoreParamsError::DecayToZero);
    }

    Ok(())
}

/// Check the rules for a single topic's parameters.
pub fn validate_topic_score_params(p: &TopicScoreParams) -> Result<(), ScoreParamsError> {
    if !(p.topic_weight >= 0.0) {
        return Err(ScoreParamsError::TopicWeight);
    }

    // P1
    if p.time_in_mesh_quantum.is_zero() {
        return Err(ScoreParamsError::TimeInMeshQuantum);
    }
    if !(p.time_in_mesh_weight >= 0.0) {
        return Err(ScoreParamsError::TimeInMeshWeight);
    }
    if p.time_in_mesh_weight != 0.0 && !(p.time_in_mesh_cap > 0.0) {
        return Err(ScoreParamsError::TimeInMeshCap);
    }

    // P2
    if !(p.first_message_deliveries_weight >= 0.0) {
        return Err(ScoreParamsError::FirstMessageDeliveriesWeight);
    }
    if p.first_message_deliveries_weight != 0.0 && !is_decay(p.first_message_deliveries_decay) {
        return Err(ScoreParamsError::FirstMessageDeliveriesDecay);
    }
    if p.first_message_deliveries_weight != 0.0 && !(p.first_message_deliveries_cap > 0.0) {
        return Err(ScoreParamsError::FirstMessageDeliveriesCap);
    }

    // P3
    if !(p.mesh_message_deliveries_weight <= 0.0) {
        return Err(ScoreParamsError::MeshMessageDeliveriesWeight);
    }
    if p.mesh_message_deliveries_weight != 0.0 {
        if !is_decay(p.mesh_message_deliveries_decay) {
            return Err(ScoreParamsError::MeshMessageDeliveriesDecay);
        }
        if !(p.mesh_message_deliveries_cap > 0.0) {
            return Err(ScoreParamsError::MeshMessageDeliveriesCap);
        }
        if !(p.mesh_message_deliveries_threshold > 0.0) {
            return Err(ScoreParamsError::MeshMessageDeliveriesThreshold);
        }
        if p.mesh_message_deliveries_activation < Duration::from_secs(1) {
            return Err(ScoreParamsError::MeshMessageDeliveriesActivation);
        }
    }

    // P3b
    if !(p.mesh_failure_penalty_weight <= 0.0) {
        return Err(ScoreParamsError::MeshFailurePenaltyWeight);
    }
    if p.mesh_failure_penalty_weight != 0.0 && !is_decay(p.mesh_failure_penalty_decay) {
        return Err(ScoreParamsError::MeshFailurePenaltyDecay);
    }

    // P4
    if !(p.invalid_message_deliveries_weight <= 0.0) {
        return Err(ScoreParamsError::InvalidMessageDeliveriesWeight);
    }
    if !is_decay(p.invalid_message_deliveries_decay) {
        return Err(ScoreParamsError::InvalidMessageDeliveriesDecay);
    }

    Ok(())
}

// ============================================================================
// Per-peer State
// ============================================================================

#[derive(Debug, Clone, Default)]
struct TopicStats {
    in_mesh: bool,
    graft_time: Option<Instant>,
    mesh_time: Duration,
    first_message_deliveries: f64,
    mesh_message_deliveries: f64,
    mesh_message_deliveries_active: bool,
    mesh_failure_penalty: f64,
    invalid_message_deliveries: f64,
}

impl TopicStats {
    /// Sticky P3b penalty when leaving the mesh with a delivery deficit.
    fn apply_mesh_failure(&mut self, params: &TopicScoreParams) {
        if self.mesh_message_deliveries_active
            && self.mesh_message_deliveries < params.mesh_message_deliveries_threshold
        {
            let deficit = params.mesh_message_deliveries_threshold - self.mesh_message_deliveries;
            self.mesh_failure_penalty += deficit * deficit;
        }
    }

    fn score(&self, params: &TopicScoreParams, now: Instant) -> f64 {
        let mut score = 0.0;

        // P1
        if self.in_mesh {
            let mesh_time = self
                .graft_time
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(self.mesh_time);
            let p1 = (mesh_time.as_secs_f64() / params.time_in_mesh_quantum.as_secs_f64())
                .min(params.time_in_mesh_cap);
            score += p1 * params.time_in_mesh_weight;
        }

        // P2
        score += self.first_message_deliveries * params.first_message_deliveries_weight;

        // P3
        if self.mesh_message_deliveries_active
            && self.mesh_message_deliveries < params.mesh_message_deliveries_threshold
        {
            let deficit = params.mesh_message_deliveries_threshold - self.mesh_message_deliveries;
            score += deficit * deficit * params.mesh_message_deliveries_weight;
        }

        // P3b
        score += self.mesh_failure_penalty * params.mesh_failure_penalty_weight;

        // P4
        score += self.invalid_message_deliveries
            * self.invalid_message_deliveries
            * params.invalid_message_deliveries_weight;

        score
    }
}

#[derive(Debug, Clone)]
struct PeerStats {
    connected: bool,
    /// Set once disconnected; the record is dropped after this instant.
    expire: Option<Instant>,
    topics: HashMap<String, TopicStats>,
    known_ips: HashSet<IpAddr>,
    behaviour_penalty: f64,
    application_score: f64,
}

impl PeerStats {
    fn new() -> Self {
        Self {
            connected: true,
            expire: None,
            topics: HashMap::new(),
            known_ips: HashSet::new(),
            behaviour_penalty: 0.0,
            application_score: 0.0,
        }
    }

    /// Topic stats, created on demand for scored topics only.
    fn topic_mut(&mut self, topic: &str, params: &PeerScoreParams) -> Option<&mut TopicStats> {
        if !params.topics.contains_key(topic) {
            return None;
        }
        Some(self.topics.entry(topic.to_string()).or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryStatus {
    /// Seen, verdict pending.
    Unknown,
    Valid,
    Invalid,
    Ignored,
}

#[derive(Debug, Clone)]
struct DeliveryRecord {
    status: DeliveryStatus,
    first_seen: Instant,
    validated: Option<Instant>,
    peers: HashSet<Identity>,
}

impl DeliveryRecord {
    fn new(now: Instant) -> Self {
        Self {
            status: DeliveryStatus::Unknown,
            first_seen: now,
            validated: None,
            peers: HashSet::new(),
        }
    }
}

fn delivery_record(
    deliveries: &mut LruCache<MessageId, DeliveryRecord>,
    id: MessageId,
    now: Instant,
) -> Option<&mut DeliveryRecord> {
    if !deliveries.contains(&id) {
        deliveries.put(id, DeliveryRecord::new(now));
    }
    deliveries.get_mut(&id)
}

/// Why a message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Structural failure (signature, size, policy). Only the sender is blamed.
    Error,
    /// Topic validator rejected it. The sender and every early duplicate sender are blamed.
    Reject,
    /// Topic validator ignored it. Nobody is blamed.
    Ignore,
}

// ============================================================================
// Score Engine
// ============================================================================

pub struct PeerScore {
    params: PeerScoreParams,
    peer_stats: HashMap<Identity, PeerStats>,
    peer_ips: HashMap<IpAddr, HashSet<Identity>>,
    deliveries: LruCache<MessageId, DeliveryRecord>,
    last_refresh: Instant,
}

impl PeerScore {
    pub fn new(params: PeerScoreParams, now: Instant) -> Self {
        let cap = NonZeroUsize::new(MAX_DELIVERY_RECORDS).unwrap_or(NonZeroUsize::MIN);
        Self {
            params,
            peer_stats: HashMap::new(),
            peer_ips: HashMap::new(),
            deliveries: LruCache::new(cap),
            last_refresh: now,
        }
    }

    /// Current score. Unknown peers score 0.
    pub fn score(&self, peer: &Identity, now: Instant) -> f64 {
        let Some(stats) = self.peer_stats.get(peer) else {
            return 0.0;
        };

        let mut score = 0.0;
        for (topic, tstats) in &stats.topics {
            if let Some(tparams) = self.params.topics.get(topic) {
                score += tstats.score(tparams, now) * tparams.topic_weight;
            }
        }
        if self.params.topic_score_cap > 0.0 && score > self.params.topic_score_cap {
            score = self.params.topic_score_cap;
        }

        // P5
        score += stats.application_score * self.params.app_specific_weight;

        // P6
        for ip in &stats.known_ips {
            if self.params.ip_colocation_factor_whitelist.contains(ip) {
                continue;
            }
            let peers_on_ip = self.peer_ips.get(ip).map_or(0, HashSet::len) as f64;
            if peers_on_ip > self.params.ip_colocation_factor_threshold {
                let surplus = peers_on_ip - self.params.ip_colocation_factor_threshold;
                score += surplus * surplus * self.params.ip_colocation_factor_weight;
            }
        }

        // P7
        if stats.behaviour_penalty > self.params.behaviour_penalty_threshold {
            let excess = stats.behaviour_penalty - self.params.behaviour_penalty_threshold;
            score += excess * excess * self.params.behaviour_penalty_weight;
        }

        score
    }

    /// Register a connected peer, reviving a retained record if one exists.
    pub fn add_peer(&mut self, peer: Identity) {
        let stats = self.peer_stats.entry(peer).or_insert_with(PeerStats::new);
        stats.connected = true;
        stats.expire = None;
    }

    /// Disconnect a peer.
    ///
    /// Positive scores are forgotten immediately. Anything else is kept for
    /// `retain_score`, with first deliveries reset and any mesh delivery
    /// deficit converted into a sticky failure penalty.
    pub fn remove_peer(&mut self, peer: &Identity, now: Instant) {
        if !self.peer_stats.contains_key(peer) {
            return;
        }

        if self.score(peer, now) > 0.0 {
            if let Some(stats) = self.peer_stats.remove(peer) {
                self.forget_ips(peer, &stats.known_ips);
            }
            return;
        }

        let retain = self.params.retain_score;
        let Some(stats) = self.peer_stats.get_mut(peer) else {
            return;
        };
        for (topic, tstats) in stats.topics.iter_mut() {
            tstats.first_message_deliveries = 0.0;
            if tstats.in_mesh
                && let Some(tparams) = self.params.topics.get(topic)
            {
                tstats.apply_mesh_failure(tparams);
            }
            tstats.in_mesh = false;
            tstats.mesh_message_deliveries_active = false;
        }
        stats.connected = false;
        stats.expire = Some(now + retain);
    }

    pub fn add_ip(&mut self, peer: &Identity, ip: IpAddr) {
        if let Some(stats) = self.peer_stats.get_mut(peer) {
            stats.known_ips.insert(ip);
        }
        self.peer_ips.entry(ip).or_default().insert(*peer);
    }

    pub fn remove_ip(&mut self, peer: &Identity, ip: &IpAddr) {
        if let Some(stats) = self.peer_stats.get_mut(peer) {
            stats.known_ips.remove(ip);
        }
        if let Some(peers) = self.peer_ips.get_mut(ip) {
            peers.remove(peer);
            if peers.is_empty() {
                self.peer_ips.remove(ip);
            }
        }
    }

    fn forget_ips(&mut self, peer: &Identity, ips: &HashSet<IpAddr>) {
        for ip in ips {
            if let Some(peers) = self.peer_ips.get_mut(ip) {
                peers.remove(peer);
                if peers.is_empty() {
                    self.peer_ips.remove(ip);
                }
            }
        }
    }

    pub fn set_application_score(&mut self, peer: &Identity, value: f64) -> bool {
        match self.peer_stats.get_mut(peer) {
            Some(stats) => {
                stats.application_score = value;
                true
            }
            None => false,
        }
    }

    /// P7: add a behavioural penalty.
    pub fn add_penalty(&mut self, peer: &Identity, count: f64) {
        if let Some(stats) = self.peer_stats.get_mut(peer) {
            stats.behaviour_penalty += count;
            trace!(peer = %peer.short(), penalty = stats.behaviour_penalty, "behaviour penalty applied");
        }
    }

    pub fn graft(&mut self, peer: &Identity, topic: &str, now: Instant) {
        let Some(stats) = self.peer_stats.get_mut(peer) else {
            return;
        };
        if let Some(tstats) = stats.topic_mut(topic, &self.params) {
            tstats.in_mesh = true;
            tstats.graft_time = Some(now);
            tstats.mesh_time = Duration::ZERO;
            tstats.mesh_message_deliveries_active = false;
        }
    }

    pub fn prune(&mut self, peer: &Identity, topic: &str) {
        let Some(stats) = self.peer_stats.get_mut(peer) else {
            return;
        };
        let Some(tparams) = self.params.topics.get(topic) else {
            return;
        };
        if let Some(tstats) = stats.topics.get_mut(topic) {
            tstats.apply_mesh_failure(tparams);
            tstats.in_mesh = false;
            tstats.mesh_message_deliveries_active = false;
        }
    }

    /// A new message passed structural checks and is awaiting a verdict.
    pub fn validate_message(&mut self, id: MessageId, now: Instant) {
        delivery_record(&mut self.deliveries, id, now);
    }

    /// The message from `from` was accepted.
    pub fn deliver_message(&mut self, from: &Identity, id: MessageId, topic: &str, now: Instant) {
        self.mark_first_message_delivery(from, topic);

        let Some(record) = delivery_record(&mut self.deliveries, id, now) else {
            return;
        };
        if record.status != DeliveryStatus::Unknown {
            return;
        }
        record.status = DeliveryStatus::Valid;
        record.validated = Some(now);
        let early: Vec<Identity> = record.peers.iter().filter(|p| *p != from).copied().collect();
        for peer in early {
            self.mark_duplicate_message_delivery(&peer, topic, None, now);
        }
    }

    /// The message from `from` was refused.
    pub fn reject_message(&mut self, from: &Identity, id: MessageId, topic: &str, reason: RejectReason, now: Instant) {
        if reason == RejectReason::Error {
            self.mark_invalid_message_delivery(from, topic);
            return;
        }

        let Some(record) = delivery_record(&mut self.deliveries, id, now) else {
            return;
        };
        if record.status != DeliveryStatus::Unknown {
            return;
        }

        if reason == RejectReason::Ignore {
            record.status = DeliveryStatus::Ignored;
            record.peers.clear();
            return;
        }

        record.status = DeliveryStatus::Invalid;
        let blamed: Vec<Identity> = record.peers.drain().collect();
        self.mark_invalid_message_delivery(from, topic);
        for peer in blamed {
            self.mark_invalid_message_delivery(&peer, topic);
        }
    }

    /// `from` sent a message we had already seen.
    pub fn duplicate_message(&mut self, from: &Identity, id: MessageId, topic: &str, now: Instant) {
        let Some(record) = delivery_record(&mut self.deliveries, id, now) else {
            return;
        };
        if record.peers.contains(from) {
            return;
        }

        match record.status {
            DeliveryStatus::Unknown => {
                record.peers.insert(*from);
            }
            DeliveryStatus::Valid => {
                record.peers.insert(*from);
                let validated = record.validated;
                self.mark_duplicate_message_delivery(from, topic, validated, now);
            }
            DeliveryStatus::Invalid => {
                self.mark_invalid_message_delivery(from, topic);
            }
            DeliveryStatus::Ignored => {}
        }
    }

    fn mark_first_message_delivery(&mut self, from: &Identity, topic: &str) {
        let Some(stats) = self.peer_stats.get_mut(from) else {
            return;
        };
        let Some(tparams) = self.params.topics.get(topic) else {
            return;
        };
        let tstats = stats.topics.entry(topic.to_string()).or_default();
        tstats.first_message_deliveries =
            (tstats.first_message_deliveries + 1.0).min(tparams.first_message_deliveries_cap);
        if tstats.in_mesh {
            tstats.mesh_message_deliveries =
                (tstats.mesh_message_deliveries + 1.0).min(tparams.mesh_message_deliveries_cap);
        }
    }

    fn mark_duplicate_message_delivery(&mut self, from: &Identity, topic: &str, validated: Option<Instant>, now: Instant) {
        let Some(stats) = self.peer_stats.get_mut(from) else {
            return;
        };
        let Some(tparams) = self.params.topics.get(topic) else {
            return;
        };
        let Some(tstats) = stats.topics.get_mut(topic) else {
            return;
        };
        if !tstats.in_mesh {
            return;
        }
        if let Some(validated) = validated
            && now.saturating_duration_since(validated) > tparams.mesh_message_deliveries_window
        {
            return;
        }
        tstats.mesh_message_deliveries =
            (tstats.mesh_message_deliveries + 1.0).min(tparams.mesh_message_deliveries_cap);
    }

    fn mark_invalid_message_delivery(&mut self, from: &Identity, topic: &str) {
        let Some(stats) = self.peer_stats.get_mut(from) else {
            return;
        };
        if let Some(tstats) = stats.topic_mut(topic, &self.params) {
            tstats.invalid_message_deliveries += 1.0;
        }
    }

    /// Decay once if a full `decay_interval` has elapsed since the last decay.
    ///
    /// Returns whether a decay round ran.
    pub fn refresh_if_due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_refresh) < self.params.decay_interval {
            return false;
        }
        self.refresh_scores(now);
        true
    }

    /// One decay round: decay counters, activate P3, expire retained peers.
    pub fn refresh_scores(&mut self, now: Instant) {
        self.last_refresh = now;
        let decay_to_zero = self.params.decay_to_zero;
        let decay = |value: f64, factor: f64| {
            let v = value * factor;
            if v < decay_to_zero { 0.0 } else { v }
        };

        let mut expired = Vec::new();
        for (peer, stats) in self.peer_stats.iter_mut() {
            if !stats.connected {
                if stats.expire.is_some_and(|e| now >= e) {
                    expired.push(*peer);
                }
                continue;
            }

            for (topic, tstats) in stats.topics.iter_mut() {
                let Some(tparams) = self.params.topics.get(topic) else {
                    continue;
                };
                tstats.first_message_deliveries =
                    decay(tstats.first_message_deliveries, tparams.first_message_deliveries_decay);
                tstats.mesh_message_deliveries =
                    decay(tstats.mesh_message_deliveries, tparams.mesh_message_deliveries_decay);
                tstats.mesh_failure_penalty =
                    decay(tstats.mesh_failure_penalty, tparams.mesh_failure_penalty_decay);
                tstats.invalid_message_deliveries =
                    decay(tstats.invalid_message_deliveries, tparams.invalid_message_deliveries_decay);

                if tstats.in_mesh {
                    if let Some(graft_time) = tstats.graft_time {
                        tstats.mesh_time = now.saturating_duration_since(graft_time);
                    }
                    if tstats.mesh_time > tparams.mesh_message_deliveries_activation {
                        tstats.mesh_message_deliveries_active = true;
                    }
                }
            }

            stats.behaviour_penalty = decay(stats.behaviour_penalty, self.params.behaviour_penalty_decay);
        }

        for peer in expired {
            if let Some(stats) = self.peer_stats.remove(&peer) {
                self.forget_ips(&peer, &stats.known_ips);
            }
        }

        while let Some((_, record)) = self.deliveries.peek_lru() {
            if now.saturating_duration_since(record.first_seen) < DELIVERY_RECORD_TTL {
                break;
            }
            self.deliveries.pop_lru();
        }
    }

    pub fn clear(&mut self) {
        self.peer_stats.clear();
        self.peer_ips.clear();
        self.deliveries.clear();
    }
}
