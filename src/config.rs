//! Router configuration.
//!
//! [`GossipSubConfig`] bundles one typed block per component. Every block has
//! a `Default` built from the `DEFAULT_*` constants below, and
//! [`GossipSubConfig::validate`] runs every component check before the router
//! starts.

use std::time::Duration;

use thiserror::Error;

use crate::messages::SignaturePolicy;
use crate::score::{PeerScoreParams, PeerScoreThresholds, ScoreParamsError, ThresholdsError};

// ============================================================================
// Mesh Parameters
// ============================================================================

/// D - Target number of peers in the mesh per topic.
pub const DEFAULT_D: usize = 6;

/// D_lo - Mesh size below which the heartbeat grafts.
pub const DEFAULT_D_LO: usize = 4;

/// D_hi - Mesh size above which the heartbeat prunes.
pub const DEFAULT_D_HI: usize = 12;

/// D_score - Peers kept by score when pruning an oversubscribed mesh.
pub const DEFAULT_D_SCORE: usize = 4;

/// D_out - Minimum outbound peers in each mesh.
/// SECURITY: Prevents eclipse attacks by requiring connections we dialed.
pub const DEFAULT_D_OUT: usize = 2;

/// D_lazy - Minimum peers to send IHAVE gossip to per topic.
pub const DEFAULT_D_LAZY: usize = 6;

/// Fraction of eligible non-mesh peers that receive gossip.
pub const DEFAULT_GOSSIP_FACTOR: f64 = 0.25;

pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

/// Peer exchange records offered in a PRUNE.
pub const DEFAULT_PRUNE_PEERS: usize = 16;

pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

/// Upper bound of the uniform jitter added to each prune backoff.
pub const DEFAULT_PRUNE_BACKOFF_JITTER: Duration = Duration::from_secs(6);

pub const DEFAULT_UNSUBSCRIBE_BACKOFF: Duration = Duration::from_secs(10);

/// Heartbeats between backoff table sweeps.
pub const DEFAULT_PRUNE_BACKOFF_TICKS: u64 = 15;

/// A GRAFT this soon after our PRUNE is a flood; the penalty doubles.
/// SECURITY: Discourages peers hammering GRAFT during backoff.
pub const DEFAULT_GRAFT_FLOOD_THRESHOLD: Duration = Duration::from_secs(10);

pub const DEFAULT_OPPORTUNISTIC_GRAFT_TICKS: u64 = 60;
pub const DEFAULT_OPPORTUNISTIC_GRAFT_PEERS: usize = 2;

// ============================================================================
// Cache and Timing
// ============================================================================

/// Heartbeat windows kept in the message cache.
pub const DEFAULT_MCACHE_LENGTH: usize = 5;

/// Most recent windows advertised in IHAVE.
pub const DEFAULT_MCACHE_GOSSIP: usize = 3;

pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

/// Times a single peer may fetch the same id via IWANT.
/// SECURITY: Stops IWANT being used to amplify traffic.
pub const DEFAULT_GOSSIP_RETRANSMISSION: u32 = 3;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Deadline for a peer to answer our IWANT.
pub const DEFAULT_IWANT_FOLLOWUP_TIME: Duration = Duration::from_secs(3);

// ============================================================================
// Size and Flood Limits
// ============================================================================

/// Largest message payload accepted from the network.
/// SECURITY: Bounds per-message memory before validation.
pub const DEFAULT_MAX_INBOUND_DATA_LENGTH: usize = 4 * 1024 * 1024;

/// Largest payload this node will publish.
pub const DEFAULT_MAX_TRANSMIT_SIZE: usize = 4 * 1024 * 1024;

/// IHAVE control messages accepted per peer per heartbeat.
/// SECURITY: Caps gossip processing cost per peer.
pub const DEFAULT_MAX_IHAVE_MESSAGES: usize = 10;

/// Ids we request via IWANT from one peer per heartbeat.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 5000;

/// IDONTWANT ids accepted per peer per heartbeat.
/// SECURITY: Bounds the idontwant table under declaration floods.
pub const DEFAULT_IDONTWANT_MAX_MESSAGES: usize = 512;

/// Only payloads larger than this trigger an outbound IDONTWANT.
pub const DEFAULT_IDONTWANT_MIN_DATA_SIZE: usize = 512;

/// Frames queued per peer before new ones are dropped.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Events buffered for slow subscribers before they lag.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Weight of the tag placed on mesh peers in the peer store.
pub const MESH_TAG_VALUE: i32 = 100;

// ============================================================================
// Component Configs
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct MeshConfig {
    /// D
    pub d: usize,
    /// D_lo
    pub d_lo: usize,
    /// D_hi
    pub d_hi: usize,
    /// D_score
    pub d_score: usize,
    /// D_out
    pub d_out: usize,
    /// D_lazy
    pub d_lazy: usize,
    pub gossip_factor: f64,
    pub fanout_ttl: Duration,
    /// Send peer exchange records when pruning.
    pub do_px: bool,
    pub prune_peers: usize,
    pub prune_backoff: Duration,
    pub prune_backoff_jitter: Duration,
    pub unsubscribe_backoff: Duration,
    pub prune_backoff_ticks: u64,
    pub graft_flood_threshold: Duration,
    pub opportunistic_graft_ticks: u64,
    pub opportunistic_graft_peers: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            d: DEFAULT_D,
            d_lo: DEFAULT_D_LO,
            d_hi: DEFAULT_D_HI,
            d_score: DEFAULT_D_SCORE,
            d_out: DEFAULT_D_OUT,
            d_lazy: DEFAULT_D_LAZY,
            gossip_factor: DEFAULT_GOSSIP_FACTOR,
            fanout_ttl: DEFAULT_FANOUT_TTL,
            do_px: false,
            prune_peers: DEFAULT_PRUNE_PEERS,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            prune_backoff_jitter: DEFAULT_PRUNE_BACKOFF_JITTER,
            unsubscribe_backoff: DEFAULT_UNSUBSCRIBE_BACKOFF,
            prune_backoff_ticks: DEFAULT_PRUNE_BACKOFF_TICKS,
            graft_flood_threshold: DEFAULT_GRAFT_FLOOD_THRESHOLD,
            opportunistic_graft_ticks: DEFAULT_OPPORTUNISTIC_GRAFT_TICKS,
            opportunistic_graft_peers: DEFAULT_OPPORTUNISTIC_GRAFT_PEERS,
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.d_lo <= self.d && self.d <= self.d_hi) {
            return Err(ConfigError::MeshDegree {
                d: self.d,
                d_lo: self.d_lo,
                d_hi: self.d_hi,
            });
        }
        if self.d_score > self.d_hi {
            return Err(ConfigError::DScore);
        }
        if self.d_out > 0 && (self.d_out >= self.d_lo || self.d_out > self.d / 2) {
            return Err(ConfigError::DOut);
        }
        if !(self.gossip_factor >= 0.0 && self.gossip_factor <= 1.0) {
            return Err(ConfigError::GossipFactor);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    pub mcache_length: usize,
    pub mcache_gossip: usize,
    pub seen_ttl: Duration,
    pub gossip_retransmission: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mcache_length: DEFAULT_MCACHE_LENGTH,
            mcache_gossip: DEFAULT_MCACHE_GOSSIP,
            seen_ttl: DEFAULT_SEEN_TTL,
            gossip_retransmission: DEFAULT_GOSSIP_RETRANSMISSION,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mcache_length == 0 {
            return Err(ConfigError::McacheLength);
        }
        if self.mcache_gossip > self.mcache_length {
            return Err(ConfigError::McacheGossip {
                gossip: self.mcache_gossip,
                length: self.mcache_length,
            });
        }
        Ok(())
    }
}

/// Complete router configuration.
#[derive(Clone, Debug)]
pub struct GossipSubConfig {
    pub mesh: MeshConfig,
    pub cache: CacheConfig,

    pub heartbeat_interval: Duration,
    /// Delay before the first heartbeat.
    pub heartbeat_initial_delay: Duration,

    pub signature_policy: SignaturePolicy,
    pub max_inbound_data_length: usize,
    pub max_transmit_size: usize,

    pub max_ihave_messages: usize,
    pub max_ihave_length: usize,
    pub iwant_followup_time: Duration,
    pub idontwant_max_messages: usize,
    pub idontwant_min_data_size: usize,

    /// Publish to every eligible subscriber rather than just the mesh.
    pub flood_publish: bool,
    /// Treat a publish with no recipients as success.
    pub allow_publish_to_zero_topic_peers: bool,
    /// Deliver our own publishes as local message events.
    pub emit_self: bool,
    /// Forward messages on topics we are not subscribed to.
    pub can_relay_message: bool,
    /// Tag mesh peers in the peer store.
    pub tag_mesh_peers: bool,

    pub score_params: PeerScoreParams,
    pub score_thresholds: PeerScoreThresholds,

    pub outbound_queue_size: usize,
    pub event_buffer: usize,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh: MeshConfig::default(),
            cache: CacheConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_initial_delay: DEFAULT_HEARTBEAT_INITIAL_DELAY,
            signature_policy: SignaturePolicy::default(),
            max_inbound_data_length: DEFAULT_MAX_INBOUND_DATA_LENGTH,
            max_transmit_size: DEFAULT_MAX_TRANSMIT_SIZE,
            max_ihave_messages: DEFAULT_MAX_IHAVE_MESSAGES,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            iwant_followup_time: DEFAULT_IWANT_FOLLOWUP_TIME,
            idontwant_max_messages: DEFAULT_IDONTWANT_MAX_MESSAGES,
            idontwant_min_data_size: DEFAULT_IDONTWANT_MIN_DATA_SIZE,
            flood_publish: true,
            allow_publish_to_zero_topic_peers: false,
            emit_self: false,
            can_relay_message: false,
            tag_mesh_peers: true,
            score_params: PeerScoreParams::default(),
            score_thresholds: PeerScoreThresholds::default(),
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl GossipSubConfig {
    /// Run every component check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mesh.validate()?;
        self.cache.validate()?;
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::HeartbeatInterval);
        }
        if self.max_inbound_data_length == 0 {
            return Err(ConfigError::ZeroLimit("max_inbound_data_length"));
        }
        if self.max_transmit_size == 0 {
            return Err(ConfigError::ZeroLimit("max_transmit_size"));
        }
        if self.idontwant_max_messages == 0 {
            return Err(ConfigError::ZeroLimit("idontwant_max_messages"));
        }
        if self.outbound_queue_size == 0 {
            return Err(ConfigError::ZeroLimit("outbound_queue_size"));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::ZeroLimit("event_buffer"));
        }
        self.score_params.validate()?;
        self.score_thresholds.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("mesh degrees must satisfy d_lo <= d <= d_hi (d_lo={d_lo}, d={d}, d_hi={d_hi})")]
    MeshDegree { d: usize, d_lo: usize, d_hi: usize },
    #[error("d_score must not exceed d_hi")]
    DScore,
    #[error("d_out must be below d_lo and at most d/2")]
    DOut,
    #[error("gossip_factor must be in [0, 1]")]
    GossipFactor,
    #[error("mcache_length must be at least 1")]
    McacheLength,
    #[error("mcache_gossip ({gossip}) must not exceed mcache_length ({length})")]
    McacheGossip { gossip: usize, length: usize },
    #[error("heartbeat_interval must be non-zero")]
    HeartbeatInterval,
    #[error("{0} must be non-zero")]
    ZeroLimit(&'static str),
    #[error(transparent)]
    Score(#[from] ScoreParamsError),
    #[error(transparent)]
    Thresholds(#[from] ThresholdsError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::TopicScoreParams;

    #[test]
    fn config_defaults_are_sane() {
        let config = GossipSubConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.mesh.d_lo <= config.mesh.d);
        assert!(config.mesh.d <= config.mesh.d_hi);
        assert!(config.mesh.d_out < config.mesh.d_lo);
        assert!(config.cache.mcache_gossip <= config.cache.mcache_length);
        assert!(config.max_inbound_data_length >= config.idontwant_min_data_size);
    }

    #[test]
    fn mesh_degree_ordering_enforced() {
        let config = GossipSubConfig {
            mesh: MeshConfig { d: 3, d_lo: 4, ..MeshConfig::default() },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MeshDegree { d: 3, .. })));

        let config = GossipSubConfig {
            mesh: MeshConfig { d_hi: 5, ..MeshConfig::default() },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MeshDegree { .. })));
    }

    #[test]
    fn d_out_bounded() {
        let mesh = MeshConfig { d_out: 4, ..MeshConfig::default() };
        assert_eq!(mesh.validate(), Err(ConfigError::DOut));
        let mesh = MeshConfig { d_out: 0, ..MeshConfig::default() };
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn mcache_gossip_within_length() {
        let cache = CacheConfig { mcache_gossip: 6, ..CacheConfig::default() };
        assert_eq!(cache.validate(), Err(ConfigError::McacheGossip { gossip: 6, length: 5 }));
    }

    #[test]
    fn zero_limits_rejected() {
        let config = GossipSubConfig { idontwant_max_messages: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroLimit("idontwant_max_messages")));
        let config = GossipSubConfig { heartbeat_interval: Duration::ZERO, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::HeartbeatInterval));
    }

    #[test]
    fn score_errors_surface_through_config() {
        let mut config = GossipSubConfig::default();
        config
            .score_params
            .topics
            .insert("t".into(), TopicScoreParams { topic_weight: -1.0, ..Default::default() });
        assert!(matches!(config.validate(), Err(ConfigError::Score(ScoreParamsError::Topic { .. }))));

        let config = GossipSubConfig {
            score_thresholds: PeerScoreThresholds { gossip_threshold: 5.0, ..Default::default() },
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Thresholds(ThresholdsError::GossipThreshold)));
    }
}
