//! # Meshsub - Scored GossipSub Router
//!
//! Meshsub is a topic-based publish/subscribe router for peer-to-peer
//! networks, implementing GossipSub v1.1 with the v1.2 IDONTWANT extension:
//!
//! - **Meshes**: bounded, per-topic overlays that carry full messages
//! - **Gossip**: IHAVE/IWANT repair towards peers outside the mesh
//! - **Scoring**: per-peer P1-P7 scores gate meshing, gossip and publishing
//! - **Backoff**: GRAFT/PRUNE with backoff windows and optional peer exchange
//! - **Suppression**: IDONTWANT keeps mesh peers from echoing large payloads
//!
//! ## Architecture
//!
//! The router is an **actor**: [`GossipSub`] is a cheap, cloneable handle that
//! sends commands over a bounded channel, and one task owns all router state.
//! The host supplies connectivity through three traits:
//!
//! - [`StreamProvider`] opens the per-peer protocol stream
//! - [`ConnectionDirectory`] reports connection direction and remote address
//! - [`PeerMetadataStore`] receives mesh-membership tags
//!
//! [`MemoryNetwork`] implements all three in-process for tests and demos.
//!
//! ## Security Model
//!
//! - Messages are Ed25519-signed by default and verified before forwarding
//! - Every cache, table and queue is bounded
//! - Misbehaving peers lose score and are graylisted below a threshold
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `gossipsub` | Router actor and public handle |
//! | `config` | Router, mesh and cache parameters with validation |
//! | `score` | Peer scoring parameters, validation and engine |
//! | `mesh` | Mesh, fanout and backoff bookkeeping |
//! | `mcache` | Sliding message cache and seen-id cache |
//! | `control` | Control piggybacking, IDONTWANT, IWANT promises |
//! | `messages` | Wire types and length-prefixed framing |
//! | `protocols` | Host integration traits and topic validators |
//! | `identity` | Ed25519 keypairs and peer identities |
//! | `crypto` | Domain-separated signatures |
//! | `memory` | In-process host for tests and demos |

mod config;
mod control;
mod crypto;
mod gossipsub;
mod identity;
mod mcache;
mod memory;
mod mesh;
mod messages;
mod protocols;
mod score;

pub use config::{CacheConfig, ConfigError, GossipSubConfig, MeshConfig};
pub use control::{ControlBuffer, GossipPromises, IDontWantTable, IHaveLimits};
pub use crypto::{sign_with_domain, verify_with_domain, SignatureError, GOSSIPSUB_SIGNATURE_DOMAIN};
pub use gossipsub::{
    is_valid_topic, GossipSub, GossipSubEvent, GossipSubServices, MessageRejection, PublishError,
    PublishOptions, PublishResult, MAX_TOPIC_LENGTH,
};
pub use identity::{Identity, Keypair};
pub use mcache::{MessageCache, SeenCache};
pub use memory::{MemoryNetwork, RawPeer};
pub use mesh::{MeshChanges, MeshState};
pub use messages::{
    message_id, read_frame, write_frame, CodecError, ControlGraft, ControlIDontWant, ControlIHave,
    ControlIWant, ControlMessage, ControlPrune, Message, MessageId, PeerRecord, Rpc, SignaturePolicy,
    SubOpts,
};
pub use protocols::{
    BoxedStream, ConnectionDirectory, ConnectionInfo, Direction, PeerMetadataStore, PeerStream,
    PeerTag, StreamProvider, TopicValidator, ValidationResult,
};
pub use score::{
    validate_peer_score_params, validate_topic_score_params, PeerScore, PeerScoreParams,
    PeerScoreThresholds, RejectReason, ScoreParamsError, ThresholdsError, TopicScoreParams,
};
