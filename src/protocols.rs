//! Collaborator traits consumed by the router.
//!
//! The router owns protocol state only. Everything that touches the outside
//! world is reached through one of these traits, so the same engine runs over
//! a real transport or the in-memory one in [`crate::memory`].
//!
//! ## Traits
//!
//! | Concern | Trait | Purpose |
//! |---------|-------|---------|
//! | Streams | [`StreamProvider`] | Open a framed byte stream to a connected peer |
//! | Connections | [`ConnectionDirectory`] | Connected peers, direction and remote IP |
//! | Peer metadata | [`PeerMetadataStore`] | Tag / untag / query peers |
//! | Validation | [`TopicValidator`] | Application verdict on a received message |
//!
//! Inbound streams flow the other way: the transport hands them to
//! `GossipSub::handle_incoming_stream`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::Identity;
use crate::messages::Message;

/// Duplex byte stream dedicated to this protocol with one peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Opens outbound protocol streams.
#[async_trait]
pub trait StreamProvider: Send + Sync + 'static {
    /// Open a new stream to an already-connected peer.
    async fn open_stream(&self, peer: &Identity) -> Result<BoxedStream>;
}

/// Which side dialed the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: Identity,
    pub direction: Direction,
    pub remote_ip: Option<IpAddr>,
}

/// Read-only view of the connection manager.
#[async_trait]
pub trait ConnectionDirectory: Send + Sync + 'static {
    async fn connections(&self) -> Vec<ConnectionInfo>;

    async fn connection(&self, peer: &Identity) -> Option<ConnectionInfo> {
        self.connections().await.into_iter().find(|c| &c.peer == peer)
    }
}

/// A named, weighted peer tag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeerTag {
    pub value: i32,
    /// `None` means the tag lives until removed.
    pub ttl: Option<Duration>,
}

/// Persistent per-peer metadata, owned by the host.
#[async_trait]
pub trait PeerMetadataStore: Send + Sync + 'static {
    async fn tag_peer(&self, peer: &Identity, name: &str, tag: PeerTag);

    async fn untag_peer(&self, peer: &Identity, name: &str);

    async fn peer_tags(&self, peer: &Identity) -> HashMap<String, PeerTag>;
}

/// Outcome of application-level validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    /// Deliver and forward.
    Accept,
    /// Drop and penalize the propagation source.
    Reject,
    /// Drop without penalty.
    Ignore,
}

/// Per-topic message validator.
///
/// Runs on the router task, so it must not block.
pub trait TopicValidator: Send + Sync + 'static {
    fn validate(&self, propagation_source: &Identity, message: &Message) -> ValidationResult;
}

impl<F> TopicValidator for F
where
    F: Fn(&Identity, &Message) -> ValidationResult + Send + Sync + 'static,
{
    fn validate(&self, propagation_source: &Identity, message: &Message) -> ValidationResult {
        self(propagation_source, message)
    }
}
