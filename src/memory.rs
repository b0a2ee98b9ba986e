//! # In-Memory Host
//!
//! Wires routers together inside one process. Streams are
//! [`tokio::io::duplex`] pairs, connections live in a shared registry and
//! every node gets a distinct `10.x.y.1` address so IP colocation scoring
//! behaves as it would across real hosts.
//!
//! Used by the demo binary and the integration tests. A [`RawPeer`] joins
//! the same network without a router behind it and speaks frames directly.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::config::GossipSubConfig;
use crate::gossipsub::{GossipSub, GossipSubServices};
use crate::identity::{Identity, Keypair};
use crate::messages::{read_frame, write_frame, Rpc};
use crate::protocols::{
    BoxedStream, ConnectionDirectory, ConnectionInfo, Direction, PeerMetadataStore, PeerTag, StreamProvider,
};

/// Buffer size of each in-memory stream half.
pub const MEMORY_STREAM_BUFFER: usize = 256 * 1024;

/// Largest frame a [`RawPeer`] reads or writes.
const RAW_FRAME_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Default)]
struct NetworkRegistry {
    routers: RwLock<HashMap<Identity, GossipSub>>,
    /// Per local node: remote peer to connection details.
    connections: RwLock<HashMap<Identity, HashMap<Identity, ConnectionInfo>>>,
    /// Per local node: remote peer to named tags.
    tags: RwLock<HashMap<Identity, HashMap<Identity, HashMap<String, PeerTag>>>>,
    addresses: RwLock<HashMap<Identity, IpAddr>>,
    failures: RwLock<HashSet<Identity>>,
    /// Streams opened towards raw peers are handed over here.
    raw_peers: RwLock<HashMap<Identity, mpsc::Sender<BoxedStream>>>,
}

impl NetworkRegistry {
    async fn router(&self, id: &Identity) -> Option<GossipSub> {
        self.routers.read().await.get(id).cloned()
    }

    async fn address_of(&self, id: &Identity) -> IpAddr {
        let mut addresses = self.addresses.write().await;
        let next = addresses.len() as u32 + 1;
        *addresses.entry(*id).or_insert_with(|| {
            let hi = ((next >> 8) & 0xFF) as u8;
            let lo = (next & 0xFF) as u8;
            IpAddr::V4(Ipv4Addr::new(10, hi, lo, 1))
        })
    }

    async fn is_connected(&self, a: &Identity, b: &Identity) -> bool {
        self.connections
            .read()
            .await
            .get(a)
            .is_some_and(|peers| peers.contains_key(b))
    }

    async fn record_connection(&self, dialer: &Identity, listener: &Identity) {
        let dialer_ip = self.address_of(dialer).await;
        let listener_ip = self.address_of(listener).await;
        let mut connections = self.connections.write().await;
        connections.entry(*dialer).or_default().insert(
            *listener,
            ConnectionInfo {
                peer: *listener,
                direction: Direction::Outbound,
                remote_ip: Some(listener_ip),
            },
        );
        connections.entry(*listener).or_default().insert(
            *dialer,
            ConnectionInfo {
                peer: *dialer,
                direction: Direction::Inbound,
                remote_ip: Some(dialer_ip),
            },
        );
    }
}

/// Shared in-process network. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<NetworkRegistry>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host services for a router running as `local`.
    pub fn services(&self, local: Identity) -> GossipSubServices {
        let host = Arc::new(MemoryHost {
            local,
            registry: self.registry.clone(),
        });
        GossipSubServices {
            streams: host.clone(),
            connections: host.clone(),
            peer_store: host,
        }
    }

    /// Make `router` reachable for inbound streams.
    pub async fn register(&self, router: &GossipSub) {
        let id = router.local_identity();
        self.registry.address_of(&id).await;
        self.registry.routers.write().await.insert(id, router.clone());
    }

    /// Spawn a router on this network and register it.
    pub async fn spawn_node(&self, keypair: Keypair, config: GossipSubConfig) -> Result<GossipSub> {
        let services = self.services(keypair.identity());
        let router = GossipSub::spawn(keypair, config, services)?;
        self.register(&router).await;
        Ok(router)
    }

    /// Connect `dialer` to `listener` and notify both routers.
    pub async fn connect(&self, dialer: &Identity, listener: &Identity) -> Result<()> {
        if dialer == listener {
            return Err(anyhow!("cannot connect a node to itself"));
        }
        let a = self
            .registry
            .router(dialer)
            .await
            .ok_or_else(|| anyhow!("unknown node {}", dialer.short()))?;
        let b = self
            .registry
            .router(listener)
            .await
            .ok_or_else(|| anyhow!("unknown node {}", listener.short()))?;

        self.registry.record_connection(dialer, listener).await;

        debug!(dialer = %dialer.short(), listener = %listener.short(), "memory connection established");
        a.peer_connected(*listener).await?;
        b.peer_connected(*dialer).await?;
        Ok(())
    }

    /// Tear down the connection between two nodes and notify both routers.
    pub async fn disconnect(&self, a: &Identity, b: &Identity) -> Result<()> {
        {
            let mut connections = self.registry.connections.write().await;
            if let Some(peers) = connections.get_mut(a) {
                peers.remove(b);
            }
            if let Some(peers) = connections.get_mut(b) {
                peers.remove(a);
            }
        }
        if let Some(router) = self.registry.router(a).await {
            router.peer_disconnected(*b).await?;
        }
        if let Some(router) = self.registry.router(b).await {
            router.peer_disconnected(*a).await?;
        }
        Ok(())
    }

    /// Dial `router` from a peer with no router of its own.
    pub async fn attach_raw(&self, keypair: Keypair, router: &Identity) -> Result<RawPeer> {
        let target = self
            .registry
            .router(router)
            .await
            .ok_or_else(|| anyhow!("unknown node {}", router.short()))?;
        let local = keypair.identity();

        let (streams_tx, streams_rx) = mpsc::channel(4);
        self.registry.raw_peers.write().await.insert(local, streams_tx);
        self.registry.record_connection(&local, router).await;
        target.peer_connected(local).await?;

        let (ours, theirs) = tokio::io::duplex(MEMORY_STREAM_BUFFER);
        target.handle_incoming_stream(local, Box::new(theirs)).await?;
        debug!(raw = %local.short(), router = %router.short(), "raw peer attached");

        Ok(RawPeer {
            keypair,
            outbound: ours,
            inbound: None,
            streams: streams_rx,
        })
    }

    /// Fail every stream opened towards `node` while set.
    pub async fn set_failure(&self, node: Identity, fail: bool) {
        let mut failures = self.registry.failures.write().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    /// Tags `owner` has placed on `peer`.
    pub async fn tags(&self, owner: &Identity, peer: &Identity) -> HashMap<String, PeerTag> {
        self.registry
            .tags
            .read()
            .await
            .get(owner)
            .and_then(|peers| peers.get(peer))
            .cloned()
            .unwrap_or_default()
    }
}

/// One node's view of the network.
struct MemoryHost {
    local: Identity,
    registry: Arc<NetworkRegistry>,
}

#[async_trait]
impl StreamProvider for MemoryHost {
    async fn open_stream(&self, peer: &Identity) -> Result<BoxedStream> {
        if self.registry.failures.read().await.contains(peer) {
            return Err(anyhow!("injected network failure"));
        }
        if !self.registry.is_connected(&self.local, peer).await {
            return Err(anyhow!("not connected to {}", peer.short()));
        }
        let (local_half, remote_half) = tokio::io::duplex(MEMORY_STREAM_BUFFER);

        let raw = self.registry.raw_peers.read().await.get(peer).cloned();
        if let Some(raw) = raw {
            raw.send(Box::new(remote_half))
                .await
                .map_err(|_| anyhow!("raw peer {} went away", peer.short()))?;
            return Ok(Box::new(local_half));
        }

        let remote = self
            .registry
            .router(peer)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))?;
        remote.handle_incoming_stream(self.local, Box::new(remote_half)).await?;
        Ok(Box::new(local_half))
    }
}

/// A peer driven by hand: it writes whatever frames it is given and reads
/// what the router sends back, with no protocol logic of its own.
pub struct RawPeer {
    keypair: Keypair,
    outbound: DuplexStream,
    inbound: Option<BoxedStream>,
    streams: mpsc::Receiver<BoxedStream>,
}

impl RawPeer {
    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub async fn send(&mut self, rpc: &Rpc) -> Result<()> {
        write_frame(&mut self.outbound, rpc, RAW_FRAME_LIMIT).await?;
        Ok(())
    }

    /// Write bytes as-is, framing included.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.outbound.write_all(bytes).await?;
        self.outbound.flush().await?;
        Ok(())
    }

    /// Next frame from the router. `None` once the router closed its stream.
    pub async fn recv(&mut self) -> Result<Option<Rpc>> {
        let stream = match self.inbound.take() {
            Some(stream) => stream,
            None => self
                .streams
                .recv()
                .await
                .ok_or_else(|| anyhow!("network dropped"))?,
        };
        let stream = self.inbound.insert(stream);
        Ok(read_frame(stream, RAW_FRAME_LIMIT).await?)
    }

    /// Drop the router's stream towards us, so its next write fails.
    pub async fn close_inbound(&mut self) {
        if self.inbound.take().is_none() {
            drop(self.streams.recv().await);
        }
    }
}

#[async_trait]
impl ConnectionDirectory for MemoryHost {
    async fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry
            .connections
            .read()
            .await
            .get(&self.local)
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn connection(&self, peer: &Identity) -> Option<ConnectionInfo> {
        self.registry
            .connections
            .read()
            .await
            .get(&self.local)
            .and_then(|peers| peers.get(peer).cloned())
    }
}

#[async_trait]
impl PeerMetadataStore for MemoryHost {
    async fn tag_peer(&self, peer: &Identity, name: &str, tag: PeerTag) {
        self.registry
            .tags
            .write()
            .await
            .entry(self.local)
            .or_default()
            .entry(*peer)
            .or_default()
            .insert(name.to_string(), tag);
    }

    async fn untag_peer(&self, peer: &Identity, name: &str) {
        let mut tags = self.registry.tags.write().await;
        if let Some(peers) = tags.get_mut(&self.local)
            && let Some(named) = peers.get_mut(peer)
        {
            named.remove(name);
            if named.is_empty() {
                peers.remove(peer);
            }
        }
    }

    async fn peer_tags(&self, peer: &Identity) -> HashMap<String, PeerTag> {
        self.registry
            .tags
            .read()
            .await
            .get(&self.local)
            .and_then(|peers| peers.get(peer))
            .cloned()
            .unwrap_or_default()
    }
}
