//! Per-peer control plane bookkeeping.
//!
//! - [`ControlBuffer`]: GRAFT/PRUNE/IHAVE waiting to ride on the next frame to
//!   a peer, or to be flushed at the end of the heartbeat.
//! - [`IDontWantTable`]: ids peers told us not to forward them.
//! - [`GossipPromises`]: ids we asked for via IWANT and expect to receive.
//! - [`IHaveLimits`]: per-heartbeat IHAVE flood accounting.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::identity::Identity;
use crate::messages::{ControlIHave, ControlMessage, MessageId};

// ============================================================================
// Outbound Control Buffer
// ============================================================================

/// Pending outbound control, keyed by peer.
#[derive(Default)]
pub struct ControlBuffer {
    control: HashMap<Identity, ControlMessage>,
    gossip: HashMap<Identity, Vec<ControlIHave>>,
}

impl ControlBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue control for `peer`, merging with anything already pending.
    pub fn push_control(&mut self, peer: Identity, control: ControlMessage) {
        if control.is_empty() {
            return;
        }
        self.control.entry(peer).or_default().extend(control);
    }

    pub fn push_gossip(&mut self, peer: Identity, ihave: ControlIHave) {
        self.gossip.entry(peer).or_default().push(ihave);
    }

    /// Remove and return everything pending for `peer`.
    ///
    /// GRAFTs are kept only for topics where the peer is still in our mesh and
    /// PRUNEs only where it is not, so a later decision cancels a stale one.
    pub fn take<F>(&mut self, peer: &Identity, in_mesh: F) -> Option<ControlMessage>
    where
        F: Fn(&str) -> bool,
    {
        let gossip = self.gossip.remove(peer);
        let control = self.control.remove(peer);

        let mut out = ControlMessage::default();
        if let Some(ihave) = gossip {
            out.ihave = ihave;
        }
        if let Some(mut control) = control {
            control.graft.retain(|g| in_mesh(&g.topic));
            control.prune.retain(|p| !in_mesh(&p.topic));
            out.extend(control);
        }

        if out.is_empty() { None } else { Some(out) }
    }

    /// Peers with anything pending.
    pub fn pending_peers(&self) -> Vec<Identity> {
        let mut peers: HashSet<Identity> = self.control.keys().copied().collect();
        peers.extend(self.gossip.keys().copied());
        peers.into_iter().collect()
    }

    pub fn remove_peer(&mut self, peer: &Identity) {
        self.control.remove(peer);
        self.gossip.remove(peer);
    }

    pub fn clear(&mut self) {
        self.control.clear();
        self.gossip.clear();
    }
}

// ============================================================================
// Inbound IDONTWANT
// ============================================================================

/// Ids each peer declared it already has.
///
/// Two bounds apply per peer: at most `max_messages` declarations are accepted
/// per heartbeat, and the retained id set never exceeds `max_messages`.
pub struct IDontWantTable {
    max_messages: usize,
    /// Heartbeats an id is remembered for.
    expiry_ticks: u64,
    counts: HashMap<Identity, usize>,
    ids: HashMap<Identity, HashMap<MessageId, u64>>,
}

impl IDontWantTable {
    pub fn new(max_messages: usize, expiry_ticks: u64) -> Self {
        Self {
            max_messages,
            expiry_ticks,
            counts: HashMap::new(),
            ids: HashMap::new(),
        }
    }

    /// Record declarations from `peer` at heartbeat `tick`.
    ///
    /// Returns how many ids were accepted; the rest are dropped.
    pub fn record(&mut self, peer: Identity, ids: &[MessageId], tick: u64) -> usize {
        let count = self.counts.entry(peer).or_insert(0);
        if *count >= self.max_messages {
            return 0;
        }

        let set = self.ids.entry(peer).or_default();
        let mut accepted = 0;
        for id in ids {
            if *count >= self.max_messages {
                break;
            }
            if !set.contains_key(id) && set.len() >= self.max_messages {
                break;
            }
            *count += 1;
            set.insert(*id, tick);
            accepted += 1;
        }
        accepted
    }

    pub fn contains(&self, peer: &Identity, id: &MessageId) -> bool {
        self.ids.get(peer).is_some_and(|set| set.contains_key(id))
    }

    pub fn count_of(&self, peer: &Identity) -> usize {
        self.counts.get(peer).copied().unwrap_or(0)
    }

    pub fn len_of(&self, peer: &Identity) -> usize {
        self.ids.get(peer).map_or(0, HashMap::len)
    }

    /// Heartbeat step: zero every per-peer counter.
    pub fn reset_counts(&mut self) {
        for count in self.counts.values_mut() {
            *count = 0;
        }
    }

    /// Heartbeat step: forget ids recorded `expiry_ticks` or more heartbeats ago.
    pub fn expire(&mut self, tick: u64) {
        let expiry = self.expiry_ticks;
        for set in self.ids.values_mut() {
            set.retain(|_, seen| tick.saturating_sub(*seen) < expiry);
        }
        self.ids.retain(|_, set| !set.is_empty());
    }

    pub fn remove_peer(&mut self, peer: &Identity) {
        self.counts.remove(peer);
        self.ids.remove(peer);
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.ids.clear();
    }
}

// ============================================================================
// IWANT Promises
// ============================================================================

/// Tracks IWANT requests that the peer implicitly promised to answer.
///
/// One id per request is sampled; if it has not arrived by the deadline, the
/// peer broke its promise.
pub struct GossipPromises {
    followup: Duration,
    promises: HashMap<MessageId, HashMap<Identity, Instant>>,
}

impl GossipPromises {
    pub fn new(followup: Duration) -> Self {
        Self {
            followup,
            promises: HashMap::new(),
        }
    }

    pub fn add_promise(&mut self, peer: Identity, ids: &[MessageId], now: Instant) {
        let Some(id) = ids.choose(&mut rand::thread_rng()) else {
            return;
        };
        self.promises
            .entry(*id)
            .or_default()
            .entry(peer)
            .or_insert(now + self.followup);
    }

    /// The message arrived and passed structural checks; every promise for it is kept.
    pub fn fulfil(&mut self, id: &MessageId) {
        self.promises.remove(id);
    }

    /// Remove expired promises and count them per peer.
    pub fn take_broken(&mut self, now: Instant) -> HashMap<Identity, u32> {
        let mut broken: HashMap<Identity, u32> = HashMap::new();
        self.promises.retain(|_, peers| {
            peers.retain(|peer, deadline| {
                if now >= *deadline {
                    *broken.entry(*peer).or_insert(0) += 1;
                    false
                } else {
                    true
                }
            });
            !peers.is_empty()
        });
        broken
    }

    pub fn clear(&mut self) {
        self.promises.clear();
    }
}

// ============================================================================
// IHAVE Flood Limits
// ============================================================================

/// Per-heartbeat IHAVE accounting.
pub struct IHaveLimits {
    max_messages: usize,
    max_length: usize,
    /// IHAVE control messages received from each peer this heartbeat.
    peer_have: HashMap<Identity, usize>,
    /// Ids we asked each peer for this heartbeat.
    asked: HashMap<Identity, usize>,
}

impl IHaveLimits {
    pub fn new(max_messages: usize, max_length: usize) -> Self {
        Self {
            max_messages,
            max_length,
            peer_have: HashMap::new(),
            asked: HashMap::new(),
        }
    }

    /// Count one IHAVE from `peer`. Returns `false` once the peer is over its budget.
    pub fn admit(&mut self, peer: &Identity) -> bool {
        let n = self.peer_have.entry(*peer).or_insert(0);
        *n += 1;
        *n <= self.max_messages && self.asked.get(peer).copied().unwrap_or(0) < self.max_length
    }

    /// How many more ids may be requested from `peer` this heartbeat.
    pub fn remaining_asks(&self, peer: &Identity) -> usize {
        self.max_length
            .saturating_sub(self.asked.get(peer).copied().unwrap_or(0))
    }

    pub fn record_asks(&mut self, peer: &Identity, n: usize) {
        *self.asked.entry(*peer).or_insert(0) += n;
    }

    pub fn reset(&mut self) {
        self.peer_have.clear();
        self.asked.clear();
    }

    pub fn remove_peer(&mut self, peer: &Identity) {
        self.peer_have.remove(peer);
        self.asked.remove(peer);
    }
}
