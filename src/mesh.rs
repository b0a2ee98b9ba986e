//! # Mesh Manager
//!
//! Owns the per-topic overlay state and decides GRAFT/PRUNE actions. It does
//! not send anything: every operation returns the peers the router must
//! notify, so the decisions stay testable without a network.
//!
//! ## State
//!
//! | Map | Meaning |
//! |-----|---------|
//! | `topics` | remote peers known to subscribe to each topic |
//! | `mesh` | full-message peers for topics we joined |
//! | `fanout` | publish targets for topics we did not join |
//! | `backoff` | (topic, peer) pairs we must not GRAFT until expiry |
//!
//! ## Heartbeat Pass (per joined topic)
//!
//! 1. Drop mesh peers with negative score.
//! 2. Below `d_lo`: graft up to `d` random eligible topic peers.
//! 3. Above `d_hi`: keep the best `d_score` by score, shuffle the rest, keep
//!    at least `d_out` outbound peers among the first `d`, prune the tail.
//! 4. At or above `d_lo` but short of `d_out` outbound peers: graft outbound ones.
//! 5. Every `opportunistic_graft_ticks`: if the median mesh score is below the
//!    threshold, graft peers scoring above the median.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::config::MeshConfig;
use crate::identity::Identity;

/// Peer score lookup supplied by the router.
pub type ScoreFn<'a> = &'a dyn Fn(&Identity) -> f64;

/// Outcome of one heartbeat pass over a topic's mesh.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MeshChanges {
    /// Peers added to the mesh; each needs a GRAFT.
    pub graft: Vec<Identity>,
    /// Peers removed from the mesh; each needs a PRUNE. The flag says
    /// whether peer exchange may be offered.
    pub prune: Vec<(Identity, bool)>,
}

impl MeshChanges {
    pub fn is_empty(&self) -> bool {
        self.graft.is_empty() && self.prune.is_empty()
    }
}

pub struct MeshState {
    config: MeshConfig,
    topics: HashMap<String, HashSet<Identity>>,
    mesh: HashMap<String, HashSet<Identity>>,
    fanout: HashMap<String, HashSet<Identity>>,
    fanout_last_pub: HashMap<String, Instant>,
    backoff: HashMap<String, HashMap<Identity, Instant>>,
    outbound: HashMap<Identity, bool>,
}

impl MeshState {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            topics: HashMap::new(),
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            fanout_last_pub: HashMap::new(),
            backoff: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    // ========================================================================
    // Peers and Subscriptions
    // ========================================================================

    pub fn add_peer(&mut self, peer: Identity, outbound: bool) {
        self.outbound.insert(peer, outbound);
    }

    pub fn is_outbound(&self, peer: &Identity) -> bool {
        self.outbound.get(peer).copied().unwrap_or(false)
    }

    /// Forget a peer everywhere except the backoff table.
    ///
    /// Returns the topics whose mesh contained it.
    pub fn remove_peer(&mut self, peer: &Identity) -> Vec<String> {
        self.outbound.remove(peer);
        for peers in self.topics.values_mut() {
            peers.remove(peer);
        }
        for peers in self.fanout.values_mut() {
            peers.remove(peer);
        }
        let mut left = Vec::new();
        for (topic, peers) in self.mesh.iter_mut() {
            if peers.remove(peer) {
                left.push(topic.clone());
            }
        }
        left
    }

    /// Returns `true` if this is a new subscription.
    pub fn add_subscription(&mut self, peer: Identity, topic: &str) -> bool {
        self.topics.entry(topic.to_string()).or_default().insert(peer)
    }

    /// Drop a remote subscription and any mesh/fanout membership for it.
    ///
    /// Returns `true` if the peer was in our mesh for the topic.
    pub fn remove_subscription(&mut self, peer: &Identity, topic: &str) -> bool {
        if let Some(peers) = self.topics.get_mut(topic) {
            peers.remove(peer);
            if peers.is_empty() {
                self.topics.remove(topic);
            }
        }
        if let Some(peers) = self.fanout.get_mut(topic) {
            peers.remove(peer);
        }
        self.mesh.get_mut(topic).is_some_and(|peers| peers.remove(peer))
    }

    pub fn is_subscribed(&self, peer: &Identity, topic: &str) -> bool {
        self.topics.get(topic).is_some_and(|peers| peers.contains(peer))
    }

    pub fn topic_peers(&self, topic: &str) -> Vec<Identity> {
        self.topics
            .get(topic)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Mesh
    // ========================================================================

    pub fn has_mesh(&self, topic: &str) -> bool {
        self.mesh.contains_key(topic)
    }

    pub fn in_mesh(&self, topic: &str, peer: &Identity) -> bool {
        self.mesh.get(topic).is_some_and(|peers| peers.contains(peer))
    }

    pub fn mesh_peers(&self, topic: &str) -> Vec<Identity> {
        self.mesh
            .get(topic)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn mesh_topics(&self) -> Vec<String> {
        self.mesh.keys().cloned().collect()
    }

    /// Join a topic, seeding the mesh from fanout first and then from random
    /// eligible subscribers. Returns the peers to GRAFT.
    pub fn join(&mut self, topic: &str, score: ScoreFn<'_>, now: Instant) -> Vec<Identity> {
        if self.mesh.contains_key(topic) {
            return Vec::new();
        }

        let mut members: HashSet<Identity> = HashSet::new();
        if let Some(fanout) = self.fanout.remove(topic) {
            self.fanout_last_pub.remove(topic);
            for peer in fanout {
                if score(&peer) >= 0.0 && !self.is_backed_off(topic, &peer, now) {
                    members.insert(peer);
                }
            }
        }

        if members.len() < self.config.d {
            let need = self.config.d - members.len();
            let extra = self.random_peers(topic, need, |p| {
                !members.contains(p) && score(p) >= 0.0 && !self.is_backed_off(topic, p, now)
            });
            members.extend(extra);
        }

        let grafted: Vec<Identity> = members.iter().copied().collect();
        self.mesh.insert(topic.to_string(), members);
        debug!(topic = %topic, peers = grafted.len(), "joined topic mesh");
        grafted
    }

    /// Leave a topic. Returns the former mesh peers, each of which is now
    /// backed off for `unsubscribe_backoff` and needs a PRUNE.
    pub fn leave(&mut self, topic: &str, now: Instant) -> Vec<Identity> {
        let Some(peers) = self.mesh.remove(topic) else {
            return Vec::new();
        };
        let peers: Vec<Identity> = peers.into_iter().collect();
        let backoff = self.config.unsubscribe_backoff;
        for peer in &peers {
            self.add_backoff(topic, *peer, backoff, now);
        }
        debug!(topic = %topic, peers = peers.len(), "left topic mesh");
        peers
    }

    /// Add a peer to a joined topic's mesh. Returns `false` if we have not
    /// joined the topic or the peer was already present.
    pub fn graft(&mut self, topic: &str, peer: Identity) -> bool {
        self.mesh.get_mut(topic).is_some_and(|peers| peers.insert(peer))
    }

    /// Returns `true` if the peer was in the mesh.
    pub fn prune(&mut self, topic: &str, peer: &Identity) -> bool {
        self.mesh.get_mut(topic).is_some_and(|peers| peers.remove(peer))
    }

    /// One heartbeat pass over a joined topic. Mesh state and backoff are
    /// updated in place; the returned changes still need to be signalled.
    pub fn maintain(
        &mut self,
        topic: &str,
        tick: u64,
        opportunistic_graft_threshold: f64,
        score: ScoreFn<'_>,
        now: Instant,
    ) -> MeshChanges {
        let mut changes = MeshChanges::default();
        let Some(current) = self.mesh.get(topic) else {
            return changes;
        };
        let mut peers: HashSet<Identity> = current.clone();
        let cfg = self.config.clone();

        // Negative score: prune without PX.
        let negative: Vec<Identity> = peers.iter().filter(|p| score(p) < 0.0).copied().collect();
        for peer in negative {
            trace!(peer = %peer.short(), topic = %topic, "pruning negative-score mesh peer");
            peers.remove(&peer);
            changes.prune.push((peer, false));
        }

        // Undersubscribed.
        if peers.len() < cfg.d_lo {
            let need = cfg.d - peers.len();
            let candidates = self.random_peers(topic, need, |p| {
                !peers.contains(p) && score(p) >= 0.0 && !self.is_backed_off(topic, p, now)
            });
            for peer in candidates {
                peers.insert(peer);
                changes.graft.push(peer);
            }
        }

        // Oversubscribed.
        if peers.len() > cfg.d_hi {
            let mut ranked: Vec<Identity> = peers.iter().copied().collect();
            ranked.shuffle(&mut rand::thread_rng());
            ranked.sort_by(|a, b| score(b).partial_cmp(&score(a)).unwrap_or(Ordering::Equal));
            let keep_best = cfg.d_score.min(ranked.len());
            ranked[keep_best..].shuffle(&mut rand::thread_rng());

            let outbound_in_d = ranked.iter().take(cfg.d).filter(|p| self.is_outbound(p)).count();
            if outbound_in_d < cfg.d_out {
                // Bubble outbound peers to the front so truncation keeps them.
                let rotate = |ranked: &mut Vec<Identity>, i: usize| {
                    let p = ranked.remove(i);
                    ranked.insert(0, p);
                };
                let mut have = outbound_in_d;
                let mut i = 1;
                while i < cfg.d && have > 0 {
                    if self.is_outbound(&ranked[i]) {
                        rotate(&mut ranked, i);
                        have -= 1;
                    }
                    i += 1;
                }
                let mut need = cfg.d_out - outbound_in_d;
                let mut i = cfg.d;
                while i < ranked.len() && need > 0 {
                    if self.is_outbound(&ranked[i]) {
                        rotate(&mut ranked, i);
                        need -= 1;
                    }
                    i += 1;
                }
            }

            for peer in ranked.into_iter().skip(cfg.d) {
                peers.remove(&peer);
                changes.prune.push((peer, true));
            }
        }

        // Outbound quota.
        if peers.len() >= cfg.d_lo {
            let outbound = peers.iter().filter(|p| self.is_outbound(p)).count();
            if outbound < cfg.d_out {
                let need = cfg.d_out - outbound;
                let candidates = self.random_peers(topic, need, |p| {
                    !peers.contains(p)
                        && self.is_outbound(p)
                        && score(p) >= 0.0
                        && !self.is_backed_off(topic, p, now)
                });
                for peer in candidates {
                    peers.insert(peer);
                    changes.graft.push(peer);
                }
            }
        }

        // Opportunistic graft.
        if cfg.opportunistic_graft_ticks > 0 && tick % cfg.opportunistic_graft_ticks == 0 && peers.len() > 1 {
            let mut scores: Vec<f64> = peers.iter().map(|p| score(p)).collect();
            scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            let median = scores[scores.len() / 2];
            if median < opportunistic_graft_threshold {
                let candidates = self.random_peers(topic, cfg.opportunistic_graft_peers, |p| {
                    !peers.contains(p) && score(p) > median && !self.is_backed_off(topic, p, now)
                });
                for peer in candidates {
                    debug!(peer = %peer.short(), topic = %topic, median, "opportunistic graft");
                    peers.insert(peer);
                    changes.graft.push(peer);
                }
            }
        }

        for (peer, _) in &changes.prune {
            self.add_prune_backoff(topic, *peer, now);
        }
        self.mesh.insert(topic.to_string(), peers);

        if !changes.is_empty() {
            debug!(
                topic = %topic,
                grafted = changes.graft.len(),
                pruned = changes.prune.len(),
                "mesh maintenance"
            );
        }
        changes
    }

    // ========================================================================
    // Fanout
    // ========================================================================

    pub fn fanout_peers(&self, topic: &str) -> Vec<Identity> {
        self.fanout
            .get(topic)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn fanout_topics(&self) -> Vec<String> {
        self.fanout.keys().cloned().collect()
    }

    /// Publish targets for a topic we have not joined, creating the fanout
    /// set on first use. Refreshes the last-publish time.
    pub fn fanout_for_publish(
        &mut self,
        topic: &str,
        publish_threshold: f64,
        score: ScoreFn<'_>,
        now: Instant,
    ) -> Vec<Identity> {
        if !self.fanout.contains_key(topic) {
            let peers = self.random_peers(topic, self.config.d, |p| score(p) >= publish_threshold);
            if !peers.is_empty() {
                self.fanout.insert(topic.to_string(), peers.into_iter().collect());
            }
        }
        self.fanout_last_pub.insert(topic.to_string(), now);
        self.fanout_peers(topic)
    }

    /// Drop fanout topics idle for longer than `fanout_ttl`.
    pub fn expire_fanout(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.config.fanout_ttl;
        let expired: Vec<String> = self
            .fanout_last_pub
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > ttl)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in &expired {
            self.fanout.remove(topic);
            self.fanout_last_pub.remove(topic);
            trace!(topic = %topic, "fanout expired");
        }
        expired
    }

    /// Drop departed or low-score fanout peers and top the set up to `d`.
    pub fn maintain_fanout(&mut self, topic: &str, publish_threshold: f64, score: ScoreFn<'_>) {
        let Some(current) = self.fanout.get(topic) else {
            return;
        };
        let subscribers = self.topics.get(topic);
        let mut peers: HashSet<Identity> = current
            .iter()
            .filter(|p| subscribers.is_some_and(|s| s.contains(p)) && score(p) >= publish_threshold)
            .copied()
            .collect();

        if peers.len() < self.config.d {
            let need = self.config.d - peers.len();
            let extra = self.random_peers(topic, need, |p| !peers.contains(p) && score(p) >= publish_threshold);
            peers.extend(extra);
        }
        self.fanout.insert(topic.to_string(), peers);
    }

    // ========================================================================
    // Backoff
    // ========================================================================

    /// Back a peer off for at least `duration`; an existing later expiry wins.
    pub fn add_backoff(&mut self, topic: &str, peer: Identity, duration: Duration, now: Instant) {
        let expiry = now + duration;
        let entry = self.backoff.entry(topic.to_string()).or_default().entry(peer).or_insert(expiry);
        if *entry < expiry {
            *entry = expiry;
        }
    }

    /// Back off after pruning: `prune_backoff` plus uniform jitter.
    pub fn add_prune_backoff(&mut self, topic: &str, peer: Identity, now: Instant) {
        let jitter = self.config.prune_backoff_jitter;
        let extra = if jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..jitter)
        };
        self.add_backoff(topic, peer, self.config.prune_backoff + extra, now);
    }

    pub fn backoff_expiry(&self, topic: &str, peer: &Identity) -> Option<Instant> {
        self.backoff.get(topic).and_then(|peers| peers.get(peer)).copied()
    }

    pub fn is_backed_off(&self, topic: &str, peer: &Identity, now: Instant) -> bool {
        self.backoff_expiry(topic, peer).is_some_and(|expiry| now < expiry)
    }

    /// Remove elapsed backoff entries.
    pub fn sweep_backoff(&mut self, now: Instant) {
        for peers in self.backoff.values_mut() {
            peers.retain(|_, expiry| now < *expiry);
        }
        self.backoff.retain(|_, peers| !peers.is_empty());
    }

    // ========================================================================
    // Peer Selection
    // ========================================================================

    /// Up to `count` random subscribers of `topic` passing `filter`.
    pub fn random_peers<F>(&self, topic: &str, count: usize, filter: F) -> Vec<Identity>
    where
        F: Fn(&Identity) -> bool,
    {
        let Some(subscribers) = self.topics.get(topic) else {
            return Vec::new();
        };
        let mut eligible: Vec<Identity> = subscribers.iter().filter(|p| filter(p)).copied().collect();
        eligible.shuffle(&mut rand::thread_rng());
        eligible.truncate(count);
        eligible
    }

    /// Non-mesh subscribers to send IHAVE to: `max(d_lazy, gossip_factor * eligible)`.
    pub fn gossip_targets(
        &self,
        topic: &str,
        exclude: &HashSet<Identity>,
        gossip_threshold: f64,
        score: ScoreFn<'_>,
    ) -> Vec<Identity> {
        let Some(subscribers) = self.topics.get(topic) else {
            return Vec::new();
        };
        let mut eligible: Vec<Identity> = subscribers
            .iter()
            .filter(|p| !exclude.contains(p) && score(p) >= gossip_threshold)
            .copied()
            .collect();
        let factor = (self.config.gossip_factor * eligible.len() as f64) as usize;
        let target = self.config.d_lazy.max(factor);
        eligible.shuffle(&mut rand::thread_rng());
        eligible.truncate(target);
        eligible
    }

    /// Peer exchange suggestions for a peer being pruned.
    pub fn px_candidates(&self, topic: &str, pruned: &Identity, score: ScoreFn<'_>) -> Vec<Identity> {
        self.random_peers(topic, self.config.prune_peers, |p| p != pruned && score(p) >= 0.0)
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.mesh.clear();
        self.fanout.clear();
        self.fanout_last_pub.clear();
        self.backoff.clear();
        self.outbound.clear();
    }
}
