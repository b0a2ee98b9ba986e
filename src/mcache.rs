//! # Message Cache
//!
//! Two bounded views of recently seen traffic:
//!
//! - [`MessageCache`]: full messages bucketed by heartbeat tick. Answers IWANT
//!   and supplies the ids advertised in IHAVE gossip.
//! - [`SeenCache`]: ids only, kept for a wall-clock TTL. Catches duplicates
//!   that arrive after the message has rotated out of the tick windows.
//!
//! ## Window Layout
//!
//! ```text
//! history[0]  <- current tick, new ids land here
//! history[1]
//!   ...       <- history[..gossip] is advertised via IHAVE
//! history[length - 1]  <- dropped (and its messages evicted) on the next shift
//! ```
//!
//! Entries are never removed explicitly; only [`MessageCache::shift`] evicts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::identity::Identity;
use crate::messages::{Message, MessageId};

/// Hard bound on the seen cache.
/// SECURITY: Caps memory even if an attacker floods unique ids faster than the TTL.
pub const MAX_SEEN_ENTRIES: usize = 200_000;

struct CacheEntry {
    message: Message,
    /// Peers the message came from; used to skip them when forwarding.
    originating_peers: HashSet<Identity>,
    /// How many times each peer has asked for this id via IWANT.
    iwant_counts: HashMap<Identity, u32>,
}

struct WindowEntry {
    id: MessageId,
    topic: String,
}

/// Tick-windowed cache of full messages.
pub struct MessageCache {
    msgs: HashMap<MessageId, CacheEntry>,
    history: VecDeque<Vec<WindowEntry>>,
    gossip: usize,
}

impl MessageCache {
    /// `length` windows are retained, the newest `gossip` are advertised.
    pub fn new(length: usize, gossip: usize) -> Self {
        let length = length.max(1);
        let mut history = VecDeque::with_capacity(length);
        for _ in 0..length {
            history.push_back(Vec::new());
        }
        Self {
            msgs: HashMap::new(),
            history,
            gossip: gossip.min(length),
        }
    }

    /// Insert a message into the current window.
    ///
    /// Returns `false` if the id is already cached.
    pub fn put(&mut self, id: MessageId, message: Message) -> bool {
        if self.msgs.contains_key(&id) {
            return false;
        }
        let topic = message.topic.clone();
        self.msgs.insert(
            id,
            CacheEntry {
                message,
                originating_peers: HashSet::new(),
                iwant_counts: HashMap::new(),
            },
        );
        if let Some(current) = self.history.front_mut() {
            current.push(WindowEntry { id, topic });
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.msgs.contains_key(id)
    }

    /// Note that `peer` also sent us a cached message.
    pub fn observe_duplicate(&mut self, id: &MessageId, peer: Identity) {
        if let Some(entry) = self.msgs.get_mut(id) {
            entry.originating_peers.insert(peer);
        }
    }

    /// Peers known to already hold the message.
    pub fn originating_peers(&self, id: &MessageId) -> Option<&HashSet<Identity>> {
        self.msgs.get(id).map(|e| &e.originating_peers)
    }

    /// Fetch a message for an IWANT from `peer`, bumping that peer's request count.
    ///
    /// Returns the message and the updated count.
    pub fn get_for_iwant(&mut self, id: &MessageId, peer: Identity) -> Option<(&Message, u32)> {
        let entry = self.msgs.get_mut(id)?;
        let count = entry.iwant_counts.entry(peer).or_insert(0);
        *count = count.saturating_add(1);
        let count = *count;
        Some((&entry.message, count))
    }

    /// Ids from the gossip windows, grouped by topic, restricted to `topics`.
    pub fn gossip_ids(&self, topics: &HashSet<String>) -> HashMap<String, Vec<MessageId>> {
        let mut out: HashMap<String, Vec<MessageId>> = HashMap::new();
        for window in self.history.iter().take(self.gossip) {
            for entry in window {
                if topics.contains(&entry.topic) {
                    out.entry(entry.topic.clone()).or_default().push(entry.id);
                }
            }
        }
        out
    }

    /// Open a new window and evict the oldest.
    pub fn shift(&mut self) {
        if let Some(oldest) = self.history.pop_back() {
            for entry in oldest {
                self.msgs.remove(&entry.id);
            }
        }
        self.history.push_front(Vec::new());
    }

    pub fn clear(&mut self) {
        self.msgs.clear();
        for window in self.history.iter_mut() {
            window.clear();
        }
    }
}

/// Time-bounded set of message ids already processed.
pub struct SeenCache {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(MAX_SEEN_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl,
        }
    }

    /// Record an id. Returns `false` if it was already present and unexpired.
    pub fn put(&mut self, id: MessageId, now: Instant) -> bool {
        let fresh = !self.contains(&id, now);
        self.entries.put(id, now);
        fresh
    }

    pub fn contains(&self, id: &MessageId, now: Instant) -> bool {
        self.entries
            .peek(id)
            .is_some_and(|inserted| now.duration_since(*inserted) < self.ttl)
    }

    /// Drop entries older than the TTL.
    ///
    /// LRU order matches insertion order closely enough that the sweep stops
    /// at the first unexpired entry.
    pub fn prune(&mut self, now: Instant) {
        while let Some((_, inserted)) = self.entries.peek_lru() {
            if now.duration_since(*inserted) < self.ttl {
                break;
            }
            self.entries.pop_lru();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
