use std::collections::HashMap;
use std::time::{Duration, Instant};

use url::Url;

use crate::node::NodeId;

/// Tracks, for every known peer, when an exchange with it last completed and
/// which identity it declared.
///
/// Reachability is derived rather than stored: a peer is reachable while its
/// `last_heard` falls within a window of a few gossip intervals. A peer we
/// have merely been told about, but never completed an exchange with, does
/// not count as reachable.
pub struct PeerTracker {
    peers: HashMap<Url, PeerState>,
    window: Duration,
}

/// Per-peer view, created from the initial peer list or on first contact.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub addr: Url,
    pub node_id: Option<NodeId>,
    pub declared_version: Option<String>,
    pub last_heard: Option<Instant>,
}

impl PeerState {
    fn never_heard(addr: Url) -> Self {
        Self {
            addr,
            node_id: None,
            declared_version: None,
            last_heard: None,
        }
    }

    fn is_reachable(&self, now: Instant, window: Duration) -> bool {
        self.last_heard
            .map_or(false, |heard| now.duration_since(heard) <= window)
    }
}

impl PeerTracker {
    /// `window` is how long a peer stays reachable after its last completed
    /// exchange, typically a small multiple of the gossip interval.
    pub fn new(initial_peers: impl IntoIterator<Item = Url>, window: Duration) -> Self {
        let peers = initial_peers
            .into_iter()
            .map(|addr| (addr.clone(), PeerState::never_heard(addr)))
            .collect();
        Self { peers, window }
    }

    /// Records a completed exchange with the peer at `addr`, creating its
    /// entry if this is the first contact.
    pub fn record_exchange(&mut self, addr: &Url, node_id: NodeId, version: &str, now: Instant) {
        let state = self
            .peers
            .entry(addr.clone())
            .or_insert_with(|| PeerState::never_heard(addr.clone()));
        state.node_id = Some(node_id);
        state.declared_version = Some(version.to_string());
        state.last_heard = Some(now);
    }

    pub fn reachable_peer_count(&self, now: Instant) -> usize {
        self.peers
            .values()
            .filter(|p| p.is_reachable(now, self.window))
            .count()
    }

    pub fn reachable_peers(&self, now: Instant) -> Vec<Url> {
        self.peers
            .values()
            .filter(|p| p.is_reachable(now, self.window))
            .map(|p| p.addr.clone())
            .collect()
    }

    pub fn known_peers(&self) -> Vec<Url> {
        self.peers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Reachability by node id, for peers whose id is known. Feeds the store's
    /// per-entry status marks.
    pub fn liveness(&self, now: Instant) -> HashMap<NodeId, bool> {
        self.peers
            .values()
            .filter_map(|p| p.node_id.map(|id| (id, p.is_reachable(now, self.window))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn initial_peers_are_unreachable_until_heard() {
        let peer = url("tcp://127.0.0.1:9900");
        let mut tracker = PeerTracker::new([peer.clone()], Duration::from_secs(3));
        let now = Instant::now();
        assert_eq!(tracker.reachable_peer_count(now), 0);
        assert_eq!(tracker.known_peers(), vec![peer.clone()]);

        tracker.record_exchange(&peer, NodeId::new(1), "v1", now);
        assert_eq!(tracker.reachable_peer_count(now), 1);
        assert_eq!(tracker.liveness(now), HashMap::from([(NodeId::new(1), true)]));
    }

    #[test]
    fn peers_age_out_of_the_window() {
        let peer = url("tcp://127.0.0.1:9901");
        let mut tracker = PeerTracker::new([], Duration::from_millis(300));
        let heard = Instant::now();
        tracker.record_exchange(&peer, NodeId::new(2), "v1", heard);

        assert_eq!(tracker.reachable_peer_count(heard + Duration::from_millis(200)), 1);
        assert_eq!(tracker.reachable_peer_count(heard + Duration::from_millis(400)), 0);
        assert_eq!(
            tracker.liveness(heard + Duration::from_millis(400)),
            HashMap::from([(NodeId::new(2), false)])
        );
    }

    #[test]
    fn first_contact_creates_the_peer() {
        let peer = url("tcp://127.0.0.1:9902");
        let mut tracker = PeerTracker::new([], Duration::from_secs(3));
        assert!(tracker.is_empty());

        tracker.record_exchange(&peer, NodeId::new(3), "v2", Instant::now());
        assert_eq!(tracker.known_peers(), vec![peer]);
    }
}
