use std::time::Instant;

use url::Url;

use crate::node::{NodeId, SelfStatus};

pub use self::peer_tracker::{PeerState, PeerTracker};
pub use self::quorum::{QuorumMonitor, TimerCommand};

pub mod peer_tracker;
pub mod quorum;


/// Cluster-health state owned by the engine's main loop: the per-peer
/// freshness view and the quorum state machine derived from it.
pub struct Cluster {
    pub this_node_id: NodeId,
    pub this_advertised_url: Url,
    pub peers: PeerTracker,
    pub quorum: QuorumMonitor,
}

impl Cluster {
    pub(crate) fn new(
        this_node_id: NodeId,
        this_advertised_url: Url,
        peers: PeerTracker,
        quorum: QuorumMonitor,
    ) -> Self {
        Self {
            this_node_id,
            this_advertised_url,
            peers,
            quorum,
        }
    }

    /// Number of reachable cluster members, including the local node unless
    /// it is down.
    pub fn reachable_count(&self, now: Instant) -> usize {
        let self_counts = self.quorum.status() != SelfStatus::Down;
        self.peers.reachable_peer_count(now) + usize::from(self_counts)
    }
}
