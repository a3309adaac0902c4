use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::gossiper::{
    Gossiper, GossiperConfig, DEFAULT_GOSSIP_INTERVAL, DEFAULT_GOSSIP_VERSION,
    DEFAULT_QUORUM_TIMEOUT,
};
use crate::node::NodeId;
use crate::transport::{PeerLink, TcpPeerLink};

/// Assembles a [Gossiper] without starting it.
///
/// Only the node's address and id are mandatory; everything else has
/// production defaults. Tests typically shorten the gossip interval and the
/// quorum timeout, and pin the rng seed to make peer selection reproducible.
pub struct GossiperBuilder {
    self_addr: Url,
    node_id: NodeId,
    gossip_interval: Duration,
    quorum_timeout: Duration,
    suspicion_ticks: u32,
    explore_probability: f64,
    version: String,
    rng_seed: Option<u64>,
    peer_link: Option<Arc<dyn PeerLink>>,
}

impl GossiperBuilder {
    pub fn new(self_addr: Url, node_id: NodeId) -> Self {
        Self {
            self_addr,
            node_id,
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            quorum_timeout: DEFAULT_QUORUM_TIMEOUT,
            suspicion_ticks: 3,
            explore_probability: 0.1,
            version: DEFAULT_GOSSIP_VERSION.to_string(),
            rng_seed: None,
            peer_link: None,
        }
    }

    /// Time between gossip rounds. Each round is jittered by up to ±20% so
    /// nodes do not synchronize.
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// How long a node below quorum keeps serving before stepping down.
    pub fn with_quorum_timeout(mut self, timeout: Duration) -> Self {
        self.quorum_timeout = timeout;
        self
    }

    /// How many gossip intervals may pass since the last completed exchange
    /// before a peer is considered unreachable.
    pub fn with_suspicion_ticks(mut self, ticks: u32) -> Self {
        self.suspicion_ticks = ticks.max(1);
        self
    }

    /// Probability of dialing an arbitrary known peer instead of a reachable
    /// one, so downed peers are eventually rediscovered.
    pub fn with_explore_probability(mut self, probability: f64) -> Self {
        self.explore_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Gossip generation. Nodes refuse to exchange across differing versions.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Swaps the transport. The default gossips over plain TCP.
    pub fn with_peer_link(mut self, peer_link: Arc<dyn PeerLink>) -> Self {
        self.peer_link = Some(peer_link);
        self
    }

    pub fn build(self) -> Gossiper {
        let peer_link = self
            .peer_link
            .unwrap_or_else(|| Arc::new(TcpPeerLink::new()));
        let config = GossiperConfig {
            self_addr: self.self_addr,
            node_id: self.node_id,
            gossip_interval: self.gossip_interval,
            quorum_timeout: self.quorum_timeout,
            suspicion_ticks: self.suspicion_ticks,
            explore_probability: self.explore_probability,
            version: self.version,
            rng_seed: self.rng_seed,
        };
        Gossiper::new(config, peer_link)
    }
}
