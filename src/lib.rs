//! Gossip-based cluster membership and shared key-value dissemination.
//!
//! Every node keeps a replicated, eventually consistent map of
//! `(key → per-node value)` entries and periodically reconciles it with a
//! randomly chosen peer through a digest exchange that ships only the entries
//! each side is actually missing. From the freshness of those exchanges each
//! node derives its own serving status against the configured cluster size:
//! a node that can no longer reach a majority keeps serving through a grace
//! window and steps down only when the quorum timeout fires.

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

pub mod builder;
pub mod cluster;
pub mod gossiper;
pub mod node;
pub mod store;
pub mod transport;

pub use builder::GossiperBuilder;
pub use gossiper::{
    ExchangeError, Gossiper, StartError, DEFAULT_GOSSIP_INTERVAL, DEFAULT_GOSSIP_VERSION,
    DEFAULT_QUORUM_TIMEOUT,
};
pub use node::{NodeId, NodeStatus, SelfStatus};
pub use store::{
    GossipStore, MetaInfo, NodeInfo, NodeInfoMap, NodeMetaInfo, StoreDiff, StoreKey, StoreNodes,
};
pub use transport::{InboundListener, PeerConn, PeerLink, TcpPeerLink, TransportError, WireMessage};
