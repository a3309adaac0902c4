use std::fmt::{self, Display};

#[cfg(test)]
use quickcheck::Arbitrary;
use serde::{Deserialize, Serialize};

/// A [NodeId] is a small number uniquely identifying a single node in a cluster.
///
/// Ids are assigned by the operator at construction time. The id space may be
/// sparse: dense listings returned by
/// [GossipStore::get_store_key_value](crate::store::GossipStore::get_store_key_value)
/// fill the holes with `Invalid` placeholders.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord, Debug, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u16);

impl NodeId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for NodeId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Status attached to a single `(key, node)` entry in the store.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum NodeStatus {
    // The owning node wrote this entry and is currently reachable.
    Up,
    // The owning node stopped gossiping or has been unreachable for too long.
    Down,
    // Placeholder for an id hole in a dense listing. Never stored.
    Invalid,
    // The owning node is alive but lost quorum and is not serving.
    NotInQuorum,
}

/// The node's own serving status, derived from the reachable-member count
/// against the configured cluster size.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum SelfStatus {
    // In quorum and serving.
    Up,
    // Below quorum, still serving while the quorum timer runs.
    UpAndWaitingForQuorum,
    // The quorum timer fired without recovery. Not serving.
    WaitingForQuorum,
    // Stopped, or never started.
    Down,
}

impl Display for SelfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelfStatus::Up => "up",
            SelfStatus::UpAndWaitingForQuorum => "up-and-waiting-for-quorum",
            SelfStatus::WaitingForQuorum => "waiting-for-quorum",
            SelfStatus::Down => "down",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
impl Arbitrary for NodeId {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        // Small ids keep dense materializations manageable in property tests.
        NodeId(u16::arbitrary(g) % 12)
    }
}

#[cfg(test)]
impl Arbitrary for NodeStatus {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        *g.choose(&[Self::Up, Self::Down, Self::NotInQuorum]).unwrap()
    }
}
