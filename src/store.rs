use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::node::{NodeId, NodeStatus};

mod reconcile;
#[cfg(test)]
mod store_tests;

/// Identifies one replicated entry. Keys are arbitrary strings chosen by the
/// application.
#[repr(transparent)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StoreKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for StoreKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One `(key, node)` record: the owning node's opaque payload plus the
/// last-writer-wins timestamp it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub last_update_ts: OffsetDateTime,
    pub status: NodeStatus,
    pub value: Vec<u8>,
}

impl NodeInfo {
    /// Placeholder for an id hole in a dense listing.
    fn invalid(id: NodeId) -> Self {
        Self {
            id,
            last_update_ts: OffsetDateTime::UNIX_EPOCH,
            status: NodeStatus::Invalid,
            value: Vec::new(),
        }
    }
}

pub type NodeInfoMap = HashMap<NodeId, NodeInfo>;

/// One `(id, timestamp)` pair of a digest. Digests never carry values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetaInfo {
    pub id: NodeId,
    pub last_update_ts: OffsetDateTime,
}

/// Digest form of the store: for each key, the `(id, timestamp)` pairs the
/// sender knows about.
pub type MetaInfo = HashMap<StoreKey, Vec<NodeMetaInfo>>;

/// Request form: for each key, the ids the sender wants materialized.
pub type StoreNodes = HashMap<StoreKey, Vec<NodeId>>;

/// Materialized entries shipped between nodes during reconciliation.
pub type StoreDiff = HashMap<StoreKey, NodeInfoMap>;

/// The replicated `(key → per-node value)` table.
///
/// Entries under the local node's id are written through [update_self]; entries
/// under any other id arrive exclusively through reconciliation
/// ([update](GossipStore::update)). For a given `(key, id)` pair the stored
/// timestamp never goes backwards.
///
/// [update_self]: GossipStore::update_self
#[derive(Debug, Clone)]
pub struct GossipStore {
    node_id: NodeId,
    version: String,
    kv_map: HashMap<StoreKey, NodeInfoMap>,
}

impl GossipStore {
    pub fn new(node_id: NodeId, version: impl Into<String>) -> Self {
        Self {
            node_id,
            version: version.into(),
            kv_map: HashMap::new(),
        }
    }

    /// The local node's identity, set at construction.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The gossip generation this store speaks. Exchanges between differing
    /// versions are refused.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Creates or overwrites the local node's entry under `key`.
    ///
    /// The new timestamp is strictly greater than the previous one for
    /// `(key, self)`. When the wall clock has not advanced since the last
    /// write, the stored timestamp is bumped by one nanosecond instead.
    pub fn update_self(&mut self, key: StoreKey, value: Vec<u8>) {
        let ts = self.next_self_ts(&key);
        let info = NodeInfo {
            id: self.node_id,
            last_update_ts: ts,
            status: NodeStatus::Up,
            value,
        };
        self.kv_map.entry(key).or_default().insert(self.node_id, info);
    }

    /// Flips the status of every entry the local node owns, bumping their
    /// timestamps so peers pick the change up through reconciliation.
    /// Entries already carrying `status` are left untouched.
    pub fn update_self_status(&mut self, status: NodeStatus) {
        let keys: Vec<StoreKey> = self
            .kv_map
            .iter()
            .filter(|(_, nodes)| {
                nodes
                    .get(&self.node_id)
                    .map_or(false, |info| info.status != status)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            let ts = self.next_self_ts(&key);
            if let Some(info) = self
                .kv_map
                .get_mut(&key)
                .and_then(|nodes| nodes.get_mut(&self.node_id))
            {
                info.status = status;
                info.last_update_ts = ts;
            }
        }
    }

    /// Returns one [NodeInfo] per id in `[0 ..= max id]` for `key`, so that
    /// list indices equal node ids. Id holes carry `Invalid` placeholders.
    /// Absent keys yield an empty list.
    pub fn get_store_key_value(&self, key: &StoreKey) -> Vec<NodeInfo> {
        let nodes = match self.kv_map.get(key) {
            Some(nodes) => nodes,
            None => return Vec::new(),
        };
        let max_index = match nodes.keys().map(|id| id.index()).max() {
            Some(max_index) => max_index,
            None => return Vec::new(),
        };
        (0..=max_index)
            .map(|i| {
                let id = NodeId(i as u16);
                nodes
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| NodeInfo::invalid(id))
            })
            .collect()
    }

    pub fn get_store_keys(&self) -> Vec<StoreKey> {
        self.kv_map.keys().cloned().collect()
    }

    /// Digest of the current store. Keys with no entries contribute nothing,
    /// so the digest and the store always agree on every `(key, id)` pair.
    pub fn meta_info(&self) -> MetaInfo {
        self.kv_map
            .iter()
            .filter(|(_, nodes)| !nodes.is_empty())
            .map(|(key, nodes)| {
                let metas = nodes
                    .values()
                    .map(|info| NodeMetaInfo {
                        id: info.id,
                        last_update_ts: info.last_update_ts,
                    })
                    .collect();
                (key.clone(), metas)
            })
            .collect()
    }

    /// Applies externally derived peer liveness to remote entries. Entries of
    /// unreachable peers are marked `Down`; entries of reachable peers that
    /// were previously marked `Down` revert to `Up`. Statuses the owning node
    /// announced itself (such as `NotInQuorum`) are preserved while the peer
    /// stays reachable. Timestamps are untouched, so a real write by the
    /// owner always supersedes a liveness mark.
    pub fn update_node_statuses(&mut self, liveness: &HashMap<NodeId, bool>) {
        for nodes in self.kv_map.values_mut() {
            for (id, info) in nodes.iter_mut() {
                if *id == self.node_id {
                    continue;
                }
                if let Some(alive) = liveness.get(id) {
                    info.status = match (*alive, info.status) {
                        (false, _) => NodeStatus::Down,
                        (true, NodeStatus::Down) => NodeStatus::Up,
                        (true, current) => current,
                    };
                }
            }
        }
    }

    fn next_self_ts(&self, key: &StoreKey) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        match self
            .kv_map
            .get(key)
            .and_then(|nodes| nodes.get(&self.node_id))
        {
            Some(prev) if prev.last_update_ts >= now => {
                prev.last_update_ts + time::Duration::NANOSECOND
            }
            _ => now,
        }
    }
}
