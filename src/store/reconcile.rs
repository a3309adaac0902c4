use std::collections::HashSet;

use tracing::warn;

use crate::node::NodeId;

use super::{GossipStore, MetaInfo, StoreDiff, StoreNodes};

impl GossipStore {
    /// Splits a remote digest into the entries this store is missing and the
    /// entries it holds newer than the remote.
    ///
    /// For every `(key, id, ts)` in the digest: an absent or older local entry
    /// puts `(key, id)` into the first set, a newer local entry puts it into
    /// the second. Equal timestamps transfer nothing, so the two sets are
    /// disjoint. Every `(key, id)` this store holds that the digest does not
    /// mention also lands in the second set.
    pub fn diff(&self, remote: &MetaInfo) -> (StoreNodes, StoreNodes) {
        let mut need_from_remote = StoreNodes::new();
        let mut have_newer = StoreNodes::new();

        for (key, metas) in remote {
            let local = self.kv_map.get(key);
            for meta in metas {
                match local.and_then(|nodes| nodes.get(&meta.id)) {
                    None => need_from_remote
                        .entry(key.clone())
                        .or_default()
                        .push(meta.id),
                    Some(info) if info.last_update_ts < meta.last_update_ts => need_from_remote
                        .entry(key.clone())
                        .or_default()
                        .push(meta.id),
                    Some(info) if info.last_update_ts > meta.last_update_ts => have_newer
                        .entry(key.clone())
                        .or_default()
                        .push(meta.id),
                    Some(_) => {}
                }
            }
            if let Some(nodes) = local {
                let mentioned: HashSet<NodeId> = metas.iter().map(|meta| meta.id).collect();
                for id in nodes.keys().filter(|id| !mentioned.contains(id)) {
                    have_newer.entry(key.clone()).or_default().push(*id);
                }
            }
        }

        // Whole keys the digest does not carry.
        for (key, nodes) in &self.kv_map {
            if !remote.contains_key(key) && !nodes.is_empty() {
                have_newer
                    .entry(key.clone())
                    .or_default()
                    .extend(nodes.keys().copied());
            }
        }

        (need_from_remote, have_newer)
    }

    /// Materializes exactly the requested entries this store actually has.
    /// Unknown keys and ids are silently omitted: the result is a subset, not
    /// a report of absences.
    pub fn subset(&self, request: &StoreNodes) -> StoreDiff {
        let mut result = StoreDiff::new();
        for (key, ids) in request {
            let nodes = match self.kv_map.get(key) {
                Some(nodes) => nodes,
                None => continue,
            };
            let found: super::NodeInfoMap = ids
                .iter()
                .filter_map(|id| nodes.get(id).map(|info| (*id, info.clone())))
                .collect();
            if !found.is_empty() {
                result.insert(key.clone(), found);
            }
        }
        result
    }

    /// Merges incoming entries with last-writer-wins on the per-entry
    /// timestamp: insert when absent, overwrite only when strictly newer.
    /// Applying the same batch twice leaves the store unchanged. Returns the
    /// number of entries taken.
    pub fn update(&mut self, incoming: StoreDiff) -> usize {
        let mut applied = 0;
        for (key, nodes) in incoming {
            let local = self.kv_map.entry(key).or_default();
            for (id, info) in nodes {
                match local.get(&id) {
                    Some(existing) if existing.last_update_ts > info.last_update_ts => {}
                    Some(existing) if existing.last_update_ts == info.last_update_ts => {
                        if existing.value != info.value {
                            warn!(node = %id, "conflicting values share a timestamp, keeping local");
                        }
                    }
                    _ => {
                        local.insert(id, info);
                        applied += 1;
                    }
                }
            }
        }
        applied
    }
}
