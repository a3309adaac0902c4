use std::collections::{BTreeMap, HashMap};

use quickcheck::Arbitrary;
use time::OffsetDateTime;

use super::*;
use crate::node::{NodeId, NodeStatus};

const SELF_ID: NodeId = NodeId(4);

fn ts_at(seconds: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(seconds)
}

fn node_info(id: u16, ts: OffsetDateTime) -> NodeInfo {
    NodeInfo {
        id: NodeId(id),
        last_update_ts: ts,
        status: NodeStatus::Up,
        value: format!("value-{id}").into_bytes(),
    }
}

/// Inserts entries for ids `0..count` under `key`, all stamped `now`.
fn fill_nodes(store: &mut GossipStore, key: &str, count: u16) {
    let nodes = store.kv_map.entry(StoreKey::from(key)).or_default();
    for id in 0..count {
        nodes.insert(NodeId(id), node_info(id, OffsetDateTime::now_utc()));
    }
}

/// Digests keyed and ordered deterministically, for equality checks.
fn normalized(meta: &MetaInfo) -> BTreeMap<StoreKey, BTreeMap<NodeId, OffsetDateTime>> {
    meta.iter()
        .map(|(key, metas)| {
            let by_id = metas
                .iter()
                .map(|m| (m.id, m.last_update_ts))
                .collect::<BTreeMap<_, _>>();
            (key.clone(), by_id)
        })
        .collect()
}

/// Runs the full two-phase reconciliation between two stores.
fn exchange(a: &mut GossipStore, b: &mut GossipStore) {
    let meta_a = a.meta_info();
    let (need_from_a, have_for_a) = b.diff(&meta_a);
    let entries_for_a = b.subset(&have_for_a);
    a.update(entries_for_a);
    let entries_for_b = a.subset(&need_from_a);
    b.update(entries_for_b);
}

#[test]
fn update_self_creates_key_and_id() {
    let mut store = GossipStore::new(SELF_ID, "v1");
    assert_eq!(store.node_id(), SELF_ID);

    let key = StoreKey::from("key1");
    store.update_self(key.clone(), b"first".to_vec());

    let info = store.kv_map[&key][&SELF_ID].clone();
    assert_eq!(info.id, SELF_ID);
    assert_eq!(info.value, b"first");
    assert_eq!(info.status, NodeStatus::Up);

    // key present, id absent
    store.kv_map.get_mut(&key).unwrap().remove(&SELF_ID);
    store.update_self(key.clone(), b"second".to_vec());
    assert_eq!(store.kv_map[&key][&SELF_ID].value, b"second");

    // key present, id present: value replaced, timestamp strictly advances
    let prev_ts = store.kv_map[&key][&SELF_ID].last_update_ts;
    store.update_self(key.clone(), b"third".to_vec());
    let info = store.kv_map[&key][&SELF_ID].clone();
    assert_eq!(info.value, b"third");
    assert!(info.last_update_ts > prev_ts);
}

#[test]
fn update_self_advances_timestamp_when_clock_stalls() {
    let mut store = GossipStore::new(SELF_ID, "v1");
    let key = StoreKey::from("key1");
    store.update_self(key.clone(), b"now".to_vec());

    // Pin the previous write far in the future so the wall clock cannot have
    // moved past it.
    let future = OffsetDateTime::now_utc() + time::Duration::hours(1);
    store
        .kv_map
        .get_mut(&key)
        .unwrap()
        .get_mut(&SELF_ID)
        .unwrap()
        .last_update_ts = future;

    store.update_self(key.clone(), b"later".to_vec());
    let info = &store.kv_map[&key][&SELF_ID];
    assert_eq!(info.last_update_ts, future + time::Duration::NANOSECOND);
}

#[test]
fn get_store_key_value_absent_and_empty_keys() {
    let mut store = GossipStore::new(SELF_ID, "v1");
    let key = StoreKey::from("key1");
    assert!(store.get_store_key_value(&key).is_empty());

    store.kv_map.insert(key.clone(), NodeInfoMap::new());
    assert!(store.get_store_key_value(&key).is_empty());
}

#[test]
fn get_store_key_value_fills_holes_with_invalid() {
    let mut store = GossipStore::new(SELF_ID, "v1");
    fill_nodes(&mut store, "key1", 6);
    let key = StoreKey::from("key1");
    for id in [0u16, 2, 4] {
        store.kv_map.get_mut(&key).unwrap().remove(&NodeId(id));
    }

    let list = store.get_store_key_value(&key);
    assert_eq!(list.len(), 6);
    for (i, info) in list.iter().enumerate() {
        assert_eq!(info.id, NodeId(i as u16));
        if i % 2 == 0 {
            assert_eq!(info.status, NodeStatus::Invalid);
        } else {
            assert_eq!(info.status, NodeStatus::Up);
            assert_eq!(info.value, format!("value-{i}").into_bytes());
        }
    }
}

#[test]
fn meta_info_matches_store_contents() {
    let mut store = GossipStore::new(SELF_ID, "v1");
    assert!(store.meta_info().is_empty());

    // Alternating id holes across three keys.
    for (i, key) in ["key1", "key2", "key3"].iter().enumerate() {
        fill_nodes(&mut store, key, 10);
        let nodes = store.kv_map.get_mut(&StoreKey::from(*key)).unwrap();
        for id in 0..10u16 {
            if (i % 2 == 0) == (id % 2 == 0) {
                nodes.remove(&NodeId(id));
            }
        }
    }
    // An empty key contributes nothing.
    store.kv_map.insert(StoreKey::from("empty"), NodeInfoMap::new());

    let meta = store.meta_info();
    assert_eq!(meta.len(), 3);
    for (key, metas) in &meta {
        let nodes = &store.kv_map[key];
        assert_eq!(metas.len(), nodes.len());
        for m in metas {
            let info = nodes.get(&m.id).expect("digest mentions unknown id");
            assert_eq!(info.last_update_ts, m.last_update_ts);
        }
    }
}

#[test]
fn diff_of_empty_stores_is_empty() {
    let a = GossipStore::new(SELF_ID, "v1");
    let b = GossipStore::new(SELF_ID, "v1");
    let (need, have) = a.diff(&b.meta_info());
    assert!(need.is_empty());
    assert!(have.is_empty());
}

#[test]
fn diff_against_richer_digest_requests_everything() {
    let a = GossipStore::new(SELF_ID, "v1");
    let mut b = GossipStore::new(SELF_ID, "v1");
    for key in ["key1", "key2", "key3"] {
        fill_nodes(&mut b, key, 10);
    }

    let (need, have) = a.diff(&b.meta_info());
    assert!(have.is_empty());
    assert_eq!(need.len(), 3);
    for (key, ids) in &need {
        assert_eq!(ids.len(), b.kv_map[key].len());
    }
}

#[test]
fn diff_with_own_digest_is_empty() {
    let mut store = GossipStore::new(SELF_ID, "v1");
    for key in ["key1", "key2"] {
        fill_nodes(&mut store, key, 10);
    }
    let (need, have) = store.diff(&store.meta_info());
    assert!(need.is_empty());
    assert!(have.is_empty());
}

#[test]
fn diff_against_poorer_digest_offers_everything() {
    let a = GossipStore::new(SELF_ID, "v1");
    let mut b = GossipStore::new(SELF_ID, "v1");
    for key in ["key1", "key2"] {
        fill_nodes(&mut b, key, 10);
    }

    let (need, have) = b.diff(&a.meta_info());
    assert!(need.is_empty());
    assert_eq!(have.len(), 2);
    for (key, ids) in &have {
        assert_eq!(ids.len(), b.kv_map[key].len());
    }
}

#[test]
fn diff_splits_newer_entries_per_side() {
    let mut a = GossipStore::new(SELF_ID, "v1");
    let mut b = GossipStore::new(SELF_ID, "v1");

    // Identical baseline on key1 and key2; key3 stays equal everywhere.
    for key in ["key1", "key2", "key3"] {
        fill_nodes(&mut b, key, 10);
        a.kv_map
            .insert(StoreKey::from(key), b.kv_map[&StoreKey::from(key)].clone());
    }
    // b moves ahead on even ids, a on odd ids.
    for key in ["key1", "key2"] {
        let key = StoreKey::from(key);
        for (id, info) in b.kv_map.get_mut(&key).unwrap().iter_mut() {
            if id.0 % 2 == 0 {
                info.last_update_ts = OffsetDateTime::now_utc() + time::Duration::seconds(1);
            }
        }
        for (id, info) in a.kv_map.get_mut(&key).unwrap().iter_mut() {
            if id.0 % 2 == 1 {
                info.last_update_ts = OffsetDateTime::now_utc() + time::Duration::seconds(1);
            }
        }
    }

    let (need, have) = a.diff(&b.meta_info());
    assert_eq!(need.len(), 2);
    assert_eq!(have.len(), 2);
    for (key, ids) in &need {
        assert_ne!(key.as_str(), "key3");
        assert!(ids.iter().all(|id| id.0 % 2 == 0), "wanted only even ids");
    }
    for (key, ids) in &have {
        assert_ne!(key.as_str(), "key3");
        assert!(ids.iter().all(|id| id.0 % 2 == 1), "offered only odd ids");
    }
}

#[test]
fn subset_returns_only_what_the_store_has() {
    let mut store = GossipStore::new(SELF_ID, "v1");

    let mut request = StoreNodes::new();
    for key in ["key1", "key2", "key3"] {
        request.insert(StoreKey::from(key), (0..20).map(NodeId).collect());
    }
    assert!(store.subset(&request).is_empty());

    fill_nodes(&mut store, "key1", 10);
    fill_nodes(&mut store, "key2", 10);

    let sv = store.subset(&request);
    assert_eq!(sv.len(), 2);
    assert!(!sv.contains_key(&StoreKey::from("key3")));
    for key in ["key1", "key2"] {
        let key = StoreKey::from(key);
        assert_eq!(sv[&key].len(), store.kv_map[&key].len());
    }
}

#[test]
fn update_applies_last_writer_wins() {
    let mut store = GossipStore::new(SELF_ID, "v1");
    let key = StoreKey::from("key1");
    let old = ts_at(100);
    let new = ts_at(200);

    store
        .kv_map
        .entry(key.clone())
        .or_default()
        .insert(NodeId(1), node_info(1, new));
    store
        .kv_map
        .entry(key.clone())
        .or_default()
        .insert(NodeId(2), node_info(2, old));

    let mut incoming = StoreDiff::new();
    let mut nodes = NodeInfoMap::new();
    // Older than local: must not overwrite.
    let mut stale = node_info(1, old);
    stale.value = b"stale".to_vec();
    nodes.insert(NodeId(1), stale);
    // Newer than local: must overwrite.
    let mut fresh = node_info(2, new);
    fresh.value = b"fresh".to_vec();
    nodes.insert(NodeId(2), fresh);
    // Unknown id: must insert.
    nodes.insert(NodeId(7), node_info(7, new));
    incoming.insert(key.clone(), nodes);

    let applied = store.update(incoming.clone());
    assert_eq!(applied, 2);
    assert_eq!(store.kv_map[&key][&NodeId(1)].value, b"value-1");
    assert_eq!(store.kv_map[&key][&NodeId(2)].value, b"fresh");
    assert_eq!(store.kv_map[&key][&NodeId(7)].value, b"value-7");

    // Idempotent: a second application changes nothing.
    let snapshot = store.kv_map.clone();
    store.update(incoming);
    assert_eq!(store.kv_map, snapshot);
}

#[test]
fn update_keeps_local_on_equal_timestamps() {
    let mut store = GossipStore::new(SELF_ID, "v1");
    let key = StoreKey::from("key1");
    let ts = ts_at(100);
    store
        .kv_map
        .entry(key.clone())
        .or_default()
        .insert(NodeId(1), node_info(1, ts));

    let mut conflicting = node_info(1, ts);
    conflicting.value = b"other".to_vec();
    let mut incoming = StoreDiff::new();
    incoming.insert(key.clone(), HashMap::from([(NodeId(1), conflicting)]));

    assert_eq!(store.update(incoming), 0);
    assert_eq!(store.kv_map[&key][&NodeId(1)].value, b"value-1");
}

#[test]
fn update_self_status_bumps_only_changed_entries() {
    let mut store = GossipStore::new(SELF_ID, "v1");
    store.update_self(StoreKey::from("key1"), b"a".to_vec());
    store.update_self(StoreKey::from("key2"), b"b".to_vec());
    fill_nodes(&mut store, "key3", 2);

    let before: HashMap<StoreKey, OffsetDateTime> = store
        .kv_map
        .iter()
        .filter_map(|(k, nodes)| nodes.get(&SELF_ID).map(|i| (k.clone(), i.last_update_ts)))
        .collect();

    store.update_self_status(NodeStatus::NotInQuorum);
    for (key, prev_ts) in &before {
        let info = &store.kv_map[key][&SELF_ID];
        assert_eq!(info.status, NodeStatus::NotInQuorum);
        assert!(info.last_update_ts > *prev_ts);
    }
    // Remote entries untouched.
    assert!(store.kv_map[&StoreKey::from("key3")]
        .values()
        .all(|info| info.status == NodeStatus::Up));

    // Re-applying the same status is a no-op.
    let snapshot = store.kv_map.clone();
    store.update_self_status(NodeStatus::NotInQuorum);
    assert_eq!(store.kv_map, snapshot);
}

#[test]
fn update_node_statuses_tracks_liveness() {
    let mut store = GossipStore::new(NodeId(0), "v1");
    store.update_self(StoreKey::from("key1"), b"self".to_vec());
    let key = StoreKey::from("key1");
    store
        .kv_map
        .get_mut(&key)
        .unwrap()
        .insert(NodeId(1), node_info(1, ts_at(100)));
    let mut remote = node_info(2, ts_at(100));
    remote.status = NodeStatus::NotInQuorum;
    store.kv_map.get_mut(&key).unwrap().insert(NodeId(2), remote);

    let liveness = HashMap::from([(NodeId(1), false), (NodeId(2), true)]);
    store.update_node_statuses(&liveness);

    assert_eq!(store.kv_map[&key][&NodeId(1)].status, NodeStatus::Down);
    // A status the owner announced survives while the peer is reachable.
    assert_eq!(store.kv_map[&key][&NodeId(2)].status, NodeStatus::NotInQuorum);
    // The local node's own entry is never touched.
    assert_eq!(store.kv_map[&key][&NodeId(0)].status, NodeStatus::Up);

    // A recovering peer flips back from Down to Up.
    let liveness = HashMap::from([(NodeId(1), true)]);
    store.update_node_statuses(&liveness);
    assert_eq!(store.kv_map[&key][&NodeId(1)].status, NodeStatus::Up);
}

impl Arbitrary for GossipStore {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let mut store = GossipStore::new(NodeId::arbitrary(g), "v1");
        for key in ["alpha", "beta", "gamma"] {
            if bool::arbitrary(g) {
                continue;
            }
            let nodes = store.kv_map.entry(StoreKey::from(key)).or_default();
            for _ in 0..(usize::arbitrary(g) % 6) {
                let id = NodeId::arbitrary(g);
                let ts = ts_at((u16::arbitrary(g) % 1000) as i64);
                let mut info = node_info(id.0, ts);
                info.status = NodeStatus::arbitrary(g);
                nodes.insert(id, info);
            }
        }
        store
    }
}

#[quickcheck]
fn diff_outputs_are_disjoint(a: GossipStore, b: GossipStore) -> bool {
    let (need, have) = a.diff(&b.meta_info());
    need.iter().all(|(key, ids)| {
        ids.iter().all(|id| {
            have.get(key)
                .map_or(true, |offered| !offered.contains(id))
        })
    })
}

#[quickcheck]
fn exchange_converges_digests(mut a: GossipStore, mut b: GossipStore) -> bool {
    exchange(&mut a, &mut b);
    normalized(&a.meta_info()) == normalized(&b.meta_info())
}

#[quickcheck]
fn subset_never_invents_entries(store: GossipStore, request_ids: Vec<NodeId>) -> bool {
    let mut request = StoreNodes::new();
    request.insert(StoreKey::from("alpha"), request_ids.clone());
    request.insert(StoreKey::from("delta"), request_ids);

    let sv = store.subset(&request);
    sv.iter().all(|(key, nodes)| {
        let requested = &request[key];
        nodes.keys().all(|id| {
            requested.contains(id)
                && store
                    .kv_map
                    .get(key)
                    .map_or(false, |local| local.contains_key(id))
        })
    })
}

#[quickcheck]
fn dense_listing_is_always_contiguous(store: GossipStore) -> bool {
    store.kv_map.keys().all(|key| {
        let list = store.get_store_key_value(key);
        let expected_len = store.kv_map[key]
            .keys()
            .map(|id| id.index() + 1)
            .max()
            .unwrap_or(0);
        list.len() == expected_len
            && list.iter().enumerate().all(|(i, info)| {
                info.id == NodeId(i as u16)
                    && (store.kv_map[key].contains_key(&info.id)
                        || info.status == NodeStatus::Invalid)
            })
    })
}

#[quickcheck]
fn repeated_self_updates_keep_timestamps_strictly_increasing(values: Vec<Vec<u8>>) -> bool {
    let mut store = GossipStore::new(SELF_ID, "v1");
    let key = StoreKey::from("key1");
    let mut last_ts = None;
    for value in values {
        store.update_self(key.clone(), value.clone());
        let list = store.get_store_key_value(&key);
        let info = &list[SELF_ID.index()];
        if info.value != value {
            return false;
        }
        if let Some(prev) = last_ts {
            if info.last_update_ts <= prev {
                return false;
            }
        }
        last_ts = Some(info.last_update_ts);
    }
    true
}
