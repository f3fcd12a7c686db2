//! In-memory region and store cache.
//!
//! `BasicCluster` is a plain value guarded by its owner's lock; it does no
//! locking of its own. `ClusterInformer` is the read facade handed to the
//! operator controller and policy modules.

use crate::config::SchedulingOptions;
use crate::core::region::{range_overlaps, RegionInfo};
use crate::core::store::StoreInfo;
use crate::error::{IngestError, Result};
use crate::types::{RegionId, StoreId};
use bytes::Bytes;
use rand::seq::IteratorRandom;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Region/store cache with a start-key index for range queries.
#[derive(Debug, Default)]
pub struct BasicCluster {
    regions: HashMap<RegionId, RegionInfo>,
    /// start_key -> region id; regions are non-overlapping once settled, so
    /// the tree plus a bounded scan resolves overlaps.
    tree: BTreeMap<Bytes, RegionId>,
    stores: HashMap<StoreId, StoreInfo>,
    store_regions: HashMap<StoreId, HashSet<RegionId>>,
    store_leaders: HashMap<StoreId, HashSet<RegionId>>,
}

impl BasicCluster {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Look up a region by id.
    pub fn get_region(&self, id: RegionId) -> Option<&RegionInfo> {
        self.regions.get(&id)
    }

    /// Region whose range contains `key`.
    pub fn get_region_by_key(&self, key: &[u8]) -> Option<&RegionInfo> {
        let (_, id) = self.tree.range(..=Bytes::copy_from_slice(key)).next_back()?;
        let region = self.regions.get(id)?;
        let end = region.end_key();
        if end.is_empty() || key < end.as_ref() {
            Some(region)
        } else {
            None
        }
    }

    /// All cached regions.
    pub fn regions(&self) -> impl Iterator<Item = &RegionInfo> {
        self.regions.values()
    }

    /// Reject a report whose epoch is strictly older than the cached one.
    pub fn pre_check_put_region(&self, region: &RegionInfo) -> Result<Option<&RegionInfo>> {
        let origin = match self.regions.get(&region.id()) {
            Some(origin) => origin,
            None => return Ok(None),
        };
        let r = region.epoch();
        let o = origin.epoch();
        if r.version < o.version || r.conf_ver < o.conf_ver {
            return Err(IngestError::StaleRegion(region.id()).into());
        }
        Ok(Some(origin))
    }

    /// Insert or update a region, evicting regions it overlaps. Returns the
    /// evicted regions.
    pub fn put_region(&mut self, region: RegionInfo) -> Vec<RegionInfo> {
        let id = region.id();

        if let Some(old) = self.regions.remove(&id) {
            self.detach_region(&old);
        }

        let overlapped: Vec<RegionId> = self
            .tree
            .iter()
            .filter_map(|(start, rid)| {
                if *rid == id {
                    return None;
                }
                let r = self.regions.get(rid)?;
                range_overlaps(start, r.end_key(), region.start_key(), region.end_key())
                    .then_some(*rid)
            })
            .collect();

        let mut evicted = Vec::with_capacity(overlapped.len());
        for rid in overlapped {
            if let Some(old) = self.regions.remove(&rid) {
                self.detach_region(&old);
                evicted.push(old);
            }
        }

        self.attach_region(&region);
        self.regions.insert(id, region);
        evicted
    }

    /// Drop a region from the cache.
    pub fn remove_region(&mut self, id: RegionId) -> Option<RegionInfo> {
        let region = self.regions.remove(&id)?;
        self.detach_region(&region);
        Some(region)
    }

    fn attach_region(&mut self, region: &RegionInfo) {
        self.tree.insert(region.start_key().clone(), region.id());
        for peer in region.peers() {
            self.store_regions
                .entry(peer.store_id)
                .or_default()
                .insert(region.id());
        }
        let leader_store = region.leader_store_id();
        if leader_store != 0 {
            self.store_leaders
                .entry(leader_store)
                .or_default()
                .insert(region.id());
        }
    }

    fn detach_region(&mut self, region: &RegionInfo) {
        if self.tree.get(region.start_key()) == Some(&region.id()) {
            self.tree.remove(region.start_key());
        }
        for peer in region.peers() {
            if let Some(set) = self.store_regions.get_mut(&peer.store_id) {
                set.remove(&region.id());
            }
        }
        if let Some(set) = self.store_leaders.get_mut(&region.leader_store_id()) {
            set.remove(&region.id());
        }
    }

    /// Look up a store by id.
    pub fn get_store(&self, id: StoreId) -> Option<&StoreInfo> {
        self.stores.get(&id)
    }

    /// Mutable store access.
    pub fn get_store_mut(&mut self, id: StoreId) -> Option<&mut StoreInfo> {
        self.stores.get_mut(&id)
    }

    /// Insert or replace a store.
    pub fn put_store(&mut self, store: StoreInfo) {
        self.stores.insert(store.id(), store);
    }

    /// All stores.
    pub fn stores(&self) -> impl Iterator<Item = &StoreInfo> {
        self.stores.values()
    }

    /// Number of peers a store hosts.
    pub fn store_region_count(&self, store_id: StoreId) -> u64 {
        self.store_regions
            .get(&store_id)
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }

    /// Number of leaders a store hosts.
    pub fn store_leader_count(&self, store_id: StoreId) -> u64 {
        self.store_leaders
            .get(&store_id)
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }

    /// Total approximate size of a store's regions, MiB.
    pub fn store_region_size(&self, store_id: StoreId) -> u64 {
        self.sum_sizes(self.store_regions.get(&store_id))
    }

    /// Total approximate size of a store's leader regions, MiB.
    pub fn store_leader_size(&self, store_id: StoreId) -> u64 {
        self.sum_sizes(self.store_leaders.get(&store_id))
    }

    /// Number of pending peers on a store.
    pub fn store_pending_peer_count(&self, store_id: StoreId) -> u64 {
        self.store_regions
            .get(&store_id)
            .map(|set| {
                set.iter()
                    .filter_map(|rid| self.regions.get(rid))
                    .filter(|r| {
                        r.pending_peers().iter().any(|p| p.store_id == store_id)
                    })
                    .count() as u64
            })
            .unwrap_or(0)
    }

    fn sum_sizes(&self, set: Option<&HashSet<RegionId>>) -> u64 {
        set.map(|s| {
            s.iter()
                .filter_map(|rid| self.regions.get(rid))
                .map(|r| r.approximate_size())
                .sum()
        })
        .unwrap_or(0)
    }

    /// Refresh a store's derived counters from the region index.
    pub fn refresh_store_status(&mut self, store_id: StoreId) {
        let leader_count = self.store_leader_count(store_id);
        let region_count = self.store_region_count(store_id);
        let pending = self.store_pending_peer_count(store_id);
        let leader_size = self.store_leader_size(store_id);
        let region_size = self.store_region_size(store_id);
        if let Some(store) = self.stores.get_mut(&store_id) {
            store.leader_count = leader_count;
            store.region_count = region_count;
            store.pending_peer_count = pending;
            store.leader_size = leader_size;
            store.region_size = region_size;
        }
    }

    /// A uniformly random region led from `store_id`, if any.
    pub fn rand_leader_region(&self, store_id: StoreId) -> Option<&RegionInfo> {
        let set = self.store_leaders.get(&store_id)?;
        let id = set.iter().choose(&mut rand::thread_rng())?;
        self.regions.get(id)
    }

    /// A uniformly random region hosted but not led from `store_id`, if any.
    pub fn rand_follower_region(&self, store_id: StoreId) -> Option<&RegionInfo> {
        let set = self.store_regions.get(&store_id)?;
        let id = set
            .iter()
            .filter(|rid| {
                self.regions
                    .get(rid)
                    .map(|r| r.leader_store_id() != store_id)
                    .unwrap_or(false)
            })
            .choose(&mut rand::thread_rng())?;
        self.regions.get(id)
    }
}

/// Read facade over cluster state for the controller and policy modules.
pub trait ClusterInformer: Send + Sync {
    /// Look up a region by id.
    fn get_region(&self, id: RegionId) -> Option<RegionInfo>;

    /// Look up a store by id.
    fn get_store(&self, id: StoreId) -> Option<StoreInfo>;

    /// All stores.
    fn get_stores(&self) -> Vec<StoreInfo>;

    /// Current scheduling options.
    fn options(&self) -> Arc<SchedulingOptions>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::StoreMeta;
    use crate::types::{Peer, RegionEpoch, RegionMeta};

    fn region(id: RegionId, start: &[u8], end: &[u8], stores: &[StoreId]) -> RegionInfo {
        let peers: Vec<Peer> = stores
            .iter()
            .enumerate()
            .map(|(i, s)| Peer::new(id * 100 + i as u64, *s))
            .collect();
        let leader = peers.first().copied();
        RegionInfo::new(
            RegionMeta {
                id,
                start_key: Bytes::copy_from_slice(start),
                end_key: Bytes::copy_from_slice(end),
                epoch: RegionEpoch::new(1, 1),
                peers,
            },
            leader,
        )
        .with_approximate(10, 1000)
    }

    #[test]
    fn test_put_and_lookup_by_key() {
        let mut cluster = BasicCluster::new();
        cluster.put_region(region(1, b"", b"g", &[1, 2]));
        cluster.put_region(region(2, b"g", b"", &[2, 3]));

        assert_eq!(cluster.get_region_by_key(b"a").map(|r| r.id()), Some(1));
        assert_eq!(cluster.get_region_by_key(b"m").map(|r| r.id()), Some(2));
        assert_eq!(cluster.region_count(), 2);
    }

    #[test]
    fn test_put_region_evicts_overlaps() {
        let mut cluster = BasicCluster::new();
        cluster.put_region(region(1, b"a", b"g", &[1]));
        cluster.put_region(region(2, b"g", b"p", &[1]));

        // A merged region spanning both ranges replaces them.
        let merged = region(3, b"a", b"p", &[1]);
        let evicted = cluster.put_region(merged);

        let mut ids: Vec<RegionId> = evicted.iter().map(|r| r.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(cluster.region_count(), 1);
        assert_eq!(cluster.get_region_by_key(b"h").map(|r| r.id()), Some(3));
    }

    #[test]
    fn test_pre_check_rejects_stale_epoch() {
        let mut cluster = BasicCluster::new();
        let mut newer = region(1, b"a", b"g", &[1]);
        cluster.put_region(newer.clone());

        let mut stale_meta = newer.meta().clone();
        stale_meta.epoch = RegionEpoch::new(0, 1);
        let stale = RegionInfo::new(stale_meta, None);
        assert!(cluster.pre_check_put_region(&stale).is_err());

        let mut meta = newer.meta().clone();
        meta.epoch = RegionEpoch::new(2, 1);
        newer = RegionInfo::new(meta, None);
        assert!(cluster.pre_check_put_region(&newer).is_ok());
    }

    #[test]
    fn test_store_counters() {
        let mut cluster = BasicCluster::new();
        cluster.put_store(StoreInfo::new(StoreMeta {
            id: 1,
            ..Default::default()
        }));
        cluster.put_region(region(1, b"a", b"g", &[1, 2]));
        cluster.put_region(region(2, b"g", b"p", &[2, 1]));

        assert_eq!(cluster.store_region_count(1), 2);
        assert_eq!(cluster.store_leader_count(1), 1);
        assert_eq!(cluster.store_region_size(1), 20);
        assert_eq!(cluster.store_leader_size(1), 10);

        cluster.refresh_store_status(1);
        let store = cluster.get_store(1).unwrap();
        assert_eq!(store.region_count, 2);
        assert_eq!(store.leader_count, 1);
    }

    #[test]
    fn test_rand_region_selection() {
        let mut cluster = BasicCluster::new();
        cluster.put_region(region(1, b"a", b"g", &[1, 2]));

        assert_eq!(cluster.rand_leader_region(1).map(|r| r.id()), Some(1));
        assert!(cluster.rand_leader_region(2).is_none());
        assert_eq!(cluster.rand_follower_region(2).map(|r| r.id()), Some(1));
    }
}
