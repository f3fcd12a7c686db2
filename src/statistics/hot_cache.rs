//! Hot-peer classification cache.
//!
//! One `HotPeerCache` per flow kind tracks the hottest region peers of every
//! store across six load dimensions. Classification is hysteresis-based: a
//! peer must stay hot to climb `hot_degree`, and gets `anti_count` cold
//! observations of grace before eviction.

use crate::core::region::RegionInfo;
use crate::statistics::hot_peer::{HotPeerStat, LoadDim, DIM_LEN};
use crate::statistics::topn::TopN;
use crate::statistics::REGION_HEARTBEAT_REPORT_INTERVAL;
use crate::types::{FlowKind, RegionId, StoreId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Ranked entries kept per store and dimension.
const TOP_N: usize = 60;

/// Entries not refreshed within this window are dropped.
const TOP_N_TTL: Duration = Duration::from_secs(3 * REGION_HEARTBEAT_REPORT_INTERVAL);

/// Reports closer together than this are treated as noise.
const HOT_REGION_REPORT_MIN_INTERVAL: u64 = 3;

/// Cold observations tolerated before eviction.
const HOT_REGION_ANTI_COUNT: i32 = 2;

/// Whether opposite-direction dimensions also qualify a peer as hot.
const UPDATE_WITH_OTHER_STATS: bool = true;

/// Per-dimension floors a rate must reach to count as hot.
const MIN_HOT_THRESHOLDS: [f64; DIM_LEN] = [256.0, 16.0, 16.0, 256.0, 16.0, 16.0];

/// Hot peers of every store for one flow direction.
#[derive(Debug)]
pub struct HotPeerCache {
    kind: FlowKind,
    peers_of_store: HashMap<StoreId, TopN>,
    stores_of_region: HashMap<RegionId, HashSet<StoreId>>,
    min_thresholds: [f64; DIM_LEN],
    denoising: bool,
}

impl HotPeerCache {
    /// Create an empty cache for `kind`.
    pub fn new(kind: FlowKind) -> Self {
        Self {
            kind,
            peers_of_store: HashMap::new(),
            stores_of_region: HashMap::new(),
            min_thresholds: MIN_HOT_THRESHOLDS,
            denoising: true,
        }
    }

    /// Disable report-interval denoising. Test hook.
    pub fn set_denoising(&mut self, denoising: bool) {
        self.denoising = denoising;
    }

    /// Flow kind this cache tracks.
    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    /// Flattened snapshot of hot peers per store.
    pub fn region_stats(&self) -> HashMap<StoreId, Vec<HotPeerStat>> {
        self.peers_of_store
            .iter()
            .map(|(store_id, peers)| {
                (
                    *store_id,
                    peers.get_all().into_iter().map(|s| s.flattened()).collect(),
                )
            })
            .collect()
    }

    /// Apply one classified item: evict it or insert/replace it.
    pub fn update(&mut self, item: HotPeerStat) {
        if item.is_need_delete() {
            if let Some(peers) = self.peers_of_store.get_mut(&item.store_id) {
                peers.remove(item.region_id);
            }
            if let Some(stores) = self.stores_of_region.get_mut(&item.region_id) {
                stores.remove(&item.store_id);
            }
        } else {
            self.peers_of_store
                .entry(item.store_id)
                .or_insert_with(|| TopN::new(TOP_N, TOP_N_TTL))
                .put(item.clone());
            self.stores_of_region
                .entry(item.region_id)
                .or_default()
                .insert(item.store_id);
        }
    }

    /// Classify one region report into new/updated hot-peer items. The caller
    /// applies the returned items through [`Self::update`] under the write
    /// path.
    pub fn check_region_flow(&self, region: &RegionInfo) -> Vec<HotPeerStat> {
        let interval = region.interval().seconds();
        if interval == 0 {
            return Vec::new();
        }

        let (total_bytes, total_keys, total_ops) = self.primary_totals(region);
        let (other_bytes, other_keys, other_ops) = self.other_totals(region);
        let interval_f = interval as f64;
        let rates = [
            total_bytes as f64 / interval_f,
            total_keys as f64 / interval_f,
            total_ops as f64 / interval_f,
            other_bytes as f64 / interval_f,
            other_keys as f64 / interval_f,
            other_ops as f64 / interval_f,
        ];

        let mut ret = Vec::new();
        // Old stores come first so an expired stat can hand its history to
        // the destination store in the same batch (peer move, leader
        // transfer).
        let store_ids = self.all_store_ids(region);
        let mut tmp_item: Option<HotPeerStat> = None;

        for store_id in &store_ids {
            let store_id = *store_id;
            let is_expired = self.is_region_expired(region, store_id);
            let old_item = self.get_old_hot_peer_stat(region.id(), store_id);
            if is_expired {
                if let Some(old) = old_item.clone() {
                    tmp_item = Some(old);
                }
            }

            if !is_expired && self.denoising && interval < HOT_REGION_REPORT_MIN_INTERVAL {
                continue;
            }

            let new_item = HotPeerStat {
                store_id,
                region_id: region.id(),
                hot_degree: 0,
                anti_count: 0,
                kind: self.kind,
                rates,
                version: region.epoch().version,
                last_update: Instant::now(),
                rolling: None,
                need_delete: is_expired,
                is_leader: region.leader_store_id() == store_id,
                is_new: false,
            };

            let old_item = old_item.or_else(|| {
                // The stat may live on the store this region just left, or on
                // any other store still in the reported set.
                tmp_item.clone().or_else(|| {
                    store_ids
                        .iter()
                        .find_map(|sid| self.get_old_hot_peer_stat(region.id(), *sid))
                })
            });

            if let Some(item) = self.update_hot_peer_stat(new_item, old_item) {
                ret.push(item);
            }
        }

        ret
    }

    /// Whether `region` is hot at `hot_degree`: any peer for write flow, the
    /// leader only for read flow.
    pub fn is_region_hot(&self, region: &RegionInfo, hot_degree: i32) -> bool {
        match self.kind {
            FlowKind::Write => region
                .peers()
                .iter()
                .any(|p| self.is_peer_hot(region.id(), p.store_id, hot_degree)),
            FlowKind::Read => {
                let leader = region.leader_store_id();
                leader != 0 && self.is_peer_hot(region.id(), leader, hot_degree)
            }
        }
    }

    /// Per-dimension thresholds in effect for a store. The Top-N quantile mix
    /// is a future extension; only the floor applies.
    pub fn calc_hot_thresholds(&self, _store_id: StoreId) -> [f64; DIM_LEN] {
        self.min_thresholds
    }

    /// Halve the per-dimension floors. Cooperative-scheduling tuning hook.
    pub fn reduce_hot_thresholds(&mut self) {
        for t in &mut self.min_thresholds {
            *t /= 2.0;
        }
    }

    fn is_peer_hot(&self, region_id: RegionId, store_id: StoreId, hot_degree: i32) -> bool {
        self.peers_of_store
            .get(&store_id)
            .and_then(|peers| peers.get(region_id))
            .map(|stat| stat.hot_degree >= hot_degree)
            .unwrap_or(false)
    }

    fn primary_totals(&self, region: &RegionInfo) -> (u64, u64, u64) {
        match self.kind {
            FlowKind::Write => (
                region.bytes_written(),
                region.keys_written(),
                region.ops_write(),
            ),
            FlowKind::Read => (region.bytes_read(), region.keys_read(), region.ops_read()),
        }
    }

    fn other_totals(&self, region: &RegionInfo) -> (u64, u64, u64) {
        match self.kind {
            FlowKind::Write => (region.bytes_read(), region.keys_read(), region.ops_read()),
            FlowKind::Read => (
                region.bytes_written(),
                region.keys_written(),
                region.ops_write(),
            ),
        }
    }

    fn get_old_hot_peer_stat(&self, region_id: RegionId, store_id: StoreId) -> Option<HotPeerStat> {
        self.peers_of_store
            .get(&store_id)
            .and_then(|peers| peers.get(region_id))
            .cloned()
    }

    fn is_region_expired(&self, region: &RegionInfo, store_id: StoreId) -> bool {
        match self.kind {
            FlowKind::Write => region.store_peer(store_id).is_none(),
            FlowKind::Read => region.leader_store_id() != store_id,
        }
    }

    /// Stores carrying the stat previously plus stores in the current report,
    /// old first.
    fn all_store_ids(&self, region: &RegionInfo) -> Vec<StoreId> {
        let mut seen = HashSet::new();
        let mut ret = Vec::with_capacity(region.peers().len());

        if let Some(old) = self.stores_of_region.get(&region.id()) {
            for store_id in old {
                if seen.insert(*store_id) {
                    ret.push(*store_id);
                }
            }
        }

        for peer in region.peers() {
            // Read flow only concerns the leader.
            if self.kind == FlowKind::Read && peer.store_id != region.leader_store_id() {
                continue;
            }
            if seen.insert(peer.store_id) {
                ret.push(peer.store_id);
            }
        }

        ret
    }

    fn update_hot_peer_stat(
        &self,
        mut new_item: HotPeerStat,
        old_item: Option<HotPeerStat>,
    ) -> Option<HotPeerStat> {
        let thresholds = self.calc_hot_thresholds(new_item.store_id);
        let mut is_hot = new_item.rate(LoadDim::Byte) >= thresholds[LoadDim::Byte.index()]
            || new_item.rate(LoadDim::Key) >= thresholds[LoadDim::Key.index()]
            || new_item.rate(LoadDim::Ops) >= thresholds[LoadDim::Ops.index()];

        if UPDATE_WITH_OTHER_STATS {
            is_hot = is_hot
                || new_item.rate(LoadDim::OtherByte) >= thresholds[LoadDim::OtherByte.index()]
                || new_item.rate(LoadDim::OtherKey) >= thresholds[LoadDim::OtherKey.index()]
                || new_item.rate(LoadDim::OtherOps) >= thresholds[LoadDim::OtherOps.index()];
        }

        if new_item.need_delete {
            return Some(new_item);
        }

        match old_item {
            Some(old) => {
                new_item.rolling = old.rolling.clone();
                if is_hot {
                    new_item.hot_degree = old.hot_degree + 1;
                    new_item.anti_count = HOT_REGION_ANTI_COUNT;
                } else {
                    new_item.hot_degree = old.hot_degree - 1;
                    new_item.anti_count = old.anti_count - 1;
                    // Deletion fires on the decay past zero, so a stat
                    // tolerates exactly `anti_count` cold reports.
                    if new_item.anti_count < 0 {
                        new_item.need_delete = true;
                    }
                }
            }
            None => {
                if !is_hot {
                    return None;
                }
                new_item.init_rolling();
                new_item.hot_degree = 1;
                new_item.anti_count = HOT_REGION_ANTI_COUNT;
                new_item.is_new = true;
            }
        }

        new_item.push_rates_to_rolling();
        Some(new_item)
    }
}

/// Both flow-direction caches under independent locks.
#[derive(Debug)]
pub struct HotCache {
    write: RwLock<HotPeerCache>,
    read: RwLock<HotPeerCache>,
}

impl HotCache {
    /// Create empty caches.
    pub fn new() -> Self {
        Self {
            write: RwLock::new(HotPeerCache::new(FlowKind::Write)),
            read: RwLock::new(HotPeerCache::new(FlowKind::Read)),
        }
    }

    /// Classify a report against the write-flow cache.
    pub fn check_write_status(&self, region: &RegionInfo) -> Vec<HotPeerStat> {
        self.write.read().check_region_flow(region)
    }

    /// Classify a report against the read-flow cache.
    pub fn check_read_status(&self, region: &RegionInfo) -> Vec<HotPeerStat> {
        self.read.read().check_region_flow(region)
    }

    /// Apply one classified item to its cache.
    pub fn update(&self, item: HotPeerStat) {
        match item.kind {
            FlowKind::Write => self.write.write().update(item),
            FlowKind::Read => self.read.write().update(item),
        }
    }

    /// Whether the region is hot in either direction.
    pub fn is_region_hot(&self, region: &RegionInfo, hot_degree: i32) -> bool {
        self.write.read().is_region_hot(region, hot_degree)
            || self.read.read().is_region_hot(region, hot_degree)
    }

    /// Flattened per-store snapshot for one direction.
    pub fn region_stats(&self, kind: FlowKind) -> HashMap<StoreId, Vec<HotPeerStat>> {
        match kind {
            FlowKind::Write => self.write.read().region_stats(),
            FlowKind::Read => self.read.read().region_stats(),
        }
    }

    /// Halve hot thresholds in both directions.
    pub fn reduce_hot_thresholds(&self) {
        self.write.write().reduce_hot_thresholds();
        self.read.write().reduce_hot_thresholds();
    }

    /// Disable denoising in both directions. Test hook.
    pub fn set_denoising(&self, denoising: bool) {
        self.write.write().set_denoising(denoising);
        self.read.write().set_denoising(denoising);
    }
}

impl Default for HotCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Peer, RegionEpoch, RegionMeta, ReportInterval};
    use bytes::Bytes;

    fn hot_region(id: RegionId, stores: &[StoreId], bytes_written: u64) -> RegionInfo {
        let peers: Vec<Peer> = stores
            .iter()
            .enumerate()
            .map(|(i, s)| Peer::new(id * 100 + i as u64, *s))
            .collect();
        let leader = peers.first().copied();
        RegionInfo::new(
            RegionMeta {
                id,
                start_key: Bytes::new(),
                end_key: Bytes::new(),
                epoch: RegionEpoch::new(1, 1),
                peers,
            },
            leader,
        )
        .with_written(bytes_written, 0, 0)
        .with_interval(ReportInterval::new(0, 10))
    }

    #[test]
    fn test_first_sight_hot_creates_stat() {
        let cache = HotPeerCache::new(FlowKind::Write);
        // 10240 bytes over 10s = 1024 B/s, above the 256 floor.
        let region = hot_region(1, &[1, 2, 3], 10240);
        let items = cache.check_region_flow(&region);

        assert_eq!(items.len(), 3);
        for item in &items {
            assert!(item.is_new());
            assert_eq!(item.hot_degree, 1);
            assert_eq!(item.anti_count, HOT_REGION_ANTI_COUNT);
        }
    }

    #[test]
    fn test_first_sight_cold_creates_nothing() {
        let cache = HotPeerCache::new(FlowKind::Write);
        let region = hot_region(1, &[1], 10); // 1 B/s
        assert!(cache.check_region_flow(&region).is_empty());
    }

    #[test]
    fn test_hysteresis_trajectory() {
        let mut cache = HotPeerCache::new(FlowKind::Write);

        // Three hot reports: degree climbs 1, 2, 3.
        let mut degrees = Vec::new();
        for _ in 0..3 {
            let region = hot_region(100, &[1], 10240);
            let items = cache.check_region_flow(&region);
            for item in items {
                degrees.push(item.hot_degree);
                cache.update(item);
            }
        }

        // Three cold reports: degree falls 2, 1, 0; third exhausts
        // anti_count and flags deletion.
        let mut deleted = false;
        for _ in 0..3 {
            let region = hot_region(100, &[1], 0);
            let items = cache.check_region_flow(&region);
            for item in items {
                degrees.push(item.hot_degree);
                deleted = item.is_need_delete();
                cache.update(item);
            }
        }

        assert_eq!(degrees, vec![1, 2, 3, 2, 1, 0]);
        assert!(deleted);
        let region = hot_region(100, &[1], 0);
        assert!(!cache.is_region_hot(&region, 1));
    }

    #[test]
    fn test_is_region_hot_write_any_peer() {
        let mut cache = HotPeerCache::new(FlowKind::Write);
        let region = hot_region(5, &[1, 2], 10240);
        for item in cache.check_region_flow(&region) {
            cache.update(item);
        }
        // First observation leaves degree at 1 after the second report.
        for item in cache.check_region_flow(&region) {
            cache.update(item);
        }
        assert!(cache.is_region_hot(&region, 1));
    }

    #[test]
    fn test_read_flow_tracks_leader_only() {
        let cache = HotPeerCache::new(FlowKind::Read);
        let region = hot_region(5, &[1, 2, 3], 0).with_read(10240, 0, 0);
        let items = cache.check_region_flow(&region);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].store_id, 1);
        assert!(items[0].is_leader());
    }

    #[test]
    fn test_expired_peer_flagged_for_delete() {
        let mut cache = HotPeerCache::new(FlowKind::Write);
        let region = hot_region(5, &[1, 2], 10240);
        for item in cache.check_region_flow(&region) {
            cache.update(item);
        }

        // Peer moves off store 2: the next report omits it.
        let moved = hot_region(5, &[1, 3], 10240);
        let items = cache.check_region_flow(&moved);
        let expired: Vec<_> = items.iter().filter(|i| i.is_need_delete()).collect();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].store_id, 2);

        // The new peer on store 3 inherits history instead of starting cold.
        let fresh: Vec<_> = items
            .iter()
            .filter(|i| i.store_id == 3 && !i.is_need_delete())
            .collect();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].hot_degree, 2);
    }

    #[test]
    fn test_denoising_skips_fast_reports() {
        let cache = HotPeerCache::new(FlowKind::Write);
        let region = hot_region(1, &[1], 10240).with_interval(ReportInterval::new(0, 1));
        assert!(cache.check_region_flow(&region).is_empty());
    }

    #[test]
    fn test_reduce_hot_thresholds() {
        let mut cache = HotPeerCache::new(FlowKind::Write);
        let before = cache.calc_hot_thresholds(1);
        cache.reduce_hot_thresholds();
        let after = cache.calc_hot_thresholds(1);
        for i in 0..DIM_LEN {
            assert_eq!(after[i], before[i] / 2.0);
        }
    }
}
