//! Cluster state and the heartbeat ingest path.
//!
//! `ClusterState` owns the region/store cache, the statistics engines, and
//! the changed-regions channel. Heartbeat ingest is the only writer to the
//! region cache; the operator controller reads through the
//! [`ClusterInformer`] facade.

pub mod worker;

use crate::config::SchedulingOptions;
use crate::core::cluster::{BasicCluster, ClusterInformer};
use crate::core::region::RegionInfo;
use crate::core::storage::Storage;
use crate::core::store::{StoreInfo, StoreMeta, StoreStats};
use crate::error::{IngestError, Result};
use crate::hooks;
use crate::metrics::SchedulerMetrics;
use crate::statistics::hot_cache::HotCache;
use crate::statistics::hot_peer::HotPeerStat;
use crate::statistics::region_stats::{LabelStatistics, RegionStatistics};
use crate::statistics::store_stats::StoresStats;
use crate::types::{FlowKind, RegionId, StoreId};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Depth of the changed-regions queue feeding the syncer.
const CHANGED_REGIONS_BUFFER: usize = 1024;

/// Share of regions that must report in before scheduling starts.
const PREPARE_COLLECT_FACTOR: f64 = 0.8;

/// Give up waiting for full collection after this long.
const PREPARE_COLLECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Tracks first-sighted regions until enough of the cluster has reported to
/// schedule safely.
#[derive(Debug)]
struct PrepareChecker {
    reported: HashSet<RegionId>,
    start: Instant,
    prepared: bool,
}

impl PrepareChecker {
    fn new() -> Self {
        Self {
            reported: HashSet::new(),
            start: Instant::now(),
            prepared: false,
        }
    }

    fn collect(&mut self, region: &RegionInfo) {
        self.reported.insert(region.id());
    }

    fn check(&mut self, total_regions: usize) -> bool {
        if self.prepared {
            return true;
        }
        if self.start.elapsed() > PREPARE_COLLECT_TIMEOUT {
            self.prepared = true;
            return true;
        }
        if total_regions > 0
            && self.reported.len() as f64 >= PREPARE_COLLECT_FACTOR * total_regions as f64
        {
            self.prepared = true;
        }
        self.prepared
    }
}

#[derive(Debug)]
struct ClusterCore {
    basic: BasicCluster,
    region_stats: RegionStatistics,
    label_stats: LabelStatistics,
    prepare: PrepareChecker,
}

/// Save-flag decision for one region report.
#[derive(Debug, Default, Clone, Copy)]
struct SaveFlags {
    save_kv: bool,
    save_cache: bool,
    is_new: bool,
    need_sync: bool,
}

/// Cluster state machine: region/store caches, statistics, and ingest.
pub struct ClusterState {
    inner: RwLock<ClusterCore>,
    stores_stats: Arc<StoresStats>,
    hot_cache: HotCache,
    storage: Option<Arc<dyn Storage>>,
    options: Arc<SchedulingOptions>,
    changed_tx: mpsc::Sender<RegionInfo>,
    suspect_regions: DashMap<RegionId, ()>,
    split_infos: DashMap<RegionId, Vec<RegionId>>,
    id_alloc: AtomicU64,
    metrics: Arc<SchedulerMetrics>,
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.read();
        f.debug_struct("ClusterState")
            .field("regions", &core.basic.region_count())
            .field("stores", &core.basic.stores().count())
            .finish()
    }
}

impl ClusterState {
    /// Create cluster state. The receiver drains region changes for the
    /// syncer.
    pub fn new(
        options: Arc<SchedulingOptions>,
        storage: Option<Arc<dyn Storage>>,
        metrics: Arc<SchedulerMetrics>,
    ) -> (Arc<Self>, mpsc::Receiver<RegionInfo>) {
        let (changed_tx, changed_rx) = mpsc::channel(CHANGED_REGIONS_BUFFER);
        let state = Arc::new(Self {
            inner: RwLock::new(ClusterCore {
                basic: BasicCluster::new(),
                region_stats: RegionStatistics::new(),
                label_stats: LabelStatistics::new(),
                prepare: PrepareChecker::new(),
            }),
            stores_stats: Arc::new(StoresStats::new()),
            hot_cache: HotCache::new(),
            storage,
            options,
            changed_tx,
            suspect_regions: DashMap::new(),
            split_infos: DashMap::new(),
            id_alloc: AtomicU64::new(1 << 20),
            metrics,
        });
        (state, changed_rx)
    }

    /// Scheduling options handle.
    pub fn scheduling_options(&self) -> Arc<SchedulingOptions> {
        Arc::clone(&self.options)
    }

    /// Per-store rolling statistics.
    pub fn stores_stats(&self) -> &Arc<StoresStats> {
        &self.stores_stats
    }

    /// Hot-peer caches.
    pub fn hot_cache(&self) -> &HotCache {
        &self.hot_cache
    }

    /// Allocate a fresh region or peer id.
    pub fn alloc_id(&self) -> u64 {
        self.id_alloc.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register or update a store.
    pub fn put_store(&self, meta: StoreMeta) {
        let mut core = self.inner.write();
        match core.basic.get_store_mut(meta.id) {
            Some(store) => *store = StoreInfo::new(meta),
            None => core.basic.put_store(StoreInfo::new(meta)),
        }
    }

    /// Number of cached regions.
    pub fn region_count(&self) -> usize {
        self.inner.read().basic.region_count()
    }

    /// Region whose range contains `key`.
    pub fn get_region_by_key(&self, key: &[u8]) -> Option<RegionInfo> {
        self.inner.read().basic.get_region_by_key(key).cloned()
    }

    /// Whether the region's recent load classifies it as hot.
    pub fn is_region_hot(&self, region: &RegionInfo) -> bool {
        let threshold = self.options.schedule().hot_region_cache_hits_threshold as i32;
        self.hot_cache.is_region_hot(region, threshold)
    }

    /// Flattened hot-peer snapshot for one flow direction.
    pub fn hot_region_stats(&self, kind: FlowKind) -> HashMap<StoreId, Vec<HotPeerStat>> {
        self.hot_cache.region_stats(kind)
    }

    /// A uniformly random region led from `store_id`.
    pub fn rand_leader_region(&self, store_id: StoreId) -> Option<RegionInfo> {
        self.inner.read().basic.rand_leader_region(store_id).cloned()
    }

    /// A uniformly random region hosted but not led from `store_id`.
    pub fn rand_follower_region(&self, store_id: StoreId) -> Option<RegionInfo> {
        self.inner
            .read()
            .basic
            .rand_follower_region(store_id)
            .cloned()
    }

    /// A random hot region currently carried by `store_id`, resolved against
    /// the region cache.
    pub fn rand_hot_region_from_store(
        &self,
        store_id: StoreId,
        kind: FlowKind,
    ) -> Option<RegionInfo> {
        let threshold = self.options.schedule().hot_region_cache_hits_threshold as i32;
        let stats = self.hot_cache.region_stats(kind);
        let candidates: Vec<RegionId> = stats
            .get(&store_id)?
            .iter()
            .filter(|s| s.hot_degree >= threshold)
            .map(|s| s.region_id)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = candidates[rand::random::<usize>() % candidates.len()];
        self.get_region(pick)
    }

    /// Whether enough regions have reported to schedule safely.
    pub fn is_prepared(&self) -> bool {
        let mut core = self.inner.write();
        let total = core.basic.region_count();
        core.prepare.check(total)
    }

    /// Mark regions as needing priority inspection.
    pub fn add_suspect_regions(&self, region_ids: impl IntoIterator<Item = RegionId>) {
        for id in region_ids {
            self.suspect_regions.insert(id, ());
        }
    }

    /// Regions flagged for priority inspection.
    pub fn get_suspect_regions(&self) -> Vec<RegionId> {
        self.suspect_regions.iter().map(|e| *e.key()).collect()
    }

    /// Clear one inspected region.
    pub fn remove_suspect_region(&self, region_id: RegionId) {
        self.suspect_regions.remove(&region_id);
    }

    /// Ingest one store heartbeat: record stats, refresh totals, drop
    /// unhealthy stores, persist metadata when due.
    pub async fn handle_store_heartbeat(&self, stats: StoreStats) -> Result<()> {
        let now = Instant::now();
        let low_space_ratio = self.options.schedule().low_space_ratio;
        let store_id = stats.store_id;

        let (needs_persist, meta) = {
            let mut core = self.inner.write();
            let store = core
                .basic
                .get_store_mut(store_id)
                .ok_or(IngestError::StoreNotFound(store_id))?;
            store.set_stats(stats.clone(), now);
            if store.is_low_space(low_space_ratio) {
                tracing::warn!(
                    store_id,
                    capacity = store.stats().capacity,
                    available = store.stats().available,
                    "store does not have enough disk space"
                );
            }
            (store.needs_persist(now), store.meta().clone())
        };

        self.stores_stats.observe(&stats);
        let (stores, unhealthy) = {
            let core = self.inner.read();
            let stores: Vec<StoreInfo> = core.basic.stores().cloned().collect();
            let unhealthy: HashSet<StoreId> = stores
                .iter()
                .filter(|s| s.is_unhealthy(now))
                .map(|s| s.id())
                .collect();
            (stores, unhealthy)
        };
        self.stores_stats.update_totals(&stores);
        self.stores_stats.filter_unhealthy(|id| unhealthy.contains(&id));

        if needs_persist {
            if let Some(storage) = &self.storage {
                match storage.save_store(&meta).await {
                    Ok(()) => {
                        let mut core = self.inner.write();
                        if let Some(store) = core.basic.get_store_mut(store_id) {
                            store.set_last_persist(Instant::now());
                        }
                    }
                    Err(err) => {
                        tracing::error!(store_id, error = %err, "failed to persist store");
                    }
                }
            }
        }

        Ok(())
    }

    /// Ingest one region heartbeat: diff against the cached view, merge, feed
    /// statistics, persist best-effort, and notify the syncer.
    pub async fn process_region_heartbeat(&self, region: RegionInfo) -> Result<()> {
        // Phase 1, read lock: stale-report rejection, flag decision, hot
        // classification.
        let (flags, origin_stores) = {
            let core = self.inner.read();
            let origin = core.basic.pre_check_put_region(&region)?;
            let flags = self.decide_save_flags(&region, origin);
            let origin_stores: Vec<StoreId> = origin
                .map(|o| o.peers().iter().map(|p| p.store_id).collect())
                .unwrap_or_default();
            (flags, origin_stores)
        };
        let write_items = self.hot_cache.check_write_status(&region);
        let read_items = self.hot_cache.check_read_status(&region);

        if !flags.save_kv
            && !flags.save_cache
            && !flags.is_new
            && write_items.is_empty()
            && read_items.is_empty()
        {
            return Ok(());
        }

        hooks::poke("concurrent-region-heartbeat");

        // Phase 2, write lock: re-validate and mutate the caches.
        let mut overlaps = Vec::new();
        {
            let mut core = self.inner.write();
            if flags.save_cache {
                // A concurrent heartbeat of an overlapping region may have
                // advanced the cache since the read phase; reject strictly
                // older state. Two equally-new reports race last-writer-wins.
                core.basic.pre_check_put_region(&region)?;
                overlaps = core.basic.put_region(region.clone());
                for item in &overlaps {
                    core.region_stats.clear_defunct_region(item.id());
                    core.label_stats.clear_defunct_region(item.id());
                }

                let mut store_ids: HashSet<StoreId> =
                    region.peers().iter().map(|p| p.store_id).collect();
                store_ids.extend(origin_stores.iter().copied());
                for store_id in store_ids {
                    core.basic.refresh_store_status(store_id);
                }
                self.metrics.region_events.inc("region", "update_cache");
            }

            if flags.is_new {
                core.prepare.collect(&region);
            }

            let schedule = self.options.schedule();
            let region_stores: Vec<StoreInfo> = region
                .peers()
                .iter()
                .filter_map(|p| core.basic.get_store(p.store_id).cloned())
                .collect();
            core.region_stats
                .observe(&region, &region_stores, schedule.max_replicas);
            core.label_stats
                .observe(&region, &region_stores, &schedule.location_labels);

            for item in write_items {
                self.hot_cache.update(item);
            }
            for item in read_items {
                self.hot_cache.update(item);
            }
        }

        // Phase 3, no lock: best-effort persistence. Failure only slows the
        // next warm-up.
        if let Some(storage) = &self.storage {
            for item in &overlaps {
                if let Err(err) = storage.delete_region(item.id()).await {
                    tracing::error!(
                        region_id = item.id(),
                        error = %err,
                        "failed to delete region from storage"
                    );
                }
            }
            if flags.save_kv {
                if let Err(err) = storage.save_region(region.meta()).await {
                    tracing::error!(
                        region_id = region.id(),
                        error = %err,
                        "failed to save region to storage"
                    );
                }
                self.metrics.region_events.inc("region", "update_kv");
            }
        }
        if flags.save_kv || flags.need_sync {
            // Last-writer-wins between concurrent heartbeats of one region;
            // drop on full rather than stall ingest.
            if self.changed_tx.try_send(region).is_err() {
                tracing::debug!("changed-regions queue full, dropping notification");
            }
        }

        Ok(())
    }

    fn decide_save_flags(&self, region: &RegionInfo, origin: Option<&RegionInfo>) -> SaveFlags {
        let mut flags = SaveFlags::default();
        let Some(origin) = origin else {
            tracing::debug!(region_id = region.id(), "insert new region");
            flags.save_kv = true;
            flags.save_cache = true;
            flags.is_new = true;
            return flags;
        };

        let r = region.epoch();
        let o = origin.epoch();
        if r.version > o.version {
            tracing::info!(
                region_id = region.id(),
                old_version = o.version,
                new_version = r.version,
                "region version changed"
            );
            flags.save_kv = true;
            flags.save_cache = true;
        }
        if r.conf_ver > o.conf_ver {
            tracing::info!(
                region_id = region.id(),
                old_confver = o.conf_ver,
                new_confver = r.conf_ver,
                "region confver changed"
            );
            flags.save_kv = true;
            flags.save_cache = true;
        }
        if region.leader().map(|p| p.id) != origin.leader().map(|p| p.id) {
            if origin.leader().is_none() {
                flags.is_new = true;
            } else {
                tracing::info!(
                    region_id = region.id(),
                    from = origin.leader_store_id(),
                    to = region.leader_store_id(),
                    "leader changed"
                );
            }
            flags.save_cache = true;
            flags.need_sync = true;
        }
        if !region.down_peers().is_empty() || !region.pending_peers().is_empty() {
            flags.save_cache = true;
        }
        if !origin.down_peers().is_empty() || !origin.pending_peers().is_empty() {
            flags.save_cache = true;
        }
        if region.peers().len() != origin.peers().len() {
            flags.save_kv = true;
            flags.save_cache = true;
        }
        if region.approximate_size() != origin.approximate_size()
            || region.approximate_keys() != origin.approximate_keys()
        {
            flags.save_cache = true;
        }
        if self.options.schedule().trace_region_flow
            && (region.bytes_written() != origin.bytes_written()
                || region.bytes_read() != origin.bytes_read()
                || region.keys_written() != origin.keys_written()
                || region.keys_read() != origin.keys_read()
                || region.ops_write() != origin.ops_write()
                || region.ops_read() != origin.ops_read())
        {
            flags.save_cache = true;
            flags.need_sync = true;
        }
        match (region.replication_status(), origin.replication_status()) {
            (Some(new), old) => {
                let changed = old
                    .map(|o| o.state != new.state || o.state_id != new.state_id)
                    .unwrap_or(true);
                if changed {
                    flags.save_cache = true;
                }
            }
            (None, _) => {}
        }

        flags
    }

    pub(crate) fn record_split_regions(&self, origin_id: RegionId, new_ids: Vec<RegionId>) {
        self.split_infos.insert(origin_id, new_ids);
    }

    /// Drain split bookkeeping: origin region id to the ids split off it.
    pub fn take_split_region_infos(&self) -> HashMap<RegionId, Vec<RegionId>> {
        let mut out = HashMap::new();
        let keys: Vec<RegionId> = self.split_infos.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((k, v)) = self.split_infos.remove(&key) {
                out.insert(k, v);
            }
        }
        out
    }
}

impl ClusterInformer for ClusterState {
    fn get_region(&self, id: RegionId) -> Option<RegionInfo> {
        self.inner.read().basic.get_region(id).cloned()
    }

    fn get_store(&self, id: StoreId) -> Option<StoreInfo> {
        self.inner.read().basic.get_store(id).cloned()
    }

    fn get_stores(&self) -> Vec<StoreInfo> {
        self.inner.read().basic.stores().cloned().collect()
    }

    fn options(&self) -> Arc<SchedulingOptions> {
        Arc::clone(&self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::core::storage::MemStorage;
    use crate::types::{Peer, RegionEpoch, RegionMeta, ReportInterval};
    use bytes::Bytes;

    fn new_state(storage: Option<Arc<dyn Storage>>) -> (Arc<ClusterState>, mpsc::Receiver<RegionInfo>) {
        let options = Arc::new(SchedulingOptions::new(ScheduleConfig::default()));
        ClusterState::new(options, storage, Arc::new(SchedulerMetrics::new()))
    }

    fn region(id: RegionId, epoch: RegionEpoch, stores: &[StoreId]) -> RegionInfo {
        let peers: Vec<Peer> = stores
            .iter()
            .enumerate()
            .map(|(i, s)| Peer::new(id * 100 + i as u64, *s))
            .collect();
        let leader = peers.first().copied();
        RegionInfo::new(
            RegionMeta {
                id,
                start_key: Bytes::from(format!("k{:04}", id)),
                end_key: Bytes::from(format!("k{:04}", id + 1)),
                epoch,
                peers,
            },
            leader,
        )
        .with_approximate(10, 1000)
        .with_interval(ReportInterval::new(0, 10))
    }

    #[tokio::test]
    async fn test_first_heartbeat_inserts_and_persists() {
        let storage = Arc::new(MemStorage::new());
        let (state, mut rx) = new_state(Some(storage.clone()));

        let r = region(1, RegionEpoch::new(1, 1), &[1, 2, 3]);
        state.process_region_heartbeat(r.clone()).await.unwrap();

        assert_eq!(state.region_count(), 1);
        assert_eq!(storage.region_count(), 1);
        // First sight persists, so the syncer hears about it.
        assert_eq!(rx.try_recv().unwrap().id(), 1);
    }

    #[tokio::test]
    async fn test_stale_epoch_rejected() {
        let (state, _rx) = new_state(None);
        state
            .process_region_heartbeat(region(1, RegionEpoch::new(2, 2), &[1]))
            .await
            .unwrap();

        let err = state
            .process_region_heartbeat(region(1, RegionEpoch::new(1, 2), &[1]))
            .await;
        assert!(err.is_err());

        // Cached epoch is monotone.
        let cached = state.get_region(1).unwrap();
        assert_eq!(cached.epoch(), RegionEpoch::new(2, 2));
    }

    #[tokio::test]
    async fn test_unchanged_heartbeat_is_noop() {
        let (state, mut rx) = new_state(None);
        let r = region(1, RegionEpoch::new(1, 1), &[1]);
        state.process_region_heartbeat(r.clone()).await.unwrap();
        let _ = rx.try_recv();

        // Same epoch, same leader, same stats: nothing to do.
        state.process_region_heartbeat(r).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leader_change_syncs_without_persist() {
        let storage = Arc::new(MemStorage::new());
        let (state, mut rx) = new_state(Some(storage.clone()));
        let r = region(1, RegionEpoch::new(1, 1), &[1, 2]);
        state.process_region_heartbeat(r.clone()).await.unwrap();
        let _ = rx.try_recv();

        let mut flipped = region(1, RegionEpoch::new(1, 1), &[1, 2]);
        let second = flipped.peers()[1];
        flipped = RegionInfo::new(flipped.meta().clone(), Some(second))
            .with_approximate(10, 1000)
            .with_interval(ReportInterval::new(0, 10));
        state.process_region_heartbeat(flipped).await.unwrap();

        // Leader change syncs but does not rewrite meta.
        assert_eq!(rx.try_recv().unwrap().id(), 1);
        assert_eq!(storage.region_count(), 1);
        assert_eq!(state.get_region(1).unwrap().leader_store_id(), 2);
    }

    #[tokio::test]
    async fn test_version_bump_evicts_overlaps() {
        let storage = Arc::new(MemStorage::new());
        let (state, _rx) = new_state(Some(storage.clone()));

        let mut left = region(1, RegionEpoch::new(1, 1), &[1]);
        let mut meta = left.meta().clone();
        meta.start_key = Bytes::from_static(b"a");
        meta.end_key = Bytes::from_static(b"m");
        left = RegionInfo::new(meta, left.leader().copied());
        state.process_region_heartbeat(left).await.unwrap();

        // A split half with a newer version covering part of the range.
        let mut right = region(2, RegionEpoch::new(2, 1), &[1]);
        let mut meta = right.meta().clone();
        meta.start_key = Bytes::from_static(b"a");
        meta.end_key = Bytes::from_static(b"g");
        right = RegionInfo::new(meta, right.leader().copied());
        state.process_region_heartbeat(right).await.unwrap();

        assert!(state.get_region(1).is_none());
        assert!(state.get_region(2).is_some());
        assert_eq!(storage.region_count(), 1);
    }

    #[tokio::test]
    async fn test_store_heartbeat_updates_stats() {
        let (state, _rx) = new_state(None);
        state.put_store(StoreMeta {
            id: 1,
            ..Default::default()
        });

        let stats = StoreStats {
            store_id: 1,
            capacity: 1000,
            available: 800,
            bytes_written: 1000,
            interval: ReportInterval::new(0, 10),
            ..Default::default()
        };
        state.handle_store_heartbeat(stats).await.unwrap();

        let rolling = state.stores_stats().get(1).unwrap();
        assert!(rolling.bytes_write_rate() > 0.0);
        assert!(state.stores_stats().total_bytes_write_rate() > 0.0);

        // Unknown stores are rejected.
        let err = state
            .handle_store_heartbeat(StoreStats {
                store_id: 99,
                ..Default::default()
            })
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_hot_items_flow_into_cache() {
        let (state, _rx) = new_state(None);
        // 10 MiB over 10s, well over the write threshold.
        let r = region(1, RegionEpoch::new(1, 1), &[1, 2])
            .with_written(10 << 20, 10_000, 500);
        for _ in 0..3 {
            state.process_region_heartbeat(r.clone()).await.unwrap();
        }

        let stats = state.hot_region_stats(FlowKind::Write);
        assert!(stats.get(&1).map(|v| !v.is_empty()).unwrap_or(false));
        // Default cache-hits threshold is 3; three hot reports reach it.
        assert!(state.is_region_hot(&r));

        let cold = region(2, RegionEpoch::new(1, 1), &[1]);
        state.process_region_heartbeat(cold.clone()).await.unwrap();
        assert!(!state.is_region_hot(&cold));
    }

    #[test]
    fn test_prepare_checker_by_share() {
        let mut checker = PrepareChecker::new();
        assert!(!checker.check(10));

        for i in 0..8 {
            checker.collect(&region(i, RegionEpoch::new(1, 1), &[1]));
        }
        assert!(checker.check(10));
        // Sticky once prepared.
        assert!(checker.check(1000));
    }

    #[test]
    fn test_suspect_and_split_bookkeeping() {
        let (state, _rx) = new_state(None);
        state.add_suspect_regions([1, 2, 3]);
        assert_eq!(state.get_suspect_regions().len(), 3);
        state.remove_suspect_region(2);
        assert_eq!(state.get_suspect_regions().len(), 2);

        state.record_split_regions(10, vec![11, 12]);
        let infos = state.take_split_region_infos();
        assert_eq!(infos[&10], vec![11, 12]);
        assert!(state.take_split_region_infos().is_empty());
    }
}
