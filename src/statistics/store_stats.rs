//! Per-store rolling rate estimators.

use crate::core::store::{StoreInfo, StoreStats};
use crate::statistics::moving_avg::{MedianFilter, MovingAvg, TimeMedian};
use crate::types::StoreId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Median window for CPU and disk IO filters.
const STORE_STATS_ROLLING_WINDOW: usize = 3;

/// Averaging window feeding each flow-rate median.
const DEFAULT_AOT_SIZE: usize = 2;

/// Median window for write-direction flow rates.
const DEFAULT_WRITE_MF_SIZE: usize = 5;

/// Median window for read-direction flow rates.
const DEFAULT_READ_MF_SIZE: usize = 3;

/// Rolling rate estimators for one store.
#[derive(Debug)]
pub struct RollingStoreStats {
    inner: RwLock<RollingInner>,
}

#[derive(Debug)]
struct RollingInner {
    bytes_write_rate: TimeMedian,
    bytes_write_leader_rate: TimeMedian,
    bytes_read_rate: TimeMedian,
    keys_write_rate: TimeMedian,
    keys_write_leader_rate: TimeMedian,
    keys_read_rate: TimeMedian,
    ops_read: TimeMedian,
    ops_write: TimeMedian,
    total_cpu_usage: MedianFilter,
    total_disk_read_rate: MedianFilter,
    total_disk_write_rate: MedianFilter,
}

fn collect(records: &[(String, u64)]) -> f64 {
    records.iter().map(|(_, v)| *v).sum::<u64>() as f64
}

impl RollingStoreStats {
    fn new() -> Self {
        Self {
            inner: RwLock::new(RollingInner {
                bytes_write_rate: TimeMedian::new(DEFAULT_AOT_SIZE, DEFAULT_WRITE_MF_SIZE),
                bytes_write_leader_rate: TimeMedian::new(DEFAULT_AOT_SIZE, DEFAULT_WRITE_MF_SIZE),
                bytes_read_rate: TimeMedian::new(DEFAULT_AOT_SIZE, DEFAULT_READ_MF_SIZE),
                keys_write_rate: TimeMedian::new(DEFAULT_AOT_SIZE, DEFAULT_WRITE_MF_SIZE),
                keys_write_leader_rate: TimeMedian::new(DEFAULT_AOT_SIZE, DEFAULT_WRITE_MF_SIZE),
                keys_read_rate: TimeMedian::new(DEFAULT_AOT_SIZE, DEFAULT_READ_MF_SIZE),
                ops_read: TimeMedian::new(DEFAULT_AOT_SIZE, DEFAULT_READ_MF_SIZE),
                ops_write: TimeMedian::new(DEFAULT_AOT_SIZE, DEFAULT_READ_MF_SIZE),
                total_cpu_usage: MedianFilter::new(STORE_STATS_ROLLING_WINDOW),
                total_disk_read_rate: MedianFilter::new(STORE_STATS_ROLLING_WINDOW),
                total_disk_write_rate: MedianFilter::new(STORE_STATS_ROLLING_WINDOW),
            }),
        }
    }

    /// Feed one store heartbeat.
    pub fn observe(&self, stats: &StoreStats) {
        let interval = Duration::from_secs(stats.interval.seconds());
        tracing::debug!(
            store_id = stats.store_id,
            keys_written = stats.keys_written,
            bytes_written = stats.bytes_written,
            interval_secs = interval.as_secs(),
            "update store stats"
        );
        let mut inner = self.inner.write();
        inner
            .bytes_write_rate
            .add(stats.bytes_written as f64, interval);
        inner
            .bytes_write_leader_rate
            .add(stats.leader_bytes_written as f64, interval);
        inner.bytes_read_rate.add(stats.bytes_read as f64, interval);
        inner
            .keys_write_rate
            .add(stats.keys_written as f64, interval);
        inner
            .keys_write_leader_rate
            .add(stats.leader_keys_written as f64, interval);
        inner.keys_read_rate.add(stats.keys_read as f64, interval);
        inner.ops_read.add(stats.ops_read as f64, interval);
        inner.ops_write.add(stats.ops_write as f64, interval);

        inner.total_cpu_usage.add(collect(&stats.cpu_usages));
        inner.total_disk_read_rate.add(collect(&stats.read_io_rates));
        inner
            .total_disk_write_rate
            .add(collect(&stats.write_io_rates));
    }

    /// Overwrite all flow estimates from one report, bypassing the windows.
    /// Test hook.
    pub fn set(&self, stats: &StoreStats) {
        let interval = stats.interval.seconds();
        if interval == 0 {
            return;
        }
        let interval = interval as f64;
        let mut inner = self.inner.write();
        inner.bytes_write_rate.set(stats.bytes_written as f64 / interval);
        inner
            .bytes_write_leader_rate
            .set(stats.leader_bytes_written as f64 / interval);
        inner.bytes_read_rate.set(stats.bytes_read as f64 / interval);
        inner.keys_write_rate.set(stats.keys_written as f64 / interval);
        inner
            .keys_write_leader_rate
            .set(stats.leader_keys_written as f64 / interval);
        inner.keys_read_rate.set(stats.keys_read as f64 / interval);
        inner.ops_read.set(stats.ops_read as f64 / interval);
        inner.ops_write.set(stats.ops_write as f64 / interval);
    }

    /// Bytes write rate.
    pub fn bytes_write_rate(&self) -> f64 {
        self.inner.read().bytes_write_rate.get()
    }

    /// Bytes write rate attributed to leader peers.
    pub fn bytes_write_leader_rate(&self) -> f64 {
        self.inner.read().bytes_write_leader_rate.get()
    }

    /// Bytes read rate.
    pub fn bytes_read_rate(&self) -> f64 {
        self.inner.read().bytes_read_rate.get()
    }

    /// Keys write rate.
    pub fn keys_write_rate(&self) -> f64 {
        self.inner.read().keys_write_rate.get()
    }

    /// Keys write rate attributed to leader peers.
    pub fn keys_write_leader_rate(&self) -> f64 {
        self.inner.read().keys_write_leader_rate.get()
    }

    /// Keys read rate.
    pub fn keys_read_rate(&self) -> f64 {
        self.inner.read().keys_read_rate.get()
    }

    /// Read operation rate.
    pub fn ops_read(&self) -> f64 {
        self.inner.read().ops_read.get()
    }

    /// Write operation rate.
    pub fn ops_write(&self) -> f64 {
        self.inner.read().ops_write.get()
    }

    /// Total CPU usage across threads, permille.
    pub fn cpu_usage(&self) -> f64 {
        self.inner.read().total_cpu_usage.get()
    }

    /// Total disk read rate across threads.
    pub fn disk_read_rate(&self) -> f64 {
        self.inner.read().total_disk_read_rate.get()
    }

    /// Total disk write rate across threads.
    pub fn disk_write_rate(&self) -> f64 {
        self.inner.read().total_disk_write_rate.get()
    }
}

/// Rolling stats of every store plus cluster-wide totals.
#[derive(Debug, Default)]
pub struct StoresStats {
    stores: RwLock<HashMap<StoreId, Arc<RollingStoreStats>>>,
    totals: RwLock<Totals>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    bytes_write_rate: f64,
    bytes_read_rate: f64,
    keys_write_rate: f64,
    keys_read_rate: f64,
    ops_write: f64,
    ops_read: f64,
}

impl StoresStats {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rolling stats for a store, if tracked.
    pub fn get(&self, store_id: StoreId) -> Option<Arc<RollingStoreStats>> {
        self.stores.read().get(&store_id).cloned()
    }

    /// Rolling stats for a store, created on first use.
    pub fn get_or_create(&self, store_id: StoreId) -> Arc<RollingStoreStats> {
        if let Some(stats) = self.stores.read().get(&store_id) {
            return Arc::clone(stats);
        }
        let mut stores = self.stores.write();
        Arc::clone(
            stores
                .entry(store_id)
                .or_insert_with(|| Arc::new(RollingStoreStats::new())),
        )
    }

    /// Drop a store's stats.
    pub fn remove(&self, store_id: StoreId) {
        self.stores.write().remove(&store_id);
    }

    /// Feed one store heartbeat.
    pub fn observe(&self, stats: &StoreStats) {
        self.get_or_create(stats.store_id).observe(stats);
    }

    /// Overwrite one store's flow estimates. Test hook.
    pub fn set(&self, stats: &StoreStats) {
        self.get_or_create(stats.store_id).set(stats);
    }

    /// Recompute cluster totals over the up members of `stores`.
    pub fn update_totals(&self, stores: &[StoreInfo]) {
        let mut totals = Totals::default();
        {
            let tracked = self.stores.read();
            for store in stores {
                if !store.is_up() {
                    continue;
                }
                let Some(stats) = tracked.get(&store.id()) else {
                    continue;
                };
                totals.bytes_write_rate += stats.bytes_write_rate();
                totals.bytes_read_rate += stats.bytes_read_rate();
                totals.keys_write_rate += stats.keys_write_rate();
                totals.keys_read_rate += stats.keys_read_rate();
                totals.ops_write += stats.ops_write();
                totals.ops_read += stats.ops_read();
            }
        }
        *self.totals.write() = totals;
    }

    /// Total bytes write rate across up stores.
    pub fn total_bytes_write_rate(&self) -> f64 {
        self.totals.read().bytes_write_rate
    }

    /// Total bytes read rate across up stores.
    pub fn total_bytes_read_rate(&self) -> f64 {
        self.totals.read().bytes_read_rate
    }

    /// Total keys write rate across up stores.
    pub fn total_keys_write_rate(&self) -> f64 {
        self.totals.read().keys_write_rate
    }

    /// Total keys read rate across up stores.
    pub fn total_keys_read_rate(&self) -> f64 {
        self.totals.read().keys_read_rate
    }

    /// Total write ops across up stores.
    pub fn total_ops_write(&self) -> f64 {
        self.totals.read().ops_write
    }

    /// Total read ops across up stores.
    pub fn total_ops_read(&self) -> f64 {
        self.totals.read().ops_read
    }

    /// One flow rate for every tracked store.
    pub fn get_stat<F>(&self, f: F) -> HashMap<StoreId, f64>
    where
        F: Fn(&RollingStoreStats) -> f64,
    {
        self.stores
            .read()
            .iter()
            .map(|(id, stats)| (*id, f(stats)))
            .collect()
    }

    /// Drop stats of stores the predicate marks unhealthy.
    pub fn filter_unhealthy<F>(&self, is_unhealthy: F)
    where
        F: Fn(StoreId) -> bool,
    {
        self.stores.write().retain(|id, _| !is_unhealthy(*id));
    }

    /// Tracked store count.
    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    /// Whether any store is tracked.
    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::StoreMeta;
    use crate::types::ReportInterval;

    fn stats(store_id: StoreId, bytes_written: u64) -> StoreStats {
        StoreStats {
            store_id,
            bytes_written,
            interval: ReportInterval::new(0, 10),
            cpu_usages: vec![("worker-0".to_string(), 300), ("worker-1".to_string(), 200)],
            read_io_rates: vec![("io-0".to_string(), 1000)],
            write_io_rates: vec![("io-0".to_string(), 2000)],
            ..Default::default()
        }
    }

    #[test]
    fn test_observe_flow_rates() {
        let rolling = RollingStoreStats::new();
        for _ in 0..5 {
            rolling.observe(&stats(1, 1000));
        }
        assert!((rolling.bytes_write_rate() - 100.0).abs() < 1e-9);
        assert_eq!(rolling.cpu_usage(), 500.0);
        assert_eq!(rolling.disk_read_rate(), 1000.0);
        assert_eq!(rolling.disk_write_rate(), 2000.0);
    }

    #[test]
    fn test_set_bypasses_windows() {
        let rolling = RollingStoreStats::new();
        rolling.set(&stats(1, 5000));
        assert_eq!(rolling.bytes_write_rate(), 500.0);
    }

    #[test]
    fn test_totals_over_up_stores() {
        let container = StoresStats::new();
        container.set(&stats(1, 1000));
        container.set(&stats(2, 3000));

        let up = StoreInfo::new(StoreMeta {
            id: 1,
            ..Default::default()
        });
        let mut offline_meta = StoreMeta {
            id: 2,
            ..Default::default()
        };
        offline_meta.state = crate::core::store::StoreState::Offline;
        let offline = StoreInfo::new(offline_meta);

        container.update_totals(&[up, offline]);
        assert_eq!(container.total_bytes_write_rate(), 100.0);
    }

    #[test]
    fn test_filter_unhealthy() {
        let container = StoresStats::new();
        container.get_or_create(1);
        container.get_or_create(2);
        assert_eq!(container.len(), 2);

        container.filter_unhealthy(|id| id == 2);
        assert_eq!(container.len(), 1);
        assert!(container.get(2).is_none());
    }
}
