//! Store (storage node) state.

use crate::types::{ReportInterval, StoreId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lifecycle state of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    /// Serving traffic.
    Up,
    /// Draining; replicas are being migrated away.
    Offline,
    /// Fully removed; only the record remains.
    Tombstone,
}

impl Default for StoreState {
    fn default() -> Self {
        StoreState::Up
    }
}

/// Store metadata as persisted and exchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Unique store identifier.
    pub id: StoreId,
    /// Network address.
    pub address: String,
    /// Lifecycle state.
    pub state: StoreState,
    /// Topology labels, e.g. zone/rack/host.
    pub labels: HashMap<String, String>,
}

/// Load figures carried by one store heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Reporting store.
    pub store_id: StoreId,
    /// Total disk capacity in bytes.
    pub capacity: u64,
    /// Free disk space in bytes.
    pub available: u64,
    /// Bytes written over the interval.
    pub bytes_written: u64,
    /// Bytes written by leader peers over the interval.
    pub leader_bytes_written: u64,
    /// Bytes read over the interval.
    pub bytes_read: u64,
    /// Keys written over the interval.
    pub keys_written: u64,
    /// Keys written by leader peers over the interval.
    pub leader_keys_written: u64,
    /// Keys read over the interval.
    pub keys_read: u64,
    /// Read operations over the interval.
    pub ops_read: u64,
    /// Write operations over the interval.
    pub ops_write: u64,
    /// Per-thread CPU usage, (thread name, permille).
    pub cpu_usages: Vec<(String, u64)>,
    /// Per-thread disk read rates, (thread name, bytes/s).
    pub read_io_rates: Vec<(String, u64)>,
    /// Per-thread disk write rates, (thread name, bytes/s).
    pub write_io_rates: Vec<(String, u64)>,
    /// Reporting interval.
    pub interval: ReportInterval,
}

/// How long a store goes without persisting before the next heartbeat forces
/// a write.
const STORE_PERSIST_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Heartbeat silence after which a store counts as disconnected.
const STORE_DISCONNECT_DURATION: Duration = Duration::from_secs(20);

/// In-memory store view: metadata plus live status.
#[derive(Debug, Clone, Default)]
pub struct StoreInfo {
    meta: StoreMeta,
    stats: StoreStats,
    last_heartbeat: Option<Instant>,
    last_persist: Option<Instant>,
    /// Number of leader peers on the store.
    pub leader_count: u64,
    /// Number of peers on the store.
    pub region_count: u64,
    /// Number of pending peers on the store.
    pub pending_peer_count: u64,
    /// Total approximate size of leader regions, MiB.
    pub leader_size: u64,
    /// Total approximate size of hosted regions, MiB.
    pub region_size: u64,
}

impl StoreInfo {
    /// Create a store view from metadata.
    pub fn new(meta: StoreMeta) -> Self {
        Self {
            meta,
            ..Default::default()
        }
    }

    /// Store identifier.
    pub fn id(&self) -> StoreId {
        self.meta.id
    }

    /// Store metadata.
    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    /// Stats from the latest heartbeat.
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Record a heartbeat's stats and arrival time.
    pub fn set_stats(&mut self, stats: StoreStats, now: Instant) {
        self.stats = stats;
        self.last_heartbeat = Some(now);
    }

    /// Record a successful persistence.
    pub fn set_last_persist(&mut self, now: Instant) {
        self.last_persist = Some(now);
    }

    /// Whether the store is up.
    pub fn is_up(&self) -> bool {
        self.meta.state == StoreState::Up
    }

    /// Whether the store is offline (draining).
    pub fn is_offline(&self) -> bool {
        self.meta.state == StoreState::Offline
    }

    /// Whether the store is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.meta.state == StoreState::Tombstone
    }

    /// Whether the store has missed heartbeats long enough to count as
    /// disconnected.
    pub fn is_disconnected(&self, now: Instant) -> bool {
        match self.last_heartbeat {
            Some(t) => now.duration_since(t) > STORE_DISCONNECT_DURATION,
            None => true,
        }
    }

    /// Whether the store should be dropped from live statistics.
    pub fn is_unhealthy(&self, now: Instant) -> bool {
        self.is_tombstone() || self.is_disconnected(now)
    }

    /// Time since the last heartbeat; unbounded if the store never reported.
    pub fn down_time(&self, now: Instant) -> Duration {
        match self.last_heartbeat {
            Some(t) => now.duration_since(t),
            None => Duration::MAX,
        }
    }

    /// Whether free space has fallen below the configured ratio.
    pub fn is_low_space(&self, low_space_ratio: f64) -> bool {
        if self.stats.capacity == 0 {
            return false;
        }
        let used = self.stats.capacity.saturating_sub(self.stats.available) as f64;
        used / self.stats.capacity as f64 >= low_space_ratio
    }

    /// Whether the metadata is due for persistence.
    pub fn needs_persist(&self, now: Instant) -> bool {
        match self.last_persist {
            Some(t) => now.duration_since(t) > STORE_PERSIST_INTERVAL,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_space() {
        let mut store = StoreInfo::new(StoreMeta {
            id: 1,
            ..Default::default()
        });
        store.set_stats(
            StoreStats {
                store_id: 1,
                capacity: 100,
                available: 30,
                ..Default::default()
            },
            Instant::now(),
        );
        assert!(!store.is_low_space(0.8));
        assert!(store.is_low_space(0.7));

        // Unknown capacity never reads as low space.
        let empty = StoreInfo::new(StoreMeta::default());
        assert!(!empty.is_low_space(0.8));
    }

    #[test]
    fn test_disconnect_and_persist_windows() {
        let now = Instant::now();
        let mut store = StoreInfo::new(StoreMeta {
            id: 1,
            ..Default::default()
        });

        assert!(store.is_disconnected(now));
        assert!(store.needs_persist(now));

        store.set_stats(StoreStats::default(), now);
        store.set_last_persist(now);
        assert!(!store.is_disconnected(now));
        assert!(!store.needs_persist(now));
        assert!(store.is_disconnected(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_tombstone_unhealthy() {
        let now = Instant::now();
        let mut store = StoreInfo::new(StoreMeta {
            id: 1,
            state: StoreState::Tombstone,
            ..Default::default()
        });
        store.set_stats(StoreStats::default(), now);
        assert!(store.is_unhealthy(now));
    }
}
