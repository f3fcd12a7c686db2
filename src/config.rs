//! Scheduler configuration.
//!
//! `ScheduleConfig` is a plain value type with builder-style setters.
//! `SchedulingOptions` wraps it in a swap-on-write snapshot holder: readers
//! grab an `Arc` to one self-consistent snapshot and never block writers;
//! writers clone, mutate, and swap.

use crate::schedule::store_limit::StoreLimitType;
use crate::types::StoreId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// How leader balancing weighs stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderSchedulePolicy {
    /// Balance by leader count.
    ByCount,
    /// Balance by total leader region size.
    BySize,
}

impl Default for LeaderSchedulePolicy {
    fn default() -> Self {
        LeaderSchedulePolicy::ByCount
    }
}

/// How store limits are maintained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreLimitMode {
    /// Operators set limits explicitly.
    Manual,
    /// Limits follow observed store load.
    Auto,
}

impl Default for StoreLimitMode {
    fn default() -> Self {
        StoreLimitMode::Manual
    }
}

/// Joint CPU/IO hot-balancing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MultiHotMode {
    /// Multi-dimension balancing disabled.
    Off,
    /// Balance CPU and disk IO cooperatively.
    Cooperative,
    /// Balance disk IO only.
    IoOnly,
    /// Balance CPU only.
    CpuOnly,
    /// Weighted combination of both dimensions.
    Weighted,
}

impl Default for MultiHotMode {
    fn default() -> Self {
        MultiHotMode::Off
    }
}

impl TryFrom<u8> for MultiHotMode {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MultiHotMode::Off),
            1 => Ok(MultiHotMode::Cooperative),
            2 => Ok(MultiHotMode::IoOnly),
            3 => Ok(MultiHotMode::CpuOnly),
            4 => Ok(MultiHotMode::Weighted),
            _ => Err(format!("unknown multi-hot mode: {}", v)),
        }
    }
}

impl From<MultiHotMode> for u8 {
    fn from(m: MultiHotMode) -> u8 {
        match m {
            MultiHotMode::Off => 0,
            MultiHotMode::Cooperative => 1,
            MultiHotMode::IoOnly => 2,
            MultiHotMode::CpuOnly => 3,
            MultiHotMode::Weighted => 4,
        }
    }
}

/// Per-store movement rate limits, in regions per minute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreLimitRates {
    /// Add-peer rate.
    pub add_peer: f64,
    /// Remove-peer rate.
    pub remove_peer: f64,
}

impl Default for StoreLimitRates {
    fn default() -> Self {
        Self {
            add_peer: 15.0,
            remove_peer: 15.0,
        }
    }
}

impl StoreLimitRates {
    /// Rate for a limit type.
    pub fn rate(&self, typ: StoreLimitType) -> f64 {
        match typ {
            StoreLimitType::AddPeer => self.add_peer,
            StoreLimitType::RemovePeer => self.remove_peer,
        }
    }
}

/// A label requirement: stores carrying `key = value` match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRequirement {
    /// Label key.
    pub key: String,
    /// Label value.
    pub value: String,
}

/// Schedule configuration recognized by the controller and ingest path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Max snapshots a store may be sending concurrently.
    pub max_snapshot_count: u64,
    /// Max pending peers per store.
    pub max_pending_peer_count: u64,
    /// Interval between region patrol rounds.
    pub patrol_region_interval: Duration,
    /// Down time after which a store is considered lost.
    pub max_store_down_time: Duration,
    /// Concurrent leader operator limit.
    pub leader_schedule_limit: u64,
    /// Concurrent region operator limit.
    pub region_schedule_limit: u64,
    /// Concurrent replica-repair operator limit.
    pub replica_schedule_limit: u64,
    /// Concurrent merge operator limit.
    pub merge_schedule_limit: u64,
    /// Concurrent hot-region operator limit.
    pub hot_region_schedule_limit: u64,
    /// Max operators waiting per description.
    pub scheduler_max_waiting_operator: u64,
    /// How store limits are maintained.
    pub store_limit_mode: StoreLimitMode,
    /// Default movement rates applied to stores without an override.
    pub default_store_limit: StoreLimitRates,
    /// Per-store movement rate overrides.
    pub store_limit: HashMap<StoreId, StoreLimitRates>,
    /// Leader balancing policy.
    pub leader_schedule_policy: LeaderSchedulePolicy,
    /// Consecutive hot observations before a region counts as hot.
    pub hot_region_cache_hits_threshold: u64,
    /// Legacy single-dimension hot scheduler switch.
    pub hot_scheduler_mode: bool,
    /// Joint CPU/IO balancing mode.
    pub multi_hot_scheduler_mode: MultiHotMode,
    /// Interval between multi-dimension balance rounds.
    pub multi_schedule_interval: Duration,
    /// Target ratio for hot balancing.
    pub hot_balance_ratio: f64,
    /// Remaining-space ratio below which a store is low on space.
    pub low_space_ratio: f64,
    /// Remaining-space ratio above which a store is comfortable.
    pub high_space_ratio: f64,
    /// Size tolerance applied when comparing stores.
    pub tolerant_size_ratio: f64,
    /// Quiet period after a split before the halves may merge.
    pub split_merge_interval: Duration,
    /// Regions above this size are not merged, in MiB.
    pub max_merge_region_size: u64,
    /// Regions above this key count are not merged.
    pub max_merge_region_keys: u64,
    /// Merge only into the previous adjacent region.
    pub enable_one_way_merge: bool,
    /// Allow merging across table boundaries.
    pub enable_cross_table_merge: bool,
    /// Replace replicas on down stores.
    pub enable_remove_down_replica: bool,
    /// Migrate replicas off offline stores.
    pub enable_replace_offline_replica: bool,
    /// Create replicas to restore replication factor.
    pub enable_make_up_replica: bool,
    /// Remove surplus replicas.
    pub enable_remove_extra_replica: bool,
    /// Move replicas toward better label isolation.
    pub enable_location_replacement: bool,
    /// Expose debug metrics.
    pub enable_debug_metrics: bool,
    /// Evaluate placement rules instead of plain replica counts.
    pub enable_placement_rules: bool,
    /// Require full label match when scattering.
    pub strictly_match_label: bool,
    /// Label keys forming the location hierarchy, outermost first.
    pub location_labels: Vec<String>,
    /// Label level on which replicas must be isolated.
    pub isolation_level: String,
    /// Replicas per region.
    pub max_replicas: u64,
    /// Named label requirements, e.g. reject-leader.
    pub label_property: HashMap<String, Vec<LabelRequirement>>,
    /// Propagate per-region flow changes to the syncer.
    pub trace_region_flow: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_snapshot_count: 3,
            max_pending_peer_count: 16,
            patrol_region_interval: Duration::from_millis(100),
            max_store_down_time: Duration::from_secs(30 * 60),
            leader_schedule_limit: 4,
            region_schedule_limit: 2048,
            replica_schedule_limit: 64,
            merge_schedule_limit: 8,
            hot_region_schedule_limit: 4,
            scheduler_max_waiting_operator: 5,
            store_limit_mode: StoreLimitMode::default(),
            default_store_limit: StoreLimitRates::default(),
            store_limit: HashMap::new(),
            leader_schedule_policy: LeaderSchedulePolicy::default(),
            hot_region_cache_hits_threshold: 3,
            hot_scheduler_mode: false,
            multi_hot_scheduler_mode: MultiHotMode::default(),
            multi_schedule_interval: Duration::from_millis(5000),
            hot_balance_ratio: 0.9,
            low_space_ratio: 0.8,
            high_space_ratio: 0.7,
            tolerant_size_ratio: 0.0,
            split_merge_interval: Duration::from_secs(3600),
            max_merge_region_size: 20,
            max_merge_region_keys: 200_000,
            enable_one_way_merge: false,
            enable_cross_table_merge: false,
            enable_remove_down_replica: true,
            enable_replace_offline_replica: true,
            enable_make_up_replica: true,
            enable_remove_extra_replica: true,
            enable_location_replacement: true,
            enable_debug_metrics: false,
            enable_placement_rules: false,
            strictly_match_label: false,
            location_labels: Vec::new(),
            isolation_level: String::new(),
            max_replicas: 3,
            label_property: HashMap::new(),
            trace_region_flow: true,
        }
    }
}

impl ScheduleConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-description waiting-operator cap.
    pub fn with_max_waiting_operator(mut self, max: u64) -> Self {
        self.scheduler_max_waiting_operator = max;
        self
    }

    /// Set the default store limit rates.
    pub fn with_default_store_limit(mut self, rates: StoreLimitRates) -> Self {
        self.default_store_limit = rates;
        self
    }

    /// Override the limit rates of one store.
    pub fn with_store_limit(mut self, store_id: StoreId, rates: StoreLimitRates) -> Self {
        self.store_limit.insert(store_id, rates);
        self
    }

    /// Set the replica count.
    pub fn with_max_replicas(mut self, n: u64) -> Self {
        self.max_replicas = n;
        self
    }

    /// Set the leader schedule policy.
    pub fn with_leader_schedule_policy(mut self, policy: LeaderSchedulePolicy) -> Self {
        self.leader_schedule_policy = policy;
        self
    }

    /// Set the multi-hot mode.
    pub fn with_multi_hot_mode(mut self, mode: MultiHotMode) -> Self {
        self.multi_hot_scheduler_mode = mode;
        self
    }

    /// Effective limit rate for a (store, type) pair: the override if present,
    /// the default otherwise.
    pub fn store_limit_rate(&self, store_id: StoreId, typ: StoreLimitType) -> f64 {
        self.store_limit
            .get(&store_id)
            .unwrap_or(&self.default_store_limit)
            .rate(typ)
    }
}

/// Swap-on-write snapshot holder for [`ScheduleConfig`].
///
/// The cluster version is kept outside the snapshot and updated with
/// compare-and-swap so a concurrent admin write and background bump cannot
/// regress it.
#[derive(Debug)]
pub struct SchedulingOptions {
    schedule: RwLock<Arc<ScheduleConfig>>,
    cluster_version: RwLock<semver::Version>,
}

/// Minimal semantic version triple for the cluster feature gate.
pub mod semver {
    use serde::{Deserialize, Serialize};

    /// A `major.minor.patch` version.
    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
    )]
    pub struct Version {
        /// Major component.
        pub major: u64,
        /// Minor component.
        pub minor: u64,
        /// Patch component.
        pub patch: u64,
    }

    impl Version {
        /// Create a version.
        pub fn new(major: u64, minor: u64, patch: u64) -> Self {
            Self {
                major,
                minor,
                patch,
            }
        }
    }

    impl std::fmt::Display for Version {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

impl SchedulingOptions {
    /// Create options from an initial configuration.
    pub fn new(schedule: ScheduleConfig) -> Self {
        Self {
            schedule: RwLock::new(Arc::new(schedule)),
            cluster_version: RwLock::new(semver::Version::default()),
        }
    }

    /// Get the current snapshot. The snapshot never changes underneath the
    /// caller; later writes produce new snapshots.
    pub fn schedule(&self) -> Arc<ScheduleConfig> {
        Arc::clone(&self.schedule.read())
    }

    /// Replace the configuration wholesale.
    pub fn set_schedule(&self, schedule: ScheduleConfig) {
        *self.schedule.write() = Arc::new(schedule);
    }

    /// Clone-mutate-swap update.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ScheduleConfig),
    {
        let mut guard = self.schedule.write();
        let mut next = ScheduleConfig::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Set the limit rates of every store and the default for future stores.
    pub fn set_all_stores_limit(&self, typ: StoreLimitType, rate: f64) {
        self.update(|cfg| {
            match typ {
                StoreLimitType::AddPeer => cfg.default_store_limit.add_peer = rate,
                StoreLimitType::RemovePeer => cfg.default_store_limit.remove_peer = rate,
            }
            for rates in cfg.store_limit.values_mut() {
                match typ {
                    StoreLimitType::AddPeer => rates.add_peer = rate,
                    StoreLimitType::RemovePeer => rates.remove_peer = rate,
                }
            }
        });
    }

    /// Current cluster version.
    pub fn cluster_version(&self) -> semver::Version {
        *self.cluster_version.read()
    }

    /// Raise the cluster version if `new` is greater than the current value.
    /// Returns whether the stored version changed.
    pub fn cas_cluster_version(
        &self,
        current: semver::Version,
        new: semver::Version,
    ) -> bool {
        let mut guard = self.cluster_version.write();
        if *guard != current || new <= *guard {
            return false;
        }
        *guard = new;
        true
    }

    /// Effective limit rate for a (store, type) pair.
    pub fn store_limit_rate(&self, store_id: StoreId, typ: StoreLimitType) -> f64 {
        self.schedule().store_limit_rate(store_id, typ)
    }
}

impl Default for SchedulingOptions {
    fn default() -> Self {
        Self::new(ScheduleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_isolation() {
        let opts = SchedulingOptions::default();
        let before = opts.schedule();
        opts.update(|cfg| cfg.max_replicas = 5);
        let after = opts.schedule();

        assert_eq!(before.max_replicas, 3);
        assert_eq!(after.max_replicas, 5);
    }

    #[test]
    fn test_store_limit_override() {
        let cfg = ScheduleConfig::new()
            .with_default_store_limit(StoreLimitRates {
                add_peer: 30.0,
                remove_peer: 30.0,
            })
            .with_store_limit(
                2,
                StoreLimitRates {
                    add_peer: 10.0,
                    remove_peer: 30.0,
                },
            );

        assert_eq!(cfg.store_limit_rate(1, StoreLimitType::AddPeer), 30.0);
        assert_eq!(cfg.store_limit_rate(2, StoreLimitType::AddPeer), 10.0);
    }

    #[test]
    fn test_set_all_stores_limit_updates_default_and_overrides() {
        let opts = SchedulingOptions::default();
        opts.update(|cfg| {
            cfg.store_limit.insert(7, StoreLimitRates::default());
        });

        opts.set_all_stores_limit(StoreLimitType::AddPeer, 60.0);

        let cfg = opts.schedule();
        assert_eq!(cfg.default_store_limit.add_peer, 60.0);
        assert_eq!(cfg.store_limit[&7].add_peer, 60.0);
        assert_eq!(cfg.store_limit[&7].remove_peer, 15.0);
    }

    #[test]
    fn test_cluster_version_cas() {
        let opts = SchedulingOptions::default();
        let v0 = opts.cluster_version();
        let v1 = semver::Version::new(5, 0, 0);

        assert!(opts.cas_cluster_version(v0, v1));
        assert_eq!(opts.cluster_version(), v1);
        // Stale CAS loses.
        assert!(!opts.cas_cluster_version(v0, semver::Version::new(4, 0, 0)));
        // Downgrade loses even with the right current value.
        assert!(!opts.cas_cluster_version(v1, semver::Version::new(4, 9, 9)));
    }
}
