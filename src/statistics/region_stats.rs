//! Region health and label-isolation statistics.

use crate::core::region::RegionInfo;
use crate::core::store::StoreInfo;
use crate::types::RegionId;
use std::collections::{HashMap, HashSet};

/// Health classes a region can fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionStatisticType {
    /// Fewer replicas than configured.
    MissPeer,
    /// More replicas than configured.
    ExtraPeer,
    /// At least one reported down peer.
    DownPeer,
    /// At least one reported pending peer.
    PendingPeer,
    /// A replica lives on an offline store.
    OfflinePeer,
    /// A learner has not been promoted.
    LearnerPeer,
    /// Approximate size is below the empty threshold.
    EmptyRegion,
}

impl RegionStatisticType {
    /// All classes.
    pub const ALL: [RegionStatisticType; 7] = [
        RegionStatisticType::MissPeer,
        RegionStatisticType::ExtraPeer,
        RegionStatisticType::DownPeer,
        RegionStatisticType::PendingPeer,
        RegionStatisticType::OfflinePeer,
        RegionStatisticType::LearnerPeer,
        RegionStatisticType::EmptyRegion,
    ];
}

/// Regions below this approximate size, MiB, count as empty.
const EMPTY_REGION_SIZE_MB: u64 = 1;

/// Region membership per health class.
#[derive(Debug, Default)]
pub struct RegionStatistics {
    index: HashMap<RegionStatisticType, HashSet<RegionId>>,
}

impl RegionStatistics {
    /// Create empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reclassify a region against its stores and the replica target.
    pub fn observe(&mut self, region: &RegionInfo, stores: &[StoreInfo], max_replicas: u64) {
        let id = region.id();
        let peer_count = region.peers().len() as u64;

        let mut classes = HashSet::new();
        if peer_count < max_replicas {
            classes.insert(RegionStatisticType::MissPeer);
        } else if peer_count > max_replicas {
            classes.insert(RegionStatisticType::ExtraPeer);
        }
        if !region.down_peers().is_empty() {
            classes.insert(RegionStatisticType::DownPeer);
        }
        if !region.pending_peers().is_empty() {
            classes.insert(RegionStatisticType::PendingPeer);
        }
        if region.peers().iter().any(|p| p.is_learner()) {
            classes.insert(RegionStatisticType::LearnerPeer);
        }
        if region.approximate_size() <= EMPTY_REGION_SIZE_MB {
            classes.insert(RegionStatisticType::EmptyRegion);
        }
        for store in stores {
            if store.is_offline() && region.store_peer(store.id()).is_some() {
                classes.insert(RegionStatisticType::OfflinePeer);
                break;
            }
        }

        for typ in RegionStatisticType::ALL {
            let set = self.index.entry(typ).or_default();
            if classes.contains(&typ) {
                set.insert(id);
            } else {
                set.remove(&id);
            }
        }
    }

    /// Regions currently in a class.
    pub fn regions(&self, typ: RegionStatisticType) -> Vec<RegionId> {
        self.index
            .get(&typ)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of regions in a class.
    pub fn count(&self, typ: RegionStatisticType) -> usize {
        self.index.get(&typ).map(|s| s.len()).unwrap_or(0)
    }

    /// Forget a region that no longer exists.
    pub fn clear_defunct_region(&mut self, id: RegionId) {
        for set in self.index.values_mut() {
            set.remove(&id);
        }
    }
}

/// Label key reported when replicas share every location label.
pub const NO_ISOLATION: &str = "none";

/// Per-region replica isolation levels along the location-label hierarchy.
#[derive(Debug, Default)]
pub struct LabelStatistics {
    /// region -> outermost label on which its replicas are fully isolated.
    levels: HashMap<RegionId, String>,
    counts: HashMap<String, usize>,
}

impl LabelStatistics {
    /// Create empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute a region's isolation level.
    pub fn observe(&mut self, region: &RegionInfo, stores: &[StoreInfo], location_labels: &[String]) {
        let level = isolation_level(region, stores, location_labels);
        let id = region.id();
        if let Some(old) = self.levels.insert(id, level.clone()) {
            if let Some(n) = self.counts.get_mut(&old) {
                *n = n.saturating_sub(1);
            }
        }
        *self.counts.entry(level).or_insert(0) += 1;
    }

    /// Number of regions isolated at `level`.
    pub fn count(&self, level: &str) -> usize {
        self.counts.get(level).copied().unwrap_or(0)
    }

    /// Forget a region that no longer exists.
    pub fn clear_defunct_region(&mut self, id: RegionId) {
        if let Some(old) = self.levels.remove(&id) {
            if let Some(n) = self.counts.get_mut(&old) {
                *n = n.saturating_sub(1);
            }
        }
    }
}

/// Outermost location label on which every replica pair differs.
fn isolation_level(region: &RegionInfo, stores: &[StoreInfo], location_labels: &[String]) -> String {
    if location_labels.is_empty() || region.peers().is_empty() {
        return NO_ISOLATION.to_string();
    }
    let store_of = |id| stores.iter().find(|s: &&StoreInfo| s.id() == id);
    for label in location_labels {
        let mut values = HashSet::new();
        let mut all_present = true;
        for peer in region.peers() {
            match store_of(peer.store_id).and_then(|s| s.meta().labels.get(label)) {
                Some(v) => {
                    if !values.insert(v.clone()) {
                        all_present = false;
                        break;
                    }
                }
                None => {
                    all_present = false;
                    break;
                }
            }
        }
        if all_present {
            return label.clone();
        }
    }
    NO_ISOLATION.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{StoreMeta, StoreState};
    use crate::types::{Peer, RegionEpoch, RegionMeta};

    fn region(id: RegionId, stores: &[u64], learner: bool) -> RegionInfo {
        let peers: Vec<Peer> = stores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if learner && i == stores.len() - 1 {
                    Peer::learner(id * 10 + i as u64, *s)
                } else {
                    Peer::new(id * 10 + i as u64, *s)
                }
            })
            .collect();
        let leader = peers.first().copied();
        RegionInfo::new(
            RegionMeta {
                id,
                epoch: RegionEpoch::new(1, 1),
                peers,
                ..Default::default()
            },
            leader,
        )
        .with_approximate(64, 1000)
    }

    fn store(id: u64, zone: &str) -> StoreInfo {
        let mut labels = HashMap::new();
        labels.insert("zone".to_string(), zone.to_string());
        StoreInfo::new(StoreMeta {
            id,
            labels,
            ..Default::default()
        })
    }

    #[test]
    fn test_miss_and_extra_peer() {
        let mut stats = RegionStatistics::new();
        stats.observe(&region(1, &[1, 2], false), &[], 3);
        assert_eq!(stats.count(RegionStatisticType::MissPeer), 1);

        // Repaired: the class empties.
        stats.observe(&region(1, &[1, 2, 3], false), &[], 3);
        assert_eq!(stats.count(RegionStatisticType::MissPeer), 0);

        stats.observe(&region(1, &[1, 2, 3, 4], false), &[], 3);
        assert_eq!(stats.count(RegionStatisticType::ExtraPeer), 1);
    }

    #[test]
    fn test_learner_and_offline_peer() {
        let mut stats = RegionStatistics::new();
        let mut offline_meta = StoreMeta {
            id: 3,
            ..Default::default()
        };
        offline_meta.state = StoreState::Offline;
        let stores = vec![store(1, "z1"), store(2, "z2"), StoreInfo::new(offline_meta)];

        stats.observe(&region(1, &[1, 2, 3], true), &stores, 3);
        assert_eq!(stats.count(RegionStatisticType::LearnerPeer), 1);
        assert_eq!(stats.count(RegionStatisticType::OfflinePeer), 1);
    }

    #[test]
    fn test_clear_defunct_region() {
        let mut stats = RegionStatistics::new();
        stats.observe(&region(1, &[1], false), &[], 3);
        assert_eq!(stats.count(RegionStatisticType::MissPeer), 1);
        stats.clear_defunct_region(1);
        assert_eq!(stats.count(RegionStatisticType::MissPeer), 0);
    }

    #[test]
    fn test_label_isolation() {
        let labels = vec!["zone".to_string()];
        let stores = vec![store(1, "z1"), store(2, "z2"), store(3, "z3")];
        let mut stats = LabelStatistics::new();

        stats.observe(&region(1, &[1, 2, 3], false), &stores, &labels);
        assert_eq!(stats.count("zone"), 1);

        // Two replicas in one zone: no isolation at any label.
        let stores2 = vec![store(1, "z1"), store(2, "z1"), store(3, "z3")];
        stats.observe(&region(1, &[1, 2, 3], false), &stores2, &labels);
        assert_eq!(stats.count("zone"), 0);
        assert_eq!(stats.count(NO_ISOLATION), 1);
    }
}
