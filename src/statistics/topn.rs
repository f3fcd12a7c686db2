//! TTL-bounded container ordered along multiple load dimensions.

use crate::statistics::hot_peer::{HotPeerStat, LoadDim};
use crate::types::RegionId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Hot peers of one store, queryable per dimension, expiring after `ttl`
/// without refresh.
#[derive(Debug)]
pub struct TopN {
    n: usize,
    ttl: Duration,
    items: HashMap<RegionId, (HotPeerStat, Instant)>,
}

impl TopN {
    /// Create a container ranking the top `n` items with entry TTL `ttl`.
    pub fn new(n: usize, ttl: Duration) -> Self {
        Self {
            n,
            ttl,
            items: HashMap::new(),
        }
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the container is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert or refresh an item, evicting expired entries first.
    pub fn put(&mut self, item: HotPeerStat) {
        self.maintain(Instant::now());
        self.items.insert(item.region_id, (item, Instant::now()));
    }

    /// Look up an item by region.
    pub fn get(&self, region_id: RegionId) -> Option<&HotPeerStat> {
        self.items.get(&region_id).map(|(item, _)| item)
    }

    /// Remove an item.
    pub fn remove(&mut self, region_id: RegionId) -> Option<HotPeerStat> {
        self.items.remove(&region_id).map(|(item, _)| item)
    }

    /// All live items.
    pub fn get_all(&self) -> Vec<&HotPeerStat> {
        self.items.values().map(|(item, _)| item).collect()
    }

    /// The smallest of the top `n` denoised rates along `dim`, if at least
    /// `n` items are live.
    pub fn top_n_min(&self, dim: LoadDim) -> Option<f64> {
        if self.items.len() < self.n {
            return None;
        }
        let mut rates: Vec<f64> = self
            .items
            .values()
            .map(|(item, _)| item.denoised_rate(dim))
            .collect();
        rates.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        rates.get(self.n - 1).copied()
    }

    fn maintain(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.items.retain(|_, (_, touched)| now.duration_since(*touched) < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowKind;

    fn stat(region_id: RegionId, byte_rate: f64) -> HotPeerStat {
        HotPeerStat {
            store_id: 1,
            region_id,
            hot_degree: 1,
            anti_count: 2,
            kind: FlowKind::Write,
            rates: [byte_rate, 0.0, 0.0, 0.0, 0.0, 0.0],
            version: 1,
            last_update: Instant::now(),
            rolling: None,
            need_delete: false,
            is_leader: false,
            is_new: false,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let mut topn = TopN::new(2, Duration::from_secs(60));
        topn.put(stat(1, 100.0));
        topn.put(stat(2, 200.0));

        assert_eq!(topn.len(), 2);
        assert_eq!(topn.get(1).map(|s| s.rate(LoadDim::Byte)), Some(100.0));

        topn.remove(1);
        assert!(topn.get(1).is_none());
        assert_eq!(topn.len(), 1);
    }

    #[test]
    fn test_put_replaces() {
        let mut topn = TopN::new(2, Duration::from_secs(60));
        topn.put(stat(1, 100.0));
        topn.put(stat(1, 150.0));

        assert_eq!(topn.len(), 1);
        assert_eq!(topn.get(1).map(|s| s.rate(LoadDim::Byte)), Some(150.0));
    }

    #[test]
    fn test_top_n_min_requires_full_set() {
        let mut topn = TopN::new(3, Duration::from_secs(60));
        topn.put(stat(1, 100.0));
        topn.put(stat(2, 200.0));
        assert!(topn.top_n_min(LoadDim::Byte).is_none());

        topn.put(stat(3, 300.0));
        assert_eq!(topn.top_n_min(LoadDim::Byte), Some(100.0));

        topn.put(stat(4, 400.0));
        assert_eq!(topn.top_n_min(LoadDim::Byte), Some(200.0));
    }

    #[test]
    fn test_ttl_eviction() {
        let mut topn = TopN::new(2, Duration::ZERO);
        topn.put(stat(1, 100.0));
        // A zero TTL expires entries on the next maintenance pass.
        topn.put(stat(2, 200.0));
        assert!(topn.get(1).is_none());
    }
}
