//! Per-peer hot statistics.

use crate::statistics::moving_avg::{MedianFilter, MovingAvg};
use crate::types::{FlowKind, RegionId, StoreId};
use std::time::Instant;

/// Load dimensions tracked per hot peer. The primary three follow the cache's
/// flow kind; the "other" three track the opposite direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDim {
    /// Bytes per second, primary direction.
    Byte,
    /// Keys per second, primary direction.
    Key,
    /// Operations per second, primary direction.
    Ops,
    /// Bytes per second, opposite direction.
    OtherByte,
    /// Keys per second, opposite direction.
    OtherKey,
    /// Operations per second, opposite direction.
    OtherOps,
}

impl LoadDim {
    /// All dimensions, index order.
    pub const ALL: [LoadDim; DIM_LEN] = [
        LoadDim::Byte,
        LoadDim::Key,
        LoadDim::Ops,
        LoadDim::OtherByte,
        LoadDim::OtherKey,
        LoadDim::OtherOps,
    ];

    /// Positional index of the dimension.
    pub fn index(self) -> usize {
        match self {
            LoadDim::Byte => 0,
            LoadDim::Key => 1,
            LoadDim::Ops => 2,
            LoadDim::OtherByte => 3,
            LoadDim::OtherKey => 4,
            LoadDim::OtherOps => 5,
        }
    }
}

/// Number of load dimensions.
pub const DIM_LEN: usize = 6;

/// Size of the per-dimension rolling median window.
pub(crate) const ROLLING_WINDOW_SIZE: usize = 5;

#[derive(Debug, Clone)]
pub(crate) struct RollingRates {
    filters: [MedianFilter; DIM_LEN],
}

impl RollingRates {
    fn new() -> Self {
        Self {
            filters: std::array::from_fn(|_| MedianFilter::new(ROLLING_WINDOW_SIZE)),
        }
    }
}

/// Hot statistics for one (store, region) peer along six load dimensions.
#[derive(Debug, Clone)]
pub struct HotPeerStat {
    /// Store hosting the peer.
    pub store_id: StoreId,
    /// Region the peer belongs to.
    pub region_id: RegionId,
    /// Consecutive-hot streak counter; drops by one per cold observation.
    pub hot_degree: i32,
    /// Cold-tolerance counter; the stat is evicted when it reaches zero.
    pub anti_count: i32,
    /// Flow direction this stat tracks.
    pub kind: FlowKind,
    /// Instantaneous rates, index order of [`LoadDim::ALL`].
    pub rates: [f64; DIM_LEN],
    /// Region version at the time of the report.
    pub version: u64,
    /// When the stat was last refreshed.
    pub last_update: Instant,
    pub(crate) rolling: Option<Box<RollingRates>>,
    pub(crate) need_delete: bool,
    pub(crate) is_leader: bool,
    pub(crate) is_new: bool,
}

impl HotPeerStat {
    /// Instantaneous rate along a dimension.
    pub fn rate(&self, dim: LoadDim) -> f64 {
        self.rates[dim.index()]
    }

    /// Denoised rate along a dimension: the rolling median when available,
    /// the instantaneous rate otherwise.
    pub fn denoised_rate(&self, dim: LoadDim) -> f64 {
        match &self.rolling {
            Some(rolling) => rolling.filters[dim.index()].get(),
            None => self.rates[dim.index()],
        }
    }

    /// Whether the stat is queued for eviction.
    pub fn is_need_delete(&self) -> bool {
        self.need_delete
    }

    /// Whether the peer led its region at the last report.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Whether this is the stat's first appearance in the cache.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn init_rolling(&mut self) {
        self.rolling = Some(Box::new(RollingRates::new()));
    }

    pub(crate) fn push_rates_to_rolling(&mut self) {
        let rates = self.rates;
        if let Some(rolling) = &mut self.rolling {
            for dim in LoadDim::ALL {
                rolling.filters[dim.index()].add(rates[dim.index()]);
            }
        }
    }

    /// Flattened copy with rolling estimates materialized into `rates`.
    /// Used for snapshots handed outside the cache.
    pub fn flattened(&self) -> HotPeerStat {
        let mut out = self.clone();
        for dim in LoadDim::ALL {
            out.rates[dim.index()] = self.denoised_rate(dim);
        }
        out.rolling = None;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat() -> HotPeerStat {
        HotPeerStat {
            store_id: 1,
            region_id: 2,
            hot_degree: 0,
            anti_count: 0,
            kind: FlowKind::Write,
            rates: [100.0, 10.0, 5.0, 0.0, 0.0, 0.0],
            version: 1,
            last_update: Instant::now(),
            rolling: None,
            need_delete: false,
            is_leader: false,
            is_new: false,
        }
    }

    #[test]
    fn test_denoised_falls_back_to_instant_rate() {
        let s = stat();
        assert_eq!(s.denoised_rate(LoadDim::Byte), 100.0);
    }

    #[test]
    fn test_rolling_median_smooths() {
        let mut s = stat();
        s.init_rolling();
        s.push_rates_to_rolling();

        s.rates[LoadDim::Byte.index()] = 10_000.0; // spike
        s.push_rates_to_rolling();

        s.rates[LoadDim::Byte.index()] = 120.0;
        s.push_rates_to_rolling();

        // Median of {100, 10000, 120} is 120.
        assert_eq!(s.denoised_rate(LoadDim::Byte), 120.0);
    }

    #[test]
    fn test_flattened_materializes_rolling() {
        let mut s = stat();
        s.init_rolling();
        s.push_rates_to_rolling();
        s.rates[LoadDim::Byte.index()] = 300.0;
        s.push_rates_to_rolling();

        let flat = s.flattened();
        assert!(flat.rolling.is_none());
        assert_eq!(flat.rate(LoadDim::Byte), s.denoised_rate(LoadDim::Byte));
    }
}
