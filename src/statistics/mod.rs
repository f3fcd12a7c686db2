//! Load statistics: rolling estimators, Top-N containers, hot-peer
//! classification, and per-store rate tracking.

pub mod hot_cache;
pub mod hot_peer;
pub mod moving_avg;
pub mod region_stats;
pub mod store_stats;
pub mod topn;

pub use hot_cache::{HotCache, HotPeerCache};
pub use hot_peer::{HotPeerStat, LoadDim, DIM_LEN};
pub use moving_avg::{AvgOverTime, MedianFilter, MovingAvg, TimeMedian};
pub use region_stats::{LabelStatistics, RegionStatistics, RegionStatisticType};
pub use store_stats::{RollingStoreStats, StoresStats};
pub use topn::TopN;

/// Interval at which regions report heartbeats, seconds.
pub const REGION_HEARTBEAT_REPORT_INTERVAL: u64 = 60;

/// Interval at which stores report heartbeats, seconds.
pub const STORE_HEARTBEAT_REPORT_INTERVAL: u64 = 10;
