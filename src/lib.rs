//! Control-plane scheduler for a range-sharded key-value store.
//!
//! Data is partitioned into **regions** (contiguous key ranges) replicated
//! across **stores**; one peer per region leads. The scheduler keeps the
//! cluster healthy and balanced by issuing multi-step **operators**
//! (transfer-leader, add/remove/promote peer, split, merge) that storage
//! nodes execute opportunistically via heartbeat responses.
//!
//! # Architecture
//!
//! ```text
//!  storage nodes ──region/store heartbeats──► ClusterState (ingest)
//!        ▲                                        │
//!        │                              stats: HotCache, StoresStats
//!        │                                        │
//!   heartbeat replies                      policy modules
//!  (RegionCommand)                                │ candidate operators
//!        │                                        ▼
//!        └──────────────────────────── OperatorController
//!                                  admit / rate-limit / dispatch / retire
//! ```
//!
//! The controller enforces at most one running operator per region, caps
//! movement per store with token buckets, pushes unacknowledged steps on a
//! timed queue, and retires operators as heartbeats converge.
//!
//! # Example
//!
//! ```rust,no_run
//! use shepherd::{ChannelSink, ScheduleConfig, Scheduler, SchedulingOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = Arc::new(SchedulingOptions::new(ScheduleConfig::default()));
//!     let (sink, mut commands) = ChannelSink::new(1024);
//!     let scheduler = Scheduler::start(options, None, Arc::new(sink));
//!
//!     // Feed heartbeats from the serving layer:
//!     // scheduler.cluster().handle_region_heartbeat(region, scheduler.controller()).await;
//!     // ...and drain `commands` into heartbeat responses.
//!
//!     scheduler.shutdown().await;
//! }
//! ```

pub mod admin;
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod schedule;
pub mod scheduler;
pub mod statistics;
pub mod types;

#[cfg(test)]
pub mod testing;

// Re-export main types for convenience.
pub use admin::{AdminHandler, OperatorRequest};
pub use cluster::worker::SplitIds;
pub use cluster::ClusterState;
pub use config::{
    LeaderSchedulePolicy, MultiHotMode, ScheduleConfig, SchedulingOptions, StoreLimitMode,
    StoreLimitRates,
};
pub use crate::core::cluster::{BasicCluster, ClusterInformer};
pub use crate::core::command::{
    ChannelSink, ConfChangeType, HeartbeatSink, RegionCommand, SplitPolicy,
};
pub use crate::core::region::RegionInfo;
pub use crate::core::storage::{ClusterMeta, MemStorage, Storage};
pub use crate::core::store::{StoreInfo, StoreMeta, StoreState, StoreStats};
pub use error::{Error, IngestError, Result, ScheduleError};
pub use schedule::controller::OperatorController;
pub use schedule::operator::{OpKind, OpStatus, Operator, PriorityLevel};
pub use schedule::step::OpStep;
pub use schedule::store_limit::{StoreLimit, StoreLimitType};
pub use scheduler::Scheduler;
pub use statistics::hot_cache::HotCache;
pub use statistics::hot_peer::HotPeerStat;
pub use statistics::store_stats::StoresStats;
pub use types::{FlowKind, Peer, PeerRole, RegionEpoch, RegionId, RegionMeta, StoreId};
