//! Shared helpers for scheduler tests.

use crate::cluster::ClusterState;
use crate::config::{ScheduleConfig, SchedulingOptions};
use crate::core::cluster::ClusterInformer;
use crate::core::command::{HeartbeatSink, RegionCommand};
use crate::core::region::RegionInfo;
use crate::core::store::StoreMeta;
use crate::error::Result;
use crate::metrics::SchedulerMetrics;
use crate::schedule::controller::OperatorController;
use crate::types::{Peer, RegionEpoch, RegionId, RegionMeta, ReportInterval, StoreId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Sink that records every command for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    commands: Mutex<Vec<(RegionId, RegionCommand)>>,
}

impl RecordingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded commands.
    pub fn commands(&self) -> Vec<(RegionId, RegionCommand)> {
        self.commands.lock().clone()
    }

    /// Commands sent for one region.
    pub fn commands_for(&self, region_id: RegionId) -> Vec<RegionCommand> {
        self.commands
            .lock()
            .iter()
            .filter(|(id, _)| *id == region_id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    /// Drop recorded commands.
    pub fn clear(&self) {
        self.commands.lock().clear();
    }
}

impl HeartbeatSink for RecordingSink {
    fn send_command(&self, region: &RegionInfo, cmd: RegionCommand) {
        self.commands.lock().push((region.id(), cmd));
    }
}

/// Cluster state plus controller wired over a recording sink.
pub struct TestCluster {
    /// Cluster state under test.
    pub cluster: Arc<ClusterState>,
    /// Controller under test.
    pub controller: Arc<OperatorController>,
    /// Sink capturing outbound commands.
    pub sink: Arc<RecordingSink>,
}

impl TestCluster {
    /// Build with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ScheduleConfig::default())
    }

    /// Build with a custom configuration.
    pub fn with_config(config: ScheduleConfig) -> Self {
        let options = Arc::new(SchedulingOptions::new(config));
        let metrics = Arc::new(SchedulerMetrics::new());
        let (cluster, _changed_rx) = ClusterState::new(options, None, Arc::clone(&metrics));
        let sink = Arc::new(RecordingSink::new());
        let controller = Arc::new(OperatorController::new(
            Arc::clone(&cluster) as Arc<dyn ClusterInformer>,
            Arc::clone(&sink) as Arc<dyn HeartbeatSink>,
            metrics,
            CancellationToken::new(),
        ));
        Self {
            cluster,
            controller,
            sink,
        }
    }

    /// Register `n` stores with ids `1..=n`.
    pub fn add_stores(&self, n: u64) {
        for store_id in 1..=n {
            self.cluster.put_store(StoreMeta {
                id: store_id,
                address: format!("127.0.0.1:2016{}", store_id),
                ..Default::default()
            });
        }
    }

    /// Build a region view: peers on `stores` (ids assigned as
    /// `region_id * 100 + index`), leader on `stores[leader_idx]`.
    pub fn region(
        &self,
        region_id: RegionId,
        epoch: RegionEpoch,
        stores: &[StoreId],
        leader_idx: usize,
    ) -> RegionInfo {
        let peers: Vec<Peer> = stores
            .iter()
            .enumerate()
            .map(|(i, s)| Peer::new(region_id * 100 + i as u64, *s))
            .collect();
        let leader = peers.get(leader_idx).copied();
        RegionInfo::new(
            RegionMeta {
                id: region_id,
                start_key: Bytes::from(format!("r{:06}", region_id)),
                end_key: Bytes::from(format!("r{:06}", region_id + 1)),
                epoch,
                peers,
            },
            leader,
        )
        .with_approximate(10, 1000)
        .with_interval(ReportInterval::new(0, 10))
    }

    /// Ingest one heartbeat and dispatch the region's operator.
    pub async fn heartbeat(&self, region: RegionInfo) -> Result<()> {
        self.cluster
            .handle_region_heartbeat(region, &self.controller)
            .await
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
