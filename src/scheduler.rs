//! Scheduler runtime: wires cluster state to the operator controller and
//! runs the background loops.

use crate::cluster::ClusterState;
use crate::config::SchedulingOptions;
use crate::core::cluster::ClusterInformer;
use crate::core::command::HeartbeatSink;
use crate::core::region::RegionInfo;
use crate::core::storage::Storage;
use crate::metrics::SchedulerMetrics;
use crate::schedule::controller::{OperatorController, PUSH_OPERATOR_TICK_INTERVAL};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Interval of the statistics background job.
const BACKGROUND_JOB_INTERVAL: Duration = Duration::from_secs(10);

/// Interval of the replication-mode refresh.
const REPLICATION_MODE_INTERVAL: Duration = Duration::from_secs(60);

/// The assembled scheduler: cluster state, operator controller, and the
/// background loops that drive them.
pub struct Scheduler {
    cluster: Arc<ClusterState>,
    controller: Arc<OperatorController>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cluster", &self.cluster)
            .field("controller", &self.controller)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl Scheduler {
    /// Build the scheduler and start its background tasks.
    pub fn start(
        options: Arc<SchedulingOptions>,
        storage: Option<Arc<dyn Storage>>,
        sink: Arc<dyn HeartbeatSink>,
    ) -> Self {
        let metrics = Arc::new(SchedulerMetrics::new());
        let shutdown = CancellationToken::new();
        let (cluster, changed_rx) = ClusterState::new(options, storage, Arc::clone(&metrics));
        let informer: Arc<dyn ClusterInformer> = Arc::clone(&cluster) as Arc<dyn ClusterInformer>;
        let controller = Arc::new(OperatorController::new(
            informer,
            sink,
            metrics,
            shutdown.child_token(),
        ));

        let tasks = vec![
            Self::run_coordinator(Arc::clone(&controller), shutdown.clone()),
            Self::run_background_jobs(
                Arc::clone(&cluster),
                Arc::clone(&controller),
                shutdown.clone(),
            ),
            Self::run_region_syncer(changed_rx, shutdown.clone()),
            Self::run_replication_mode(Arc::clone(&cluster), shutdown.clone()),
        ];

        Self {
            cluster,
            controller,
            shutdown,
            tasks,
        }
    }

    /// Cluster state handle.
    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    /// Operator controller handle.
    pub fn controller(&self) -> &Arc<OperatorController> {
        &self.controller
    }

    /// Stop the background tasks and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "background task exited abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Timed operator pushes: pop due entries and re-dispatch.
    fn run_coordinator(
        controller: Arc<OperatorController>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PUSH_OPERATOR_TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => controller.push_operators(),
                }
            }
            tracing::debug!("coordinator loop exited");
        })
    }

    /// Statistics upkeep: totals, history pruning, unhealthy-store cleanup,
    /// store-limit gauges.
    fn run_background_jobs(
        cluster: Arc<ClusterState>,
        controller: Arc<OperatorController>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(BACKGROUND_JOB_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let now = std::time::Instant::now();
                        let stores = cluster.get_stores();
                        cluster.stores_stats().update_totals(&stores);
                        let unhealthy: std::collections::HashSet<_> = stores
                            .iter()
                            .filter(|s| s.is_unhealthy(now))
                            .map(|s| s.id())
                            .collect();
                        cluster.stores_stats().filter_unhealthy(|id| unhealthy.contains(&id));
                        controller.prune_history();
                        controller.collect_store_limit_metrics();
                    }
                }
            }
            tracing::debug!("background jobs loop exited");
        })
    }

    /// Drain the changed-regions channel toward replica schedulers.
    fn run_region_syncer(
        mut changed_rx: mpsc::Receiver<RegionInfo>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    region = changed_rx.recv() => {
                        match region {
                            Some(region) => {
                                tracing::trace!(region_id = region.id(), "region change synced");
                            }
                            None => break,
                        }
                    }
                }
            }
            tracing::debug!("region syncer loop exited");
        })
    }

    /// Periodic replication-mode refresh.
    fn run_replication_mode(
        cluster: Arc<ClusterState>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REPLICATION_MODE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        // State refresh only: replication-mode decisions are
                        // driven by the reports already merged into the
                        // cluster cache.
                        let _ = cluster.is_prepared();
                    }
                }
            }
            tracing::debug!("replication mode loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::core::command::ChannelSink;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let options = Arc::new(SchedulingOptions::new(ScheduleConfig::default()));
        let (sink, _rx) = ChannelSink::new(16);
        let scheduler = Scheduler::start(options, None, Arc::new(sink));

        assert_eq!(scheduler.cluster().region_count(), 0);
        // Joins all four loops.
        scheduler.shutdown().await;
    }
}
