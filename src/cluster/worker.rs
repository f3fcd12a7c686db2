//! Heartbeat entry points and split request handling.

use crate::cluster::ClusterState;
use crate::core::region::RegionInfo;
use crate::error::{IngestError, Result, ScheduleError};
use crate::schedule::controller::{OperatorController, DISPATCH_FROM_HEARTBEAT};
use crate::types::{PeerId, RegionId, RegionMeta};

/// Ids allocated for one half of a batch split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIds {
    /// Id for the new region.
    pub new_region_id: RegionId,
    /// Ids for its peers, one per existing peer.
    pub new_peer_ids: Vec<PeerId>,
}

impl ClusterState {
    /// Ingest a region heartbeat and drive the region's operator, if any.
    pub async fn handle_region_heartbeat(
        &self,
        region: RegionInfo,
        controller: &OperatorController,
    ) -> Result<()> {
        self.process_region_heartbeat(region.clone()).await?;

        if region.peers().is_empty() {
            tracing::warn!(region_id = region.id(), "invalid region, zero region peer count");
            return Err(IngestError::NoPeers(region.id()).into());
        }

        controller.dispatch(&region, DISPATCH_FROM_HEARTBEAT);
        Ok(())
    }

    /// Reject split requests whose region view is older than ours.
    pub fn valid_request_region(&self, req_region: &RegionMeta) -> Result<()> {
        let region = self
            .get_region_by_key(&req_region.start_key)
            .ok_or(ScheduleError::RegionNotFound(req_region.id))?;
        let current = region.epoch();
        if req_region.epoch.version < current.version || req_region.epoch.conf_ver < current.conf_ver
        {
            return Err(IngestError::StaleRegion(req_region.id).into());
        }
        Ok(())
    }

    /// Allocate ids for one split.
    pub fn handle_ask_split(&self, req_region: &RegionMeta) -> Result<SplitIds> {
        self.valid_request_region(req_region)?;

        let new_region_id = self.alloc_id();
        let new_peer_ids: Vec<PeerId> =
            req_region.peers.iter().map(|_| self.alloc_id()).collect();

        tracing::info!(
            region_id = new_region_id,
            peer_ids = ?new_peer_ids,
            "alloc ids for region split"
        );

        Ok(SplitIds {
            new_region_id,
            new_peer_ids,
        })
    }

    /// Allocate ids for a batch split and flag the affected regions for
    /// priority inspection.
    pub fn handle_ask_batch_split(
        &self,
        req_region: &RegionMeta,
        split_count: u32,
    ) -> Result<Vec<SplitIds>> {
        self.valid_request_region(req_region)?;

        let mut split_ids = Vec::with_capacity(split_count as usize);
        let mut record_regions = Vec::with_capacity(split_count as usize + 1);
        for _ in 0..split_count {
            let new_region_id = self.alloc_id();
            let new_peer_ids: Vec<PeerId> =
                req_region.peers.iter().map(|_| self.alloc_id()).collect();
            record_regions.push(new_region_id);
            tracing::info!(
                region_id = new_region_id,
                peer_ids = ?new_peer_ids,
                "alloc ids for region split"
            );
            split_ids.push(SplitIds {
                new_region_id,
                new_peer_ids,
            });
        }
        record_regions.push(req_region.id);

        // Regions fresh out of a split may be left in an abnormal state if
        // scheduling raced the split; inspect them with priority.
        self.add_suspect_regions(record_regions);

        Ok(split_ids)
    }

    /// Validate one reported split pair.
    pub fn handle_report_split(&self, left: &RegionMeta, right: &RegionMeta) -> Result<()> {
        check_split_pair(left, right)?;
        tracing::info!(
            left_region = left.id,
            right_region = right.id,
            "region split, generate new region"
        );
        Ok(())
    }

    /// Validate a reported batch split and record the bookkeeping.
    pub fn handle_report_batch_split(&self, regions: &[RegionMeta]) -> Result<()> {
        check_split_chain(regions)?;

        let Some(origin) = regions.last() else {
            return Err(IngestError::InvalidSplit.into());
        };
        let new_ids: Vec<RegionId> = regions[..regions.len() - 1].iter().map(|r| r.id).collect();
        tracing::info!(
            region_id = origin.id,
            total = new_ids.len(),
            "region batch split, generate new regions"
        );
        self.record_split_regions(origin.id, new_ids);
        Ok(())
    }
}

fn check_split_pair(left: &RegionMeta, right: &RegionMeta) -> Result<()> {
    if left.end_key != right.start_key {
        return Err(IngestError::InvalidSplit.into());
    }
    if right.end_key.is_empty() || left.start_key < right.end_key {
        return Ok(());
    }
    Err(IngestError::InvalidSplit.into())
}

fn check_split_chain(regions: &[RegionMeta]) -> Result<()> {
    if regions.len() <= 1 {
        return Err(IngestError::InvalidSplit.into());
    }
    for pair in regions.windows(2) {
        check_split_pair(&pair[0], &pair[1])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScheduleConfig, SchedulingOptions};
    use crate::metrics::SchedulerMetrics;
    use crate::types::{Peer, RegionEpoch};
    use bytes::Bytes;
    use std::sync::Arc;

    fn new_state() -> Arc<ClusterState> {
        let options = Arc::new(SchedulingOptions::new(ScheduleConfig::default()));
        ClusterState::new(options, None, Arc::new(SchedulerMetrics::new())).0
    }

    fn meta(id: RegionId, start: &[u8], end: &[u8], epoch: RegionEpoch) -> RegionMeta {
        RegionMeta {
            id,
            start_key: Bytes::copy_from_slice(start),
            end_key: Bytes::copy_from_slice(end),
            epoch,
            peers: vec![Peer::new(id * 10, 1), Peer::new(id * 10 + 1, 2)],
        }
    }

    #[tokio::test]
    async fn test_ask_split_allocates_distinct_ids() {
        let state = new_state();
        let m = meta(1, b"a", b"z", RegionEpoch::new(1, 1));
        let region = RegionInfo::new(m.clone(), Some(Peer::new(10, 1)));
        state.process_region_heartbeat(region).await.unwrap();

        let ids = state.handle_ask_split(&m).unwrap();
        assert_eq!(ids.new_peer_ids.len(), 2);
        assert_ne!(ids.new_region_id, ids.new_peer_ids[0]);

        let batch = state.handle_ask_batch_split(&m, 3).unwrap();
        assert_eq!(batch.len(), 3);
        // Split leftovers go under priority inspection.
        assert!(state.get_suspect_regions().contains(&1));
    }

    #[tokio::test]
    async fn test_ask_split_rejects_stale_epoch() {
        let state = new_state();
        let current = meta(1, b"a", b"z", RegionEpoch::new(3, 3));
        let region = RegionInfo::new(current, Some(Peer::new(10, 1)));
        state.process_region_heartbeat(region).await.unwrap();

        let stale = meta(1, b"a", b"z", RegionEpoch::new(2, 3));
        assert!(state.handle_ask_split(&stale).is_err());
    }

    #[test]
    fn test_report_split_adjacency() {
        let state = new_state();
        let left = meta(1, b"a", b"g", RegionEpoch::new(1, 1));
        let right = meta(2, b"g", b"z", RegionEpoch::new(1, 1));
        assert!(state.handle_report_split(&left, &right).is_ok());

        let gap = meta(3, b"h", b"z", RegionEpoch::new(1, 1));
        assert!(state.handle_report_split(&left, &gap).is_err());
    }

    #[test]
    fn test_report_batch_split_records_infos() {
        let state = new_state();
        let chain = vec![
            meta(11, b"a", b"g", RegionEpoch::new(1, 1)),
            meta(12, b"g", b"m", RegionEpoch::new(1, 1)),
            meta(1, b"m", b"z", RegionEpoch::new(1, 1)),
        ];
        state.handle_report_batch_split(&chain).unwrap();

        let infos = state.take_split_region_infos();
        assert_eq!(infos[&1], vec![11, 12]);

        assert!(state.handle_report_batch_split(&chain[..1]).is_err());
    }
}
