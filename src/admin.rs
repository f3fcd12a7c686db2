//! Admin operator surface (contract only).
//!
//! The embedding server exposes these over HTTP; this module holds the serde
//! payload model and the translation from payloads to operators. Transport
//! is out of scope.

use crate::cluster::ClusterState;
use crate::core::command::{SplitOptions, SplitPolicy};
use crate::core::region::RegionInfo;
use crate::error::{Error, Result, ScheduleError};
use crate::schedule::controller::OperatorController;
use crate::schedule::operator::{OpKind, Operator, PriorityLevel};
use crate::schedule::records::OperatorRecord;
use crate::types::{FlowKind, RegionId, StoreId};
use bytes::Bytes;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `POST /operators` payload, tagged by operator name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum OperatorRequest {
    /// Move region leadership.
    TransferLeader {
        /// Target region.
        region_id: RegionId,
        /// Store to lead from.
        to_store_id: StoreId,
    },
    /// Move every replica to a given store set.
    TransferRegion {
        /// Target region.
        region_id: RegionId,
        /// Stores that should hold the region.
        to_store_ids: Vec<StoreId>,
    },
    /// Move one replica between stores.
    TransferPeer {
        /// Target region.
        region_id: RegionId,
        /// Store losing its replica.
        from_store_id: StoreId,
        /// Store receiving the replica.
        to_store_id: StoreId,
    },
    /// Add a voter replica.
    AddPeer {
        /// Target region.
        region_id: RegionId,
        /// Store receiving the replica.
        store_id: StoreId,
    },
    /// Add a learner replica.
    AddLearner {
        /// Target region.
        region_id: RegionId,
        /// Store receiving the replica.
        store_id: StoreId,
    },
    /// Remove a replica.
    RemovePeer {
        /// Target region.
        region_id: RegionId,
        /// Store losing its replica.
        store_id: StoreId,
    },
    /// Merge one region into another.
    MergeRegion {
        /// Region to be absorbed.
        source_region_id: RegionId,
        /// Region absorbing it.
        target_region_id: RegionId,
    },
    /// Split a region.
    SplitRegion {
        /// Target region.
        region_id: RegionId,
        /// Split policy; defaults to scan.
        #[serde(default)]
        policy: Option<String>,
        /// Load dimension for ratio splits.
        #[serde(default)]
        dim_id: Option<u32>,
        /// Split position for ratio splits.
        #[serde(default)]
        ratio: Option<f64>,
        /// Flow direction for ratio splits.
        #[serde(default)]
        rw_type: Option<String>,
    },
    /// Scatter a region's replicas across random stores.
    ScatterRegion {
        /// Target region.
        region_id: RegionId,
    },
}

/// Translates admin payloads into operators against the cluster.
#[derive(Debug)]
pub struct AdminHandler {
    cluster: Arc<ClusterState>,
    controller: Arc<OperatorController>,
}

impl AdminHandler {
    /// Create a handler.
    pub fn new(cluster: Arc<ClusterState>, controller: Arc<OperatorController>) -> Self {
        Self {
            cluster,
            controller,
        }
    }

    /// Handle one `POST /operators` payload.
    pub fn handle(&self, request: OperatorRequest) -> Result<()> {
        match request {
            OperatorRequest::TransferLeader {
                region_id,
                to_store_id,
            } => {
                let region = self.region(region_id)?;
                if region.store_peer(to_store_id).is_none() {
                    return Err(ScheduleError::PeerNotFound {
                        region_id,
                        store_id: to_store_id,
                    }
                    .into());
                }
                let op =
                    Operator::transfer_leader(&region, to_store_id).with_priority(PriorityLevel::High);
                self.add(vec![op])
            }
            OperatorRequest::TransferRegion {
                region_id,
                to_store_ids,
            } => {
                let region = self.region(region_id)?;
                let ops = self.build_transfer_region(&region, &to_store_ids)?;
                self.add(ops)
            }
            OperatorRequest::TransferPeer {
                region_id,
                from_store_id,
                to_store_id,
            } => {
                let region = self.region(region_id)?;
                if region.store_peer(from_store_id).is_none() {
                    return Err(ScheduleError::PeerNotFound {
                        region_id,
                        store_id: from_store_id,
                    }
                    .into());
                }
                if region.store_peer(to_store_id).is_some() {
                    return Err(Error::Admin(format!(
                        "region {} already has a peer on store {}",
                        region_id, to_store_id
                    )));
                }
                let op = Operator::move_peer(
                    &region,
                    from_store_id,
                    to_store_id,
                    self.cluster.alloc_id(),
                )
                .with_priority(PriorityLevel::High);
                self.add(vec![op])
            }
            OperatorRequest::AddPeer {
                region_id,
                store_id,
            } => {
                let region = self.region(region_id)?;
                self.check_target_store(store_id)?;
                if region.store_peer(store_id).is_some() {
                    return Err(Error::Admin(format!(
                        "region {} already has a peer on store {}",
                        region_id, store_id
                    )));
                }
                let op = Operator::add_peer(&region, store_id, self.cluster.alloc_id())
                    .with_priority(PriorityLevel::High);
                self.add(vec![op])
            }
            OperatorRequest::AddLearner {
                region_id,
                store_id,
            } => {
                let region = self.region(region_id)?;
                self.check_target_store(store_id)?;
                if region.store_peer(store_id).is_some() {
                    return Err(Error::Admin(format!(
                        "region {} already has a peer on store {}",
                        region_id, store_id
                    )));
                }
                let op = Operator::add_learner(&region, store_id, self.cluster.alloc_id())
                    .with_priority(PriorityLevel::High);
                self.add(vec![op])
            }
            OperatorRequest::RemovePeer {
                region_id,
                store_id,
            } => {
                let region = self.region(region_id)?;
                if region.store_peer(store_id).is_none() {
                    return Err(ScheduleError::PeerNotFound {
                        region_id,
                        store_id,
                    }
                    .into());
                }
                let op = Operator::remove_peer(&region, store_id).with_priority(PriorityLevel::High);
                self.add(vec![op])
            }
            OperatorRequest::MergeRegion {
                source_region_id,
                target_region_id,
            } => {
                let source = self.region(source_region_id)?;
                let target = self.region(target_region_id)?;
                if source.start_key() != target.end_key() && source.end_key() != target.start_key()
                {
                    return Err(Error::Admin(format!(
                        "regions {} and {} are not adjacent",
                        source_region_id, target_region_id
                    )));
                }
                let (active, passive) = Operator::merge_pair(&source, &target);
                self.add(vec![active, passive])
            }
            OperatorRequest::SplitRegion {
                region_id,
                policy,
                dim_id,
                ratio,
                rw_type,
            } => {
                let region = self.region(region_id)?;
                let policy = parse_split_policy(policy.as_deref())?;
                let opts = SplitOptions {
                    dim_id: dim_id.unwrap_or(0),
                    ratio: ratio.unwrap_or(0.5),
                    rw_type: parse_rw_type(rw_type.as_deref())?,
                };
                let op = Operator::split_region(&region, policy, Vec::new(), opts, OpKind::ADMIN)
                    .with_priority(PriorityLevel::High);
                self.add(vec![op])
            }
            OperatorRequest::ScatterRegion { region_id } => {
                let region = self.region(region_id)?;
                let ops = self.build_scatter_region(&region)?;
                self.add(ops)
            }
        }
    }

    /// `GET /operators/{region_id}` semantics.
    pub fn get_operator(&self, region_id: RegionId) -> Option<OperatorRecord> {
        self.controller.get_operator_status(region_id)
    }

    /// `GET /operators[?kind=]` semantics: running operators, optionally
    /// filtered by kind.
    pub fn list_operators(&self, kind: Option<OpKind>) -> Vec<Arc<Operator>> {
        let ops = self.controller.get_operators();
        match kind {
            Some(mask) => ops
                .into_iter()
                .filter(|op| op.kind().contains_any(mask))
                .collect(),
            None => ops,
        }
    }

    /// `DELETE /operators/{region_id}` semantics.
    pub fn cancel_operator(&self, region_id: RegionId) -> Result<()> {
        let op = self
            .controller
            .get_operator(region_id)
            .ok_or_else(|| Error::Admin(format!("no operator running for region {}", region_id)))?;
        self.controller.remove_operator(&op, Some("canceled by admin"));
        Ok(())
    }

    fn region(&self, region_id: RegionId) -> Result<RegionInfo> {
        use crate::core::cluster::ClusterInformer;
        self.cluster
            .get_region(region_id)
            .ok_or_else(|| ScheduleError::RegionNotFound(region_id).into())
    }

    fn check_target_store(&self, store_id: StoreId) -> Result<()> {
        use crate::core::cluster::ClusterInformer;
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or_else(|| Error::Admin(format!("store {} not found", store_id)))?;
        if store.is_tombstone() {
            return Err(Error::Admin(format!("store {} is tombstone", store_id)));
        }
        Ok(())
    }

    fn build_transfer_region(
        &self,
        region: &RegionInfo,
        to_store_ids: &[StoreId],
    ) -> Result<Vec<Operator>> {
        if to_store_ids.is_empty() {
            return Err(Error::Admin("empty target store list".to_string()));
        }
        for store_id in to_store_ids {
            self.check_target_store(*store_id)?;
        }
        // One move operator per store gained, dropping a current store each
        // time; finer balancing is the policy modules' job.
        let current: Vec<StoreId> = region.peers().iter().map(|p| p.store_id).collect();
        let gains: Vec<StoreId> = to_store_ids
            .iter()
            .copied()
            .filter(|s| !current.contains(s))
            .collect();
        let losses: Vec<StoreId> = current
            .iter()
            .copied()
            .filter(|s| !to_store_ids.contains(s))
            .collect();
        if gains.len() != losses.len() {
            return Err(Error::Admin(format!(
                "replica count would change from {} to {}",
                current.len(),
                to_store_ids.len()
            )));
        }
        let ops = gains
            .into_iter()
            .zip(losses)
            .map(|(to, from)| {
                Operator::move_peer(region, from, to, self.cluster.alloc_id())
                    .with_priority(PriorityLevel::High)
            })
            .collect();
        Ok(ops)
    }

    fn build_scatter_region(&self, region: &RegionInfo) -> Result<Vec<Operator>> {
        use crate::core::cluster::ClusterInformer;
        let current: Vec<StoreId> = region.peers().iter().map(|p| p.store_id).collect();
        let mut candidates: Vec<StoreId> = self
            .cluster
            .get_stores()
            .iter()
            .filter(|s| s.is_up() && !current.contains(&s.id()))
            .map(|s| s.id())
            .collect();
        if candidates.is_empty() {
            return Err(Error::Admin("no candidate store to scatter to".to_string()));
        }
        candidates.shuffle(&mut rand::thread_rng());

        // Move one non-leader replica to a random store; repeated scatters
        // spread the remaining replicas.
        let from = region
            .peers()
            .iter()
            .map(|p| p.store_id)
            .find(|s| *s != region.leader_store_id())
            .ok_or_else(|| Error::Admin("region has no movable follower".to_string()))?;
        let to = candidates[0];
        Ok(vec![Operator::move_peer(
            region,
            from,
            to,
            self.cluster.alloc_id(),
        )])
    }

    fn add(&self, ops: Vec<Operator>) -> Result<()> {
        let count = ops.len();
        let ops: Vec<Arc<Operator>> = ops.into_iter().map(Arc::new).collect();
        if !self.controller.add_operator(ops) {
            return Err(Error::Admin(format!(
                "failed to admit {} operator(s)",
                count
            )));
        }
        Ok(())
    }
}

fn parse_split_policy(policy: Option<&str>) -> Result<SplitPolicy> {
    match policy {
        None | Some("scan") => Ok(SplitPolicy::Scan),
        Some("approximate") => Ok(SplitPolicy::Approximate),
        Some("ratio") => Ok(SplitPolicy::Ratio),
        Some(other) => Err(Error::Admin(format!("unknown split policy: {}", other))),
    }
}

fn parse_rw_type(rw: Option<&str>) -> Result<Option<FlowKind>> {
    match rw {
        None => Ok(None),
        Some("read") => Ok(Some(FlowKind::Read)),
        Some("write") => Ok(Some(FlowKind::Write)),
        Some(other) => Err(Error::Admin(format!("unknown rw type: {}", other))),
    }
}

/// Ensure key-based payloads stay representable; admin split keys arrive
/// hex-encoded from clients.
pub fn decode_hex_key(hex: &str) -> Result<Bytes> {
    if hex.len() % 2 != 0 {
        return Err(Error::Admin(format!("invalid hex key: {}", hex)));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = hex_val(pair[0]).ok_or_else(|| Error::Admin(format!("invalid hex key: {}", hex)))?;
        let lo = hex_val(pair[1]).ok_or_else(|| Error::Admin(format!("invalid hex key: {}", hex)))?;
        out.push(hi << 4 | lo);
    }
    Ok(Bytes::from(out))
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScheduleConfig, SchedulingOptions};
    use crate::core::command::ChannelSink;
    use crate::core::store::StoreMeta;
    use crate::metrics::SchedulerMetrics;
    use crate::schedule::operator::OpStatus;
    use crate::types::{Peer, RegionEpoch, RegionMeta, ReportInterval};
    use tokio_util::sync::CancellationToken;

    async fn setup() -> (AdminHandler, Arc<ClusterState>) {
        let options = Arc::new(SchedulingOptions::new(ScheduleConfig::default()));
        let metrics = Arc::new(SchedulerMetrics::new());
        let (cluster, _rx) = ClusterState::new(options, None, Arc::clone(&metrics));
        let (sink, _cmd_rx) = ChannelSink::new(64);
        let controller = Arc::new(OperatorController::new(
            Arc::clone(&cluster) as Arc<dyn crate::core::cluster::ClusterInformer>,
            Arc::new(sink),
            metrics,
            CancellationToken::new(),
        ));

        for store_id in 1..=4 {
            cluster.put_store(StoreMeta {
                id: store_id,
                address: format!("127.0.0.1:2016{}", store_id),
                ..Default::default()
            });
        }
        let peers = vec![Peer::new(101, 1), Peer::new(102, 2), Peer::new(103, 3)];
        let region = RegionInfo::new(
            RegionMeta {
                id: 42,
                epoch: RegionEpoch::new(1, 1),
                peers: peers.clone(),
                ..Default::default()
            },
            Some(peers[0]),
        )
        .with_approximate(10, 1000)
        .with_interval(ReportInterval::new(0, 10));
        cluster.process_region_heartbeat(region).await.unwrap();

        (AdminHandler::new(Arc::clone(&cluster), controller), cluster)
    }

    #[tokio::test]
    async fn test_transfer_leader_request() {
        let (handler, _cluster) = setup().await;
        handler
            .handle(OperatorRequest::TransferLeader {
                region_id: 42,
                to_store_id: 2,
            })
            .unwrap();

        let record = handler.get_operator(42).unwrap();
        assert_eq!(record.status, OpStatus::Started);
        assert!(record.kind.contains_any(OpKind::LEADER));
    }

    #[tokio::test]
    async fn test_transfer_leader_to_missing_peer_fails() {
        let (handler, _cluster) = setup().await;
        let err = handler.handle(OperatorRequest::TransferLeader {
            region_id: 42,
            to_store_id: 4,
        });
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_add_and_cancel_operator() {
        let (handler, _cluster) = setup().await;
        handler
            .handle(OperatorRequest::AddPeer {
                region_id: 42,
                store_id: 4,
            })
            .unwrap();
        assert_eq!(handler.list_operators(None).len(), 1);
        assert_eq!(handler.list_operators(Some(OpKind::MERGE)).len(), 0);

        handler.cancel_operator(42).unwrap();
        assert!(handler.list_operators(None).is_empty());
        // The record survives cancellation for status queries.
        let record = handler.get_operator(42).unwrap();
        assert_eq!(record.status, OpStatus::Canceled);
    }

    #[tokio::test]
    async fn test_transfer_region_balances_replica_count() {
        let (handler, _cluster) = setup().await;
        let err = handler.handle(OperatorRequest::TransferRegion {
            region_id: 42,
            to_store_ids: vec![1, 2],
        });
        assert!(err.is_err());

        handler
            .handle(OperatorRequest::TransferRegion {
                region_id: 42,
                to_store_ids: vec![1, 2, 4],
            })
            .unwrap();
        assert_eq!(handler.list_operators(None).len(), 1);
    }

    #[tokio::test]
    async fn test_split_request_policies() {
        let (handler, _cluster) = setup().await;
        handler
            .handle(OperatorRequest::SplitRegion {
                region_id: 42,
                policy: Some("approximate".to_string()),
                dim_id: None,
                ratio: None,
                rw_type: None,
            })
            .unwrap();

        let err = handler.handle(OperatorRequest::SplitRegion {
            region_id: 42,
            policy: Some("bogus".to_string()),
            dim_id: None,
            ratio: None,
            rw_type: None,
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_request_serde_round_trip() {
        let req = OperatorRequest::TransferPeer {
            region_id: 1,
            from_store_id: 2,
            to_store_id: 3,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"name\":\"transfer-peer\""));
        let back: OperatorRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_decode_hex_key() {
        assert_eq!(decode_hex_key("6162").unwrap(), Bytes::from_static(b"ab"));
        assert!(decode_hex_key("6").is_err());
        assert!(decode_hex_key("6g").is_err());
    }
}
