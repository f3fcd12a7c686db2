//! Operator steps: the single-heartbeat units of an operator.

use crate::core::region::RegionInfo;
use crate::error::ScheduleError;
use crate::schedule::influence::OpInfluence;
use crate::schedule::store_limit::StoreLimitType;
use crate::types::{PeerId, RegionMeta, StoreId};
use bytes::Bytes;

use crate::core::command::{SplitOptions, SplitPolicy};

/// One peer change inside a joint-consensus transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerChange {
    /// Peer being changed.
    pub peer_id: PeerId,
    /// Store hosting the peer.
    pub store_id: StoreId,
}

/// One unit of an operator, executable in a single heartbeat reply.
///
/// Every step knows how to validate the region state it is about to act on
/// (`check_safety`) and whether the region view shows it completed
/// (`is_finish`).
#[derive(Debug, Clone, PartialEq)]
pub enum OpStep {
    /// Hand leadership to the peer on `to_store`.
    TransferLeader {
        /// Destination store.
        to_store: StoreId,
    },
    /// Add a voter on `to_store`.
    AddPeer {
        /// Destination store.
        to_store: StoreId,
        /// Pre-allocated peer id.
        peer_id: PeerId,
    },
    /// Add a voter without counting against the store limit.
    AddLightPeer {
        /// Destination store.
        to_store: StoreId,
        /// Pre-allocated peer id.
        peer_id: PeerId,
    },
    /// Add a learner on `to_store`.
    AddLearner {
        /// Destination store.
        to_store: StoreId,
        /// Pre-allocated peer id.
        peer_id: PeerId,
    },
    /// Add a learner without counting against the store limit.
    AddLightLearner {
        /// Destination store.
        to_store: StoreId,
        /// Pre-allocated peer id.
        peer_id: PeerId,
    },
    /// Promote the learner on `to_store` to voter.
    PromoteLearner {
        /// Store holding the learner.
        to_store: StoreId,
        /// The learner's peer id.
        peer_id: PeerId,
    },
    /// Demote the voter on `to_store` to learner.
    DemoteFollower {
        /// Store holding the voter.
        to_store: StoreId,
        /// The voter's peer id.
        peer_id: PeerId,
    },
    /// Remove the peer on `from_store`.
    RemovePeer {
        /// Store losing its peer.
        from_store: StoreId,
    },
    /// Merge this region into `target`. The passive side is the target
    /// itself, which only waits.
    MergeRegion {
        /// Region absorbing the source.
        target: RegionMeta,
        /// Whether this step sits on the target region.
        is_passive: bool,
    },
    /// Split this region.
    SplitRegion {
        /// Range snapshot at operator creation.
        start_key: Bytes,
        /// Range snapshot at operator creation.
        end_key: Bytes,
        /// Split policy.
        policy: SplitPolicy,
        /// Explicit split keys.
        keys: Vec<Bytes>,
        /// Ratio-split arguments.
        opts: SplitOptions,
    },
    /// Enter a joint-consensus configuration.
    ChangePeerV2Enter {
        /// Learners to promote.
        promote_learners: Vec<PeerChange>,
        /// Voters to demote.
        demote_voters: Vec<PeerChange>,
    },
    /// Leave the joint-consensus configuration.
    ChangePeerV2Leave {
        /// Learners promoted on enter.
        promote_learners: Vec<PeerChange>,
        /// Voters demoted on enter.
        demote_voters: Vec<PeerChange>,
    },
}

impl std::fmt::Display for OpStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpStep::TransferLeader { to_store } => {
                write!(f, "transfer leader to store {}", to_store)
            }
            OpStep::AddPeer { to_store, peer_id } => {
                write!(f, "add peer {} on store {}", peer_id, to_store)
            }
            OpStep::AddLightPeer { to_store, peer_id } => {
                write!(f, "add light peer {} on store {}", peer_id, to_store)
            }
            OpStep::AddLearner { to_store, peer_id } => {
                write!(f, "add learner {} on store {}", peer_id, to_store)
            }
            OpStep::AddLightLearner { to_store, peer_id } => {
                write!(f, "add light learner {} on store {}", peer_id, to_store)
            }
            OpStep::PromoteLearner { to_store, peer_id } => {
                write!(f, "promote learner {} on store {}", peer_id, to_store)
            }
            OpStep::DemoteFollower { to_store, peer_id } => {
                write!(f, "demote follower {} on store {}", peer_id, to_store)
            }
            OpStep::RemovePeer { from_store } => write!(f, "remove peer on store {}", from_store),
            OpStep::MergeRegion { target, is_passive } => {
                if *is_passive {
                    write!(f, "waiting to be merged by region {}", target.id)
                } else {
                    write!(f, "merge region into region {}", target.id)
                }
            }
            OpStep::SplitRegion { policy, .. } => write!(f, "split region with policy {:?}", policy),
            OpStep::ChangePeerV2Enter {
                promote_learners,
                demote_voters,
            } => write!(
                f,
                "enter joint state, promote {} learners, demote {} voters",
                promote_learners.len(),
                demote_voters.len()
            ),
            OpStep::ChangePeerV2Leave { .. } => write!(f, "leave joint state"),
        }
    }
}

impl OpStep {
    /// Whether the step gets the fast push cadence (leader and configuration
    /// changes) rather than the slow one (data movement).
    pub fn is_fast(&self) -> bool {
        matches!(
            self,
            OpStep::TransferLeader { .. }
                | OpStep::PromoteLearner { .. }
                | OpStep::DemoteFollower { .. }
                | OpStep::ChangePeerV2Enter { .. }
                | OpStep::ChangePeerV2Leave { .. }
        )
    }

    /// Validate the region state this step is about to act on. A failure
    /// means the operator went stale and must be canceled.
    pub fn check_safety(&self, region: &RegionInfo) -> Result<(), ScheduleError> {
        let unsafe_step = |reason: &str| ScheduleError::UnsafeStep {
            region_id: region.id(),
            reason: reason.to_string(),
        };
        match self {
            OpStep::TransferLeader { to_store } => match region.store_peer(*to_store) {
                Some(peer) if peer.is_learner() => Err(unsafe_step("target peer is a learner")),
                Some(_) => Ok(()),
                None => Err(ScheduleError::PeerNotFound {
                    region_id: region.id(),
                    store_id: *to_store,
                }),
            },
            OpStep::AddPeer { to_store, peer_id }
            | OpStep::AddLightPeer { to_store, peer_id }
            | OpStep::AddLearner { to_store, peer_id }
            | OpStep::AddLightLearner { to_store, peer_id } => {
                match region.store_peer(*to_store) {
                    Some(peer) if peer.id != *peer_id => {
                        Err(unsafe_step("peer exists on target store with another id"))
                    }
                    _ => Ok(()),
                }
            }
            OpStep::PromoteLearner { to_store, peer_id }
            | OpStep::DemoteFollower { to_store, peer_id } => {
                match region.store_peer(*to_store) {
                    Some(peer) if peer.id == *peer_id => {
                        if matches!(self, OpStep::DemoteFollower { .. })
                            && region.leader().map(|l| l.id) == Some(*peer_id)
                        {
                            Err(unsafe_step("cannot demote the leader"))
                        } else {
                            Ok(())
                        }
                    }
                    _ => Err(ScheduleError::PeerNotFound {
                        region_id: region.id(),
                        store_id: *to_store,
                    }),
                }
            }
            OpStep::RemovePeer { from_store } => {
                if region.leader_store_id() == *from_store {
                    Err(unsafe_step("cannot remove the leader peer"))
                } else {
                    Ok(())
                }
            }
            OpStep::MergeRegion { .. } | OpStep::SplitRegion { .. } => Ok(()),
            OpStep::ChangePeerV2Enter {
                promote_learners,
                demote_voters,
            } => {
                for change in promote_learners {
                    match region.store_peer(change.store_id) {
                        Some(peer) if peer.id == change.peer_id => {}
                        _ => {
                            return Err(ScheduleError::PeerNotFound {
                                region_id: region.id(),
                                store_id: change.store_id,
                            })
                        }
                    }
                }
                for change in demote_voters {
                    match region.store_peer(change.store_id) {
                        Some(peer) if peer.id == change.peer_id => {
                            if region.leader().map(|l| l.id) == Some(change.peer_id) {
                                return Err(unsafe_step("cannot demote the leader"));
                            }
                        }
                        _ => {
                            return Err(ScheduleError::PeerNotFound {
                                region_id: region.id(),
                                store_id: change.store_id,
                            })
                        }
                    }
                }
                Ok(())
            }
            OpStep::ChangePeerV2Leave { .. } => Ok(()),
        }
    }

    /// Whether the current region view shows the step completed.
    pub fn is_finish(&self, region: &RegionInfo) -> bool {
        match self {
            OpStep::TransferLeader { to_store } => region.leader_store_id() == *to_store,
            OpStep::AddPeer { to_store, peer_id } | OpStep::AddLightPeer { to_store, peer_id } => {
                match region.store_peer(*to_store) {
                    Some(peer) => {
                        peer.id == *peer_id && !peer.is_learner() && !region.is_pending_peer(peer.id)
                    }
                    None => false,
                }
            }
            OpStep::AddLearner { to_store, peer_id }
            | OpStep::AddLightLearner { to_store, peer_id } => {
                match region.store_peer(*to_store) {
                    Some(peer) => {
                        peer.id == *peer_id && peer.is_learner() && !region.is_pending_peer(peer.id)
                    }
                    None => false,
                }
            }
            OpStep::PromoteLearner { to_store, peer_id } => match region.store_peer(*to_store) {
                Some(peer) => peer.id == *peer_id && !peer.is_learner(),
                None => false,
            },
            OpStep::DemoteFollower { to_store, peer_id } => match region.store_peer(*to_store) {
                Some(peer) => peer.id == *peer_id && peer.is_learner(),
                None => false,
            },
            OpStep::RemovePeer { from_store } => region.store_peer(*from_store).is_none(),
            OpStep::MergeRegion { target, is_passive } => {
                // The passive target finishes when its range changes; the
                // active source disappears instead of finishing.
                *is_passive
                    && (region.start_key() != &target.start_key
                        || region.end_key() != &target.end_key)
            }
            OpStep::SplitRegion { start_key, end_key, .. } => {
                region.start_key() != start_key || region.end_key() != end_key
            }
            OpStep::ChangePeerV2Enter {
                promote_learners,
                demote_voters,
            }
            | OpStep::ChangePeerV2Leave {
                promote_learners,
                demote_voters,
            } => {
                promote_learners.iter().all(|c| {
                    region
                        .peer(c.peer_id)
                        .map(|p| !p.is_learner())
                        .unwrap_or(false)
                }) && demote_voters.iter().all(|c| {
                    region
                        .peer(c.peer_id)
                        .map(|p| p.is_learner())
                        .unwrap_or(false)
                })
            }
        }
    }

    /// How many conf-version bumps this step accounts for, given the region
    /// view.
    pub fn conf_ver_changed(&self, region: &RegionInfo) -> u64 {
        match self {
            OpStep::TransferLeader { .. }
            | OpStep::MergeRegion { .. }
            | OpStep::SplitRegion { .. } => 0,
            OpStep::AddPeer { to_store, peer_id } | OpStep::AddLightPeer { to_store, peer_id } => {
                region
                    .store_peer(*to_store)
                    .map(|p| (p.id == *peer_id && !p.is_learner()) as u64)
                    .unwrap_or(0)
            }
            OpStep::AddLearner { to_store, peer_id }
            | OpStep::AddLightLearner { to_store, peer_id } => region
                .store_peer(*to_store)
                .map(|p| (p.id == *peer_id && p.is_learner()) as u64)
                .unwrap_or(0),
            OpStep::PromoteLearner { to_store, peer_id } => region
                .store_peer(*to_store)
                .map(|p| (p.id == *peer_id && !p.is_learner()) as u64)
                .unwrap_or(0),
            OpStep::DemoteFollower { to_store, peer_id } => region
                .store_peer(*to_store)
                .map(|p| (p.id == *peer_id && p.is_learner()) as u64)
                .unwrap_or(0),
            OpStep::RemovePeer { from_store } => region.store_peer(*from_store).is_none() as u64,
            OpStep::ChangePeerV2Enter {
                promote_learners,
                demote_voters,
            }
            | OpStep::ChangePeerV2Leave {
                promote_learners,
                demote_voters,
            } => {
                let promoted = promote_learners
                    .iter()
                    .filter(|c| {
                        region
                            .peer(c.peer_id)
                            .map(|p| !p.is_learner())
                            .unwrap_or(false)
                    })
                    .count();
                let demoted = demote_voters
                    .iter()
                    .filter(|c| {
                        region
                            .peer(c.peer_id)
                            .map(|p| p.is_learner())
                            .unwrap_or(false)
                    })
                    .count();
                (promoted + demoted) as u64
            }
        }
    }

    /// Account this step's cost into `inf`.
    pub fn influence(&self, inf: &mut OpInfluence, region: &RegionInfo) {
        let size = region.approximate_size() as i64;
        match self {
            OpStep::TransferLeader { to_store } => {
                let from = region.leader_store_id();
                if from != 0 {
                    let src = inf.store(from);
                    src.leader_count -= 1;
                    src.leader_size -= size;
                }
                let dst = inf.store(*to_store);
                dst.leader_count += 1;
                dst.leader_size += size;
            }
            OpStep::AddPeer { to_store, .. } | OpStep::AddLearner { to_store, .. } => {
                let dst = inf.store(*to_store);
                dst.region_count += 1;
                dst.region_size += size;
                dst.add_step_cost(
                    StoreLimitType::AddPeer,
                    StoreLimitType::AddPeer.region_influence(),
                );
            }
            OpStep::AddLightPeer { to_store, .. } | OpStep::AddLightLearner { to_store, .. } => {
                let dst = inf.store(*to_store);
                dst.region_count += 1;
                dst.region_size += size;
            }
            OpStep::PromoteLearner { .. } | OpStep::DemoteFollower { .. } => {}
            OpStep::RemovePeer { from_store } => {
                let src = inf.store(*from_store);
                src.region_count -= 1;
                src.region_size -= size;
                src.add_step_cost(
                    StoreLimitType::RemovePeer,
                    StoreLimitType::RemovePeer.region_influence(),
                );
            }
            OpStep::MergeRegion { is_passive, .. } => {
                if *is_passive {
                    for peer in region.peers() {
                        let store = inf.store(peer.store_id);
                        store.region_count -= 1;
                        store.region_size -= size;
                    }
                }
            }
            OpStep::SplitRegion { .. } => {
                for peer in region.peers() {
                    inf.store(peer.store_id).region_count += 1;
                }
            }
            OpStep::ChangePeerV2Enter { .. } | OpStep::ChangePeerV2Leave { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Peer, RegionEpoch};

    fn region(stores_and_roles: &[(StoreId, bool)], leader_idx: usize) -> RegionInfo {
        let peers: Vec<Peer> = stores_and_roles
            .iter()
            .enumerate()
            .map(|(i, (s, learner))| {
                if *learner {
                    Peer::learner(i as u64 + 1, *s)
                } else {
                    Peer::new(i as u64 + 1, *s)
                }
            })
            .collect();
        let leader = peers.get(leader_idx).copied();
        RegionInfo::new(
            RegionMeta {
                id: 1,
                epoch: RegionEpoch::new(1, 1),
                peers,
                ..Default::default()
            },
            leader,
        )
        .with_approximate(50, 1000)
    }

    #[test]
    fn test_transfer_leader_progress() {
        let step = OpStep::TransferLeader { to_store: 2 };
        let before = region(&[(1, false), (2, false)], 0);
        let after = region(&[(1, false), (2, false)], 1);

        assert!(step.check_safety(&before).is_ok());
        assert!(!step.is_finish(&before));
        assert!(step.is_finish(&after));
    }

    #[test]
    fn test_transfer_leader_to_learner_is_unsafe() {
        let step = OpStep::TransferLeader { to_store: 2 };
        let r = region(&[(1, false), (2, true)], 0);
        assert!(step.check_safety(&r).is_err());
    }

    #[test]
    fn test_add_peer_finish_requires_settled_voter() {
        let step = OpStep::AddPeer {
            to_store: 3,
            peer_id: 9,
        };
        let absent = region(&[(1, false), (2, false)], 0);
        assert!(!step.is_finish(&absent));

        let mut meta = absent.meta().clone();
        meta.peers.push(Peer::new(9, 3));
        let present = RegionInfo::new(meta.clone(), Some(Peer::new(1, 1)));
        assert!(step.is_finish(&present));
        assert_eq!(step.conf_ver_changed(&present), 1);

        // Still pending: not finished yet.
        let pending =
            RegionInfo::new(meta, Some(Peer::new(1, 1))).with_pending_peers(vec![Peer::new(9, 3)]);
        assert!(!step.is_finish(&pending));
    }

    #[test]
    fn test_add_peer_safety_conflicting_id() {
        let step = OpStep::AddPeer {
            to_store: 2,
            peer_id: 99,
        };
        let r = region(&[(1, false), (2, false)], 0);
        assert!(step.check_safety(&r).is_err());
    }

    #[test]
    fn test_remove_peer_guards_leader() {
        let r = region(&[(1, false), (2, false)], 0);
        assert!(OpStep::RemovePeer { from_store: 1 }.check_safety(&r).is_err());
        assert!(OpStep::RemovePeer { from_store: 2 }.check_safety(&r).is_ok());

        let removed = region(&[(1, false)], 0);
        assert!(OpStep::RemovePeer { from_store: 2 }.is_finish(&removed));
        assert_eq!(
            OpStep::RemovePeer { from_store: 2 }.conf_ver_changed(&removed),
            1
        );
    }

    #[test]
    fn test_promote_learner() {
        let step = OpStep::PromoteLearner {
            to_store: 2,
            peer_id: 2,
        };
        let before = region(&[(1, false), (2, true)], 0);
        assert!(step.check_safety(&before).is_ok());
        assert!(!step.is_finish(&before));

        let after = region(&[(1, false), (2, false)], 0);
        assert!(step.is_finish(&after));
    }

    #[test]
    fn test_split_region_finish_on_range_change() {
        let r = region(&[(1, false)], 0);
        let step = OpStep::SplitRegion {
            start_key: r.start_key().clone(),
            end_key: r.end_key().clone(),
            policy: SplitPolicy::Scan,
            keys: vec![],
            opts: SplitOptions::default(),
        };
        assert!(!step.is_finish(&r));

        let mut meta = r.meta().clone();
        meta.start_key = Bytes::from_static(b"m");
        let halved = RegionInfo::new(meta, None);
        assert!(step.is_finish(&halved));
    }

    #[test]
    fn test_influence_accounting() {
        let r = region(&[(1, false), (2, false)], 0);
        let mut inf = OpInfluence::new();

        OpStep::AddPeer {
            to_store: 3,
            peer_id: 9,
        }
        .influence(&mut inf, &r);
        OpStep::RemovePeer { from_store: 2 }.influence(&mut inf, &r);
        OpStep::TransferLeader { to_store: 2 }.influence(&mut inf, &r);

        let s3 = inf.get(3).unwrap();
        assert_eq!(s3.step_cost(StoreLimitType::AddPeer), 1000);
        assert_eq!(s3.region_count, 1);
        assert_eq!(s3.region_size, 50);

        let s2 = inf.get(2).unwrap();
        assert_eq!(s2.step_cost(StoreLimitType::RemovePeer), 1000);
        assert_eq!(s2.leader_count, 1);

        let s1 = inf.get(1).unwrap();
        assert_eq!(s1.leader_count, -1);
        assert_eq!(s1.leader_size, -50);

        // Light peers skip the limit cost.
        let mut inf2 = OpInfluence::new();
        OpStep::AddLightPeer {
            to_store: 4,
            peer_id: 10,
        }
        .influence(&mut inf2, &r);
        assert_eq!(inf2.get(4).unwrap().step_cost(StoreLimitType::AddPeer), 0);
    }

    #[test]
    fn test_fast_and_slow_cadence() {
        assert!(OpStep::TransferLeader { to_store: 1 }.is_fast());
        assert!(OpStep::PromoteLearner {
            to_store: 1,
            peer_id: 1
        }
        .is_fast());
        assert!(!OpStep::AddPeer {
            to_store: 1,
            peer_id: 1
        }
        .is_fast());
        assert!(!OpStep::RemovePeer { from_store: 1 }.is_fast());
    }
}
