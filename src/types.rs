//! Core identifier and metadata types shared across the scheduler.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Region identifier in the cluster.
pub type RegionId = u64;

/// Store (storage node) identifier.
pub type StoreId = u64;

/// Peer (replica) identifier.
pub type PeerId = u64;

/// Role of a peer within its region's replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// Full voting member.
    Voter,
    /// Non-voting replica catching up on the log.
    Learner,
}

impl Default for PeerRole {
    fn default() -> Self {
        PeerRole::Voter
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Voter => write!(f, "voter"),
            PeerRole::Learner => write!(f, "learner"),
        }
    }
}

/// One replica of one region on one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Unique peer identifier.
    pub id: PeerId,
    /// Store hosting the replica.
    pub store_id: StoreId,
    /// Voting role.
    pub role: PeerRole,
}

impl Peer {
    /// Create a voter peer.
    pub fn new(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }

    /// Create a learner peer.
    pub fn learner(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Learner,
        }
    }

    /// Whether the peer is a learner.
    pub fn is_learner(&self) -> bool {
        self.role == PeerRole::Learner
    }
}

/// Region epoch: `version` advances on key-range changes (split/merge),
/// `conf_ver` advances on peer-set changes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RegionEpoch {
    /// Key-range version.
    pub version: u64,
    /// Configuration (peer set) version.
    pub conf_ver: u64,
}

impl RegionEpoch {
    /// Create an epoch.
    pub fn new(version: u64, conf_ver: u64) -> Self {
        Self { version, conf_ver }
    }
}

impl std::fmt::Display for RegionEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}/c{}", self.version, self.conf_ver)
    }
}

/// Region metadata: identity, key range, epoch, and replica set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMeta {
    /// Unique region identifier.
    pub id: RegionId,
    /// Inclusive start of the key range.
    pub start_key: Bytes,
    /// Exclusive end of the key range; empty means unbounded.
    pub end_key: Bytes,
    /// Current epoch.
    pub epoch: RegionEpoch,
    /// All replicas.
    pub peers: Vec<Peer>,
}

impl RegionMeta {
    /// Look up the peer residing on `store_id`, if any.
    pub fn peer_on_store(&self, store_id: StoreId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }
}

/// Flow direction a statistic was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKind {
    /// Write traffic.
    Write,
    /// Read traffic.
    Read,
}

impl FlowKind {
    /// All flow kinds.
    pub const ALL: [FlowKind; 2] = [FlowKind::Write, FlowKind::Read];
}

impl std::fmt::Display for FlowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowKind::Write => write!(f, "write"),
            FlowKind::Read => write!(f, "read"),
        }
    }
}

/// Half-open reporting interval in unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportInterval {
    /// Interval start.
    pub start_sec: u64,
    /// Interval end.
    pub end_sec: u64,
}

impl ReportInterval {
    /// Create an interval.
    pub fn new(start_sec: u64, end_sec: u64) -> Self {
        Self { start_sec, end_sec }
    }

    /// Interval length in seconds.
    pub fn seconds(&self) -> u64 {
        self.end_sec.saturating_sub(self.start_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_roles() {
        let voter = Peer::new(1, 10);
        let learner = Peer::learner(2, 11);
        assert!(!voter.is_learner());
        assert!(learner.is_learner());
    }

    #[test]
    fn test_region_meta_peer_lookup() {
        let meta = RegionMeta {
            id: 7,
            peers: vec![Peer::new(1, 10), Peer::learner(2, 11)],
            ..Default::default()
        };
        assert_eq!(meta.peer_on_store(11).map(|p| p.id), Some(2));
        assert!(meta.peer_on_store(12).is_none());
    }

    #[test]
    fn test_report_interval_seconds() {
        assert_eq!(ReportInterval::new(100, 110).seconds(), 10);
        assert_eq!(ReportInterval::new(110, 100).seconds(), 0);
    }
}
