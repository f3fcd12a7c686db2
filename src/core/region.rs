//! Region state as observed through heartbeats.

use crate::types::{Peer, PeerId, RegionEpoch, RegionId, RegionMeta, ReportInterval, StoreId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Replication group state reported alongside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    /// No replication status reported.
    Unknown,
    /// Plain majority replication.
    Majority,
    /// Label-aware integrity mode.
    IntegrityOverLabel,
}

impl Default for ReplicationState {
    fn default() -> Self {
        ReplicationState::Unknown
    }
}

/// Replication status: a state plus the id of the configuration that set it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Current replication state.
    pub state: ReplicationState,
    /// Identifier of the state transition.
    pub state_id: u64,
}

/// A down peer report: the peer and for how long it has been unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownPeer {
    /// The unreachable peer.
    pub peer: Peer,
    /// Seconds since the peer was last heard from.
    pub down_seconds: u64,
}

/// Full region view assembled from one heartbeat report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionInfo {
    meta: RegionMeta,
    leader: Option<Peer>,
    down_peers: Vec<DownPeer>,
    pending_peers: Vec<Peer>,
    bytes_written: u64,
    bytes_read: u64,
    keys_written: u64,
    keys_read: u64,
    ops_write: u64,
    ops_read: u64,
    approximate_size: u64,
    approximate_keys: u64,
    interval: ReportInterval,
    replication_status: Option<ReplicationStatus>,
}

impl RegionInfo {
    /// Create a region view from its metadata and reported leader.
    pub fn new(meta: RegionMeta, leader: Option<Peer>) -> Self {
        Self {
            meta,
            leader,
            ..Default::default()
        }
    }

    /// Attach down peers.
    pub fn with_down_peers(mut self, down: Vec<DownPeer>) -> Self {
        self.down_peers = down;
        self
    }

    /// Attach pending peers.
    pub fn with_pending_peers(mut self, pending: Vec<Peer>) -> Self {
        self.pending_peers = pending;
        self
    }

    /// Attach write-direction flow counters.
    pub fn with_written(mut self, bytes: u64, keys: u64, ops: u64) -> Self {
        self.bytes_written = bytes;
        self.keys_written = keys;
        self.ops_write = ops;
        self
    }

    /// Attach read-direction flow counters.
    pub fn with_read(mut self, bytes: u64, keys: u64, ops: u64) -> Self {
        self.bytes_read = bytes;
        self.keys_read = keys;
        self.ops_read = ops;
        self
    }

    /// Attach approximate size (MiB) and key count.
    pub fn with_approximate(mut self, size_mb: u64, keys: u64) -> Self {
        self.approximate_size = size_mb;
        self.approximate_keys = keys;
        self
    }

    /// Attach the reporting interval.
    pub fn with_interval(mut self, interval: ReportInterval) -> Self {
        self.interval = interval;
        self
    }

    /// Attach a replication status.
    pub fn with_replication_status(mut self, status: ReplicationStatus) -> Self {
        self.replication_status = Some(status);
        self
    }

    /// Region identifier.
    pub fn id(&self) -> RegionId {
        self.meta.id
    }

    /// Region metadata.
    pub fn meta(&self) -> &RegionMeta {
        &self.meta
    }

    /// Region epoch.
    pub fn epoch(&self) -> RegionEpoch {
        self.meta.epoch
    }

    /// Start of the key range.
    pub fn start_key(&self) -> &Bytes {
        &self.meta.start_key
    }

    /// End of the key range (empty = unbounded).
    pub fn end_key(&self) -> &Bytes {
        &self.meta.end_key
    }

    /// Reported leader peer.
    pub fn leader(&self) -> Option<&Peer> {
        self.leader.as_ref()
    }

    /// Store of the reported leader, 0 if none.
    pub fn leader_store_id(&self) -> StoreId {
        self.leader.map(|p| p.store_id).unwrap_or(0)
    }

    /// All peers.
    pub fn peers(&self) -> &[Peer] {
        &self.meta.peers
    }

    /// The peer hosted on `store_id`, if any.
    pub fn store_peer(&self, store_id: StoreId) -> Option<&Peer> {
        self.meta.peer_on_store(store_id)
    }

    /// The peer with the given id, if any.
    pub fn peer(&self, peer_id: PeerId) -> Option<&Peer> {
        self.meta.peers.iter().find(|p| p.id == peer_id)
    }

    /// Voter peers only.
    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.meta.peers.iter().filter(|p| !p.is_learner())
    }

    /// Reported down peers.
    pub fn down_peers(&self) -> &[DownPeer] {
        &self.down_peers
    }

    /// Reported pending peers.
    pub fn pending_peers(&self) -> &[Peer] {
        &self.pending_peers
    }

    /// Whether the peer with `peer_id` is reported pending.
    pub fn is_pending_peer(&self, peer_id: PeerId) -> bool {
        self.pending_peers.iter().any(|p| p.id == peer_id)
    }

    /// Bytes written over the interval.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes read over the interval.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Keys written over the interval.
    pub fn keys_written(&self) -> u64 {
        self.keys_written
    }

    /// Keys read over the interval.
    pub fn keys_read(&self) -> u64 {
        self.keys_read
    }

    /// Write operations over the interval.
    pub fn ops_write(&self) -> u64 {
        self.ops_write
    }

    /// Read operations over the interval.
    pub fn ops_read(&self) -> u64 {
        self.ops_read
    }

    /// Approximate region size in MiB.
    pub fn approximate_size(&self) -> u64 {
        self.approximate_size
    }

    /// Approximate key count.
    pub fn approximate_keys(&self) -> u64 {
        self.approximate_keys
    }

    /// Reporting interval.
    pub fn interval(&self) -> ReportInterval {
        self.interval
    }

    /// Reported replication status.
    pub fn replication_status(&self) -> Option<ReplicationStatus> {
        self.replication_status
    }

    /// Whether `other` covers a key range overlapping this region's.
    pub fn overlaps(&self, other: &RegionInfo) -> bool {
        range_overlaps(
            self.start_key(),
            self.end_key(),
            other.start_key(),
            other.end_key(),
        )
    }
}

/// Half-open range overlap where an empty end key means unbounded.
pub(crate) fn range_overlaps(a_start: &[u8], a_end: &[u8], b_start: &[u8], b_end: &[u8]) -> bool {
    let a_before_b = !a_end.is_empty() && a_end <= b_start;
    let b_before_a = !b_end.is_empty() && b_end <= a_start;
    !(a_before_b || b_before_a)
}
