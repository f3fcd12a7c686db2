//! Error types for the scheduler.

use crate::types::{RegionId, StoreId};
use thiserror::Error;

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the scheduler.
#[derive(Error, Debug)]
pub enum Error {
    /// Operator admission and dispatch errors.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Heartbeat ingest errors.
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Persistent storage errors.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Admin request errors.
    #[error("admin error: {0}")]
    Admin(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised by the operator controller.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The target region is not present in the cluster cache.
    #[error("region not found: {0}")]
    RegionNotFound(RegionId),

    /// The operator's epoch snapshot no longer matches the region.
    #[error("region {0} epoch not match")]
    EpochNotMatch(RegionId),

    /// A merge operator arrived without its required pair.
    #[error("merge operator should be paired")]
    OrphanMergeOperator,

    /// A step references a peer the region no longer holds.
    #[error("peer not found on store {store_id} for region {region_id}")]
    PeerNotFound {
        /// Region the step targets.
        region_id: RegionId,
        /// Store expected to hold the peer.
        store_id: StoreId,
    },

    /// A step found the region in a state it cannot safely act on.
    #[error("unsafe step on region {region_id}: {reason}")]
    UnsafeStep {
        /// Region the step targets.
        region_id: RegionId,
        /// Human-readable safety violation.
        reason: String,
    },

    /// An operator was observed in a status the caller cannot handle.
    #[error("unexpected operator status: {0}")]
    UnexpectedStatus(&'static str),
}

/// Errors raised by the region heartbeat ingest path.
#[derive(Error, Debug)]
pub enum IngestError {
    /// A report carried a strictly older epoch than the cached region.
    #[error("region {0} is stale, reported epoch older than cached")]
    StaleRegion(RegionId),

    /// A report listed no peers at all.
    #[error("invalid region {0}, zero peer count")]
    NoPeers(RegionId),

    /// Store heartbeat for a store the cluster does not know.
    #[error("store not found: {0}")]
    StoreNotFound(StoreId),

    /// Split report halves do not form a contiguous range.
    #[error("invalid split region report")]
    InvalidSplit,
}
