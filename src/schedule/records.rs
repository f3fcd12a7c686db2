//! Short-lived recall of finished operators.

use crate::schedule::operator::{OpKind, OpStatus, Operator};
use crate::types::RegionId;
use moka::sync::Cache;
use std::time::Duration;

/// How long a finished operator stays queryable.
const OPERATOR_STATUS_REMAIN_TIME: Duration = Duration::from_secs(10 * 60);

/// Summary of a finished operator.
#[derive(Debug, Clone)]
pub struct OperatorRecord {
    /// Region the operator acted on.
    pub region_id: RegionId,
    /// Metric label.
    pub desc: String,
    /// One-line summary.
    pub brief: String,
    /// Kind bitmask.
    pub kind: OpKind,
    /// Terminal status.
    pub status: OpStatus,
}

impl OperatorRecord {
    fn from_operator(op: &Operator) -> Self {
        Self {
            region_id: op.region_id(),
            desc: op.desc().to_string(),
            brief: op.brief().to_string(),
            kind: op.kind(),
            status: op.status(),
        }
    }
}

/// TTL cache of finished operators keyed by region, serving status queries
/// after retirement.
#[derive(Debug)]
pub struct OperatorRecords {
    ttl: Cache<RegionId, OperatorRecord>,
}

impl OperatorRecords {
    /// Create a cache with the default retention.
    pub fn new() -> Self {
        Self::with_ttl(OPERATOR_STATUS_REMAIN_TIME)
    }

    /// Create a cache with a custom retention. Test hook.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Record a finished operator.
    pub fn put(&self, op: &Operator) {
        self.ttl
            .insert(op.region_id(), OperatorRecord::from_operator(op));
    }

    /// Recall the most recent finished operator of a region.
    pub fn get(&self, region_id: RegionId) -> Option<OperatorRecord> {
        self.ttl.get(&region_id)
    }
}

impl Default for OperatorRecords {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegionEpoch;

    #[test]
    fn test_put_get() {
        let records = OperatorRecords::new();
        let op = Operator::new(
            "transfer-leader",
            "brief",
            5,
            RegionEpoch::new(1, 1),
            OpKind::LEADER,
            vec![],
        );
        op.start();
        op.cancel();
        records.put(&op);

        let record = records.get(5).unwrap();
        assert_eq!(record.status, OpStatus::Canceled);
        assert_eq!(record.desc, "transfer-leader");
        assert!(records.get(6).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let records = OperatorRecords::with_ttl(Duration::from_millis(10));
        let op = Operator::new("t", "b", 5, RegionEpoch::new(1, 1), OpKind::LEADER, vec![]);
        op.cancel();
        records.put(&op);
        assert!(records.get(5).is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(records.get(5).is_none());
    }
}
