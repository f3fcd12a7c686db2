//! Cost accounting: what an operator imposes on each store.

use crate::schedule::store_limit::StoreLimitType;
use crate::types::StoreId;
use std::collections::HashMap;

/// Cost an operator imposes on one store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreInfluence {
    /// Leader count delta.
    pub leader_count: i64,
    /// Region count delta.
    pub region_count: i64,
    /// Leader size delta, MiB.
    pub leader_size: i64,
    /// Region size delta, MiB.
    pub region_size: i64,
    step_cost: HashMap<StoreLimitType, i64>,
}

impl StoreInfluence {
    /// Token cost accumulated for one limit type.
    pub fn step_cost(&self, typ: StoreLimitType) -> i64 {
        self.step_cost.get(&typ).copied().unwrap_or(0)
    }

    /// Accumulate token cost for one limit type.
    pub fn add_step_cost(&mut self, typ: StoreLimitType, cost: i64) {
        *self.step_cost.entry(typ).or_insert(0) += cost;
    }
}

/// Costs of a set of operators across all affected stores.
#[derive(Debug, Clone, Default)]
pub struct OpInfluence {
    stores: HashMap<StoreId, StoreInfluence>,
}

impl OpInfluence {
    /// Create an empty influence table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Influence entry for a store, created on first touch.
    pub fn store(&mut self, store_id: StoreId) -> &mut StoreInfluence {
        self.stores.entry(store_id).or_default()
    }

    /// Read-only influence of a store.
    pub fn get(&self, store_id: StoreId) -> Option<&StoreInfluence> {
        self.stores.get(&store_id)
    }

    /// All affected store ids.
    pub fn store_ids(&self) -> impl Iterator<Item = StoreId> + '_ {
        self.stores.keys().copied()
    }

    /// Number of affected stores.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Whether no store is affected.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_cost_accumulates() {
        let mut inf = OpInfluence::new();
        inf.store(1).add_step_cost(StoreLimitType::AddPeer, 1000);
        inf.store(1).add_step_cost(StoreLimitType::AddPeer, 1000);
        inf.store(2).add_step_cost(StoreLimitType::RemovePeer, 1000);

        assert_eq!(inf.get(1).unwrap().step_cost(StoreLimitType::AddPeer), 2000);
        assert_eq!(inf.get(1).unwrap().step_cost(StoreLimitType::RemovePeer), 0);
        assert_eq!(
            inf.get(2).unwrap().step_cost(StoreLimitType::RemovePeer),
            1000
        );
        assert_eq!(inf.len(), 2);
    }
}
