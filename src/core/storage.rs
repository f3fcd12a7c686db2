//! Persistent-storage collaborator.
//!
//! The scheduler persists meta best-effort through this seam; every caller
//! logs and continues on failure. The in-memory implementation backs tests
//! and single-process deployments.

use crate::config::ScheduleConfig;
use crate::core::store::StoreMeta;
use crate::error::{Error, Result};
use crate::types::{RegionId, RegionMeta, StoreId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Cluster-wide metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMeta {
    /// Unique cluster identifier.
    pub cluster_id: u64,
    /// Replication factor expected of every region.
    pub max_peer_count: u64,
}

/// Storage seam for cluster, store, region, and config persistence.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Persist region metadata.
    async fn save_region(&self, meta: &RegionMeta) -> Result<()>;

    /// Delete region metadata.
    async fn delete_region(&self, id: RegionId) -> Result<()>;

    /// Persist store metadata.
    async fn save_store(&self, meta: &StoreMeta) -> Result<()>;

    /// Delete store metadata.
    async fn delete_store(&self, id: StoreId) -> Result<()>;

    /// Persist the schedule configuration.
    async fn save_config(&self, config: &ScheduleConfig) -> Result<()>;

    /// Load the schedule configuration, if one was saved.
    async fn load_config(&self) -> Result<Option<ScheduleConfig>>;

    /// Persist cluster metadata.
    async fn save_meta(&self, meta: &ClusterMeta) -> Result<()>;

    /// Load cluster metadata, if present.
    async fn load_meta(&self) -> Result<Option<ClusterMeta>>;

    /// Persist per-store scheduling weights.
    async fn save_store_weight(&self, id: StoreId, leader: f64, region: f64) -> Result<()>;

    /// Key under which the cluster state lives, for external inspection.
    fn cluster_state_path(&self) -> String {
        "raft/status".to_string()
    }
}

/// In-memory storage holding bincode-encoded blobs.
#[derive(Debug, Default)]
pub struct MemStorage {
    regions: DashMap<RegionId, Vec<u8>>,
    stores: DashMap<StoreId, Vec<u8>>,
    weights: DashMap<StoreId, (f64, f64)>,
    config: Mutex<Option<Vec<u8>>>,
    meta: Mutex<Option<Vec<u8>>>,
}

impl MemStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Load one persisted region.
    pub fn load_region(&self, id: RegionId) -> Result<Option<RegionMeta>> {
        match self.regions.get(&id) {
            Some(blob) => {
                let meta = bincode::deserialize(&blob).map_err(|e| Error::Storage(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl Storage for MemStorage {
    async fn save_region(&self, meta: &RegionMeta) -> Result<()> {
        let blob = bincode::serialize(meta).map_err(|e| Error::Storage(e.to_string()))?;
        self.regions.insert(meta.id, blob);
        Ok(())
    }

    async fn delete_region(&self, id: RegionId) -> Result<()> {
        self.regions.remove(&id);
        Ok(())
    }

    async fn save_store(&self, meta: &StoreMeta) -> Result<()> {
        let blob = bincode::serialize(meta).map_err(|e| Error::Storage(e.to_string()))?;
        self.stores.insert(meta.id, blob);
        Ok(())
    }

    async fn delete_store(&self, id: StoreId) -> Result<()> {
        self.stores.remove(&id);
        Ok(())
    }

    async fn save_config(&self, config: &ScheduleConfig) -> Result<()> {
        let blob = bincode::serialize(config).map_err(|e| Error::Storage(e.to_string()))?;
        *self.config.lock() = Some(blob);
        Ok(())
    }

    async fn load_config(&self) -> Result<Option<ScheduleConfig>> {
        match self.config.lock().as_deref() {
            Some(blob) => {
                let cfg = bincode::deserialize(blob).map_err(|e| Error::Storage(e.to_string()))?;
                Ok(Some(cfg))
            }
            None => Ok(None),
        }
    }

    async fn save_meta(&self, meta: &ClusterMeta) -> Result<()> {
        let blob = bincode::serialize(meta).map_err(|e| Error::Storage(e.to_string()))?;
        *self.meta.lock() = Some(blob);
        Ok(())
    }

    async fn load_meta(&self) -> Result<Option<ClusterMeta>> {
        match self.meta.lock().as_deref() {
            Some(blob) => {
                let meta = bincode::deserialize(blob).map_err(|e| Error::Storage(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    async fn save_store_weight(&self, id: StoreId, leader: f64, region: f64) -> Result<()> {
        self.weights.insert(id, (leader, region));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_region_round_trip() {
        let storage = MemStorage::new();
        let meta = RegionMeta {
            id: 42,
            ..Default::default()
        };

        storage.save_region(&meta).await.unwrap();
        assert_eq!(storage.load_region(42).unwrap(), Some(meta));

        storage.delete_region(42).await.unwrap();
        assert_eq!(storage.load_region(42).unwrap(), None);
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let storage = MemStorage::new();
        assert!(storage.load_config().await.unwrap().is_none());

        let cfg = ScheduleConfig::new().with_max_replicas(5);
        storage.save_config(&cfg).await.unwrap();
        let loaded = storage.load_config().await.unwrap().unwrap();
        assert_eq!(loaded.max_replicas, 5);
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let storage = MemStorage::new();
        let meta = ClusterMeta {
            cluster_id: 7,
            max_peer_count: 3,
        };
        storage.save_meta(&meta).await.unwrap();
        assert_eq!(storage.load_meta().await.unwrap(), Some(meta));
    }
}
