//! Ceph object storage driver (RADOS gateway).
//!
//! Object storage: buckets and flat custom volumes. There is no snapshot
//! concept at all, so the snapshot entry points refuse outright and
//! migrations into this driver flatten any snapshot chain.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::substrate::{Policy, Substrate};
use super::StorageDriver;
use crate::error::{Result, StorageError};
use crate::types::{
    DiskSource, DriverKind, PoolUsage, StoragePool, StorageVolume, VolumeKey, VolumeUsage,
};

pub struct CephObjectDriver {
    state: Substrate,
    /// Gateway endpoint per pool, from `cephobject.radosgw.endpoint`.
    endpoints: RwLock<HashMap<String, String>>,
}

impl CephObjectDriver {
    pub fn new() -> Self {
        Self {
            state: Substrate::new(Policy {
                cow_snapshots: false,
                track_retained: false,
                enforce_volume_quota: true,
                quota_needs_registration: false,
            }),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    fn no_snapshots(&self) -> StorageError {
        StorageError::CapabilityUnsupported {
            driver: self.kind().to_string(),
            operation: "snapshots".to_string(),
        }
    }

    async fn bucket_url(&self, key: &VolumeKey) -> String {
        let endpoints = self.endpoints.read().await;
        let endpoint = endpoints
            .get(&key.pool)
            .cloned()
            .unwrap_or_else(|| "radosgw.local".to_string());
        format!("s3://{}/{}", endpoint, key.name.replace('/', "-"))
    }
}

impl Default for CephObjectDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for CephObjectDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::CephObject
    }

    async fn create_pool(&self, pool: &StoragePool) -> Result<()> {
        self.state.create_pool(pool).await?;

        if let Some(endpoint) = pool.config.get("cephobject.radosgw.endpoint") {
            self.endpoints
                .write()
                .await
                .insert(pool.name.clone(), endpoint.clone());
        }
        Ok(())
    }

    async fn delete_pool(&self, pool: &str) -> Result<()> {
        self.state.delete_pool(pool).await?;
        self.endpoints.write().await.remove(pool);
        Ok(())
    }

    async fn pool_usage(&self, pool: &str) -> Result<PoolUsage> {
        self.state.pool_usage(pool).await
    }

    async fn create_volume(&self, volume: &StorageVolume) -> Result<()> {
        self.state.create_volume(volume).await
    }

    async fn delete_volume(&self, key: &VolumeKey) -> Result<()> {
        self.state.delete_volume(key).await
    }

    async fn rename_volume(&self, key: &VolumeKey, new_name: &str) -> Result<()> {
        self.state.rename_volume(key, new_name).await
    }

    async fn resize_volume(&self, key: &VolumeKey, new_size: u64) -> Result<()> {
        self.state.resize_volume(key, new_size).await
    }

    async fn volume_usage(&self, key: &VolumeKey) -> Result<VolumeUsage> {
        self.state.volume_usage(key).await
    }

    async fn read_volume(&self, key: &VolumeKey) -> Result<Bytes> {
        self.state.read_volume(key).await
    }

    async fn write_volume(&self, key: &VolumeKey, data: Bytes) -> Result<()> {
        self.state.write_volume(key, data).await
    }

    async fn create_snapshot(&self, _key: &VolumeKey, _name: &str) -> Result<()> {
        Err(self.no_snapshots())
    }

    async fn delete_snapshot(&self, _key: &VolumeKey, _name: &str) -> Result<()> {
        Err(self.no_snapshots())
    }

    async fn read_snapshot(&self, _key: &VolumeKey, _name: &str) -> Result<Bytes> {
        Err(self.no_snapshots())
    }

    async fn restore_snapshot(&self, _key: &VolumeKey, _name: &str) -> Result<()> {
        Err(self.no_snapshots())
    }

    async fn attach_source(&self, key: &VolumeKey) -> Result<DiskSource> {
        self.state.read_volume(key).await?;
        Ok(DiskSource::Remote(self.bucket_url(key).await))
    }
}
