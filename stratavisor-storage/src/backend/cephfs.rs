//! CephFS storage driver.
//!
//! Distributed filesystem storage for custom volumes only; instances
//! cannot boot from it. Snapshots exist but are plain directory copies,
//! so nothing here is optimized and cross-pool moves always stream.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::substrate::{Policy, Substrate};
use super::StorageDriver;
use crate::error::Result;
use crate::types::{
    DiskSource, DriverKind, PoolUsage, StoragePool, StorageVolume, VolumeKey, VolumeUsage,
};

pub struct CephFsDriver {
    state: Substrate,
    /// Filesystem path per pool, from `cephfs.path`.
    paths: RwLock<HashMap<String, String>>,
}

impl CephFsDriver {
    pub fn new() -> Self {
        Self {
            state: Substrate::new(Policy {
                cow_snapshots: false,
                track_retained: false,
                enforce_volume_quota: true,
                quota_needs_registration: false,
            }),
            paths: RwLock::new(HashMap::new()),
        }
    }

    async fn volume_locator(&self, key: &VolumeKey) -> String {
        let paths = self.paths.read().await;
        let base = paths
            .get(&key.pool)
            .cloned()
            .unwrap_or_else(|| key.pool.clone());
        format!("cephfs:{}/{}", base, key.name)
    }
}

impl Default for CephFsDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for CephFsDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::CephFs
    }

    async fn create_pool(&self, pool: &StoragePool) -> Result<()> {
        self.state.create_pool(pool).await?;

        let path = pool
            .config
            .get("cephfs.path")
            .cloned()
            .unwrap_or_else(|| pool.name.clone());
        self.paths.write().await.insert(pool.name.clone(), path);
        Ok(())
    }

    async fn delete_pool(&self, pool: &str) -> Result<()> {
        self.state.delete_pool(pool).await?;
        self.paths.write().await.remove(pool);
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

    async fn create_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()> {
        self.state.create_snapshot(key, name).await
    }

    async fn delete_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()> {
        self.state.delete_snapshot(key, name).await
    }

    async fn read_snapshot(&self, key: &VolumeKey, name: &str) -> Result<Bytes> {
        self.state.read_snapshot(key, name).await
    }

    async fn restore_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()> {
        self.state.restore_snapshot(key, name).await
    }

    async fn attach_source(&self, key: &VolumeKey) -> Result<DiskSource> {
        self.state.read_volume(key).await?;
        Ok(DiskSource::Remote(self.volume_locator(key).await))
    }
}
