//! LVM storage driver.
//!
//! Volumes are logical volumes in a volume group, either classic (thick,
//! space reserved eagerly at the declared size) or thin-pool backed.
//! Snapshots and clones are optimized on thin pools. Restoring a snapshot
//! requires strict ordering: the lifecycle manager removes snapshots newer
//! than the restore point first, per this driver's capability descriptor.

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

pub struct LvmDriver {
    state: Substrate,
    /// Volume group per pool, from `lvm.vg_name` (pool name by default).
    volume_groups: RwLock<HashMap<String, String>>,
}

impl LvmDriver {
    pub fn new() -> Self {
        Self {
            state: Substrate::new(Policy {
                cow_snapshots: true,
                track_retained: false,
                enforce_volume_quota: true,
                quota_needs_registration: false,
            }),
            volume_groups: RwLock::new(HashMap::new()),
        }
    }

    /// Logical volume device path. Slashes in volume names are not legal
    /// LV names, so they are mapped to double dashes.
    async fn device_path(&self, key: &VolumeKey) -> String {
        let groups = self.volume_groups.read().await;
        let vg = groups
            .get(&key.pool)
            .cloned()
            .unwrap_or_else(|| key.pool.clone());
        format!("/dev/{}/{}", vg, key.name.replace('/', "--"))
    }
}

impl Default for LvmDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for LvmDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Lvm
    }

    async fn create_pool(&self, pool: &StoragePool) -> Result<()> {
        self.state.create_pool(pool).await?;

        let vg = pool
            .config
            .get("lvm.vg_name")
            .cloned()
            .unwrap_or_else(|| pool.name.clone());
        self.volume_groups
            .write()
            .await
            .insert(pool.name.clone(), vg);
        Ok(())
    }

    async fn delete_pool(&self, pool: &str) -> Result<()> {
        self.state.delete_pool(pool).await?;
        self.volume_groups.write().await.remove(pool);
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

    async fn clone_volume(
        &self,
        source: &VolumeKey,
        source_snapshot: Option<&str>,
        dest: &StorageVolume,
    ) -> Result<()> {
        self.state.clone_cow(source, source_snapshot, dest).await
    }

    async fn attach_source(&self, key: &VolumeKey) -> Result<DiskSource> {
        self.state.read_volume(key).await?;
        Ok(DiskSource::HostPath(self.device_path(key).await))
    }
}
