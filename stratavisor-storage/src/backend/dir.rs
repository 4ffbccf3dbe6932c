//! Directory storage driver.
//!
//! Volumes live as plain directory trees (or raw image files for block
//! content) under the pool's source path. Nothing is copy-on-write: clones
//! and snapshots are full copies, quotas are not enforced, and the pool is
//! always thick-provisioned. Suitable for development and single-node
//! setups.

use async_trait::async_trait;
use bytes::Bytes;

use super::substrate::{Policy, Substrate};
use super::StorageDriver;
use crate::error::Result;
use crate::types::{
    DiskSource, DriverKind, PoolUsage, StoragePool, StorageVolume, VolumeKey, VolumeKind,
    VolumeUsage,
};

/// Default base path for directory pools.
pub const DEFAULT_DIR_BASE: &str = "/var/lib/stratavisor/pools";

pub struct DirDriver {
    base_path: String,
    state: Substrate,
}

impl DirDriver {
    pub fn new() -> Self {
        Self::with_base_path(DEFAULT_DIR_BASE)
    }

    /// Use a custom base path instead of [`DEFAULT_DIR_BASE`].
    pub fn with_base_path(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            state: Substrate::new(Policy {
                cow_snapshots: false,
                track_retained: false,
                enforce_volume_quota: false,
                quota_needs_registration: false,
            }),
        }
    }

    fn kind_dir(kind: VolumeKind) -> &'static str {
        match kind {
            VolumeKind::Image => "images",
            VolumeKind::Container => "containers",
            VolumeKind::VirtualMachine => "virtual-machines",
            VolumeKind::Custom => "custom",
            VolumeKind::Bucket => "buckets",
        }
    }

    /// Host path a volume is reachable under.
    fn volume_path(&self, key: &VolumeKey) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_path,
            key.pool,
            Self::kind_dir(key.kind),
            key.name
        )
    }
}

impl Default for DirDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for DirDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Dir
    }

    async fn create_pool(&self, pool: &StoragePool) -> Result<()> {
        self.state.create_pool(pool).await
    }

    async fn delete_pool(&self, pool: &str) -> Result<()> {
        self.state.delete_pool(pool).await
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
        // Make sure the volume actually exists before handing out a path.
        self.state.read_volume(key).await?;
        Ok(DiskSource::HostPath(self.volume_path(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_path_layout() {
        let driver = DirDriver::new();
        let key = VolumeKey::new("default", "web1", VolumeKind::Container);
        assert_eq!(
            driver.volume_path(&key),
            "/var/lib/stratavisor/pools/default/containers/web1"
        );
    }
}
