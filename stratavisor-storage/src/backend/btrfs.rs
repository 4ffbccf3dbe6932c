//! Btrfs storage driver.
//!
//! Volumes are subvolumes, snapshots and clones are copy-on-write. Two
//! quirks this driver models explicitly:
//!
//! - Quota groups do not enroll child subvolumes automatically. Quota
//!   enforcement only starts once a volume has been registered through
//!   [`StorageDriver::register_quota`]; the lifecycle manager does this as
//!   part of volume creation.
//! - Superseded extents stay allocated while snapshots reference them, so
//!   reported usage can sit above live data. Usage reports carry the
//!   `includes_retained_extents` marker to tell this apart from a leak.

use async_trait::async_trait;
use bytes::Bytes;

use super::substrate::{Policy, Substrate};
use super::StorageDriver;
use crate::error::Result;
use crate::types::{
    DiskSource, DriverKind, PoolUsage, StoragePool, StorageVolume, VolumeKey, VolumeKind,
    VolumeUsage,
};

/// Default mount base for btrfs pools.
pub const DEFAULT_BTRFS_BASE: &str = "/var/lib/stratavisor/btrfs";

pub struct BtrfsDriver {
    base_path: String,
    state: Substrate,
}

impl BtrfsDriver {
    pub fn new() -> Self {
        Self {
            base_path: DEFAULT_BTRFS_BASE.to_string(),
            state: Substrate::new(Policy {
                cow_snapshots: true,
                track_retained: true,
                enforce_volume_quota: true,
                quota_needs_registration: true,
            }),
        }
    }

    /// Subvolume path for a volume.
    fn subvolume_path(&self, key: &VolumeKey) -> String {
        let prefix = match key.kind {
            VolumeKind::Image => "images",
            VolumeKind::Container => "containers",
            VolumeKind::VirtualMachine => "virtual-machines",
            VolumeKind::Custom => "custom",
            VolumeKind::Bucket => "buckets",
        };
        format!("{}/{}/{}/{}", self.base_path, key.pool, prefix, key.name)
    }
}

impl Default for BtrfsDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for BtrfsDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Btrfs
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

    async fn clone_volume(
        &self,
        source: &VolumeKey,
        source_snapshot: Option<&str>,
        dest: &StorageVolume,
    ) -> Result<()> {
        self.state.clone_cow(source, source_snapshot, dest).await
    }

    async fn native_transfer(
        &self,
        source: &VolumeKey,
        dest: &StorageVolume,
        copy_snapshots: bool,
    ) -> Result<()> {
        self.state.transfer(source, dest, copy_snapshots).await
    }

    async fn register_quota(&self, key: &VolumeKey) -> Result<()> {
        self.state.set_quota_registered(key).await
    }

    async fn attach_source(&self, key: &VolumeKey) -> Result<DiskSource> {
        self.state.read_volume(key).await?;
        Ok(DiskSource::HostPath(self.subvolume_path(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentType, ProvisioningMode};
    use chrono::Utc;
    use std::collections::HashMap;

    fn pool() -> StoragePool {
        StoragePool {
            name: "btr".to_string(),
            driver: DriverKind::Btrfs,
            config: HashMap::new(),
            source: "/dev/sdb".to_string(),
            provisioning: ProvisioningMode::Thin,
            capacity_bytes: 1 << 20,
            created_at: Utc::now(),
        }
    }

    fn volume(name: &str, size: u64) -> StorageVolume {
        StorageVolume {
            key: VolumeKey::new("btr", name, VolumeKind::Custom),
            content_type: ContentType::Filesystem,
            size_bytes: size,
            config: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_quota_only_applies_after_registration() {
        let driver = BtrfsDriver::new();
        driver.create_pool(&pool()).await.unwrap();
        driver.create_volume(&volume("v1", 16)).await.unwrap();

        let key = VolumeKey::new("btr", "v1", VolumeKind::Custom);

        // Unregistered: no quota group membership, no enforcement.
        driver
            .write_volume(&key, Bytes::from(vec![0u8; 64]))
            .await
            .unwrap();

        driver.register_quota(&key).await.unwrap();
        let err = driver
            .write_volume(&key, Bytes::from(vec![0u8; 64]))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::StorageError::Capacity { .. }));
    }

    #[tokio::test]
    async fn test_retained_extents_inflate_usage() {
        let driver = BtrfsDriver::new();
        driver.create_pool(&pool()).await.unwrap();
        driver.create_volume(&volume("v1", 4096)).await.unwrap();

        let key = VolumeKey::new("btr", "v1", VolumeKind::Custom);
        driver
            .write_volume(&key, Bytes::from_static(b"generation-1"))
            .await
            .unwrap();
        driver.create_snapshot(&key, "s1").await.unwrap();
        driver
            .write_volume(&key, Bytes::from_static(b"generation-2"))
            .await
            .unwrap();

        let usage = driver.volume_usage(&key).await.unwrap();
        assert!(usage.includes_retained_extents);
        assert!(usage.used_bytes > usage.live_bytes);

        // Dropping the last snapshot dereferences the superseded extents.
        driver.delete_snapshot(&key, "s1").await.unwrap();
        let usage = driver.volume_usage(&key).await.unwrap();
        assert!(!usage.includes_retained_extents);
        assert_eq!(usage.used_bytes, usage.live_bytes);
    }
}
