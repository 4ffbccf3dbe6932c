//! Storage backend drivers.
//!
//! One driver per [`DriverKind`], each implementing the [`StorageDriver`]
//! trait. The lifecycle manager and migration transport never talk to a
//! backend directly; they resolve the driver through the [`DriverRegistry`]
//! and rely on the capability descriptor to know what the driver can do.
//!
//! Drivers are state machines over an in-process substrate: they model the
//! technology's real semantics (copy-on-write sharing, eager thick
//! reservation, quota-group registration, extent retention) while the
//! plumbing that would shell out to the host is left to the integration
//! layer above this crate.

mod substrate;

mod btrfs;
mod ceph;
mod cephfs;
mod cephobject;
mod dir;
mod lvm;

pub use btrfs::BtrfsDriver;
pub use ceph::CephRbdDriver;
pub use cephfs::CephFsDriver;
pub use cephobject::CephObjectDriver;
pub use dir::DirDriver;
pub use lvm::LvmDriver;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Result, StorageError};
use crate::types::{DiskSource, DriverKind, PoolUsage, StoragePool, StorageVolume, VolumeKey, VolumeUsage};

/// Storage driver trait, implemented by each backend kind.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// The driver kind this backend implements.
    fn kind(&self) -> DriverKind;

    /// Bring a pool under management.
    async fn create_pool(&self, pool: &StoragePool) -> Result<()>;

    /// Release a pool. Fails if volumes still exist in it.
    async fn delete_pool(&self, pool: &str) -> Result<()>;

    /// Current pool space accounting.
    async fn pool_usage(&self, pool: &str) -> Result<PoolUsage>;

    /// Create an empty volume.
    async fn create_volume(&self, volume: &StorageVolume) -> Result<()>;

    /// Delete a volume and its backing storage.
    async fn delete_volume(&self, key: &VolumeKey) -> Result<()>;

    /// Rename a volume within its pool.
    async fn rename_volume(&self, key: &VolumeKey, new_name: &str) -> Result<()>;

    /// Grow or shrink a volume. Shrinking below used space fails.
    async fn resize_volume(&self, key: &VolumeKey, new_size: u64) -> Result<()>;

    /// Volume space accounting.
    async fn volume_usage(&self, key: &VolumeKey) -> Result<VolumeUsage>;

    /// Current volume content.
    async fn read_volume(&self, key: &VolumeKey) -> Result<Bytes>;

    /// Replace volume content. Enforces the volume quota where the driver
    /// supports one, and pool physical capacity for thin pools.
    async fn write_volume(&self, key: &VolumeKey, data: Bytes) -> Result<()>;

    /// Take a consistent point-in-time snapshot.
    async fn create_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()>;

    /// Delete a snapshot.
    async fn delete_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()>;

    /// Read a snapshot's captured content.
    async fn read_snapshot(&self, key: &VolumeKey, name: &str) -> Result<Bytes>;

    /// Rewind the live volume to a snapshot's content.
    async fn restore_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()>;

    /// Backend-native copy-on-write clone of a volume or one of its
    /// snapshots. Only drivers whose capability descriptor sets
    /// `optimized_clone` implement this; the lifecycle manager falls back
    /// to a streamed full copy otherwise.
    async fn clone_volume(
        &self,
        _source: &VolumeKey,
        _source_snapshot: Option<&str>,
        _dest: &StorageVolume,
    ) -> Result<()> {
        Err(StorageError::CapabilityUnsupported {
            driver: self.kind().to_string(),
            operation: "optimized clone".to_string(),
        })
    }

    /// Backend-native cross-pool transfer preserving thin provisioning and
    /// snapshot history. Only drivers with `optimized_transfer`.
    async fn native_transfer(
        &self,
        _source: &VolumeKey,
        _dest: &StorageVolume,
        _copy_snapshots: bool,
    ) -> Result<()> {
        Err(StorageError::CapabilityUnsupported {
            driver: self.kind().to_string(),
            operation: "native transfer".to_string(),
        })
    }

    /// Enroll a volume in the pool's quota accounting. Only meaningful for
    /// drivers whose capability descriptor sets `quota_requires_registration`;
    /// a no-op elsewhere.
    async fn register_quota(&self, _key: &VolumeKey) -> Result<()> {
        Ok(())
    }

    /// How an instance reaches this volume's bytes.
    async fn attach_source(&self, key: &VolumeKey) -> Result<DiskSource>;
}

/// Registry resolving a driver kind to its backend instance.
pub struct DriverRegistry {
    drivers: HashMap<DriverKind, Arc<dyn StorageDriver>>,
}

impl DriverRegistry {
    /// Registry with all built-in drivers registered.
    pub fn with_defaults() -> Arc<Self> {
        let mut drivers: HashMap<DriverKind, Arc<dyn StorageDriver>> = HashMap::new();
        drivers.insert(DriverKind::Dir, Arc::new(DirDriver::new()));
        drivers.insert(DriverKind::Btrfs, Arc::new(BtrfsDriver::new()));
        drivers.insert(DriverKind::Lvm, Arc::new(LvmDriver::new()));
        drivers.insert(DriverKind::CephRbd, Arc::new(CephRbdDriver::new()));
        drivers.insert(DriverKind::CephFs, Arc::new(CephFsDriver::new()));
        drivers.insert(DriverKind::CephObject, Arc::new(CephObjectDriver::new()));
        Arc::new(Self { drivers })
    }

    /// Resolve the driver for a kind.
    pub fn get(&self, kind: DriverKind) -> Result<Arc<dyn StorageDriver>> {
        self.drivers.get(&kind).cloned().ok_or_else(|| {
            StorageError::Config(format!("No driver registered for kind {}", kind))
        })
    }
}
