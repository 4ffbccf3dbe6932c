//! Ceph RBD storage driver.
//!
//! Distributed block storage. Snapshots and clones are copy-on-write RBD
//! operations and cross-pool transfers ride the backend's native
//! export/import path, preserving thin provisioning and snapshot history.
//! Like LVM, snapshot restore requires strict ordering; the capability
//! descriptor tells the lifecycle manager to drop newer snapshots first.

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

/// Per-pool Ceph addressing details.
#[derive(Clone)]
struct CephPoolState {
    cluster: String,
    osd_pool: String,
}

pub struct CephRbdDriver {
    state: Substrate,
    pools: RwLock<HashMap<String, CephPoolState>>,
}

impl CephRbdDriver {
    pub fn new() -> Self {
        Self {
            state: Substrate::new(Policy {
                cow_snapshots: true,
                track_retained: false,
                enforce_volume_quota: true,
                quota_needs_registration: false,
            }),
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// RBD image spec: `cluster/osd-pool/image`.
    async fn image_spec(&self, key: &VolumeKey) -> String {
        let pools = self.pools.read().await;
        match pools.get(&key.pool) {
            Some(ceph) => format!(
                "rbd:{}/{}/{}",
                ceph.cluster,
                ceph.osd_pool,
                key.name.replace('/', "_")
            ),
            None => format!("rbd:{}/{}", key.pool, key.name.replace('/', "_")),
        }
    }
}

impl Default for CephRbdDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for CephRbdDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::CephRbd
    }

    async fn create_pool(&self, pool: &StoragePool) -> Result<()> {
        self.state.create_pool(pool).await?;

        let ceph = CephPoolState {
            cluster: pool
                .config
                .get("ceph.cluster_name")
                .cloned()
                .unwrap_or_else(|| "ceph".to_string()),
            osd_pool: pool
                .config
                .get("ceph.osd.pool_name")
                .cloned()
                .unwrap_or_else(|| pool.name.clone()),
        };
        self.pools.write().await.insert(pool.name.clone(), ceph);
        Ok(())
    }

    async fn delete_pool(&self, pool: &str) -> Result<()> {
        self.state.delete_pool(pool).await?;
        self.pools.write().await.remove(pool);
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

    async fn native_transfer(
        &self,
        source: &VolumeKey,
        dest: &StorageVolume,
        copy_snapshots: bool,
    ) -> Result<()> {
        self.state.transfer(source, dest, copy_snapshots).await
    }

    async fn attach_source(&self, key: &VolumeKey) -> Result<DiskSource> {
        self.state.read_volume(key).await?;
        Ok(DiskSource::Remote(self.image_spec(key).await))
    }
}
