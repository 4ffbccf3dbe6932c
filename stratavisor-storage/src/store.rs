//! Process-wide pool/volume/snapshot metadata.
//!
//! The store is explicit shared state: one [`MetadataStore`] is created at
//! startup and passed by `Arc` handle into every component, never reached
//! through ambient globals. It also owns the locking discipline: a
//! structural lock per pool and an exclusive lock per volume, held for the
//! duration of any mutating operation. Read-only queries take neither.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{Result, StorageError};
use crate::types::{DiskDeviceBinding, SnapshotRecord, StoragePool, StorageVolume, VolumeKey};

#[derive(Default)]
struct StoreInner {
    pools: HashMap<String, StoragePool>,
    volumes: HashMap<VolumeKey, StorageVolume>,
    /// Snapshots per volume, ordered by creation time.
    snapshots: HashMap<VolumeKey, Vec<SnapshotRecord>>,
    /// Bindings keyed by (instance, device name).
    bindings: HashMap<(String, String), DiskDeviceBinding>,
}

/// Shared metadata store and lock registry.
pub struct MetadataStore {
    inner: RwLock<StoreInner>,
    volume_locks: Mutex<HashMap<VolumeKey, Arc<Mutex<()>>>>,
    pool_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MetadataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StoreInner::default()),
            volume_locks: Mutex::new(HashMap::new()),
            pool_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire the exclusive lock for a volume. Held for the duration of
    /// any mutating operation on that volume.
    pub async fn lock_volume(&self, key: &VolumeKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.volume_locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Acquire the structural lock for a pool (pool create/delete/resize).
    /// Independent volumes in the same pool do not take this lock.
    pub async fn lock_pool(&self, pool: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.pool_locks.lock().await;
            locks
                .entry(pool.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    // ---- pools ----

    pub async fn insert_pool(&self, pool: StoragePool) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.pools.contains_key(&pool.name) {
            return Err(StorageError::NameConflict(pool.name));
        }
        inner.pools.insert(pool.name.clone(), pool);
        Ok(())
    }

    pub async fn get_pool(&self, name: &str) -> Result<StoragePool> {
        let inner = self.inner.read().await;
        inner
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::pool_not_found(name))
    }

    pub async fn remove_pool(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::pool_not_found(name))
    }

    pub async fn update_pool(&self, pool: StoragePool) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.pools.contains_key(&pool.name) {
            return Err(StorageError::pool_not_found(&pool.name));
        }
        inner.pools.insert(pool.name.clone(), pool);
        Ok(())
    }

    pub async fn list_pools(&self) -> Vec<StoragePool> {
        let inner = self.inner.read().await;
        inner.pools.values().cloned().collect()
    }

    /// Volumes referencing a pool, blocking its destruction.
    pub async fn pool_volumes(&self, pool: &str) -> Vec<VolumeKey> {
        let inner = self.inner.read().await;
        inner
            .volumes
            .keys()
            .filter(|k| k.pool == pool)
            .cloned()
            .collect()
    }

    // ---- volumes ----

    pub async fn insert_volume(&self, volume: StorageVolume) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.volumes.contains_key(&volume.key) {
            return Err(StorageError::NameConflict(volume.key.to_string()));
        }
        inner.volumes.insert(volume.key.clone(), volume);
        Ok(())
    }

    pub async fn get_volume(&self, key: &VolumeKey) -> Result<StorageVolume> {
        let inner = self.inner.read().await;
        inner
            .volumes
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))
    }

    pub async fn update_volume(&self, volume: StorageVolume) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.volumes.contains_key(&volume.key) {
            return Err(StorageError::volume_not_found(volume.key.to_string()));
        }
        inner.volumes.insert(volume.key.clone(), volume);
        Ok(())
    }

    pub async fn remove_volume(&self, key: &VolumeKey) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.snapshots.remove(key);
        inner
            .volumes
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))
    }

    pub async fn list_volumes(&self, pool: &str) -> Vec<StorageVolume> {
        let inner = self.inner.read().await;
        let mut volumes: Vec<_> = inner
            .volumes
            .values()
            .filter(|v| v.key.pool == pool)
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.key.cmp(&b.key));
        volumes
    }

    // ---- snapshots ----

    pub async fn insert_snapshot(&self, snapshot: SnapshotRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entries = inner.snapshots.entry(snapshot.volume.clone()).or_default();
        if entries.iter().any(|s| s.name == snapshot.name) {
            return Err(StorageError::NameConflict(format!(
                "{}/{}",
                snapshot.volume, snapshot.name
            )));
        }
        entries.push(snapshot);
        Ok(())
    }

    pub async fn get_snapshot(&self, volume: &VolumeKey, name: &str) -> Result<SnapshotRecord> {
        let inner = self.inner.read().await;
        inner
            .snapshots
            .get(volume)
            .and_then(|entries| entries.iter().find(|s| s.name == name))
            .cloned()
            .ok_or_else(|| StorageError::snapshot_not_found(format!("{}/{}", volume, name)))
    }

    pub async fn remove_snapshot(&self, volume: &VolumeKey, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entries = inner
            .snapshots
            .get_mut(volume)
            .ok_or_else(|| StorageError::snapshot_not_found(format!("{}/{}", volume, name)))?;
        let before = entries.len();
        entries.retain(|s| s.name != name);
        if entries.len() == before {
            return Err(StorageError::snapshot_not_found(format!(
                "{}/{}",
                volume, name
            )));
        }
        Ok(())
    }

    /// Snapshots of a volume, in creation order.
    pub async fn list_snapshots(&self, volume: &VolumeKey) -> Vec<SnapshotRecord> {
        let inner = self.inner.read().await;
        inner.snapshots.get(volume).cloned().unwrap_or_default()
    }

    // ---- bindings ----

    pub async fn insert_binding(&self, binding: DiskDeviceBinding) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (binding.instance.clone(), binding.device_name.clone());
        if inner.bindings.contains_key(&key) {
            return Err(StorageError::NameConflict(format!(
                "{}/{}",
                key.0, key.1
            )));
        }
        inner.bindings.insert(key, binding);
        Ok(())
    }

    pub async fn remove_binding(&self, instance: &str, device_name: &str) -> Result<DiskDeviceBinding> {
        let mut inner = self.inner.write().await;
        inner
            .bindings
            .remove(&(instance.to_string(), device_name.to_string()))
            .ok_or_else(|| StorageError::NotFound {
                kind: "Device",
                name: format!("{}/{}", instance, device_name),
            })
    }

    pub async fn instance_bindings(&self, instance: &str) -> Vec<DiskDeviceBinding> {
        let inner = self.inner.read().await;
        inner
            .bindings
            .values()
            .filter(|b| b.instance == instance)
            .cloned()
            .collect()
    }

    /// Bindings referencing a volume, blocking its deletion.
    pub async fn volume_bindings(&self, key: &VolumeKey) -> Vec<DiskDeviceBinding> {
        let inner = self.inner.read().await;
        inner
            .bindings
            .values()
            .filter(|b| matches!(&b.source, crate::types::DiskSource::Volume(k) if k == key))
            .cloned()
            .collect()
    }
}
