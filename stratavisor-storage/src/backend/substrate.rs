//! Shared driver state machinery.
//!
//! Every driver keeps its pools in a [`Substrate`]: per-pool volume state
//! with content, reservations and snapshots. A [`Policy`] captures where
//! the technologies genuinely differ — copy-on-write sharing, extent
//! retention, quota enforcement — so each driver file only carries its own
//! semantics on top.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::{Result, StorageError};
use crate::types::{
    PoolUsage, ProvisioningMode, StoragePool, StorageVolume, VolumeKey, VolumeKind, VolumeUsage,
};

/// Driver-specific behavior switches.
pub(super) struct Policy {
    /// Snapshots share extents with the live volume instead of duplicating
    /// them.
    pub cow_snapshots: bool,
    /// Superseded extents stay allocated while snapshots reference them,
    /// inflating reported usage above live data.
    pub track_retained: bool,
    /// The volume's declared size is enforced as a write quota.
    pub enforce_volume_quota: bool,
    /// Quota enforcement only applies to explicitly registered volumes.
    pub quota_needs_registration: bool,
}

type Slot = (VolumeKind, String);

fn slot(key: &VolumeKey) -> Slot {
    (key.kind, key.name.clone())
}

pub(super) struct SnapshotState {
    pub name: String,
    pub content: Bytes,
}

pub(super) struct VolumeState {
    /// Declared size (quota).
    pub size: u64,
    /// Physically reserved bytes (equals `size` on thick pools, zero on
    /// thin pools).
    pub reserved: u64,
    pub content: Bytes,
    pub snapshots: Vec<SnapshotState>,
    /// Bytes of superseded extents still referenced by snapshots.
    pub retained_bytes: u64,
    pub quota_registered: bool,
}

impl VolumeState {
    fn live_bytes(&self) -> u64 {
        self.content.len() as u64
    }
}

pub(super) struct PoolState {
    pub provisioning: ProvisioningMode,
    pub capacity: u64,
    pub volumes: HashMap<Slot, VolumeState>,
}

pub(super) struct Substrate {
    policy: Policy,
    pools: RwLock<HashMap<String, PoolState>>,
}

impl Substrate {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Physical bytes a volume holds, per this driver's snapshot policy.
    fn allocated(&self, vol: &VolumeState) -> u64 {
        let snapshots: u64 = if self.policy.cow_snapshots {
            // Snapshots share the live extents.
            0
        } else {
            vol.snapshots.iter().map(|s| s.content.len() as u64).sum()
        };
        vol.live_bytes() + vol.retained_bytes + snapshots
    }

    pub async fn create_pool(&self, pool: &StoragePool) -> Result<()> {
        let mut pools = self.pools.write().await;
        if pools.contains_key(&pool.name) {
            return Err(StorageError::NameConflict(pool.name.clone()));
        }
        pools.insert(
            pool.name.clone(),
            PoolState {
                provisioning: pool.provisioning,
                capacity: pool.capacity_bytes,
                volumes: HashMap::new(),
            },
        );
        Ok(())
    }

    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get(name)
            .ok_or_else(|| StorageError::pool_not_found(name))?;
        if !state.volumes.is_empty() {
            return Err(StorageError::HasDependents {
                blockers: state.volumes.keys().map(|(_, n)| n.clone()).collect(),
            });
        }
        pools.remove(name);
        Ok(())
    }

    pub async fn pool_usage(&self, name: &str) -> Result<PoolUsage> {
        let pools = self.pools.read().await;
        let state = pools
            .get(name)
            .ok_or_else(|| StorageError::pool_not_found(name))?;

        let reserved = state.volumes.values().map(|v| v.size).sum();
        let allocated = state.volumes.values().map(|v| self.allocated(v)).sum();

        Ok(PoolUsage {
            total_bytes: state.capacity,
            reserved_bytes: reserved,
            allocated_bytes: allocated,
        })
    }

    pub async fn create_volume(&self, volume: &StorageVolume) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get_mut(&volume.key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&volume.key.pool))?;

        let slot_key = slot(&volume.key);
        if state.volumes.contains_key(&slot_key) {
            return Err(StorageError::NameConflict(volume.key.to_string()));
        }

        let reserved = match state.provisioning {
            ProvisioningMode::Thick => volume.size_bytes,
            ProvisioningMode::Thin => 0,
        };

        state.volumes.insert(
            slot_key,
            VolumeState {
                size: volume.size_bytes,
                reserved,
                content: Bytes::new(),
                snapshots: Vec::new(),
                retained_bytes: 0,
                quota_registered: false,
            },
        );
        Ok(())
    }

    pub async fn delete_volume(&self, key: &VolumeKey) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get_mut(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?;
        state
            .volumes
            .remove(&slot(key))
            .map(|_| ())
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))
    }

    pub async fn rename_volume(&self, key: &VolumeKey, new_name: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get_mut(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?;

        let new_slot = (key.kind, new_name.to_string());
        if state.volumes.contains_key(&new_slot) {
            return Err(StorageError::NameConflict(format!(
                "{}/{}",
                key.pool, new_name
            )));
        }

        let vol = state
            .volumes
            .remove(&slot(key))
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))?;
        state.volumes.insert(new_slot, vol);
        Ok(())
    }

    pub async fn resize_volume(&self, key: &VolumeKey, new_size: u64) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get_mut(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?;
        let provisioning = state.provisioning;
        let vol = state
            .volumes
            .get_mut(&slot(key))
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))?;

        if new_size < vol.live_bytes() {
            return Err(StorageError::Size(format!(
                "Cannot shrink {} to {} bytes: {} bytes in use",
                key,
                new_size,
                vol.live_bytes()
            )));
        }

        vol.size = new_size;
        if provisioning == ProvisioningMode::Thick {
            vol.reserved = new_size;
        }
        Ok(())
    }

    pub async fn volume_usage(&self, key: &VolumeKey) -> Result<VolumeUsage> {
        let pools = self.pools.read().await;
        let vol = pools
            .get(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?
            .volumes
            .get(&slot(key))
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))?;

        Ok(VolumeUsage {
            used_bytes: vol.live_bytes() + vol.retained_bytes,
            live_bytes: vol.live_bytes(),
            includes_retained_extents: self.policy.track_retained && vol.retained_bytes > 0,
        })
    }

    pub async fn read_volume(&self, key: &VolumeKey) -> Result<Bytes> {
        let pools = self.pools.read().await;
        pools
            .get(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?
            .volumes
            .get(&slot(key))
            .map(|v| v.content.clone())
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))
    }

    pub async fn write_volume(&self, key: &VolumeKey, data: Bytes) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get_mut(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?;

        let capacity = state.capacity;
        let provisioning = state.provisioning;
        let pool_allocated: u64 = state.volumes.values().map(|v| self.allocated(v)).sum();

        let vol = state
            .volumes
            .get_mut(&slot(key))
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))?;

        let retained_after = if self.policy.track_retained && !vol.snapshots.is_empty() {
            vol.retained_bytes + vol.live_bytes()
        } else {
            vol.retained_bytes
        };

        let quota_applies = self.policy.enforce_volume_quota
            && (!self.policy.quota_needs_registration || vol.quota_registered);
        let used_after = data.len() as u64 + retained_after;
        if quota_applies && used_after > vol.size {
            return Err(StorageError::Capacity {
                pool: key.pool.clone(),
                requested: used_after,
                available: vol.size,
            });
        }

        // Thin pools allocate extents at write time; capacity pressure from
        // sibling volumes shows up here, after validation already passed.
        if provisioning == ProvisioningMode::Thin {
            let vol_before = vol.live_bytes() + vol.retained_bytes;
            let vol_after = data.len() as u64 + retained_after;
            let allocated_after = pool_allocated - vol_before + vol_after;
            if allocated_after > capacity {
                return Err(StorageError::Capacity {
                    pool: key.pool.clone(),
                    requested: allocated_after,
                    available: capacity,
                });
            }
        }

        vol.retained_bytes = retained_after;
        vol.content = data;
        Ok(())
    }

    pub async fn create_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get_mut(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?;
        let vol = state
            .volumes
            .get_mut(&slot(key))
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))?;

        if vol.snapshots.iter().any(|s| s.name == name) {
            return Err(StorageError::NameConflict(format!("{}/{}", key, name)));
        }

        // Captured under the pool write lock, so the content is a fully
        // consistent point-in-time state.
        vol.snapshots.push(SnapshotState {
            name: name.to_string(),
            content: vol.content.clone(),
        });
        Ok(())
    }

    pub async fn delete_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get_mut(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?;
        let vol = state
            .volumes
            .get_mut(&slot(key))
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))?;

        let before = vol.snapshots.len();
        vol.snapshots.retain(|s| s.name != name);
        if vol.snapshots.len() == before {
            return Err(StorageError::snapshot_not_found(format!("{}/{}", key, name)));
        }

        // Last reference gone: superseded extents are dereferenced.
        if vol.snapshots.is_empty() {
            vol.retained_bytes = 0;
        }
        Ok(())
    }

    pub async fn read_snapshot(&self, key: &VolumeKey, name: &str) -> Result<Bytes> {
        let pools = self.pools.read().await;
        pools
            .get(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?
            .volumes
            .get(&slot(key))
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))?
            .snapshots
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.content.clone())
            .ok_or_else(|| StorageError::snapshot_not_found(format!("{}/{}", key, name)))
    }

    pub async fn restore_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get_mut(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?;
        let vol = state
            .volumes
            .get_mut(&slot(key))
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))?;

        let content = vol
            .snapshots
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.content.clone())
            .ok_or_else(|| StorageError::snapshot_not_found(format!("{}/{}", key, name)))?;

        vol.content = content;
        // The live volume now shares the restore point's extents.
        vol.retained_bytes = 0;
        Ok(())
    }

    /// Copy-on-write clone of a volume (or one of its snapshots) into a
    /// fresh volume in the same pool.
    pub async fn clone_cow(
        &self,
        source: &VolumeKey,
        source_snapshot: Option<&str>,
        dest: &StorageVolume,
    ) -> Result<()> {
        let mut pools = self.pools.write().await;
        let state = pools
            .get_mut(&dest.key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&dest.key.pool))?;

        let src = state
            .volumes
            .get(&slot(source))
            .ok_or_else(|| StorageError::volume_not_found(source.to_string()))?;

        let content = match source_snapshot {
            Some(name) => src
                .snapshots
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.content.clone())
                .ok_or_else(|| {
                    StorageError::snapshot_not_found(format!("{}/{}", source, name))
                })?,
            None => src.content.clone(),
        };

        let dest_slot = slot(&dest.key);
        if state.volumes.contains_key(&dest_slot) {
            return Err(StorageError::NameConflict(dest.key.to_string()));
        }

        let reserved = match state.provisioning {
            ProvisioningMode::Thick => dest.size_bytes,
            ProvisioningMode::Thin => 0,
        };

        state.volumes.insert(
            dest_slot,
            VolumeState {
                size: dest.size_bytes,
                reserved,
                content,
                snapshots: Vec::new(),
                retained_bytes: 0,
                quota_registered: false,
            },
        );
        Ok(())
    }

    /// Native transfer: copy a volume, optionally with its whole snapshot
    /// chain, into another pool managed by the same driver. The source is
    /// left untouched; the caller owns move semantics.
    pub async fn transfer(
        &self,
        source: &VolumeKey,
        dest: &StorageVolume,
        copy_snapshots: bool,
    ) -> Result<()> {
        let mut pools = self.pools.write().await;

        let (content, snapshots) = {
            let src_pool = pools
                .get(&source.pool)
                .ok_or_else(|| StorageError::pool_not_found(&source.pool))?;
            let src = src_pool
                .volumes
                .get(&slot(source))
                .ok_or_else(|| StorageError::volume_not_found(source.to_string()))?;

            let snapshots: Vec<SnapshotState> = if copy_snapshots {
                src.snapshots
                    .iter()
                    .map(|s| SnapshotState {
                        name: s.name.clone(),
                        content: s.content.clone(),
                    })
                    .collect()
            } else {
                Vec::new()
            };
            (src.content.clone(), snapshots)
        };

        let dst_pool = pools
            .get_mut(&dest.key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&dest.key.pool))?;

        let dest_slot = slot(&dest.key);
        if dst_pool.volumes.contains_key(&dest_slot) {
            return Err(StorageError::NameConflict(dest.key.to_string()));
        }

        let reserved = match dst_pool.provisioning {
            ProvisioningMode::Thick => dest.size_bytes,
            ProvisioningMode::Thin => 0,
        };

        dst_pool.volumes.insert(
            dest_slot,
            VolumeState {
                size: dest.size_bytes,
                reserved,
                content,
                snapshots,
                retained_bytes: 0,
                quota_registered: false,
            },
        );
        Ok(())
    }

    pub async fn set_quota_registered(&self, key: &VolumeKey) -> Result<()> {
        let mut pools = self.pools.write().await;
        let vol = pools
            .get_mut(&key.pool)
            .ok_or_else(|| StorageError::pool_not_found(&key.pool))?
            .volumes
            .get_mut(&slot(key))
            .ok_or_else(|| StorageError::volume_not_found(key.to_string()))?;
        vol.quota_registered = true;
        Ok(())
    }
}
