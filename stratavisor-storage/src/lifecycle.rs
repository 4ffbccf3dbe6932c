//! Volume lifecycle management.
//!
//! The sole mutation surface of the storage core: pool and volume create,
//! clone, snapshot, restore, resize and delete, dispatched to the resolved
//! driver. Every mutating operation holds the per-volume exclusive lock;
//! capacity is re-validated against the pool's live accounting at execution
//! time because sibling operations can consume space between validation and
//! execution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backend::DriverRegistry;
use crate::config::{
    effective_volume_config, validate_pool_config, validate_volume_config, resolve_provisioning,
};
use crate::error::{Result, StorageError};
use crate::scheduler::snapshot_expiry;
use crate::store::MetadataStore;
use crate::types::{
    ContentType, DriverKind, PoolUsage, SnapshotRecord, StoragePool, StorageVolume, VolumeKey,
    VolumeKind, VolumeUsage,
};

/// Capacity assumed for pools that do not declare a `size`.
pub const DEFAULT_POOL_CAPACITY: u64 = 100 * (1 << 30);

/// Size assumed for volumes that do not declare a `size`.
pub const DEFAULT_VOLUME_SIZE: u64 = 10 * (1 << 30);

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Retry transient backend contention a bounded number of times with
/// exponential backoff, then surface it as a hard backend error.
async fn with_retry<T, F, Fut>(operation: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Err(err) if err.is_transient() => {
                if attempt + 1 >= RETRY_ATTEMPTS {
                    return Err(StorageError::Backend(format!(
                        "{} failed after {} attempts: {}",
                        operation, RETRY_ATTEMPTS, err
                    )));
                }
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                warn!(%operation, %err, ?delay, "Transient backend error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Request to create a volume.
#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub pool: String,
    pub name: String,
    pub kind: VolumeKind,
    pub content_type: ContentType,
    pub config: HashMap<String, String>,
}

/// Source of a clone: a live volume or one of its snapshots.
#[derive(Debug, Clone)]
pub struct CloneSource {
    pub volume: VolumeKey,
    pub snapshot: Option<String>,
}

impl CloneSource {
    pub fn volume(key: VolumeKey) -> Self {
        Self {
            volume: key,
            snapshot: None,
        }
    }

    pub fn snapshot(key: VolumeKey, name: impl Into<String>) -> Self {
        Self {
            volume: key,
            snapshot: Some(name.into()),
        }
    }
}

/// Options for volume deletion.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Delete the volume's snapshots first instead of refusing with
    /// `HasDependents`. Bound instances always block deletion.
    pub force_cascade: bool,
}

/// The volume lifecycle manager.
pub struct VolumeLifecycleManager {
    store: Arc<MetadataStore>,
    drivers: Arc<DriverRegistry>,
}

impl VolumeLifecycleManager {
    pub fn new(store: Arc<MetadataStore>, drivers: Arc<DriverRegistry>) -> Self {
        Self { store, drivers }
    }

    // ---- pools ----

    /// Create a storage pool.
    #[instrument(skip(self, config), fields(pool = %name, driver = %driver))]
    pub async fn create_pool(
        &self,
        name: &str,
        driver: DriverKind,
        config: HashMap<String, String>,
    ) -> Result<StoragePool> {
        let _guard = self.store.lock_pool(name).await;

        if self.store.get_pool(name).await.is_ok() {
            return Err(StorageError::NameConflict(name.to_string()));
        }

        let normalized = validate_pool_config(driver, &config)?;
        let provisioning = resolve_provisioning(driver, &normalized)?;

        let capacity_bytes = match normalized.get("size") {
            // Size values were normalized to a plain byte count.
            Some(size) => size
                .parse::<u64>()
                .map_err(|_| StorageError::Config(format!("Invalid pool size {:?}", size)))?,
            None => DEFAULT_POOL_CAPACITY,
        };

        let source = normalized
            .get("source")
            .cloned()
            .unwrap_or_else(|| format!("/var/lib/stratavisor/pools/{name}"));

        let pool = StoragePool {
            name: name.to_string(),
            driver,
            config: normalized,
            source,
            provisioning,
            capacity_bytes,
            created_at: Utc::now(),
        };

        let backend = self.drivers.get(driver)?;
        with_retry("create pool", || backend.create_pool(&pool)).await?;
        self.store.insert_pool(pool.clone()).await?;

        info!(capacity_bytes, "Storage pool created");
        Ok(pool)
    }

    /// Destroy a pool. Fails while any volume still references it.
    #[instrument(skip(self), fields(pool = %name))]
    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        let _guard = self.store.lock_pool(name).await;

        let pool = self.store.get_pool(name).await?;
        let volumes = self.store.pool_volumes(name).await;
        if !volumes.is_empty() {
            return Err(StorageError::HasDependents {
                blockers: volumes.iter().map(|k| format!("volume {}", k)).collect(),
            });
        }

        let backend = self.drivers.get(pool.driver)?;
        with_retry("delete pool", || backend.delete_pool(name)).await?;
        self.store.remove_pool(name).await?;

        info!("Storage pool destroyed");
        Ok(())
    }

    /// Current pool space accounting.
    pub async fn pool_usage(&self, name: &str) -> Result<PoolUsage> {
        let pool = self.store.get_pool(name).await?;
        self.drivers.get(pool.driver)?.pool_usage(name).await
    }

    // ---- volumes ----

    /// Create a volume.
    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<StorageVolume> {
        self.create_volume_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Create a volume, honoring a cancellation token. Cancellation tears
    /// down any partially created backend state.
    #[instrument(skip(self, request, cancel), fields(pool = %request.pool, volume = %request.name))]
    pub async fn create_volume_with_cancel(
        &self,
        request: CreateVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<StorageVolume> {
        let pool = self.store.get_pool(&request.pool).await?;
        let caps = pool.driver.capability();

        if !caps.supports_volume_kind(request.kind) {
            return Err(StorageError::CapabilityUnsupported {
                driver: pool.driver.to_string(),
                operation: format!("{:?} volumes", request.kind),
            });
        }
        if !caps.supports_content_type(request.content_type) {
            return Err(StorageError::CapabilityUnsupported {
                driver: pool.driver.to_string(),
                operation: format!("{:?} content", request.content_type),
            });
        }

        let normalized = validate_volume_config(
            pool.driver,
            request.kind,
            request.content_type,
            pool.provisioning,
            &request.config,
        )?;
        let mut config = effective_volume_config(
            pool.driver,
            request.kind,
            request.content_type,
            pool.provisioning,
            &pool.config,
            &normalized,
        );

        let size_bytes = match config.get("size") {
            Some(size) => size
                .parse::<u64>()
                .map_err(|_| StorageError::Config(format!("Invalid volume size {:?}", size)))?,
            None => DEFAULT_VOLUME_SIZE,
        };
        config.insert("size".to_string(), size_bytes.to_string());

        let key = VolumeKey::new(&request.pool, &request.name, request.kind);
        if self.store.get_volume(&key).await.is_ok() {
            return Err(StorageError::NameConflict(key.to_string()));
        }

        let _guard = self.store.lock_volume(&key).await;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let backend = self.drivers.get(pool.driver)?;

        // Execution-time capacity check: declared sizes reserve logical
        // capacity on both thin and thick pools; sibling operations may
        // have consumed space since the caller validated.
        let usage = backend.pool_usage(&request.pool).await?;
        if size_bytes > usage.free_bytes() {
            return Err(StorageError::Capacity {
                pool: request.pool.clone(),
                requested: size_bytes,
                available: usage.free_bytes(),
            });
        }

        let volume = StorageVolume {
            key: key.clone(),
            content_type: request.content_type,
            size_bytes,
            config,
            created_at: Utc::now(),
        };

        with_retry("create volume", || backend.create_volume(&volume)).await?;

        // Quota groups don't enroll new volumes implicitly on drivers that
        // need registration; do it as part of creation.
        if caps.supports_quota && caps.quota_requires_registration {
            backend.register_quota(&key).await?;
        }

        if cancel.is_cancelled() {
            backend.delete_volume(&key).await?;
            return Err(StorageError::Cancelled);
        }

        self.store.insert_volume(volume.clone()).await?;
        info!(size_bytes, "Volume created");
        Ok(volume)
    }

    /// Clone a volume or snapshot into a new independent volume in the
    /// same pool.
    pub async fn clone_volume(
        &self,
        source: CloneSource,
        new_name: &str,
    ) -> Result<StorageVolume> {
        self.clone_volume_with_cancel(source, new_name, &CancellationToken::new())
            .await
    }

    /// Clone with cancellation. Uses the driver's copy-on-write clone when
    /// available, a full byte copy otherwise. Either way the clone is
    /// independent: divergent writes never affect the source.
    #[instrument(skip(self, source, cancel), fields(source = %source.volume, clone = %new_name))]
    pub async fn clone_volume_with_cancel(
        &self,
        source: CloneSource,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<StorageVolume> {
        let src_volume = self.store.get_volume(&source.volume).await?;
        let pool = self.store.get_pool(&source.volume.pool).await?;
        let caps = pool.driver.capability();
        let backend = self.drivers.get(pool.driver)?;

        if let Some(snapshot) = &source.snapshot {
            self.store.get_snapshot(&source.volume, snapshot).await?;
        }

        let dest_key = VolumeKey::new(&source.volume.pool, new_name, source.volume.kind);
        if self.store.get_volume(&dest_key).await.is_ok() {
            return Err(StorageError::NameConflict(dest_key.to_string()));
        }

        // Lock both volumes in key order so concurrent clones can't
        // deadlock against each other.
        let (first, second) = if source.volume < dest_key {
            (source.volume.clone(), dest_key.clone())
        } else {
            (dest_key.clone(), source.volume.clone())
        };
        let _guard_a = self.store.lock_volume(&first).await;
        let _guard_b = self.store.lock_volume(&second).await;

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let usage = backend.pool_usage(&pool.name).await?;
        if src_volume.size_bytes > usage.free_bytes() {
            return Err(StorageError::Capacity {
                pool: pool.name.clone(),
                requested: src_volume.size_bytes,
                available: usage.free_bytes(),
            });
        }

        let dest = StorageVolume {
            key: dest_key.clone(),
            content_type: src_volume.content_type,
            size_bytes: src_volume.size_bytes,
            config: src_volume.config.clone(),
            created_at: Utc::now(),
        };

        if caps.optimized_clone {
            with_retry("clone volume", || {
                backend.clone_volume(&source.volume, source.snapshot.as_deref(), &dest)
            })
            .await?;
        } else {
            // Streamed fallback: full byte copy at clone time.
            let content = match &source.snapshot {
                Some(snapshot) => backend.read_snapshot(&source.volume, snapshot).await?,
                None => backend.read_volume(&source.volume).await?,
            };

            with_retry("create clone target", || backend.create_volume(&dest)).await?;

            if cancel.is_cancelled() {
                backend.delete_volume(&dest_key).await?;
                return Err(StorageError::Cancelled);
            }

            if let Err(err) = backend.write_volume(&dest_key, content).await {
                backend.delete_volume(&dest_key).await?;
                return Err(err);
            }
        }

        if caps.supports_quota && caps.quota_requires_registration {
            backend.register_quota(&dest_key).await?;
        }

        if cancel.is_cancelled() {
            backend.delete_volume(&dest_key).await?;
            return Err(StorageError::Cancelled);
        }

        self.store.insert_volume(dest.clone()).await?;
        info!(optimized = caps.optimized_clone, "Volume cloned");
        Ok(dest)
    }

    /// Take a read-only snapshot of a volume.
    #[instrument(skip(self), fields(volume = %key, snapshot = %name))]
    pub async fn snapshot_volume(&self, key: &VolumeKey, name: &str) -> Result<SnapshotRecord> {
        let pool = self.store.get_pool(&key.pool).await?;
        let caps = pool.driver.capability();

        if !caps.supports_snapshots {
            return Err(StorageError::CapabilityUnsupported {
                driver: pool.driver.to_string(),
                operation: "snapshots".to_string(),
            });
        }

        let _guard = self.store.lock_volume(key).await;

        let volume = self.store.get_volume(key).await?;
        if self.store.get_snapshot(key, name).await.is_ok() {
            return Err(StorageError::NameConflict(format!("{}/{}", key, name)));
        }

        // Resolve the expiry before touching the backend so a bad config
        // cannot leave an orphaned backend snapshot behind.
        let created_at = Utc::now();
        let expires_at = snapshot_expiry(&volume.config, created_at)?;

        let backend = self.drivers.get(pool.driver)?;
        with_retry("create snapshot", || backend.create_snapshot(key, name)).await?;

        let record = SnapshotRecord {
            volume: key.clone(),
            name: name.to_string(),
            created_at,
            expires_at,
        };
        self.store.insert_snapshot(record.clone()).await?;

        info!("Snapshot created");
        Ok(record)
    }

    /// Rewind a volume's content to a snapshot.
    ///
    /// On drivers requiring strict snapshot ordering the snapshots newer
    /// than the restore point are deleted first; elsewhere they coexist
    /// with the restored state.
    #[instrument(skip(self), fields(volume = %key, snapshot = %name))]
    pub async fn restore_volume(&self, key: &VolumeKey, name: &str) -> Result<()> {
        let pool = self.store.get_pool(&key.pool).await?;
        let caps = pool.driver.capability();
        let backend = self.drivers.get(pool.driver)?;

        let _guard = self.store.lock_volume(key).await;

        self.store.get_volume(key).await?;
        let restore_point = self.store.get_snapshot(key, name).await?;

        if caps.restore_removes_newer_snapshots {
            let newer: Vec<_> = self
                .store
                .list_snapshots(key)
                .await
                .into_iter()
                .filter(|s| s.created_at > restore_point.created_at)
                .collect();

            for snapshot in newer.iter().rev() {
                warn!(snapshot = %snapshot.name, "Removing snapshot newer than restore point");
                backend.delete_snapshot(key, &snapshot.name).await?;
                self.store.remove_snapshot(key, &snapshot.name).await?;
            }
        }

        with_retry("restore snapshot", || backend.restore_snapshot(key, name)).await?;
        info!("Volume restored");
        Ok(())
    }

    /// Grow or shrink a volume. Shrinking below used space fails.
    #[instrument(skip(self), fields(volume = %key, new_size = %new_size))]
    pub async fn resize_volume(&self, key: &VolumeKey, new_size: u64) -> Result<()> {
        let pool = self.store.get_pool(&key.pool).await?;
        let backend = self.drivers.get(pool.driver)?;

        let _guard = self.store.lock_volume(key).await;

        let mut volume = self.store.get_volume(key).await?;

        if new_size > volume.size_bytes {
            // Growth consumes reservation; re-check at execution time.
            let delta = new_size - volume.size_bytes;
            let usage = backend.pool_usage(&key.pool).await?;
            if delta > usage.free_bytes() {
                return Err(StorageError::Capacity {
                    pool: key.pool.clone(),
                    requested: delta,
                    available: usage.free_bytes(),
                });
            }
        }

        with_retry("resize volume", || backend.resize_volume(key, new_size)).await?;

        volume.size_bytes = new_size;
        volume
            .config
            .insert("size".to_string(), new_size.to_string());
        self.store.update_volume(volume).await?;

        info!("Volume resized");
        Ok(())
    }

    /// Delete a volume. Refuses with `HasDependents` while snapshots or
    /// instance bindings reference it, unless `force_cascade` removes the
    /// snapshots first. Bindings always block.
    #[instrument(skip(self, options), fields(volume = %key))]
    pub async fn delete_volume(&self, key: &VolumeKey, options: DeleteOptions) -> Result<()> {
        let pool = self.store.get_pool(&key.pool).await?;
        let backend = self.drivers.get(pool.driver)?;

        let _guard = self.store.lock_volume(key).await;

        self.store.get_volume(key).await?;

        let bindings = self.store.volume_bindings(key).await;
        let snapshots = self.store.list_snapshots(key).await;

        let mut blockers: Vec<String> = bindings
            .iter()
            .map(|b| format!("instance {} device {}", b.instance, b.device_name))
            .collect();
        if !options.force_cascade {
            blockers.extend(snapshots.iter().map(|s| format!("snapshot {}", s.name)));
        }
        if !blockers.is_empty() {
            return Err(StorageError::HasDependents { blockers });
        }

        if options.force_cascade {
            for snapshot in snapshots.iter().rev() {
                backend.delete_snapshot(key, &snapshot.name).await?;
                self.store.remove_snapshot(key, &snapshot.name).await?;
            }
        }

        with_retry("delete volume", || backend.delete_volume(key)).await?;
        self.store.remove_volume(key).await?;

        info!("Volume deleted");
        Ok(())
    }

    /// Delete a single snapshot.
    #[instrument(skip(self), fields(volume = %key, snapshot = %name))]
    pub async fn delete_snapshot(&self, key: &VolumeKey, name: &str) -> Result<()> {
        let pool = self.store.get_pool(&key.pool).await?;
        let backend = self.drivers.get(pool.driver)?;

        let _guard = self.store.lock_volume(key).await;

        self.store.get_snapshot(key, name).await?;
        with_retry("delete snapshot", || backend.delete_snapshot(key, name)).await?;
        self.store.remove_snapshot(key, name).await?;

        info!("Snapshot deleted");
        Ok(())
    }

    // ---- read-only queries (no volume lock) ----

    pub async fn get_volume(&self, key: &VolumeKey) -> Result<StorageVolume> {
        self.store.get_volume(key).await
    }

    pub async fn list_volumes(&self, pool: &str) -> Result<Vec<StorageVolume>> {
        self.store.get_pool(pool).await?;
        Ok(self.store.list_volumes(pool).await)
    }

    pub async fn list_snapshots(&self, key: &VolumeKey) -> Result<Vec<SnapshotRecord>> {
        self.store.get_volume(key).await?;
        Ok(self.store.list_snapshots(key).await)
    }

    /// Volume space accounting, with the retained-extents marker for
    /// drivers whose usage reporting runs ahead of live data.
    pub async fn volume_usage(&self, key: &VolumeKey) -> Result<VolumeUsage> {
        let pool = self.store.get_pool(&key.pool).await?;
        self.drivers.get(pool.driver)?.volume_usage(key).await
    }

    pub(crate) fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub(crate) fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_contention() {
        let attempts = AtomicU32::new(0);
        let result = with_retry("op", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::BackendBusy("lock held".to_string()))
            } else {
                Ok(42u32)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_becomes_backend_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("create snapshot", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::BackendBusy("lock held".to_string()))
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(attempts.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retry_passes_hard_errors_through() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("op", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Config("bad".to_string()))
        })
        .await;

        assert!(matches!(result.unwrap_err(), StorageError::Config(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
