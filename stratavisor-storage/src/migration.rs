//! Cross-pool volume migration.
//!
//! Transport selection is negotiated from the two pools' capability
//! descriptors: matching driver kinds with native transfer support use the
//! backend's own mechanism (preserving thin provisioning and snapshot
//! history); every other pairing falls back to a streamed byte copy.
//! Migrations are staged: data lands under a temporary name on the
//! destination, is verified, and only then renamed into place, so a
//! half-finished migration never leaves a visible volume behind.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::lifecycle::VolumeLifecycleManager;
use crate::types::{
    DriverKind, SnapshotRecord, StoragePool, StorageVolume, TransferMode, VolumeKey,
};

/// Chunk size used for bandwidth pacing of streamed transfers.
const STREAM_CHUNK: usize = 256 * 1024;

/// Prefix of the staging name a migration writes into before commit.
const STAGING_PREFIX: &str = ".migrate-";

/// Options controlling a migration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationOptions {
    /// Carry the source's snapshots across. Silently flattened when the
    /// destination driver has no snapshot support.
    pub copy_snapshots: bool,
    /// Streaming throughput cap in bytes per second. Ignored by native
    /// transfers, which pace themselves.
    pub bandwidth_limit: Option<u64>,
    /// Compress the streamed byte stream in flight.
    pub compress: bool,
}

/// Pick the transfer mode for a source/destination pool pairing.
///
/// Native transfer needs the same driver kind on both ends and a driver
/// that implements it; everything else streams.
pub fn select_transport(source: DriverKind, dest: DriverKind) -> TransferMode {
    if source == dest && source.capability().optimized_transfer {
        TransferMode::Native
    } else {
        TransferMode::Stream
    }
}

/// FNV-1a, used to verify streamed transfers end to end.
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Cross-pool volume migrator.
pub struct VolumeMigrator {
    lifecycle: Arc<VolumeLifecycleManager>,
}

impl VolumeMigrator {
    pub fn new(lifecycle: Arc<VolumeLifecycleManager>) -> Self {
        Self { lifecycle }
    }

    /// Migrate a volume into another pool under a new name. The source is
    /// left untouched; callers wanting a move delete it afterwards.
    pub async fn migrate(
        &self,
        source: &VolumeKey,
        dest_pool: &str,
        dest_name: &str,
        options: MigrationOptions,
    ) -> Result<StorageVolume> {
        self.migrate_with_cancel(source, dest_pool, dest_name, options, &CancellationToken::new())
            .await
    }

    #[instrument(skip(self, options, cancel), fields(source = %source, dest = %dest_pool))]
    pub async fn migrate_with_cancel(
        &self,
        source: &VolumeKey,
        dest_pool: &str,
        dest_name: &str,
        options: MigrationOptions,
        cancel: &CancellationToken,
    ) -> Result<StorageVolume> {
        let store = self.lifecycle.store();
        let drivers = self.lifecycle.drivers();

        let src_volume = store.get_volume(source).await?;
        let src_pool = store.get_pool(&source.pool).await?;
        let dst_pool = store.get_pool(dest_pool).await?;
        let dst_caps = dst_pool.driver.capability();

        if !dst_caps.supports_volume_kind(source.kind) {
            return Err(StorageError::CapabilityUnsupported {
                driver: dst_pool.driver.to_string(),
                operation: format!("{:?} volumes", source.kind),
            });
        }
        if !dst_caps.supports_content_type(src_volume.content_type) {
            return Err(StorageError::CapabilityUnsupported {
                driver: dst_pool.driver.to_string(),
                operation: format!("{:?} content", src_volume.content_type),
            });
        }

        let final_key = VolumeKey::new(dest_pool, dest_name, source.kind);
        if store.get_volume(&final_key).await.is_ok() {
            return Err(StorageError::NameConflict(final_key.to_string()));
        }

        let src_backend = drivers.get(src_pool.driver)?;
        let dst_backend = drivers.get(dst_pool.driver)?;

        let dst_usage = dst_backend.pool_usage(dest_pool).await?;
        if src_volume.size_bytes > dst_usage.free_bytes() {
            return Err(StorageError::Capacity {
                pool: dest_pool.to_string(),
                requested: src_volume.size_bytes,
                available: dst_usage.free_bytes(),
            });
        }

        let transport = select_transport(src_pool.driver, dst_pool.driver);
        let snapshots = store.list_snapshots(source).await;
        let flatten = options.copy_snapshots && !dst_caps.supports_snapshots;
        if flatten {
            warn!(
                snapshots = snapshots.len(),
                "Destination has no snapshot support, flattening"
            );
        }

        // Source is read-locked implicitly by the backend; the staging
        // volume is invisible to metadata until commit, so only the final
        // key needs conflict protection.
        let _guard = store.lock_volume(&final_key).await;

        let staged_key = VolumeKey::new(
            dest_pool,
            format!("{}{}", STAGING_PREFIX, Uuid::new_v4()),
            source.kind,
        );
        let staged = StorageVolume {
            key: staged_key.clone(),
            content_type: src_volume.content_type,
            size_bytes: src_volume.size_bytes,
            config: src_volume.config.clone(),
            created_at: Utc::now(),
        };

        let copy_snapshots = options.copy_snapshots && !flatten;
        let result = match transport {
            TransferMode::Native => {
                info!("Using native transfer");
                src_backend
                    .native_transfer(source, &staged, copy_snapshots)
                    .await
            }
            TransferMode::Stream => {
                info!(compress = options.compress, "Using streamed transfer");
                self.stream_transfer(
                    src_backend.as_ref(),
                    dst_backend.as_ref(),
                    source,
                    &staged,
                    &snapshots,
                    copy_snapshots,
                    &options,
                    cancel,
                )
                .await
            }
        };

        if let Err(err) = result {
            // The staging volume may or may not exist at this point.
            if dst_backend.delete_volume(&staged_key).await.is_err() {
                info!("No staged volume to discard");
            }
            return Err(err);
        }

        if cancel.is_cancelled() {
            dst_backend.delete_volume(&staged_key).await?;
            return Err(StorageError::Cancelled);
        }

        // Commit: register the quota, rename into place and publish the
        // metadata. A failure at this stage still discards the staged
        // volume so nothing invisible keeps holding pool capacity.
        let commit = async {
            if dst_caps.supports_quota && dst_caps.quota_requires_registration {
                dst_backend.register_quota(&staged_key).await?;
            }
            dst_backend.rename_volume(&staged_key, dest_name).await
        };
        if let Err(err) = commit.await {
            if let Err(cleanup) = dst_backend.delete_volume(&staged_key).await {
                warn!(%cleanup, "Failed to discard staged volume after commit error");
            }
            return Err(err);
        }

        let volume = StorageVolume {
            key: final_key.clone(),
            content_type: src_volume.content_type,
            size_bytes: src_volume.size_bytes,
            config: src_volume.config.clone(),
            created_at: Utc::now(),
        };
        store.insert_volume(volume.clone()).await?;

        if copy_snapshots {
            for snapshot in &snapshots {
                store
                    .insert_snapshot(SnapshotRecord {
                        volume: final_key.clone(),
                        name: snapshot.name.clone(),
                        created_at: snapshot.created_at,
                        expires_at: snapshot.expires_at,
                    })
                    .await?;
            }
        }

        info!(
            transport = ?transport,
            snapshots = if copy_snapshots { snapshots.len() } else { 0 },
            "Migration committed"
        );
        Ok(volume)
    }

    /// Generic streamed copy: works across any driver pairing.
    #[allow(clippy::too_many_arguments)]
    async fn stream_transfer(
        &self,
        src_backend: &dyn crate::backend::StorageDriver,
        dst_backend: &dyn crate::backend::StorageDriver,
        source: &VolumeKey,
        staged: &StorageVolume,
        snapshots: &[SnapshotRecord],
        copy_snapshots: bool,
        options: &MigrationOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        dst_backend.create_volume(staged).await?;

        // Snapshots replay oldest-first so the destination's snapshot
        // chain mirrors the source's history, then the live head goes
        // last.
        if copy_snapshots {
            for snapshot in snapshots {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let content = src_backend.read_snapshot(source, &snapshot.name).await?;
                self.send(dst_backend, &staged.key, content, options).await?;
                dst_backend
                    .create_snapshot(&staged.key, &snapshot.name)
                    .await?;
            }
        }

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let content = src_backend.read_volume(source).await?;
        let checksum = fnv1a(&content);
        let length = content.len();

        self.send(dst_backend, &staged.key, content, options).await?;

        // Verify the landed bytes before anything becomes visible.
        let landed = dst_backend.read_volume(&staged.key).await?;
        if landed.len() != length || fnv1a(&landed) != checksum {
            return Err(StorageError::Backend(format!(
                "Migration verification failed for {}: length {} checksum mismatch",
                source,
                landed.len()
            )));
        }

        Ok(())
    }

    /// Push one payload to the destination, applying in-flight compression
    /// and bandwidth pacing.
    async fn send(
        &self,
        dst_backend: &dyn crate::backend::StorageDriver,
        dest: &VolumeKey,
        content: Bytes,
        options: &MigrationOptions,
    ) -> Result<()> {
        let wire: Bytes = if options.compress {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(&content)
                .map_err(|e| StorageError::Backend(format!("Compression failed: {e}")))?;
            Bytes::from(compressed)
        } else {
            content.clone()
        };

        if let Some(limit) = options.bandwidth_limit {
            self.throttle(wire.len(), limit).await;
        }

        let payload: Bytes = if options.compress {
            let decompressed = snap::raw::Decoder::new()
                .decompress_vec(&wire)
                .map_err(|e| StorageError::Backend(format!("Decompression failed: {e}")))?;
            Bytes::from(decompressed)
        } else {
            wire
        };

        dst_backend.write_volume(dest, payload).await
    }

    /// Pace a transfer of `len` wire bytes to at most `limit` bytes/sec.
    async fn throttle(&self, len: usize, limit: u64) {
        if limit == 0 {
            return;
        }
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(STREAM_CHUNK);
            let nanos = (chunk as u64).saturating_mul(1_000_000_000) / limit;
            tokio::time::sleep(Duration::from_nanos(nanos)).await;
            remaining -= chunk;
        }
    }
}

/// Pools a volume of the given kind could migrate to, judged purely from
/// capability descriptors.
pub fn eligible_destinations<'a>(
    volume: &StorageVolume,
    pools: &'a [StoragePool],
) -> Vec<&'a StoragePool> {
    pools
        .iter()
        .filter(|p| {
            let caps = p.driver.capability();
            caps.supports_volume_kind(volume.key.kind)
                && caps.supports_content_type(volume.content_type)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_selection() {
        // Same kind with native support.
        assert_eq!(
            select_transport(DriverKind::Btrfs, DriverKind::Btrfs),
            TransferMode::Native
        );
        assert_eq!(
            select_transport(DriverKind::CephRbd, DriverKind::CephRbd),
            TransferMode::Native
        );
        // Same kind without native support.
        assert_eq!(
            select_transport(DriverKind::Lvm, DriverKind::Lvm),
            TransferMode::Stream
        );
        // Cross-kind always streams.
        assert_eq!(
            select_transport(DriverKind::Btrfs, DriverKind::CephRbd),
            TransferMode::Stream
        );
        assert_eq!(
            select_transport(DriverKind::Dir, DriverKind::CephObject),
            TransferMode::Stream
        );
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_ne!(fnv1a(b"abc"), fnv1a(b"abd"));
    }

    #[test]
    fn test_eligible_destinations_filter() {
        use crate::types::{ContentType, ProvisioningMode, VolumeKind};
        use std::collections::HashMap;

        let pool = |name: &str, driver: DriverKind| StoragePool {
            name: name.to_string(),
            driver,
            config: HashMap::new(),
            source: String::new(),
            provisioning: ProvisioningMode::Thin,
            capacity_bytes: 1 << 30,
            created_at: chrono::Utc::now(),
        };
        let pools = vec![
            pool("d", DriverKind::Dir),
            pool("o", DriverKind::CephObject),
            pool("f", DriverKind::CephFs),
        ];

        let vm_root = StorageVolume {
            key: VolumeKey::new("d", "vm", VolumeKind::VirtualMachine),
            content_type: ContentType::Block,
            size_bytes: 1 << 20,
            config: HashMap::new(),
            created_at: chrono::Utc::now(),
        };

        // Block VM roots fit the dir pool, not the distributed
        // filesystem/object pools.
        let names: Vec<_> = eligible_destinations(&vm_root, &pools)
            .into_iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, ["d"]);
    }
}
