//! Integration tests for the storage core.
//!
//! These tests drive the public API end to end: pools, volume lifecycle,
//! snapshots, scheduling, migration and device bindings, across the
//! in-process drivers.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, TimeZone, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use stratavisor_storage::{
    BindRequest, CloneSource, ContentType, CreateVolumeRequest, DeleteOptions, DiskDeviceBinder,
    DiskSource, DriverKind, DriverRegistry, InstanceKind, MetadataStore, MigrationOptions,
    SnapshotScheduler, StorageError, StorageVolume, VolumeKey, VolumeKind,
    VolumeLifecycleManager, VolumeMigrator, ROOT_DEVICE_NAME,
};

const KIB: u64 = 1024;

struct Harness {
    store: Arc<MetadataStore>,
    drivers: Arc<DriverRegistry>,
    lifecycle: Arc<VolumeLifecycleManager>,
}

fn harness() -> Harness {
    let store = MetadataStore::new();
    let drivers = DriverRegistry::with_defaults();
    let lifecycle = Arc::new(VolumeLifecycleManager::new(store.clone(), drivers.clone()));
    Harness {
        store,
        drivers,
        lifecycle,
    }
}

fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn volume_request(pool: &str, name: &str, size: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        pool: pool.to_string(),
        name: name.to_string(),
        kind: VolumeKind::Custom,
        content_type: ContentType::Filesystem,
        config: map(&[("size", size)]),
    }
}

/// Deleting a volume returns its reservation to the pool.
#[tokio::test]
async fn test_delete_restores_pool_capacity() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Dir, map(&[("size", "10KiB")]))
        .await
        .unwrap();

    let v1 = h
        .lifecycle
        .create_volume(volume_request("p", "v1", "8KiB"))
        .await
        .unwrap();

    // 8KiB of 10KiB reserved: a 4KiB volume no longer fits.
    let err = h
        .lifecycle
        .create_volume(volume_request("p", "v2", "4KiB"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Capacity { .. }));

    h.lifecycle
        .delete_volume(&v1.key, DeleteOptions::default())
        .await
        .unwrap();

    h.lifecycle
        .create_volume(volume_request("p", "v2", "4KiB"))
        .await
        .unwrap();

    let usage = h.lifecycle.pool_usage("p").await.unwrap();
    assert_eq!(usage.reserved_bytes, 4 * KIB);
}

/// Thin pools still refuse volumes whose declared size exceeds the
/// unreserved capacity, and snapshots block deletion until cascaded.
#[tokio::test]
async fn test_thin_pool_reservation_and_dependents() {
    let h = harness();
    h.lifecycle
        .create_pool("fast", DriverKind::Btrfs, map(&[("size", "20KiB")]))
        .await
        .unwrap();

    let v1 = h
        .lifecycle
        .create_volume(volume_request("fast", "v1", "5KiB"))
        .await
        .unwrap();

    // Declared sizes reserve logical capacity even on thin pools.
    let err = h
        .lifecycle
        .create_volume(volume_request("fast", "v2", "20KiB"))
        .await
        .unwrap_err();
    match err {
        StorageError::Capacity {
            requested,
            available,
            ..
        } => {
            assert_eq!(requested, 20 * KIB);
            assert_eq!(available, 15 * KIB);
        }
        other => panic!("expected capacity error, got {other}"),
    }

    h.lifecycle.snapshot_volume(&v1.key, "s1").await.unwrap();

    let err = h
        .lifecycle
        .delete_volume(&v1.key, DeleteOptions::default())
        .await
        .unwrap_err();
    match err {
        StorageError::HasDependents { blockers } => {
            assert!(blockers.iter().any(|b| b.contains("s1")));
        }
        other => panic!("expected dependents error, got {other}"),
    }

    // Removing the snapshot first unblocks the plain delete.
    h.lifecycle.delete_snapshot(&v1.key, "s1").await.unwrap();
    h.lifecycle
        .delete_volume(&v1.key, DeleteOptions::default())
        .await
        .unwrap();

    let v2 = h
        .lifecycle
        .create_volume(volume_request("fast", "v2", "20KiB"))
        .await
        .unwrap();

    // The cascade flag removes snapshots and volume in one call.
    h.lifecycle.snapshot_volume(&v2.key, "s1").await.unwrap();
    h.lifecycle
        .delete_volume(&v2.key, DeleteOptions { force_cascade: true })
        .await
        .unwrap();
    assert_eq!(h.lifecycle.pool_usage("fast").await.unwrap().reserved_bytes, 0);
}

/// A copy-on-write clone diverges from its source without affecting it.
#[tokio::test]
async fn test_optimized_clone_isolation() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Btrfs, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let v = h
        .lifecycle
        .create_volume(volume_request("p", "v", "8KiB"))
        .await
        .unwrap();

    let driver = h.drivers.get(DriverKind::Btrfs).unwrap();
    driver
        .write_volume(&v.key, Bytes::from_static(b"original"))
        .await
        .unwrap();

    let clone = h
        .lifecycle
        .clone_volume(CloneSource::volume(v.key.clone()), "c")
        .await
        .unwrap();

    driver
        .write_volume(&clone.key, Bytes::from_static(b"diverged"))
        .await
        .unwrap();

    assert_eq!(
        driver.read_volume(&v.key).await.unwrap(),
        Bytes::from_static(b"original")
    );
    assert_eq!(
        driver.read_volume(&clone.key).await.unwrap(),
        Bytes::from_static(b"diverged")
    );
}

/// Drivers without copy-on-write clone fall back to a full copy with the
/// same isolation guarantee, and can clone from a snapshot.
#[tokio::test]
async fn test_streamed_clone_from_snapshot() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let v = h
        .lifecycle
        .create_volume(volume_request("p", "v", "8KiB"))
        .await
        .unwrap();

    let driver = h.drivers.get(DriverKind::Dir).unwrap();
    driver
        .write_volume(&v.key, Bytes::from_static(b"at snapshot"))
        .await
        .unwrap();
    h.lifecycle.snapshot_volume(&v.key, "s1").await.unwrap();
    driver
        .write_volume(&v.key, Bytes::from_static(b"moved on"))
        .await
        .unwrap();

    let clone = h
        .lifecycle
        .clone_volume(CloneSource::snapshot(v.key.clone(), "s1"), "c")
        .await
        .unwrap();

    assert_eq!(
        driver.read_volume(&clone.key).await.unwrap(),
        Bytes::from_static(b"at snapshot")
    );
    assert_eq!(
        driver.read_volume(&v.key).await.unwrap(),
        Bytes::from_static(b"moved on")
    );
}

/// Restore rewinds content exactly; newer snapshots survive on drivers
/// that keep independent snapshots and are removed where the backend
/// requires strict ordering.
#[tokio::test]
async fn test_restore_fidelity_and_newer_snapshot_policy() {
    let h = harness();
    h.lifecycle
        .create_pool("b", DriverKind::Btrfs, map(&[("size", "64KiB")]))
        .await
        .unwrap();
    h.lifecycle
        .create_pool("l", DriverKind::Lvm, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    for pool in ["b", "l"] {
        let v = h
            .lifecycle
            .create_volume(volume_request(pool, "v", "8KiB"))
            .await
            .unwrap();
        let driver = h
            .drivers
            .get(h.store.get_pool(pool).await.unwrap().driver)
            .unwrap();

        driver
            .write_volume(&v.key, Bytes::from_static(b"state a"))
            .await
            .unwrap();
        h.lifecycle.snapshot_volume(&v.key, "a").await.unwrap();
        driver
            .write_volume(&v.key, Bytes::from_static(b"state b"))
            .await
            .unwrap();
        h.lifecycle.snapshot_volume(&v.key, "b").await.unwrap();

        h.lifecycle.restore_volume(&v.key, "a").await.unwrap();
        assert_eq!(
            driver.read_volume(&v.key).await.unwrap(),
            Bytes::from_static(b"state a")
        );

        let names: Vec<_> = h
            .lifecycle
            .list_snapshots(&v.key)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        match pool {
            "b" => assert_eq!(names, ["a", "b"]),
            _ => assert_eq!(names, ["a"]),
        }
    }
}

/// Racing a snapshot against a delete of the same volume: exactly one
/// wins, and the loser fails cleanly.
#[tokio::test]
async fn test_concurrent_snapshot_and_delete() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();
    let v = h
        .lifecycle
        .create_volume(volume_request("p", "v", "8KiB"))
        .await
        .unwrap();

    let snap_lc = h.lifecycle.clone();
    let snap_key = v.key.clone();
    let snapshot = tokio::spawn(async move { snap_lc.snapshot_volume(&snap_key, "s").await });

    let del_lc = h.lifecycle.clone();
    let del_key = v.key.clone();
    let delete =
        tokio::spawn(async move { del_lc.delete_volume(&del_key, DeleteOptions::default()).await });

    let snapshot = snapshot.await.unwrap();
    let delete = delete.await.unwrap();

    assert!(
        snapshot.is_ok() != delete.is_ok(),
        "exactly one of the racing operations must succeed: snapshot={snapshot:?} delete={delete:?}"
    );
    match (snapshot, delete) {
        (Ok(_), Err(StorageError::HasDependents { .. })) => {}
        (Err(StorageError::NotFound { .. }), Ok(())) => {}
        other => panic!("unexpected race outcome: {other:?}"),
    }
}

/// Native migration between pools of the same driver carries the
/// snapshot chain across.
#[tokio::test]
async fn test_native_migration_preserves_snapshots() {
    let h = harness();
    h.lifecycle
        .create_pool("src", DriverKind::Btrfs, map(&[("size", "64KiB")]))
        .await
        .unwrap();
    h.lifecycle
        .create_pool("dst", DriverKind::Btrfs, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let v = h
        .lifecycle
        .create_volume(volume_request("src", "v", "8KiB"))
        .await
        .unwrap();
    let driver = h.drivers.get(DriverKind::Btrfs).unwrap();
    driver
        .write_volume(&v.key, Bytes::from_static(b"history"))
        .await
        .unwrap();
    h.lifecycle.snapshot_volume(&v.key, "s1").await.unwrap();
    driver
        .write_volume(&v.key, Bytes::from_static(b"present"))
        .await
        .unwrap();

    let migrator = VolumeMigrator::new(h.lifecycle.clone());
    let moved = migrator
        .migrate(
            &v.key,
            "dst",
            "v",
            MigrationOptions {
                copy_snapshots: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        driver.read_volume(&moved.key).await.unwrap(),
        Bytes::from_static(b"present")
    );
    assert_eq!(
        driver.read_snapshot(&moved.key, "s1").await.unwrap(),
        Bytes::from_static(b"history")
    );
    let names: Vec<_> = h
        .lifecycle
        .list_snapshots(&moved.key)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, ["s1"]);

    // The source is a copy, not a move: still fully intact.
    assert_eq!(
        driver.read_volume(&v.key).await.unwrap(),
        Bytes::from_static(b"present")
    );
}

/// Migration into a driver without snapshot support streams and
/// flattens: the head arrives intact, the chain does not.
#[tokio::test]
async fn test_streamed_migration_flattens_snapshots() {
    let h = harness();
    h.lifecycle
        .create_pool("src", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();
    h.lifecycle
        .create_pool(
            "obj",
            DriverKind::CephObject,
            map(&[("size", "64KiB"), ("cephobject.radosgw.endpoint", "rgw.example.com")]),
        )
        .await
        .unwrap();

    let v = h
        .lifecycle
        .create_volume(volume_request("src", "v", "8KiB"))
        .await
        .unwrap();
    let src_driver = h.drivers.get(DriverKind::Dir).unwrap();
    src_driver
        .write_volume(&v.key, Bytes::from_static(b"old"))
        .await
        .unwrap();
    h.lifecycle.snapshot_volume(&v.key, "s1").await.unwrap();
    src_driver
        .write_volume(&v.key, Bytes::from_static(b"payload"))
        .await
        .unwrap();

    let migrator = VolumeMigrator::new(h.lifecycle.clone());
    let moved = migrator
        .migrate(
            &v.key,
            "obj",
            "v",
            MigrationOptions {
                copy_snapshots: true,
                compress: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let obj_driver = h.drivers.get(DriverKind::CephObject).unwrap();
    assert_eq!(
        obj_driver.read_volume(&moved.key).await.unwrap(),
        Bytes::from_static(b"payload")
    );
    assert!(h
        .lifecycle
        .list_snapshots(&moved.key)
        .await
        .unwrap()
        .is_empty());
}

/// A scheduled snapshot fires once per matching minute and names itself
/// from the pattern; expired snapshots are pruned on a later tick.
#[tokio::test]
async fn test_scheduler_fires_and_prunes() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Btrfs, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let mut request = volume_request("p", "v", "8KiB");
    request
        .config
        .insert("snapshots.schedule".to_string(), "0 3 * * *".to_string());
    let v = h.lifecycle.create_volume(request).await.unwrap();

    let mut request = volume_request("p", "w", "8KiB");
    request
        .config
        .insert("snapshots.expiry".to_string(), "1M".to_string());
    let w = h.lifecycle.create_volume(request).await.unwrap();

    let scheduler = SnapshotScheduler::new(h.lifecycle.clone());

    let three_am = Utc.with_ymd_and_hms(2026, 8, 24, 3, 0, 0).unwrap();
    join_all(scheduler.tick(three_am).await).await;
    join_all(scheduler.tick(three_am + Duration::seconds(30)).await).await;

    let snapshots = h.lifecycle.list_snapshots(&v.key).await.unwrap();
    assert_eq!(snapshots.len(), 1, "one firing window, one snapshot");
    assert_eq!(snapshots[0].name, "snap0");

    // A manual snapshot of the expiring volume is pruned once a tick runs
    // past its expiry instant.
    let taken = h.lifecycle.snapshot_volume(&w.key, "ephemeral").await.unwrap();
    let expires_at = taken.expires_at.unwrap();
    assert_eq!(expires_at, taken.created_at + Duration::minutes(1));

    join_all(scheduler.tick(expires_at + Duration::seconds(1)).await).await;
    assert!(h.lifecycle.list_snapshots(&w.key).await.unwrap().is_empty());
}

/// Root volume creation applies the `initial.*` overlay once and binds
/// the root device with the path rules of its content type.
#[tokio::test]
async fn test_instance_root_creation() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Lvm, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let binder = DiskDeviceBinder::new(h.store.clone(), h.drivers.clone(), h.lifecycle.clone());
    let (volume, binding) = binder
        .create_instance_root(
            "vm01",
            InstanceKind::VirtualMachine,
            "p",
            &map(&[("size", "8KiB"), ("initial.block.filesystem", "ext4")]),
        )
        .await
        .unwrap();

    assert_eq!(volume.key.kind, VolumeKind::VirtualMachine);
    assert_eq!(volume.content_type, ContentType::Block);
    assert_eq!(volume.size_bytes, 8 * KIB);
    assert_eq!(volume.config.get("block.filesystem").unwrap(), "ext4");

    assert_eq!(binding.device_name, ROOT_DEVICE_NAME);
    assert!(binding.path.is_none());
    assert!(binding.required);
    assert!(matches!(binding.source, DiskSource::Volume(ref k) if *k == volume.key));

    // The root volume now blocks its own deletion.
    let err = h
        .lifecycle
        .delete_volume(&volume.key, DeleteOptions { force_cascade: true })
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::HasDependents { .. }));
}

/// Mount path rules: filesystem content requires a path, block content
/// forbids one.
#[tokio::test]
async fn test_device_path_rules() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();
    let v = h
        .lifecycle
        .create_volume(volume_request("p", "data", "8KiB"))
        .await
        .unwrap();

    let binder = DiskDeviceBinder::new(h.store.clone(), h.drivers.clone(), h.lifecycle.clone());

    let err = binder
        .bind(BindRequest {
            instance: "c1".to_string(),
            instance_kind: InstanceKind::Container,
            device_name: "data".to_string(),
            source: DiskSource::Volume(v.key.clone()),
            path: None,
            required: false,
            hotplug: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));

    binder
        .bind(BindRequest {
            instance: "c1".to_string(),
            instance_kind: InstanceKind::Container,
            device_name: "data".to_string(),
            source: DiskSource::Volume(v.key.clone()),
            path: Some("/mnt/data".to_string()),
            required: false,
            hotplug: false,
        })
        .await
        .unwrap();
}

/// Hot-plug gating comes from the driver descriptor: a dir-backed
/// filesystem volume hot-attaches to a container but not to a VM.
#[tokio::test]
async fn test_hotplug_gating() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();
    let v = h
        .lifecycle
        .create_volume(volume_request("p", "data", "8KiB"))
        .await
        .unwrap();

    let binder = DiskDeviceBinder::new(h.store.clone(), h.drivers.clone(), h.lifecycle.clone());

    binder
        .bind(BindRequest {
            instance: "c1".to_string(),
            instance_kind: InstanceKind::Container,
            device_name: "data".to_string(),
            source: DiskSource::Volume(v.key.clone()),
            path: Some("/mnt/data".to_string()),
            required: false,
            hotplug: true,
        })
        .await
        .unwrap();

    let err = binder
        .bind(BindRequest {
            instance: "vm1".to_string(),
            instance_kind: InstanceKind::VirtualMachine,
            device_name: "data".to_string(),
            source: DiskSource::Volume(v.key.clone()),
            path: Some("/mnt/data".to_string()),
            required: false,
            hotplug: true,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::CapabilityUnsupported { .. }));
}

/// Sharing one volume across instances requires a shifted custom
/// filesystem volume.
#[tokio::test]
async fn test_shared_attach_requires_shifted() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Btrfs, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let plain = h
        .lifecycle
        .create_volume(volume_request("p", "plain", "8KiB"))
        .await
        .unwrap();

    let mut shifted = volume_request("p", "shared", "8KiB");
    shifted
        .config
        .insert("security.shifted".to_string(), "true".to_string());
    let shifted = h.lifecycle.create_volume(shifted).await.unwrap();

    let binder = DiskDeviceBinder::new(h.store.clone(), h.drivers.clone(), h.lifecycle.clone());

    let attach = |volume: VolumeKey, instance: &str, device: &str| BindRequest {
        instance: instance.to_string(),
        instance_kind: InstanceKind::Container,
        device_name: device.to_string(),
        source: DiskSource::Volume(volume),
        path: Some("/mnt/data".to_string()),
        required: false,
        hotplug: false,
    };

    binder
        .bind(attach(plain.key.clone(), "c1", "data"))
        .await
        .unwrap();
    let err = binder
        .bind(attach(plain.key.clone(), "c2", "data"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::HasDependents { .. }));

    binder
        .bind(attach(shifted.key.clone(), "c1", "shared"))
        .await
        .unwrap();
    binder
        .bind(attach(shifted.key.clone(), "c2", "shared"))
        .await
        .unwrap();

    // Unbinding frees the device slot again.
    binder.unbind("c1", "data").await.unwrap();
    assert_eq!(binder.instance_devices("c1").await.len(), 1);
}

/// Capability gates fail at validation time: no instances on cephfs, no
/// snapshots on object storage, no pool deletion while volumes exist.
#[tokio::test]
async fn test_capability_and_dependency_gates() {
    let h = harness();
    h.lifecycle
        .create_pool(
            "fs",
            DriverKind::CephFs,
            map(&[("size", "64KiB"), ("cephfs.path", "volumes")]),
        )
        .await
        .unwrap();
    h.lifecycle
        .create_pool("obj", DriverKind::CephObject, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    // cephfs hosts custom volumes only.
    let err = h
        .lifecycle
        .create_volume(CreateVolumeRequest {
            pool: "fs".to_string(),
            name: "root".to_string(),
            kind: VolumeKind::Container,
            content_type: ContentType::Filesystem,
            config: map(&[("size", "8KiB")]),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::CapabilityUnsupported { .. }));

    // Object storage has no snapshot concept.
    let bucket = h
        .lifecycle
        .create_volume(CreateVolumeRequest {
            pool: "obj".to_string(),
            name: "assets".to_string(),
            kind: VolumeKind::Bucket,
            content_type: ContentType::Filesystem,
            config: map(&[("size", "8KiB")]),
        })
        .await
        .unwrap();
    let err = h
        .lifecycle
        .snapshot_volume(&bucket.key, "s")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::CapabilityUnsupported { .. }));

    // A populated pool cannot be destroyed.
    let err = h.lifecycle.delete_pool("obj").await.unwrap_err();
    assert!(matches!(err, StorageError::HasDependents { .. }));
    h.lifecycle
        .delete_volume(&bucket.key, DeleteOptions::default())
        .await
        .unwrap();
    h.lifecycle.delete_pool("obj").await.unwrap();
}

/// Malformed snapshot settings never make it onto a volume, and even a
/// record that carries one (imported metadata) fails its snapshot before
/// the backend is touched, so the name stays usable.
#[tokio::test]
async fn test_bad_expiry_rejected_without_orphan_snapshot() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Btrfs, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let mut request = volume_request("p", "v", "8KiB");
    request
        .config
        .insert("snapshots.expiry".to_string(), "1µ".to_string());
    let err = h.lifecycle.create_volume(request).await.unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));

    // Imported metadata bypasses creation-time validation.
    let driver = h.drivers.get(DriverKind::Btrfs).unwrap();
    let imported = StorageVolume {
        key: VolumeKey::new("p", "v", VolumeKind::Custom),
        content_type: ContentType::Filesystem,
        size_bytes: 8 * KIB,
        config: map(&[("size", "8192"), ("snapshots.expiry", "1µ")]),
        created_at: Utc::now(),
    };
    driver.create_volume(&imported).await.unwrap();
    h.store.insert_volume(imported.clone()).await.unwrap();

    let err = h
        .lifecycle
        .snapshot_volume(&imported.key, "s1")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));
    // The backend never saw the snapshot.
    assert!(matches!(
        driver.read_snapshot(&imported.key, "s1").await.unwrap_err(),
        StorageError::NotFound { .. }
    ));

    // With the expiry repaired the same snapshot name goes through.
    let mut repaired = imported.clone();
    repaired
        .config
        .insert("snapshots.expiry".to_string(), "1d".to_string());
    h.store.update_volume(repaired).await.unwrap();
    let record = h
        .lifecycle
        .snapshot_volume(&imported.key, "s1")
        .await
        .unwrap();
    assert!(record.expires_at.is_some());
}

/// A cancelled creation tears down any partial backend state: no record,
/// no lingering reservation.
#[tokio::test]
async fn test_cancelled_create_leaves_nothing_behind() {
    let h = harness();
    h.lifecycle
        .create_pool("p", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .lifecycle
        .create_volume_with_cancel(volume_request("p", "v", "8KiB"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Cancelled));

    let key = VolumeKey::new("p", "v", VolumeKind::Custom);
    assert!(h.lifecycle.get_volume(&key).await.is_err());
    assert_eq!(h.lifecycle.pool_usage("p").await.unwrap().reserved_bytes, 0);

    // The name is free for a later, uncancelled attempt.
    h.lifecycle
        .create_volume(volume_request("p", "v", "8KiB"))
        .await
        .unwrap();
}

/// Cancelling a streamed migration discards the staged destination
/// volume; nothing becomes visible and no capacity stays reserved.
#[tokio::test]
async fn test_cancelled_migration_discards_staged_volume() {
    let h = harness();
    h.lifecycle
        .create_pool("src", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();
    h.lifecycle
        .create_pool("dst", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let v = h
        .lifecycle
        .create_volume(volume_request("src", "v", "8KiB"))
        .await
        .unwrap();
    let driver = h.drivers.get(DriverKind::Dir).unwrap();
    driver
        .write_volume(&v.key, Bytes::from_static(b"payload"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let migrator = VolumeMigrator::new(h.lifecycle.clone());
    let err = migrator
        .migrate_with_cancel(&v.key, "dst", "v", MigrationOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Cancelled));

    assert!(h
        .store
        .get_volume(&VolumeKey::new("dst", "v", VolumeKind::Custom))
        .await
        .is_err());
    assert_eq!(driver.pool_usage("dst").await.unwrap().reserved_bytes, 0);
}

/// A migration whose commit fails still discards the staged volume
/// instead of leaving it holding destination capacity.
#[tokio::test]
async fn test_failed_commit_discards_staged_volume() {
    let h = harness();
    h.lifecycle
        .create_pool("src", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();
    h.lifecycle
        .create_pool("dst", DriverKind::Dir, map(&[("size", "64KiB")]))
        .await
        .unwrap();

    let v = h
        .lifecycle
        .create_volume(volume_request("src", "v", "8KiB"))
        .await
        .unwrap();
    let driver = h.drivers.get(DriverKind::Dir).unwrap();
    driver
        .write_volume(&v.key, Bytes::from_static(b"payload"))
        .await
        .unwrap();

    // A volume already sits on the destination backend under the target
    // name, unknown to metadata, so the commit rename collides.
    let squatter = StorageVolume {
        key: VolumeKey::new("dst", "v", VolumeKind::Custom),
        content_type: ContentType::Filesystem,
        size_bytes: 4 * KIB,
        config: HashMap::new(),
        created_at: Utc::now(),
    };
    driver.create_volume(&squatter).await.unwrap();

    let migrator = VolumeMigrator::new(h.lifecycle.clone());
    let err = migrator
        .migrate(&v.key, "dst", "v", MigrationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NameConflict(_)));

    // Only the squatter holds destination space; the staged copy is gone
    // and metadata never saw the target.
    assert_eq!(
        driver.pool_usage("dst").await.unwrap().reserved_bytes,
        4 * KIB
    );
    assert!(h.store.get_volume(&squatter.key).await.is_err());
}

/// Remote sources mount as filesystem trees and follow the same path
/// rules as host paths.
#[tokio::test]
async fn test_remote_source_requires_mount_path() {
    let h = harness();
    let binder = DiskDeviceBinder::new(h.store.clone(), h.drivers.clone(), h.lifecycle.clone());

    let attach = |path: Option<&str>| BindRequest {
        instance: "c1".to_string(),
        instance_kind: InstanceKind::Container,
        device_name: "nfs".to_string(),
        source: DiskSource::Remote("ceph:tank/exports/data".to_string()),
        path: path.map(str::to_string),
        required: false,
        hotplug: false,
    };

    let err = binder.bind(attach(None)).await.unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));

    let binding = binder.bind(attach(Some("/mnt/remote"))).await.unwrap();
    assert_eq!(binding.locator, "ceph:tank/exports/data");
}
