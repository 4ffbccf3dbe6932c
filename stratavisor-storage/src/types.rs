//! Storage type definitions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage driver kind. A closed set: adding a backend means adding a
/// variant plus its capability descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Plain directory tree (file-based)
    Dir,
    /// Btrfs subvolumes (copy-on-write filesystem)
    Btrfs,
    /// LVM logical volumes (block-based)
    Lvm,
    /// Ceph RBD (block-based, distributed)
    CephRbd,
    /// CephFS (file-based, distributed)
    CephFs,
    /// Ceph RADOS gateway (object storage, distributed)
    CephObject,
}

impl DriverKind {
    /// Driver name as used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Dir => "dir",
            DriverKind::Btrfs => "btrfs",
            DriverKind::Lvm => "lvm",
            DriverKind::CephRbd => "ceph_rbd",
            DriverKind::CephFs => "ceph_fs",
            DriverKind::CephObject => "ceph_object",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of instance a volume can back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Container,
    VirtualMachine,
}

/// What a volume holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// A mountable filesystem tree.
    Filesystem,
    /// A raw block device image.
    Block,
}

/// Kind of a storage volume. Snapshots are modeled as children of their
/// parent volume, not as a volume kind of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    /// Cached image volume.
    Image,
    /// Container root filesystem.
    Container,
    /// Virtual machine root disk.
    VirtualMachine,
    /// User-created data volume.
    Custom,
    /// Object storage bucket.
    Bucket,
}

impl VolumeKind {
    /// The instance kind a root volume backs, if any.
    pub fn instance_kind(&self) -> Option<InstanceKind> {
        match self {
            VolumeKind::Container => Some(InstanceKind::Container),
            VolumeKind::VirtualMachine => Some(InstanceKind::VirtualMachine),
            _ => None,
        }
    }
}

/// Space allocation strategy for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningMode {
    /// Allocate backing space on demand.
    Thin,
    /// Reserve the full declared size eagerly.
    Thick,
}

/// Transfer mechanism for cross-pool copy and move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Backend-native block/dataset transfer.
    Native,
    /// Generic streaming byte copy.
    Stream,
}

/// A named logical grouping of backing storage managed by one driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    /// Pool name, unique process-wide.
    pub name: String,
    /// Driver managing this pool.
    pub driver: DriverKind,
    /// Normalized driver-scoped configuration.
    pub config: HashMap<String, String>,
    /// Source locator: path, device or remote locator string.
    pub source: String,
    /// Space allocation strategy.
    pub provisioning: ProvisioningMode,
    /// Logical capacity in bytes. Declared volume sizes reserve against
    /// this; thin drivers allocate physical extents lazily within it.
    pub capacity_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Identity of a volume: pool plus project-scoped name plus kind.
///
/// `name` is already project-scoped by the caller (the project prefix is
/// applied by the request front end, which owns project semantics).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeKey {
    pub pool: String,
    pub name: String,
    pub kind: VolumeKind,
}

impl VolumeKey {
    pub fn new(pool: impl Into<String>, name: impl Into<String>, kind: VolumeKind) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
            kind,
        }
    }
}

impl std::fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pool, self.name)
    }
}

/// An individually addressable unit of storage within a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageVolume {
    pub key: VolumeKey,
    pub content_type: ContentType,
    /// Declared size/quota in bytes.
    pub size_bytes: u64,
    /// Normalized volume configuration, with pool-level `volume.*`
    /// defaults already folded in.
    pub config: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// An immutable, named, point-in-time child of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Parent volume.
    pub volume: VolumeKey,
    /// Snapshot name, unique within the parent volume.
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// When the snapshot becomes eligible for pruning, if an expiry is
    /// configured.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Pool-level space accounting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolUsage {
    /// Logical capacity of the pool.
    pub total_bytes: u64,
    /// Bytes reserved by declared volume sizes.
    pub reserved_bytes: u64,
    /// Bytes physically allocated by the backend.
    pub allocated_bytes: u64,
}

impl PoolUsage {
    /// Unreserved logical capacity.
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.reserved_bytes)
    }
}

/// Volume-level space accounting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VolumeUsage {
    /// Bytes the backend reports as used.
    pub used_bytes: u64,
    /// Live data bytes, excluding superseded extents.
    pub live_bytes: u64,
    /// True when `used_bytes` counts extents retained only by snapshots.
    /// Extent-based copy-on-write backends report quota pressure above
    /// live data usage until superseded extents are fully dereferenced;
    /// callers must treat this as expected, not a leak.
    pub includes_retained_extents: bool,
}

/// Where a disk device gets its bytes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskSource {
    /// A managed volume in a pool.
    Volume(VolumeKey),
    /// A raw path on the host.
    HostPath(String),
    /// A pre-existing remote resource locator (e.g. an RBD image spec).
    Remote(String),
}

/// Association of one instance with one volume or external path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskDeviceBinding {
    /// Instance the device belongs to.
    pub instance: String,
    pub instance_kind: InstanceKind,
    /// Device slot name, unique per instance.
    pub device_name: String,
    /// What the device logically attaches. Volume sources keep their
    /// [`VolumeKey`] here so the volume's deletion stays blocked.
    pub source: DiskSource,
    /// Host-side locator the driver resolved at bind time: a mount path,
    /// a device node or a remote spec.
    pub locator: String,
    /// Mount path inside the instance. Mandatory for filesystem content,
    /// forbidden for block content.
    pub path: Option<String>,
    /// Whether instance startup fails if the device cannot be attached.
    pub required: bool,
    /// ID-shifted access, allowing the volume to be shared across
    /// instances when driver and configuration permit.
    pub shifted: bool,
    /// True when the device was added to a running instance.
    pub hotplugged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_wire_names() {
        let json = serde_json::to_string(&DriverKind::CephRbd).unwrap();
        assert_eq!(json, "\"ceph_rbd\"");
        let back: DriverKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DriverKind::CephRbd);
    }

    #[test]
    fn test_volume_key_display() {
        let key = VolumeKey::new("default", "web-data", VolumeKind::Custom);
        assert_eq!(key.to_string(), "default/web-data");
    }

    #[test]
    fn test_pool_usage_free_saturates() {
        let usage = PoolUsage {
            total_bytes: 100,
            reserved_bytes: 150,
            allocated_bytes: 0,
        };
        assert_eq!(usage.free_bytes(), 0);
    }
}
