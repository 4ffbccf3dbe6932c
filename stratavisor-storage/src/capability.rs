//! Per-driver capability descriptors.
//!
//! Each driver kind maps to one immutable [`Capability`] record. The
//! lifecycle manager, migration transport selector and disk device binder
//! consult it up front so unsupported operations fail at validation time
//! rather than mid-operation.

use crate::types::{
    ContentType, DriverKind, InstanceKind, ProvisioningMode, TransferMode, VolumeKind,
};

/// Static capability descriptor for one driver kind.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub driver: DriverKind,
    /// Instance kinds whose root volumes this driver can host.
    pub instance_kinds: &'static [InstanceKind],
    /// Volume kinds this driver can create.
    pub volume_kinds: &'static [VolumeKind],
    /// Content types this driver can hold.
    pub content_types: &'static [ContentType],
    /// Whether per-volume quotas are enforced.
    pub supports_quota: bool,
    /// Whether snapshots exist at all for this driver.
    pub supports_snapshots: bool,
    /// Copy-on-write snapshot avoiding full data duplication.
    pub optimized_snapshot: bool,
    /// Copy-on-write clone avoiding full data duplication.
    pub optimized_clone: bool,
    /// Backend-native cross-pool transfer preserving thin provisioning
    /// and snapshot history.
    pub optimized_transfer: bool,
    /// Object storage buckets.
    pub supports_buckets: bool,
    /// Provisioning modes this driver permits.
    pub provisioning_modes: &'static [ProvisioningMode],
    pub default_provisioning: ProvisioningMode,
    /// Preferred transfer mode; streaming remains available as fallback
    /// for every driver.
    pub default_transfer: TransferMode,
    /// Whether the backing store lives off-host.
    pub remote: bool,
    /// Content types that may be attached to a running instance.
    pub hot_pluggable: &'static [ContentType],
    /// Restoring a snapshot destroys snapshots newer than the restore
    /// point. Backend-dependent policy, not a global assumption.
    pub restore_removes_newer_snapshots: bool,
    /// Quota enforcement requires an explicit per-volume registration
    /// step on create; child subvolumes are never enrolled implicitly.
    pub quota_requires_registration: bool,
    /// Usage reports count extents retained by snapshots, so reported
    /// usage can exceed live data.
    pub usage_includes_retained_extents: bool,
}

impl Capability {
    pub fn supports_instance_kind(&self, kind: InstanceKind) -> bool {
        self.instance_kinds.contains(&kind)
    }

    pub fn supports_volume_kind(&self, kind: VolumeKind) -> bool {
        self.volume_kinds.contains(&kind)
    }

    pub fn supports_content_type(&self, content: ContentType) -> bool {
        self.content_types.contains(&content)
    }

    pub fn supports_provisioning(&self, mode: ProvisioningMode) -> bool {
        self.provisioning_modes.contains(&mode)
    }

    pub fn hot_pluggable(&self, content: ContentType) -> bool {
        self.hot_pluggable.contains(&content)
    }
}

const BOTH_INSTANCE_KINDS: &[InstanceKind] =
    &[InstanceKind::Container, InstanceKind::VirtualMachine];
const BOTH_CONTENT_TYPES: &[ContentType] = &[ContentType::Filesystem, ContentType::Block];
const INSTANCE_VOLUME_KINDS: &[VolumeKind] = &[
    VolumeKind::Image,
    VolumeKind::Container,
    VolumeKind::VirtualMachine,
    VolumeKind::Custom,
];

static DIR: Capability = Capability {
    driver: DriverKind::Dir,
    instance_kinds: BOTH_INSTANCE_KINDS,
    volume_kinds: INSTANCE_VOLUME_KINDS,
    content_types: BOTH_CONTENT_TYPES,
    supports_quota: false,
    supports_snapshots: true,
    optimized_snapshot: false,
    optimized_clone: false,
    optimized_transfer: false,
    supports_buckets: false,
    provisioning_modes: &[ProvisioningMode::Thick],
    default_provisioning: ProvisioningMode::Thick,
    default_transfer: TransferMode::Stream,
    remote: false,
    hot_pluggable: &[ContentType::Filesystem],
    restore_removes_newer_snapshots: false,
    quota_requires_registration: false,
    usage_includes_retained_extents: false,
};

static BTRFS: Capability = Capability {
    driver: DriverKind::Btrfs,
    instance_kinds: BOTH_INSTANCE_KINDS,
    volume_kinds: &[
        VolumeKind::Image,
        VolumeKind::Container,
        VolumeKind::VirtualMachine,
        VolumeKind::Custom,
        VolumeKind::Bucket,
    ],
    content_types: BOTH_CONTENT_TYPES,
    supports_quota: true,
    supports_snapshots: true,
    optimized_snapshot: true,
    optimized_clone: true,
    optimized_transfer: true,
    supports_buckets: true,
    provisioning_modes: &[ProvisioningMode::Thin],
    default_provisioning: ProvisioningMode::Thin,
    default_transfer: TransferMode::Native,
    remote: false,
    hot_pluggable: &[ContentType::Filesystem],
    restore_removes_newer_snapshots: false,
    quota_requires_registration: true,
    usage_includes_retained_extents: true,
};

static LVM: Capability = Capability {
    driver: DriverKind::Lvm,
    instance_kinds: BOTH_INSTANCE_KINDS,
    volume_kinds: INSTANCE_VOLUME_KINDS,
    content_types: BOTH_CONTENT_TYPES,
    supports_quota: true,
    supports_snapshots: true,
    optimized_snapshot: true,
    optimized_clone: true,
    optimized_transfer: false,
    supports_buckets: false,
    provisioning_modes: &[ProvisioningMode::Thin, ProvisioningMode::Thick],
    default_provisioning: ProvisioningMode::Thin,
    default_transfer: TransferMode::Stream,
    remote: false,
    hot_pluggable: &[ContentType::Block],
    restore_removes_newer_snapshots: true,
    quota_requires_registration: false,
    usage_includes_retained_extents: false,
};

static CEPH_RBD: Capability = Capability {
    driver: DriverKind::CephRbd,
    instance_kinds: BOTH_INSTANCE_KINDS,
    volume_kinds: INSTANCE_VOLUME_KINDS,
    content_types: BOTH_CONTENT_TYPES,
    supports_quota: true,
    supports_snapshots: true,
    optimized_snapshot: true,
    optimized_clone: true,
    optimized_transfer: true,
    supports_buckets: false,
    provisioning_modes: &[ProvisioningMode::Thin],
    default_provisioning: ProvisioningMode::Thin,
    default_transfer: TransferMode::Native,
    remote: true,
    hot_pluggable: &[ContentType::Block],
    restore_removes_newer_snapshots: true,
    quota_requires_registration: false,
    usage_includes_retained_extents: false,
};

static CEPH_FS: Capability = Capability {
    driver: DriverKind::CephFs,
    instance_kinds: &[],
    volume_kinds: &[VolumeKind::Custom],
    content_types: &[ContentType::Filesystem],
    supports_quota: true,
    supports_snapshots: true,
    optimized_snapshot: false,
    optimized_clone: false,
    optimized_transfer: false,
    supports_buckets: false,
    provisioning_modes: &[ProvisioningMode::Thin],
    default_provisioning: ProvisioningMode::Thin,
    default_transfer: TransferMode::Stream,
    remote: true,
    hot_pluggable: &[ContentType::Filesystem],
    restore_removes_newer_snapshots: false,
    quota_requires_registration: false,
    usage_includes_retained_extents: false,
};

static CEPH_OBJECT: Capability = Capability {
    driver: DriverKind::CephObject,
    instance_kinds: &[],
    volume_kinds: &[VolumeKind::Custom, VolumeKind::Bucket],
    content_types: &[ContentType::Filesystem],
    supports_quota: true,
    supports_snapshots: false,
    optimized_snapshot: false,
    optimized_clone: false,
    optimized_transfer: false,
    supports_buckets: true,
    provisioning_modes: &[ProvisioningMode::Thin],
    default_provisioning: ProvisioningMode::Thin,
    default_transfer: TransferMode::Stream,
    remote: true,
    hot_pluggable: &[],
    restore_removes_newer_snapshots: false,
    quota_requires_registration: false,
    usage_includes_retained_extents: false,
};

impl DriverKind {
    /// The immutable capability descriptor for this driver kind.
    pub fn capability(self) -> &'static Capability {
        match self {
            DriverKind::Dir => &DIR,
            DriverKind::Btrfs => &BTRFS,
            DriverKind::Lvm => &LVM,
            DriverKind::CephRbd => &CEPH_RBD,
            DriverKind::CephFs => &CEPH_FS,
            DriverKind::CephObject => &CEPH_OBJECT,
        }
    }
}
