//! # stratavisor Storage
//!
//! Storage backend abstraction: pools, volumes, snapshots and the
//! operations that move data between them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │   VolumeLifecycleManager / VolumeMigrator /      │
//! │   SnapshotScheduler / DiskDeviceBinder           │
//! └───────────────────────┬──────────────────────────┘
//!                         │  capability-gated dispatch
//!                         ▼
//! ┌──────────────────────────────────────────────────┐
//! │              StorageDriver trait                 │
//! │  (create_volume, snapshot, clone, transfer...)   │
//! └───────────────────────┬──────────────────────────┘
//!          ┌──────┬───────┼────────┬─────────┬───────┐
//!          ▼      ▼       ▼        ▼         ▼       ▼
//!         dir   btrfs    lvm    ceph_rbd  ceph_fs  ceph_object
//! ```
//!
//! Every driver ships a static [`Capability`] descriptor; the layers above
//! consult it so unsupported operations fail at validation time instead of
//! mid-operation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use stratavisor_storage::{
//!     CreateVolumeRequest, DriverKind, DriverRegistry, MetadataStore,
//!     VolumeLifecycleManager,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MetadataStore::new();
//!     let drivers = DriverRegistry::with_defaults();
//!     let lifecycle = Arc::new(VolumeLifecycleManager::new(store, drivers));
//!
//!     lifecycle
//!         .create_pool("default", DriverKind::Btrfs, HashMap::new())
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod backend;
pub mod capability;
pub mod config;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod migration;
pub mod scheduler;
pub mod store;
pub mod types;

pub use backend::{DriverRegistry, StorageDriver};
pub use capability::Capability;
pub use device::{BindRequest, DiskDeviceBinder, ROOT_DEVICE_NAME};
pub use error::{Result, StorageError};
pub use lifecycle::{
    CloneSource, CreateVolumeRequest, DeleteOptions, VolumeLifecycleManager,
};
pub use migration::{select_transport, MigrationOptions, VolumeMigrator};
pub use scheduler::SnapshotScheduler;
pub use store::MetadataStore;
pub use types::*;
