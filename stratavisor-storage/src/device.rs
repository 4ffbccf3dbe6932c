//! Disk device bindings between instances and storage.
//!
//! A binding ties one instance device slot to a managed volume, a host
//! path or a remote locator. Validation happens here, up front: mount
//! path rules, hot-plug support, and shared-access rules all come from
//! the capability descriptor and the volume's configuration, so an
//! attach either fails immediately or is known to be startable.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::backend::DriverRegistry;
use crate::config::{initial_volume_config, INITIAL_CONFIG_PREFIX};
use crate::error::{Result, StorageError};
use crate::lifecycle::{CreateVolumeRequest, VolumeLifecycleManager};
use crate::store::MetadataStore;
use crate::types::{
    ContentType, DiskDeviceBinding, DiskSource, InstanceKind, StorageVolume, VolumeKind, VolumeKey,
};

/// Device slot name reserved for an instance's root disk.
pub const ROOT_DEVICE_NAME: &str = "root";

/// Request to attach a disk device to an instance.
#[derive(Debug, Clone)]
pub struct BindRequest {
    pub instance: String,
    pub instance_kind: InstanceKind,
    pub device_name: String,
    pub source: DiskSource,
    /// Mount path inside the instance. Mandatory for filesystem content,
    /// forbidden for block content.
    pub path: Option<String>,
    pub required: bool,
    /// The instance is running and the device must attach live.
    pub hotplug: bool,
}

/// The disk device binder.
pub struct DiskDeviceBinder {
    store: Arc<MetadataStore>,
    drivers: Arc<DriverRegistry>,
    lifecycle: Arc<VolumeLifecycleManager>,
}

impl DiskDeviceBinder {
    pub fn new(
        store: Arc<MetadataStore>,
        drivers: Arc<DriverRegistry>,
        lifecycle: Arc<VolumeLifecycleManager>,
    ) -> Self {
        Self {
            store,
            drivers,
            lifecycle,
        }
    }

    /// Attach a disk device to an instance.
    #[instrument(skip(self, request), fields(instance = %request.instance, device = %request.device_name))]
    pub async fn bind(&self, request: BindRequest) -> Result<DiskDeviceBinding> {
        let (shifted, locator) = match &request.source {
            DiskSource::Volume(key) => {
                let volume = self.store.get_volume(key).await?;
                self.validate_volume_attach(&request, key, &volume).await?;

                let pool = self.store.get_pool(&key.pool).await?;
                let resolved = self.drivers.get(pool.driver)?.attach_source(key).await?;
                let locator = match resolved {
                    DiskSource::HostPath(path) | DiskSource::Remote(path) => path,
                    DiskSource::Volume(key) => key.to_string(),
                };
                (volume_is_shifted(&volume), locator)
            }
            DiskSource::HostPath(path) => {
                self.validate_path_rules(&request, ContentType::Filesystem)?;
                (false, path.clone())
            }
            DiskSource::Remote(locator) => {
                // Remote locators attach as mountable trees, same rules as
                // host paths.
                self.validate_path_rules(&request, ContentType::Filesystem)?;
                (false, locator.clone())
            }
        };

        let binding = DiskDeviceBinding {
            instance: request.instance.clone(),
            instance_kind: request.instance_kind,
            device_name: request.device_name.clone(),
            source: request.source.clone(),
            locator,
            path: request.path.clone(),
            required: request.required,
            shifted,
            hotplugged: request.hotplug,
        };

        self.store.insert_binding(binding.clone()).await?;
        info!(hotplug = request.hotplug, "Disk device bound");
        Ok(binding)
    }

    /// Detach a disk device from an instance.
    #[instrument(skip(self))]
    pub async fn unbind(&self, instance: &str, device_name: &str) -> Result<DiskDeviceBinding> {
        let binding = self.store.remove_binding(instance, device_name).await?;
        info!("Disk device unbound");
        Ok(binding)
    }

    /// All devices bound to an instance.
    pub async fn instance_devices(&self, instance: &str) -> Vec<DiskDeviceBinding> {
        self.store.instance_bindings(instance).await
    }

    /// Create an instance's root volume and bind it as the `root` device.
    ///
    /// Any `initial.*` keys in the device configuration are applied to the
    /// root volume at creation and then discarded; they never persist on
    /// the binding.
    #[instrument(skip(self, device_config), fields(instance = %instance, pool = %pool))]
    pub async fn create_instance_root(
        &self,
        instance: &str,
        instance_kind: InstanceKind,
        pool: &str,
        device_config: &HashMap<String, String>,
    ) -> Result<(StorageVolume, DiskDeviceBinding)> {
        let pool_record = self.store.get_pool(pool).await?;
        let caps = pool_record.driver.capability();

        if !caps.supports_instance_kind(instance_kind) {
            return Err(StorageError::CapabilityUnsupported {
                driver: pool_record.driver.to_string(),
                operation: format!("{:?} instances", instance_kind),
            });
        }

        let (volume_kind, content_type, path) = match instance_kind {
            InstanceKind::Container => (
                VolumeKind::Container,
                ContentType::Filesystem,
                Some("/".to_string()),
            ),
            InstanceKind::VirtualMachine => (VolumeKind::VirtualMachine, ContentType::Block, None),
        };

        let mut config = initial_volume_config(pool_record.driver, device_config)?;
        if let Some(size) = device_config.get("size") {
            config.insert("size".to_string(), size.clone());
        }

        let volume = self
            .lifecycle
            .create_volume(CreateVolumeRequest {
                pool: pool.to_string(),
                name: instance.to_string(),
                kind: volume_kind,
                content_type,
                config,
            })
            .await?;

        let binding = self
            .bind(BindRequest {
                instance: instance.to_string(),
                instance_kind,
                device_name: ROOT_DEVICE_NAME.to_string(),
                source: DiskSource::Volume(volume.key.clone()),
                path,
                required: true,
                hotplug: false,
            })
            .await?;

        Ok((volume, binding))
    }

    async fn validate_volume_attach(
        &self,
        request: &BindRequest,
        key: &VolumeKey,
        volume: &StorageVolume,
    ) -> Result<()> {
        let pool = self.store.get_pool(&key.pool).await?;
        let caps = pool.driver.capability();

        if !caps.supports_instance_kind(request.instance_kind) {
            return Err(StorageError::CapabilityUnsupported {
                driver: pool.driver.to_string(),
                operation: format!("{:?} instances", request.instance_kind),
            });
        }

        self.validate_path_rules(request, volume.content_type)?;

        if request.hotplug {
            self.validate_hotplug(request, &pool, volume)?;
        }

        // A root volume belongs to exactly one instance; custom volumes
        // can be shared, but only shifted filesystem volumes, since two
        // unshifted ID maps over the same data corrupt ownership.
        let existing = self.store.volume_bindings(key).await;
        let shared_with_other = existing.iter().any(|b| b.instance != request.instance);
        if shared_with_other {
            let sharable = key.kind == VolumeKind::Custom
                && volume.content_type == ContentType::Filesystem
                && volume_is_shifted(volume);
            if !sharable {
                return Err(StorageError::HasDependents {
                    blockers: existing
                        .iter()
                        .map(|b| format!("instance {} device {}", b.instance, b.device_name))
                        .collect(),
                });
            }
        }

        Ok(())
    }

    fn validate_path_rules(&self, request: &BindRequest, content: ContentType) -> Result<()> {
        match content {
            ContentType::Filesystem if request.path.is_none() => Err(StorageError::Config(
                format!(
                    "Device {} attaches filesystem content and requires a mount path",
                    request.device_name
                ),
            )),
            ContentType::Block if request.path.is_some() => Err(StorageError::Config(format!(
                "Device {} attaches block content and must not set a mount path",
                request.device_name
            ))),
            _ => Ok(()),
        }
    }

    fn validate_hotplug(
        &self,
        request: &BindRequest,
        pool: &crate::types::StoragePool,
        volume: &StorageVolume,
    ) -> Result<()> {
        let caps = pool.driver.capability();

        let supported = match request.instance_kind {
            // Containers hot-attach whatever the driver can live-mount.
            InstanceKind::Container => caps.hot_pluggable(volume.content_type),
            // VM hot-plug is a block device operation only.
            InstanceKind::VirtualMachine => {
                volume.content_type == ContentType::Block
                    && caps.hot_pluggable(ContentType::Block)
            }
        };

        if supported {
            Ok(())
        } else {
            Err(StorageError::CapabilityUnsupported {
                driver: pool.driver.to_string(),
                operation: format!(
                    "hot-plugging {:?} content into a running {:?}",
                    volume.content_type, request.instance_kind
                ),
            })
        }
    }
}

fn volume_is_shifted(volume: &StorageVolume) -> bool {
    volume
        .config
        .get("security.shifted")
        .is_some_and(|v| v == "true")
}

/// Whether a device configuration key is part of the creation-time
/// `initial.*` overlay rather than the binding itself.
pub fn is_initial_config_key(key: &str) -> bool {
    key.starts_with(INITIAL_CONFIG_PREFIX)
}
