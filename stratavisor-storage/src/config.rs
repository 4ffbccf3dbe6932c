//! Pool and volume configuration validation.
//!
//! Configuration is a flat string key/value map scoped by driver. Every key
//! has a declared type, an optional applicability condition and a default.
//! Validation is pure: it rejects unknown keys, failed type coercions and
//! unmet conditions, and returns a normalized map with defaults filled in.
//! Persistence is the caller's concern.

use std::collections::HashMap;

use stratavisor_common::units::parse_byte_size;

use crate::error::{Result, StorageError};
use crate::types::{ContentType, DriverKind, ProvisioningMode, VolumeKind};

/// Declared type of a configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Str,
    Bool,
    Int,
    /// Byte size with the shared suffix grammar; normalized to a plain
    /// byte count string.
    Size,
    /// Cron schedule list (or alias), kept verbatim once it parses.
    Schedule,
    /// Snapshot expiry span, kept verbatim once it parses.
    Expiry,
}

/// Applicability condition attached to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Only valid on thin-provisioned pools.
    ThinOnly,
    /// Only valid on custom volumes.
    CustomVolumeOnly,
    /// Only valid for block content volumes.
    BlockContentOnly,
}

/// One entry in a driver's configuration schema.
#[derive(Debug, Clone, Copy)]
pub struct KeyRule {
    pub name: &'static str,
    pub key_type: KeyType,
    pub condition: Option<Condition>,
    pub default: Option<&'static str>,
}

const fn rule(name: &'static str, key_type: KeyType) -> KeyRule {
    KeyRule {
        name,
        key_type,
        condition: None,
        default: None,
    }
}

const fn rule_with(
    name: &'static str,
    key_type: KeyType,
    condition: Option<Condition>,
    default: Option<&'static str>,
) -> KeyRule {
    KeyRule {
        name,
        key_type,
        condition,
        default,
    }
}

/// Pool keys every driver accepts.
const COMMON_POOL_RULES: &[KeyRule] = &[
    rule("source", KeyType::Str),
    rule("size", KeyType::Size),
    rule("rsync.bwlimit", KeyType::Size),
    rule_with("rsync.compression", KeyType::Bool, None, Some("true")),
];

/// Volume keys every driver accepts.
const COMMON_VOLUME_RULES: &[KeyRule] = &[
    rule("size", KeyType::Size),
    rule("snapshots.schedule", KeyType::Schedule),
    rule_with("snapshots.pattern", KeyType::Str, None, Some("snap%d")),
    rule("snapshots.expiry", KeyType::Expiry),
    rule_with(
        "security.shifted",
        KeyType::Bool,
        Some(Condition::CustomVolumeOnly),
        None,
    ),
    rule_with(
        "security.unmapped",
        KeyType::Bool,
        Some(Condition::CustomVolumeOnly),
        None,
    ),
    rule_with(
        "block.filesystem",
        KeyType::Str,
        Some(Condition::BlockContentOnly),
        None,
    ),
    rule_with(
        "block.mount_options",
        KeyType::Str,
        Some(Condition::BlockContentOnly),
        None,
    ),
];

const BTRFS_POOL_RULES: &[KeyRule] = &[rule("btrfs.mount_options", KeyType::Str)];

const LVM_POOL_RULES: &[KeyRule] = &[
    rule_with("lvm.use_thinpool", KeyType::Bool, None, Some("true")),
    rule_with(
        "lvm.thinpool_name",
        KeyType::Str,
        Some(Condition::ThinOnly),
        Some("thinpool"),
    ),
    rule("lvm.vg_name", KeyType::Str),
];

const CEPH_RBD_POOL_RULES: &[KeyRule] = &[
    rule_with("ceph.cluster_name", KeyType::Str, None, Some("ceph")),
    rule_with("ceph.user.name", KeyType::Str, None, Some("admin")),
    rule("ceph.osd.pool_name", KeyType::Str),
    rule("ceph.rbd.features", KeyType::Str),
];

const CEPH_FS_POOL_RULES: &[KeyRule] = &[
    rule_with("cephfs.cluster_name", KeyType::Str, None, Some("ceph")),
    rule_with("cephfs.user.name", KeyType::Str, None, Some("admin")),
    rule("cephfs.path", KeyType::Str),
];

const CEPH_OBJECT_POOL_RULES: &[KeyRule] = &[
    rule_with("cephobject.cluster_name", KeyType::Str, None, Some("ceph")),
    rule("cephobject.radosgw.endpoint", KeyType::Str),
];

const LVM_VOLUME_RULES: &[KeyRule] = &[
    rule_with(
        "lvm.stripes",
        KeyType::Int,
        Some(Condition::BlockContentOnly),
        None,
    ),
    rule_with(
        "lvm.stripes.size",
        KeyType::Size,
        Some(Condition::BlockContentOnly),
        None,
    ),
];

fn driver_pool_rules(driver: DriverKind) -> &'static [KeyRule] {
    match driver {
        DriverKind::Dir => &[],
        DriverKind::Btrfs => BTRFS_POOL_RULES,
        DriverKind::Lvm => LVM_POOL_RULES,
        DriverKind::CephRbd => CEPH_RBD_POOL_RULES,
        DriverKind::CephFs => CEPH_FS_POOL_RULES,
        DriverKind::CephObject => CEPH_OBJECT_POOL_RULES,
    }
}

fn driver_volume_rules(driver: DriverKind) -> &'static [KeyRule] {
    match driver {
        DriverKind::Lvm => LVM_VOLUME_RULES,
        _ => &[],
    }
}

fn find_rule<'a>(rules: &'a [KeyRule], extra: &'a [KeyRule], name: &str) -> Option<&'a KeyRule> {
    rules
        .iter()
        .chain(extra.iter())
        .find(|r| r.name == name)
}

/// Coerce a raw value to its declared type, returning the normalized form.
fn normalize_value(rule: &KeyRule, value: &str) -> Result<String> {
    match rule.key_type {
        KeyType::Str => Ok(value.to_string()),
        KeyType::Bool => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok("true".to_string()),
            "false" | "0" | "no" | "off" => Ok("false".to_string()),
            _ => Err(StorageError::Config(format!(
                "Key {} expects a boolean, got {:?}",
                rule.name, value
            ))),
        },
        KeyType::Int => value
            .parse::<i64>()
            .map(|v| v.to_string())
            .map_err(|_| {
                StorageError::Config(format!(
                    "Key {} expects an integer, got {:?}",
                    rule.name, value
                ))
            }),
        KeyType::Size => {
            let bytes = parse_byte_size(value).map_err(|e| {
                StorageError::Config(format!("Key {}: {}", rule.name, e))
            })?;
            Ok(bytes.to_string())
        }
        // Schedule and expiry values stay verbatim; parsing here rejects
        // malformed ones before they reach the scheduler.
        KeyType::Schedule => {
            crate::scheduler::parse_schedules(value)
                .map_err(|e| StorageError::Config(format!("Key {}: {}", rule.name, e)))?;
            Ok(value.to_string())
        }
        KeyType::Expiry => {
            if !value.trim().is_empty() {
                crate::scheduler::parse_expiry(value)
                    .map_err(|e| StorageError::Config(format!("Key {}: {}", rule.name, e)))?;
            }
            Ok(value.to_string())
        }
    }
}

fn check_condition(
    rule: &KeyRule,
    provisioning: ProvisioningMode,
    volume: Option<(VolumeKind, ContentType)>,
) -> Result<()> {
    let Some(condition) = rule.condition else {
        return Ok(());
    };

    let ok = match condition {
        Condition::ThinOnly => provisioning == ProvisioningMode::Thin,
        Condition::CustomVolumeOnly => matches!(volume, Some((VolumeKind::Custom, _))),
        Condition::BlockContentOnly => matches!(volume, Some((_, ContentType::Block))),
    };

    if ok {
        Ok(())
    } else {
        let requirement = match condition {
            Condition::ThinOnly => "thin-provisioned pools",
            Condition::CustomVolumeOnly => "custom volumes",
            Condition::BlockContentOnly => "block content volumes",
        };
        Err(StorageError::Config(format!(
            "Key {} is only valid for {}",
            rule.name, requirement
        )))
    }
}

/// Determine the pool's provisioning mode from its raw configuration,
/// checking it against the driver's permitted modes.
pub fn resolve_provisioning(driver: DriverKind, config: &HashMap<String, String>) -> Result<ProvisioningMode> {
    let caps = driver.capability();

    let mode = if driver == DriverKind::Lvm {
        match config.get("lvm.use_thinpool").map(String::as_str) {
            Some("false") | Some("0") | Some("no") | Some("off") => ProvisioningMode::Thick,
            _ => ProvisioningMode::Thin,
        }
    } else {
        caps.default_provisioning
    };

    if !caps.supports_provisioning(mode) {
        return Err(StorageError::Config(format!(
            "Driver {} does not permit {:?} provisioning",
            driver, mode
        )));
    }

    Ok(mode)
}

/// Validate and normalize a pool configuration map.
///
/// Keys prefixed with `volume.` declare pool-level defaults for volume
/// configuration and are validated against the volume schema (type only;
/// kind and content conditions apply when a concrete volume inherits them).
pub fn validate_pool_config(
    driver: DriverKind,
    config: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let provisioning = resolve_provisioning(driver, config)?;
    let extra = driver_pool_rules(driver);
    let mut normalized = HashMap::new();

    for (key, value) in config {
        if let Some(volume_key) = key.strip_prefix("volume.") {
            let rule = find_rule(COMMON_VOLUME_RULES, driver_volume_rules(driver), volume_key)
                .ok_or_else(|| {
                    StorageError::Config(format!(
                        "Unknown volume default key {:?} for driver {}",
                        key, driver
                    ))
                })?;
            normalized.insert(key.clone(), normalize_value(rule, value)?);
            continue;
        }

        let rule = find_rule(COMMON_POOL_RULES, extra, key).ok_or_else(|| {
            StorageError::Config(format!("Unknown key {:?} for driver {}", key, driver))
        })?;
        check_condition(rule, provisioning, None)?;
        normalized.insert(key.clone(), normalize_value(rule, value)?);
    }

    for rule in COMMON_POOL_RULES.iter().chain(extra.iter()) {
        if let Some(default) = rule.default {
            if !normalized.contains_key(rule.name)
                && check_condition(rule, provisioning, None).is_ok()
            {
                normalized.insert(rule.name.to_string(), default.to_string());
            }
        }
    }

    Ok(normalized)
}

/// Validate and normalize a volume configuration map.
pub fn validate_volume_config(
    driver: DriverKind,
    kind: VolumeKind,
    content_type: ContentType,
    provisioning: ProvisioningMode,
    config: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let extra = driver_volume_rules(driver);
    let mut normalized = HashMap::new();

    for (key, value) in config {
        let rule = find_rule(COMMON_VOLUME_RULES, extra, key).ok_or_else(|| {
            StorageError::Config(format!(
                "Unknown volume key {:?} for driver {}",
                key, driver
            ))
        })?;
        check_condition(rule, provisioning, Some((kind, content_type)))?;
        normalized.insert(key.clone(), normalize_value(rule, value)?);
    }

    for rule in COMMON_VOLUME_RULES.iter().chain(extra.iter()) {
        if let Some(default) = rule.default {
            if !normalized.contains_key(rule.name)
                && check_condition(rule, provisioning, Some((kind, content_type))).is_ok()
            {
                normalized.insert(rule.name.to_string(), default.to_string());
            }
        }
    }

    Ok(normalized)
}

/// Fold pool-level `volume.<key>` defaults into a volume's configuration.
///
/// A default applies only when the volume does not set the key itself and
/// the key's condition holds for this volume.
pub fn effective_volume_config(
    driver: DriverKind,
    kind: VolumeKind,
    content_type: ContentType,
    provisioning: ProvisioningMode,
    pool_config: &HashMap<String, String>,
    volume_config: &HashMap<String, String>,
) -> HashMap<String, String> {
    let extra = driver_volume_rules(driver);
    let mut effective = volume_config.clone();

    for (key, value) in pool_config {
        let Some(volume_key) = key.strip_prefix("volume.") else {
            continue;
        };
        if effective.contains_key(volume_key) {
            continue;
        }
        let Some(rule) = find_rule(COMMON_VOLUME_RULES, extra, volume_key) else {
            continue;
        };
        if check_condition(rule, provisioning, Some((kind, content_type))).is_ok() {
            effective.insert(volume_key.to_string(), value.clone());
        }
    }

    effective
}

/// Prefix marking a disk device config key as creation-time volume
/// configuration.
pub const INITIAL_CONFIG_PREFIX: &str = "initial.";

/// Extract the `initial.*` overlay from a disk device configuration.
///
/// The overlay applies exclusively to an instance's root volume at the
/// moment the instance is created and is discarded thereafter. It may not
/// carry `size` or custom-volume-only keys.
pub fn initial_volume_config(
    driver: DriverKind,
    device_config: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let extra = driver_volume_rules(driver);
    let mut overlay = HashMap::new();

    for (key, value) in device_config {
        let Some(volume_key) = key.strip_prefix(INITIAL_CONFIG_PREFIX) else {
            continue;
        };

        if volume_key == "size" {
            return Err(StorageError::Config(
                "initial.size is not allowed; set the device size directly".to_string(),
            ));
        }

        let rule = find_rule(COMMON_VOLUME_RULES, extra, volume_key).ok_or_else(|| {
            StorageError::Config(format!("Unknown initial volume key {:?}", key))
        })?;

        if rule.condition == Some(Condition::CustomVolumeOnly) {
            return Err(StorageError::Config(format!(
                "Key {} is custom-volume-only and cannot be set at instance creation",
                volume_key
            )));
        }

        overlay.insert(volume_key.to_string(), normalize_value(rule, value)?);
    }

    Ok(overlay)
}
