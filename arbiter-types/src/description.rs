// SPDX-License-Identifier: GPL-3.0-only

//! Disk description maps
//!
//! A description is the cached property map the device feed reports for a
//! disk. Clients match registrations against it and watch individual keys.

use std::collections::BTreeMap;

use serde_json::Value;

/// Property map describing a disk
pub type Description = BTreeMap<String, Value>;

/// Well-known description keys
pub mod keys {
    /// `true` when the disk is a whole physical medium rather than a volume
    pub const MEDIA_WHOLE: &str = "media.whole";
    /// `true` when the medium is removable
    pub const MEDIA_REMOVABLE: &str = "media.removable";
    /// `true` when the medium can be ejected
    pub const MEDIA_EJECTABLE: &str = "media.ejectable";
    /// Size of the medium in bytes
    pub const MEDIA_SIZE: &str = "media.size";
    /// Physical unit shared by a whole disk and all of its volumes
    pub const DEVICE_UNIT: &str = "device.unit";
    /// Device node path
    pub const DEVICE_PATH: &str = "device.path";
    /// `true` when unmounting the volume must unmount every volume of the unit
    pub const VOLUME_MULTI: &str = "volume.multi";
    /// Filesystem type of the volume
    pub const VOLUME_KIND: &str = "volume.kind";
    /// Filesystem label
    pub const VOLUME_NAME: &str = "volume.name";
    /// Current mount point
    pub const VOLUME_PATH: &str = "volume.path";
    /// Filesystem UUID
    pub const VOLUME_UUID: &str = "volume.uuid";
    /// `true` once a session adopted the disk
    pub const DISK_ADOPTED: &str = "disk.adopted";
}

/// Reads a boolean property, treating anything other than `true` as false
pub fn flag(description: &Description, key: &str) -> bool {
    matches!(description.get(key), Some(Value::Bool(true)))
}

/// Reads a string property
pub fn text<'a>(description: &'a Description, key: &str) -> Option<&'a str> {
    description.get(key).and_then(Value::as_str)
}

/// Keys that were added, removed, or changed between two descriptions, sorted
pub fn changed_keys(old: &Description, new: &Description) -> Vec<String> {
    let mut keys: Vec<String> = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();

    keys.extend(
        old.keys()
            .filter(|key| !new.contains_key(*key))
            .cloned(),
    );

    keys.sort();
    keys
}

/// A description matches a pattern when every pattern entry is present with an equal value
pub fn description_matches(description: &Description, pattern: &Description) -> bool {
    pattern
        .iter()
        .all(|(key, value)| description.get(key) == Some(value))
}
