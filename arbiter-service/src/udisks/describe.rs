// SPDX-License-Identifier: GPL-3.0-only

//! Builds broker disk records from UDisks2 block objects

use anyhow::Result;
use arbiter_types::description::keys;
use arbiter_types::{Description, Disk};
use serde_json::json;
use udisks2::{
    block::BlockProxy, drive::DriveProxy, filesystem::FilesystemProxy, partition::PartitionProxy,
};
use zbus::Connection;

use super::decode_c_string;

/// Describes the block object at `block_path`.
///
/// Returns `None` for objects the arbiter does not manage: empty media and
/// devices UDisks2 asks tools to ignore.
pub(crate) async fn describe_block(connection: &Connection, block_path: &str) -> Result<Option<Disk>> {
    let block = BlockProxy::builder(connection)
        .path(block_path)?
        .build()
        .await?;

    let size = block.size().await?;
    if size == 0 || block.hint_ignore().await.unwrap_or(false) {
        return Ok(None);
    }

    let preferred = decode_c_string(&block.preferred_device().await?);
    let device_path = if preferred.is_empty() {
        decode_c_string(&block.device().await?)
    } else {
        preferred
    };

    let mut description = Description::new();
    description.insert(keys::DEVICE_PATH.to_string(), json!(device_path));
    description.insert(keys::MEDIA_SIZE.to_string(), json!(size));

    // Partitions share the unit of the block holding their table
    let table = match PartitionProxy::builder(connection)
        .path(block_path)?
        .build()
        .await
    {
        Ok(partition) => partition.table().await.ok(),
        Err(_) => None,
    };
    let unit = match &table {
        Some(table) => table.to_string(),
        None => block_path.to_string(),
    };
    description.insert(keys::MEDIA_WHOLE.to_string(), json!(table.is_none()));
    description.insert(keys::DEVICE_UNIT.to_string(), json!(unit));

    if let Ok(drive_path) = block.drive().await
        && drive_path.as_str() != "/"
    {
        let drive = DriveProxy::builder(connection)
            .path(&drive_path)?
            .build()
            .await?;
        description.insert(
            keys::MEDIA_REMOVABLE.to_string(),
            json!(drive.media_removable().await.unwrap_or(false)),
        );
        description.insert(
            keys::MEDIA_EJECTABLE.to_string(),
            json!(drive.ejectable().await.unwrap_or(false)),
        );
    }

    // UDisks2 has no multi-volume media, so `volume.multi` stays unset.
    for (key, value) in [
        (keys::VOLUME_KIND, block.id_type().await.unwrap_or_default()),
        (keys::VOLUME_NAME, block.id_label().await.unwrap_or_default()),
        (keys::VOLUME_UUID, block.id_uuid().await.unwrap_or_default()),
    ] {
        if !value.is_empty() {
            description.insert(key.to_string(), json!(value));
        }
    }

    if let Some(mount_point) = first_mount_point(connection, block_path).await {
        description.insert(keys::VOLUME_PATH.to_string(), json!(mount_point));
    }

    Ok(Some(Disk::new(block_path, device_path, description)))
}

async fn first_mount_point(connection: &Connection, block_path: &str) -> Option<String> {
    let filesystem = FilesystemProxy::builder(connection)
        .path(block_path)
        .ok()?
        .build()
        .await
        .ok()?;

    filesystem
        .mount_points()
        .await
        .ok()?
        .iter()
        .map(|bytes| decode_c_string(bytes))
        .find(|path| !path.is_empty())
}
