// SPDX-License-Identifier: GPL-3.0-only

//! UDisks2 backed device feed and stage engine
//!
//! Disks are identified by their UDisks2 block object path
//! (e.g. "/org/freedesktop/UDisks2/block_devices/sdb1"), so the stage engine
//! can address a disk without resolving device nodes.

mod describe;
mod feed;
mod stage;

use std::collections::HashMap;

use zbus::zvariant::{self, Value};

pub use feed::start_device_feed;
pub use stage::{UdisksStageEngine, UnavailableStage};

pub(crate) const UDISKS_SERVICE: &str = "org.freedesktop.UDisks2";
pub(crate) const BLOCK_IFACE: &str = "org.freedesktop.UDisks2.Block";
pub(crate) const BLOCK_DEVICES_PREFIX: &str = "/org/freedesktop/UDisks2/block_devices/";

#[zbus::proxy(
    default_service = "org.freedesktop.UDisks2",
    default_path = "/org/freedesktop/UDisks2/Manager",
    interface = "org.freedesktop.UDisks2.Manager"
)]
pub trait UDisks2Manager {
    fn get_block_devices(
        &self,
        options: HashMap<String, Value<'_>>,
    ) -> zbus::Result<Vec<zvariant::OwnedObjectPath>>;
}

#[zbus::proxy(
    default_service = "org.freedesktop.UDisks2",
    default_path = "/org/freedesktop/UDisks2",
    interface = "org.freedesktop.DBus.ObjectManager"
)]
pub trait UDisks2ObjectManager {
    #[zbus(signal)]
    fn interfaces_added(
        &self,
        object_path: zvariant::OwnedObjectPath,
        interfaces_and_properties: HashMap<String, HashMap<String, zvariant::OwnedValue>>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    fn interfaces_removed(
        &self,
        object_path: zvariant::OwnedObjectPath,
        interfaces: Vec<String>,
    ) -> zbus::Result<()>;
}

/// Decodes a NUL-terminated UDisks2 byte string
pub(crate) fn decode_c_string(bytes: &[u8]) -> String {
    let raw = bytes.split(|b| *b == 0).next().unwrap_or(bytes);
    String::from_utf8_lossy(raw).trim().to_string()
}
