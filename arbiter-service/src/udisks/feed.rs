// SPDX-License-Identifier: GPL-3.0-only

//! Device feed: turns UDisks2 object events into broker `DeviceEvent`s

use std::collections::HashMap;

use anyhow::Result;
use arbiter_broker::DeviceEvent;
use arbiter_types::DiskId;
use futures_util::StreamExt;
use zbus::{Connection, MatchRule, MessageStream};

use super::describe::describe_block;
use super::{
    BLOCK_DEVICES_PREFIX, BLOCK_IFACE, UDISKS_SERVICE, UDisks2ManagerProxy,
    UDisks2ObjectManagerProxy,
};
use crate::runtime::BrokerHandle;

/// Enumerates the current block devices, then follows hotplug and property changes.
///
/// Subscriptions are made before enumeration so nothing that changes in
/// between is lost; duplicates are harmless to the broker.
pub async fn start_device_feed(connection: Connection, broker: BrokerHandle) -> Result<()> {
    tracing::info!("Starting UDisks2 device feed");

    let object_manager = UDisks2ObjectManagerProxy::new(&connection).await?;
    let mut added_stream = object_manager.receive_interfaces_added().await?;
    let mut removed_stream = object_manager.receive_interfaces_removed().await?;

    let rule = MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(UDISKS_SERVICE)?
        .interface("org.freedesktop.DBus.Properties")?
        .member("PropertiesChanged")?
        .path_namespace("/org/freedesktop/UDisks2/block_devices")?
        .build();
    let mut property_stream = MessageStream::for_match_rule(rule, &connection, None).await?;

    let manager = UDisks2ManagerProxy::new(&connection).await?;
    let block_paths = manager.get_block_devices(HashMap::new()).await?;
    let mut announced = 0usize;
    for path in block_paths {
        match describe_block(&connection, path.as_str()).await {
            Ok(Some(disk)) => {
                broker.device_event(DeviceEvent::Appeared(disk))?;
                announced += 1;
            }
            Ok(None) => tracing::debug!("Skipping unmanaged block {}", path),
            Err(e) => tracing::warn!("Could not describe {}: {}", path, e),
        }
    }
    broker.device_event(DeviceEvent::EnumerationComplete)?;
    tracing::info!("Initial enumeration announced {} disk(s)", announced);

    tokio::spawn(async move {
        loop {
            let forwarded = tokio::select! {
                maybe_added = added_stream.next() => {
                    let Some(signal) = maybe_added else {
                        break;
                    };
                    match signal.args() {
                        Ok(args) => {
                            let path = args.object_path.to_string();
                            if args.interfaces_and_properties.contains_key(BLOCK_IFACE) {
                                announce(&connection, &broker, &path).await
                            } else {
                                refresh(&connection, &broker, &path).await
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to parse InterfacesAdded signal args: {e}");
                            Ok(())
                        }
                    }
                }
                maybe_removed = removed_stream.next() => {
                    let Some(signal) = maybe_removed else {
                        break;
                    };
                    match signal.args() {
                        Ok(args) => {
                            let path = args.object_path.to_string();
                            if args.interfaces.iter().any(|i| i == BLOCK_IFACE) {
                                tracing::info!("Block removed: {}", path);
                                broker.device_event(DeviceEvent::Disappeared(DiskId::from(path)))
                            } else {
                                refresh(&connection, &broker, &path).await
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to parse InterfacesRemoved signal args: {e}");
                            Ok(())
                        }
                    }
                }
                maybe_changed = property_stream.next() => {
                    let Some(message) = maybe_changed else {
                        break;
                    };
                    match message {
                        Ok(message) => {
                            let path = message.header().path().map(|p| p.to_string());
                            match path {
                                Some(path) => refresh(&connection, &broker, &path).await,
                                None => Ok(()),
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to read PropertiesChanged signal: {e}");
                            Ok(())
                        }
                    }
                }
            };

            if forwarded.is_err() {
                tracing::debug!("Broker stopped; device feed exiting");
                break;
            }
        }
    });

    tracing::info!("UDisks2 device feed started");
    Ok(())
}

async fn announce(connection: &Connection, broker: &BrokerHandle, path: &str) -> crate::error::Result<()> {
    match describe_block(connection, path).await {
        Ok(Some(disk)) => {
            tracing::info!("Block added: {} ({})", disk.device_path, path);
            broker.device_event(DeviceEvent::Appeared(disk))
        }
        Ok(None) => Ok(()),
        Err(e) => {
            tracing::warn!("Could not describe {}: {}", path, e);
            Ok(())
        }
    }
}

/// Re-reads a block whose interfaces or properties changed.
///
/// Re-announcing a known disk only updates its description; a block that
/// stopped being managed (media removed) is reported gone.
async fn refresh(connection: &Connection, broker: &BrokerHandle, path: &str) -> crate::error::Result<()> {
    if !path.starts_with(BLOCK_DEVICES_PREFIX) {
        return Ok(());
    }

    match describe_block(connection, path).await {
        Ok(Some(disk)) => broker.device_event(DeviceEvent::Appeared(disk)),
        Ok(None) => broker.device_event(DeviceEvent::Disappeared(DiskId::from(path))),
        Err(e) => {
            tracing::debug!("Could not re-read {}: {}", path, e);
            Ok(())
        }
    }
}
