// SPDX-License-Identifier: GPL-3.0-only

//! COSMIC Ext Disk Arbiter - D-Bus broker that arbitrates access to disks
//!
//! Sessions subscribe to disk events, vote on mount, unmount and eject
//! requests, and receive completions. Device knowledge and command execution
//! come from UDisks2.

use std::path::PathBuf;

use anyhow::Result;
use arbiter_broker::{Broker, DeviceEvent};
use arbiter_contracts::StageEngine;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};
use zbus::connection::Builder as ConnectionBuilder;

mod config;
mod error;
mod interface;
mod notifier;
mod owners;
mod runtime;
mod udisks;

use config::{ArbiterConfig, BusKind};
use interface::{ArbiterHandler, BUS_NAME, OBJECT_PATH};
use notifier::SignalNotifier;
use owners::SessionOwners;
use runtime::BrokerHandle;
use udisks::{UdisksStageEngine, UnavailableStage};

#[derive(Debug, Parser)]
#[command(name = "cosmic-ext-disk-arbiter")]
#[command(about = "Disk arbitration broker for COSMIC Ext Storage")]
struct Cli {
    /// Configuration file (defaults to /etc/cosmic-ext-disk-arbiter/arbiter.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve on the session bus instead of the system bus
    #[arg(long)]
    session_bus: bool,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Do not track disks through UDisks2
    #[arg(long)]
    no_udisks: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ArbiterConfig::load(cli.config.as_deref())?;
    if cli.session_bus {
        config.bus = BusKind::Session;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if cli.no_udisks {
        config.enable_udisks_feed = false;
    }
    config.validate()?;

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_directive())),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        "Starting COSMIC Ext Disk Arbiter v{}",
        env!("CARGO_PKG_VERSION")
    );

    if config.bus == BusKind::System && unsafe { libc::geteuid() } != 0 {
        tracing::error!("Disk arbiter must run as root on the system bus");
        anyhow::bail!("Service must run with root privileges");
    }

    let (broker_handle, broker_receiver) = BrokerHandle::channel();
    let (notifier, wakes) = SignalNotifier::new();

    // UDisks2 always lives on the system bus, whichever bus we serve on
    let udisks_connection = if config.enable_udisks_feed {
        Some(zbus::Connection::system().await?)
    } else {
        tracing::warn!("UDisks2 feed disabled; no disks will be reported");
        None
    };

    let stage: Box<dyn StageEngine> = match &udisks_connection {
        Some(connection) => Box::new(UdisksStageEngine::new(
            connection.clone(),
            broker_handle.clone(),
        )),
        None => Box::new(UnavailableStage::new(broker_handle.clone())),
    };

    let broker_config = config.broker_config();
    tracing::info!(
        "Response timeout {:?}, timer leeway {:?}",
        broker_config.response_timeout,
        broker_config.timer_leeway
    );
    let broker = Broker::new(broker_config, stage, Box::new(notifier));
    let broker_task = tokio::spawn(runtime::run(broker, broker_receiver));

    let owners = SessionOwners::default();
    let handler = ArbiterHandler::new(broker_handle.clone(), owners.clone());

    let connection_builder = match config.bus {
        BusKind::System => ConnectionBuilder::system()?,
        BusKind::Session => ConnectionBuilder::session()?,
    };
    let connection = connection_builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, handler)?
        .build()
        .await?;

    tracing::info!("Service registered on D-Bus {:?} bus", config.bus);
    tracing::info!("  - {} at {}", BUS_NAME, OBJECT_PATH);

    notifier::forward_wakes(connection.clone(), wakes).await?;
    owners::watch_name_owners(connection.clone(), owners, broker_handle.clone()).await?;

    match udisks_connection {
        Some(udisks_connection) => {
            udisks::start_device_feed(udisks_connection, broker_handle.clone()).await?;
        }
        None => broker_handle.device_event(DeviceEvent::EnumerationComplete)?,
    }

    tracing::info!("Service ready, waiting for requests...");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    drop(broker_handle);
    broker_task.abort();

    tracing::info!("COSMIC Ext Disk Arbiter shutting down");
    Ok(())
}
