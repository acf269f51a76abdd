// SPDX-License-Identifier: GPL-3.0-only

//! Stage engine executing broker jobs through UDisks2

use std::collections::HashMap;

use arbiter_contracts::{
    ArbitrationError, ArbitrationErrorKind, CompletionStatus, StageEngine, StageJob, StageOutcome,
};
use arbiter_types::{RequestKind, RequestOption};
use udisks2::{block::BlockProxy, drive::DriveProxy, filesystem::FilesystemProxy};
use zbus::Connection;
use zbus::zvariant::Value;

use crate::runtime::BrokerHandle;

/// Runs each job on its own task and reports back to the broker
pub struct UdisksStageEngine {
    connection: Connection,
    broker: BrokerHandle,
}

impl UdisksStageEngine {
    pub fn new(connection: Connection, broker: BrokerHandle) -> Self {
        Self { connection, broker }
    }
}

impl StageEngine for UdisksStageEngine {
    fn start(&mut self, job: StageJob) {
        let connection = self.connection.clone();
        let broker = self.broker.clone();

        tokio::spawn(async move {
            tracing::info!("Running {} on {} ({})", job.kind, job.device_path, job.request);
            let status = match execute(&connection, &job).await {
                Ok(()) => CompletionStatus::Success,
                Err(e) => {
                    tracing::warn!("{} on {} failed: {}", job.kind, job.device_path, e);
                    CompletionStatus::Failed(e)
                }
            };

            if broker
                .stage_completed(StageOutcome::for_job(&job, status))
                .is_err()
            {
                tracing::debug!("Broker stopped before {} finished", job.request);
            }
        });
    }
}

/// Stage engine used when the UDisks2 feed is disabled
pub struct UnavailableStage {
    broker: BrokerHandle,
}

impl UnavailableStage {
    pub fn new(broker: BrokerHandle) -> Self {
        Self { broker }
    }
}

impl StageEngine for UnavailableStage {
    fn start(&mut self, job: StageJob) {
        let status = CompletionStatus::Failed(ArbitrationError::new(
            ArbitrationErrorKind::Unsupported,
            "no device backend is configured",
        ));
        if self
            .broker
            .stage_completed(StageOutcome::for_job(&job, status))
            .is_err()
        {
            tracing::debug!("Broker stopped before {} was rejected", job.request);
        }
    }
}

async fn execute(connection: &Connection, job: &StageJob) -> Result<(), ArbitrationError> {
    match job.kind {
        RequestKind::Mount => mount(connection, job).await,
        RequestKind::Unmount => unmount(connection, job).await,
        RequestKind::Eject => eject(connection, job).await,
        RequestKind::Rename => rename(connection, job).await,
        RequestKind::Probe | RequestKind::Refresh => rescan(connection, job).await,
        RequestKind::Claim => Err(ArbitrationError::new(
            ArbitrationErrorKind::Internal,
            "claims are settled by the broker",
        )),
    }
}

async fn filesystem<'a>(
    connection: &'a Connection,
    job: &'a StageJob,
) -> Result<FilesystemProxy<'a>, ArbitrationError> {
    FilesystemProxy::builder(connection)
        .path(job.disk.as_str())
        .map_err(dbus_error)?
        .build()
        .await
        .map_err(dbus_error)
}

async fn mount(connection: &Connection, job: &StageJob) -> Result<(), ArbitrationError> {
    if job.arguments.mount_point.is_some() {
        return Err(ArbitrationError::new(
            ArbitrationErrorKind::Unsupported,
            "explicit mount points are not supported",
        ));
    }

    let mut options_vec: Vec<&str> = Vec::new();
    if job.options.contains(RequestOption::ReadOnly) {
        options_vec.push("ro");
    }
    for opt in &job.arguments.mount_options {
        options_vec.push(opt.as_str());
    }

    let mut opts: HashMap<&str, Value<'_>> = HashMap::new();
    if !options_vec.is_empty() {
        opts.insert("options", Value::from(options_vec.join(",")));
    }

    match filesystem(connection, job).await?.mount(opts).await {
        Ok(mount_point) => {
            tracing::info!("Mounted {} at {}", job.device_path, mount_point);
            Ok(())
        }
        // The volumes of a whole-disk mount are mounted by their own jobs
        Err(e) if whole_without_filesystem(job, &e.to_string()) => {
            tracing::debug!("{} has no filesystem of its own", job.device_path);
            Ok(())
        }
        Err(e) => Err(dbus_error(e)),
    }
}

async fn unmount(connection: &Connection, job: &StageJob) -> Result<(), ArbitrationError> {
    let mut opts: HashMap<&str, Value<'_>> = HashMap::new();
    if job.options.contains(RequestOption::Force) {
        opts.insert("force", Value::from(true));
    }

    match filesystem(connection, job).await?.unmount(opts).await {
        Ok(()) => Ok(()),
        // A whole disk without a filesystem of its own, or a volume that is already unmounted
        Err(e) if is_not_mounted(&e.to_string()) => {
            tracing::debug!("{} has nothing mounted", job.device_path);
            Ok(())
        }
        Err(e) => Err(dbus_error(e)),
    }
}

async fn eject(connection: &Connection, job: &StageJob) -> Result<(), ArbitrationError> {
    let block = BlockProxy::builder(connection)
        .path(job.disk.as_str())
        .map_err(dbus_error)?
        .build()
        .await
        .map_err(dbus_error)?;
    let drive_path = block.drive().await.map_err(dbus_error)?;
    if drive_path.as_str() == "/" {
        return Err(ArbitrationError::new(
            ArbitrationErrorKind::Unsupported,
            format!("{} has no drive to eject", job.device_path),
        ));
    }

    let drive = DriveProxy::builder(connection)
        .path(drive_path)
        .map_err(dbus_error)?
        .build()
        .await
        .map_err(dbus_error)?;
    drive.eject(HashMap::new()).await.map_err(dbus_error)
}

async fn rename(connection: &Connection, job: &StageJob) -> Result<(), ArbitrationError> {
    let Some(name) = job.arguments.name.as_deref() else {
        return Err(ArbitrationError::new(
            ArbitrationErrorKind::BadArgument,
            "rename needs a name",
        ));
    };

    filesystem(connection, job)
        .await?
        .set_label(name, HashMap::new())
        .await
        .map_err(dbus_error)
}

async fn rescan(connection: &Connection, job: &StageJob) -> Result<(), ArbitrationError> {
    let block = BlockProxy::builder(connection)
        .path(job.disk.as_str())
        .map_err(dbus_error)?
        .build()
        .await
        .map_err(dbus_error)?;
    block.rescan(HashMap::new()).await.map_err(dbus_error)
}

fn is_not_mounted(message: &str) -> bool {
    message.contains("NotMounted")
        || message.contains("not mounted")
        || message.contains("No such interface")
}

fn whole_without_filesystem(job: &StageJob, message: &str) -> bool {
    job.options.contains(RequestOption::Whole)
        && (message.contains("No such interface") || message.contains("NotAFilesystem"))
}

fn dbus_error(e: zbus::Error) -> ArbitrationError {
    let message = e.to_string();
    ArbitrationError::new(classify(&message), message)
}

/// Maps UDisks2 error text onto broker error kinds
fn classify(message: &str) -> ArbitrationErrorKind {
    if message.contains("NotSupported")
        || message.contains("not supported")
        || message.contains("No such interface")
    {
        ArbitrationErrorKind::Unsupported
    } else if message.contains("DeviceBusy") || message.contains("Device or resource busy") {
        ArbitrationErrorKind::Busy
    } else if message.contains("NotAuthorized") {
        ArbitrationErrorKind::NotPrivileged
    } else if message.contains("UnknownObject") || message.contains("No such object") {
        ArbitrationErrorKind::NotFound
    } else {
        ArbitrationErrorKind::Internal
    }
}
