// SPDX-License-Identifier: GPL-3.0-only

//! Arbiter D-Bus interface
//!
//! Thin translation layer: arguments are parsed and checked here, then the
//! operation runs on the broker task. Structured values (descriptions, request
//! arguments, callback instances) travel as JSON strings, like the rest of the
//! storage service.

use arbiter_broker::{Broker, RegistrationSpec, SubmitSpec};
use arbiter_contracts::{ArbitrationError, Dissenter};
use arbiter_types::{
    CallbackKind, CallbackToken, CallerInfo, Description, DiskId, DiskOption, DiskSnapshot,
    RequestArguments, RequestKind, RequestOption, ResponseId, SessionId, SessionOption,
};
use enumflags2::BitFlags;
use zbus::message::Header as MessageHeader;
use zbus::object_server::SignalEmitter;
use zbus::{Connection, interface};

use crate::error::ServiceError;
use crate::owners::SessionOwners;
use crate::runtime::BrokerHandle;

pub const BUS_NAME: &str = "org.cosmic.ext.Storage.Arbiter";
pub const OBJECT_PATH: &str = "/org/cosmic/ext/Storage/Arbiter";

/// D-Bus interface for disk arbitration sessions
pub struct ArbiterHandler {
    broker: BrokerHandle,
    owners: SessionOwners,
}

impl ArbiterHandler {
    pub fn new(broker: BrokerHandle, owners: SessionOwners) -> Self {
        Self { broker, owners }
    }

    /// Runs a fallible broker operation and maps both failure layers to D-Bus errors
    async fn apply<T, F>(&self, operation: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Broker) -> Result<T, ArbitrationError> + Send + 'static,
    {
        let result = self.broker.call(operation).await?;
        result.map_err(|e| ServiceError::from(e).into())
    }

    /// Resolves `session` and checks that the calling connection created it
    fn owned_session(&self, session: u64, header: &MessageHeader<'_>) -> zbus::fdo::Result<SessionId> {
        let sender = sender_of(header)?;
        let session = SessionId::new(session);

        if !self.owners.is_owner(session, &sender) {
            tracing::warn!("{} tried to use {} which it does not own", sender, session);
            return Err(ServiceError::AccessDenied(format!("{session} is not owned by {sender}")).into());
        }
        Ok(session)
    }
}

fn sender_of(header: &MessageHeader<'_>) -> zbus::fdo::Result<String> {
    Ok(header
        .sender()
        .ok_or_else(|| zbus::fdo::Error::Failed("No sender in message header".to_string()))?
        .as_str()
        .to_string())
}

/// Credentials of `sender` as reported by the bus daemon
async fn caller_info(connection: &Connection, sender: &str) -> zbus::fdo::Result<CallerInfo> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(connection)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("D-Bus connection error: {}", e)))?;

    let bus_name: zbus::names::BusName = sender
        .try_into()
        .map_err(|e| zbus::fdo::Error::Failed(format!("Invalid bus name: {}", e)))?;

    let uid = dbus_proxy
        .get_connection_unix_user(bus_name.clone())
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("Failed to get caller UID: {}", e)))?;
    let pid = dbus_proxy
        .get_connection_unix_process_id(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("Failed to get caller PID: {}", e)))?;

    Ok(CallerInfo::new(uid, pid))
}

async fn has_owner(connection: &Connection, name: &str) -> zbus::fdo::Result<bool> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(connection)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("D-Bus connection error: {}", e)))?;
    let bus_name: zbus::names::BusName = name
        .try_into()
        .map_err(|e| zbus::fdo::Error::Failed(format!("Invalid bus name: {}", e)))?;
    dbus_proxy.name_has_owner(bus_name).await
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> zbus::fdo::Result<Option<T>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| ServiceError::InvalidArgument(format!("{what}: {e}")).into())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| {
        tracing::error!("Failed to serialize reply: {e}");
        ServiceError::from(e).into()
    })
}

fn invalid_bits(what: &str, bits: u32) -> zbus::fdo::Error {
    ServiceError::InvalidArgument(format!("unknown {what} bits {bits:#x}")).into()
}

fn token(function: u64, context: u64) -> CallbackToken {
    CallbackToken::new(function, context)
}

#[interface(name = "org.cosmic.ext.Storage.Arbiter")]
impl ArbiterHandler {
    /// Emitted when a session has callback instances waiting in its queue.
    ///
    /// Args:
    /// - session: The session to drain with `DrainQueue`
    #[zbus(signal)]
    pub async fn callbacks_pending(
        signal_ctxt: &SignalEmitter<'_>,
        session: u64,
    ) -> zbus::Result<()>;

    /// Open a session for the calling connection
    ///
    /// Args:
    /// - name: Client name used in logs
    /// - pid: Client-reported process id (the bus-reported one is authoritative)
    ///
    /// Returns the session id.
    async fn create_session(
        &self,
        name: String,
        pid: u32,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<u64> {
        let sender = sender_of(&header)?;
        let caller = caller_info(connection, &sender).await?;
        if pid != 0 && pid != caller.pid {
            tracing::debug!("{} reports pid {} but the bus says {}", sender, pid, caller.pid);
        }

        let bus_pid = caller.pid;
        let session = self
            .broker
            .call(move |broker| broker.create_session(name, bus_pid, caller))
            .await?;
        self.owners.insert(session, &sender);

        // The client may have left before the owner was recorded.
        if !has_owner(connection, &sender).await? && self.owners.take(session) {
            tracing::info!("Client {} left while {} was created", sender, session);
            self.apply(move |broker| broker.release_session(session)).await?;
            return Err(zbus::fdo::Error::Failed(format!("{sender} disconnected")));
        }

        Ok(session.as_u64())
    }

    async fn release_session(
        &self,
        session: u64,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<()> {
        let session = self.owned_session(session, &header)?;
        self.owners.remove(session);
        self.apply(move |broker| broker.release_session(session)).await
    }

    /// Replace the session's option bits (`SessionOption`)
    async fn set_session_options(
        &self,
        session: u64,
        options: u32,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<()> {
        let session = self.owned_session(session, &header)?;
        let options = BitFlags::<SessionOption>::from_bits(options)
            .map_err(|_| invalid_bits("session option", options))?;
        self.apply(move |broker| broker.set_session_options(session, options))
            .await
    }

    /// Add a standing subscription
    ///
    /// Args:
    /// - kind: Callback kind name (e.g. "mount_approval")
    /// - function, context: Client token echoed in every instance
    /// - order: Lower orders fire first
    /// - matching: JSON description subset the disk must match, or ""
    /// - watch: Description keys of interest for description-changed, or empty
    #[allow(clippy::too_many_arguments)]
    async fn register(
        &self,
        session: u64,
        kind: String,
        function: u64,
        context: u64,
        order: i32,
        matching: String,
        watch: Vec<String>,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<()> {
        let session = self.owned_session(session, &header)?;
        let kind = CallbackKind::from_name(&kind).ok_or_else(|| {
            zbus::fdo::Error::from(ServiceError::InvalidArgument(format!(
                "unknown callback kind {kind}"
            )))
        })?;

        let mut spec = RegistrationSpec::new(token(function, context), kind);
        spec.order = order;
        spec.matching = parse_json::<Description>(&matching, "matching")?;
        spec.watch = (!watch.is_empty()).then_some(watch);

        self.apply(move |broker| broker.register(session, spec)).await
    }

    /// Remove every subscription made with (function, context)
    ///
    /// Returns the number of registrations removed.
    async fn unregister(
        &self,
        session: u64,
        function: u64,
        context: u64,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<u32> {
        let session = self.owned_session(session, &header)?;
        let removed = self
            .apply(move |broker| broker.unregister(session, token(function, context)))
            .await?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Take every queued callback instance
    ///
    /// Returns a JSON array of CallbackInstance objects.
    async fn drain_queue(
        &self,
        session: u64,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<String> {
        let session = self.owned_session(session, &header)?;
        let instances = self.apply(move |broker| broker.drain(session)).await?;
        tracing::debug!("Draining {} instance(s) for {}", instances.len(), session);
        to_json(&instances)
    }

    /// Queue an operation on a disk
    ///
    /// Args:
    /// - kind: "claim", "eject", "mount", "probe", "refresh", "rename" or "unmount"
    /// - disk: Disk id
    /// - options: `RequestOption` bits
    /// - arguments: JSON RequestArguments, or ""
    /// - function, context: Completion token; (0, 0) for no completion
    ///
    /// Returns the request id.
    #[allow(clippy::too_many_arguments)]
    async fn submit(
        &self,
        session: u64,
        kind: String,
        disk: String,
        options: u32,
        arguments: String,
        function: u64,
        context: u64,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<u64> {
        let session = self.owned_session(session, &header)?;
        let kind = RequestKind::from_name(&kind).ok_or_else(|| {
            zbus::fdo::Error::from(ServiceError::InvalidArgument(format!(
                "unknown request kind {kind}"
            )))
        })?;
        let options = BitFlags::<RequestOption>::from_bits(options)
            .map_err(|_| invalid_bits("request option", options))?;
        let caller = caller_info(connection, &sender_of(&header)?).await?;

        let mut spec = SubmitSpec::new(kind, disk, caller);
        spec.options = options;
        spec.arguments =
            parse_json::<RequestArguments>(&arguments, "arguments")?.unwrap_or_default();
        spec.callback = (function != 0 || context != 0).then(|| token(function, context));

        tracing::info!("{} submits {} on {}", session, kind, spec.disk);
        let request = self.apply(move |broker| broker.submit(session, spec)).await?;
        Ok(request.as_u64())
    }

    /// Vote on an approval instance
    ///
    /// Args:
    /// - response: Response id carried by the instance
    /// - dissent_status: 0 to approve, otherwise the veto status
    /// - dissent_reason: Optional human-readable reason
    async fn respond(
        &self,
        session: u64,
        disk: String,
        response: u64,
        dissent_status: u32,
        dissent_reason: String,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<()> {
        let session = self.owned_session(session, &header)?;
        let dissent = (dissent_status != 0).then(|| {
            let reason = (!dissent_reason.is_empty()).then_some(dissent_reason);
            Dissenter::new(dissent_status, reason)
        });
        let disk = DiskId::from(disk);

        self.apply(move |broker| broker.respond(session, &disk, ResponseId::new(response), dissent))
            .await
    }

    /// Snapshot every known disk as a JSON array
    async fn list_disks(&self) -> zbus::fdo::Result<String> {
        let disks: Vec<DiskSnapshot> = self
            .broker
            .call(|broker| broker.disks().iter().map(|disk| disk.snapshot()).collect())
            .await?;
        to_json(&disks)
    }

    /// The disk's description as a JSON object
    async fn copy_description(&self, disk: String) -> zbus::fdo::Result<String> {
        let disk = DiskId::from(disk);
        let description = self
            .apply(move |broker| broker.copy_description(&disk))
            .await?;
        to_json(&description)
    }

    async fn get_disk_options(&self, disk: String) -> zbus::fdo::Result<u32> {
        let disk = DiskId::from(disk);
        let options = self.apply(move |broker| broker.disk_options(&disk)).await?;
        Ok(options.bits())
    }

    /// Set (`enable`) or clear the given `DiskOption` bits
    async fn set_disk_options(
        &self,
        session: u64,
        disk: String,
        options: u32,
        enable: bool,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<()> {
        self.owned_session(session, &header)?;
        let options = BitFlags::<DiskOption>::from_bits(options)
            .map_err(|_| invalid_bits("disk option", options))?;
        let disk = DiskId::from(disk);

        self.apply(move |broker| broker.set_disk_options(&disk, options, enable))
            .await
    }

    async fn is_claimed(&self, disk: String) -> zbus::fdo::Result<bool> {
        let disk = DiskId::from(disk);
        self.apply(move |broker| broker.is_claimed(&disk)).await
    }

    async fn set_adoption(
        &self,
        session: u64,
        disk: String,
        adopted: bool,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<()> {
        let session = self.owned_session(session, &header)?;
        let disk = DiskId::from(disk);
        tracing::info!("{} sets adoption of {} to {}", session, disk, adopted);
        self.apply(move |broker| broker.set_adoption(&disk, adopted))
            .await
    }

    async fn unclaim(
        &self,
        session: u64,
        disk: String,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<()> {
        let session = self.owned_session(session, &header)?;
        let disk = DiskId::from(disk);
        self.apply(move |broker| broker.unclaim(session, &disk)).await
    }

    /// Re-read the disk's description; returns the request id
    async fn refresh(
        &self,
        session: u64,
        disk: String,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<u64> {
        let session = self.owned_session(session, &header)?;
        let disk = DiskId::from(disk);
        let request = self.apply(move |broker| broker.refresh(session, &disk)).await?;
        Ok(request.as_u64())
    }
}
