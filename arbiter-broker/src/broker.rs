// SPDX-License-Identifier: GPL-3.0-only

//! The broker context
//!
//! `Broker` owns every registry and is the only place state changes. Each
//! public method handles one inbound message to completion and returns; the
//! event loop around it serializes messages and sleeps until
//! `next_deadline()`.

use std::time::Duration;

use arbiter_contracts::{
    ArbitrationError, ArbitrationErrorKind, CallbackArgument, CallbackInstance, Clock,
    CompletionStatus, Dissenter, StageEngine, SystemClock, WakeNotifier,
};
use arbiter_types::description::keys;
use arbiter_types::{
    CallbackKind, CallbackToken, CallerInfo, Description, Disk, DiskId, DiskOption, DiskState,
    RequestArguments, RequestId, RequestKind, RequestOption, ResponseId, SessionFlag, SessionId,
    SessionOption,
};
use enumflags2::BitFlags;

use crate::directory::CallbackRegistration;
use crate::registry::DiskRegistry;
use crate::request::{Request, RequestQueue};
use crate::response::ResponseTracker;
use crate::session::{Session, SessionRegistry};
use crate::timer::ResponseTimer;

/// How long a session may take to vote before its vote counts as approval
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack added to the sweep deadline so nearby expiries are handled together
pub const DEFAULT_TIMER_LEEWAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    pub response_timeout: Duration,
    pub timer_leeway: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            timer_leeway: DEFAULT_TIMER_LEEWAY,
        }
    }
}

/// A new subscription as the client describes it
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationSpec {
    pub token: CallbackToken,
    pub kind: CallbackKind,
    pub order: i32,
    pub matching: Option<Description>,
    pub watch: Option<Vec<String>>,
}

impl RegistrationSpec {
    pub fn new(token: CallbackToken, kind: CallbackKind) -> Self {
        Self {
            token,
            kind,
            order: 0,
            matching: None,
            watch: None,
        }
    }
}

/// A new operation as the client describes it
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitSpec {
    pub kind: RequestKind,
    pub disk: DiskId,
    pub options: BitFlags<RequestOption>,
    pub arguments: RequestArguments,
    pub caller: CallerInfo,
    /// Where to deliver the completion, if anywhere
    pub callback: Option<CallbackToken>,
}

impl SubmitSpec {
    pub fn new(kind: RequestKind, disk: impl Into<DiskId>, caller: CallerInfo) -> Self {
        Self {
            kind,
            disk: disk.into(),
            options: BitFlags::empty(),
            arguments: RequestArguments::default(),
            caller,
            callback: None,
        }
    }
}

/// Changes reported by the device feed
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A disk appeared; re-announcing a known disk only updates its description
    Appeared(Disk),
    DescriptionChanged {
        disk: DiskId,
        description: Description,
    },
    Disappeared(DiskId),
    /// The feed finished reporting the disks present at startup
    EnumerationComplete,
}

pub struct Broker {
    pub(crate) config: BrokerConfig,
    pub(crate) disks: DiskRegistry,
    pub(crate) sessions: SessionRegistry,
    pub(crate) tracker: ResponseTracker,
    pub(crate) queue: RequestQueue,
    pub(crate) timer: ResponseTimer,
    pub(crate) stage: Box<dyn StageEngine>,
    pub(crate) notifier: Box<dyn WakeNotifier>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) idle: bool,
    enumerated: bool,
    next_session: u64,
    next_request: u64,
    next_response: u64,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        stage: Box<dyn StageEngine>,
        notifier: Box<dyn WakeNotifier>,
    ) -> Self {
        Self::with_clock(config, stage, notifier, Box::new(SystemClock))
    }

    pub fn with_clock(
        config: BrokerConfig,
        stage: Box<dyn StageEngine>,
        notifier: Box<dyn WakeNotifier>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            config,
            disks: DiskRegistry::default(),
            sessions: SessionRegistry::default(),
            tracker: ResponseTracker::default(),
            queue: RequestQueue::default(),
            timer: ResponseTimer::default(),
            stage,
            notifier,
            clock,
            idle: true,
            enumerated: false,
            next_session: 1,
            next_request: 1,
            next_response: 1,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn disks(&self) -> &DiskRegistry {
        &self.disks
    }

    pub fn disk(&self, id: &DiskId) -> Option<&Disk> {
        self.disks.get(id)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn responses(&self) -> &ResponseTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.queue.get(id)
    }

    /// Nothing queued and no vote outstanding
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn enumeration_finished(&self) -> bool {
        self.enumerated
    }

    /// When the event loop should call `on_timer` next
    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.timer.deadline()
    }

    // Sessions

    pub fn create_session(
        &mut self,
        name: impl Into<String>,
        pid: u32,
        caller: CallerInfo,
    ) -> SessionId {
        let id = SessionId::new(self.next_session);
        self.next_session += 1;

        let session = Session::new(id, name.into(), pid, caller);
        tracing::info!(%id, name = session.name(), pid, "session created");
        self.sessions.insert(session);
        id
    }

    pub fn set_session_options(
        &mut self,
        id: SessionId,
        options: BitFlags<SessionOption>,
    ) -> Result<(), ArbitrationError> {
        let session = self.session_mut(id)?;
        session.options = options;
        tracing::debug!(%id, ?options, "session options updated");
        self.rearm_timer();
        Ok(())
    }

    // Callbacks

    pub fn register(
        &mut self,
        session: SessionId,
        spec: RegistrationSpec,
    ) -> Result<(), ArbitrationError> {
        self.session_mut(session)?;

        let mut registration = CallbackRegistration::new(session, spec.token, spec.kind)
            .with_order(spec.order);
        if let Some(matching) = spec.matching {
            registration = registration.with_matching(matching);
        }
        if let Some(watch) = spec.watch {
            registration = registration.with_watch(watch);
        }

        tracing::debug!(%session, kind = %spec.kind, order = spec.order, "callback registered");
        if let Some(entry) = self.sessions.get_mut(session) {
            entry.directory.register(registration.clone());
        }

        match spec.kind {
            CallbackKind::DiskAppeared => {
                for disk in self.disks.appeared() {
                    self.dispatch_logged(&registration, Some(&disk), CallbackArgument::None);
                }
                if self.idle {
                    self.broadcast_to_session(session, CallbackKind::Idle, None, CallbackArgument::None);
                }
            }
            CallbackKind::Idle if self.idle => {
                self.dispatch_logged(&registration, None, CallbackArgument::None);
                if let Some(entry) = self.sessions.get_mut(session) {
                    entry.flags.insert(SessionFlag::Idle);
                }
            }
            CallbackKind::ListComplete if self.enumerated => {
                self.dispatch_logged(&registration, None, CallbackArgument::None);
            }
            _ => {}
        }

        Ok(())
    }

    /// Removes every registration made with `token` and settles whatever was waiting on them
    pub fn unregister(
        &mut self,
        session: SessionId,
        token: CallbackToken,
    ) -> Result<usize, ArbitrationError> {
        let removed = self.session_mut(session)?.directory.unregister(token);
        tracing::debug!(%session, function = token.function, context = token.context, removed, "callback unregistered");

        for disk in self.tracker.release_registration(session, token) {
            self.complete_response(&disk);
        }
        self.queue.strip_callback(session, token);

        self.settle();
        Ok(removed)
    }

    /// Hands the session its queued instances and clears its timed-out state
    pub fn drain(&mut self, session: SessionId) -> Result<Vec<CallbackInstance>, ArbitrationError> {
        let entry = self.session_mut(session)?;
        entry.flags.remove(SessionFlag::TimedOut);
        Ok(entry.directory.drain())
    }

    // Requests

    pub fn submit(
        &mut self,
        session: SessionId,
        spec: SubmitSpec,
    ) -> Result<RequestId, ArbitrationError> {
        self.session_mut(session)?;

        let callback = spec.callback.map(|token| {
            CallbackRegistration::new(session, token, spec.kind.completion_kind())
        });

        let checked = match self.disks.get(&spec.disk) {
            Some(disk) => crate::request::validate(spec.kind, disk, spec.options, &spec.arguments)
                .map(|()| {
                    if crate::request::fans_out(spec.kind, disk, spec.options) {
                        self.disks.siblings_of(disk)
                    } else {
                        Vec::new()
                    }
                }),
            None => Err(ArbitrationError::new(
                ArbitrationErrorKind::NotFound,
                format!("unknown disk {}", spec.disk),
            )),
        };

        let siblings = match checked {
            Ok(siblings) => siblings,
            Err(error) => {
                tracing::debug!(%session, kind = %spec.kind, disk = %spec.disk, %error, "request rejected");
                if let Some(callback) = &callback {
                    self.dispatch_logged(
                        callback,
                        Some(&spec.disk),
                        CallbackArgument::Outcome(CompletionStatus::Failed(error.clone())),
                    );
                }
                return Err(error);
            }
        };

        let id = self.allocate_request_id();
        let mut parent = Request::new(
            id,
            spec.kind,
            spec.disk,
            session,
            spec.options,
            spec.arguments,
            spec.caller,
            callback,
        );

        let mut children = Vec::with_capacity(siblings.len());
        for sibling in siblings {
            let child = Request::linked(self.allocate_request_id(), &parent, sibling);
            parent.links.push(crate::request::Link {
                request: child.id,
                disk: child.disk.clone(),
                outcome: None,
            });
            children.push(child);
        }

        tracing::info!(
            %session,
            %id,
            kind = %parent.kind,
            disk = %parent.disk,
            links = children.len(),
            "request queued"
        );

        self.queue.push(parent);
        for child in children {
            self.queue.push(child);
        }

        self.settle();
        Ok(id)
    }

    /// Records a vote for an approval instance
    pub fn respond(
        &mut self,
        session: SessionId,
        disk: &DiskId,
        response: ResponseId,
        dissent: Option<Dissenter>,
    ) -> Result<(), ArbitrationError> {
        self.session_mut(session)?;

        match self.tracker.on_response(session, response, dissent) {
            Some(answered) => {
                if &answered != disk {
                    tracing::warn!(%session, %response, claimed = %disk, actual = %answered, "response names the wrong disk");
                }
                self.complete_response(&answered);
            }
            None => {
                tracing::warn!(%session, %response, %disk, "dropping orphaned response");
            }
        }

        self.settle();
        Ok(())
    }

    // Disk introspection

    pub fn copy_description(&self, disk: &DiskId) -> Result<Description, ArbitrationError> {
        Ok(self.disk_ref(disk)?.description.clone())
    }

    pub fn disk_options(&self, disk: &DiskId) -> Result<BitFlags<DiskOption>, ArbitrationError> {
        Ok(self.disk_ref(disk)?.options)
    }

    pub fn set_disk_options(
        &mut self,
        disk: &DiskId,
        options: BitFlags<DiskOption>,
        enable: bool,
    ) -> Result<(), ArbitrationError> {
        let entry = self.disk_mut(disk)?;
        if enable {
            entry.options |= options;
        } else {
            entry.options &= !options;
        }
        Ok(())
    }

    pub fn is_claimed(&self, disk: &DiskId) -> Result<bool, ArbitrationError> {
        Ok(self.disk_ref(disk)?.claim.is_some())
    }

    pub fn set_adoption(&mut self, disk: &DiskId, adopted: bool) -> Result<(), ArbitrationError> {
        let entry = self.disk_mut(disk)?;
        entry.adopted = adopted;

        let mut description = entry.description.clone();
        description.insert(keys::DISK_ADOPTED.to_string(), serde_json::Value::Bool(adopted));
        self.disk_description_changed(disk, description);
        Ok(())
    }

    pub fn unclaim(&mut self, session: SessionId, disk: &DiskId) -> Result<(), ArbitrationError> {
        self.session_mut(session)?;
        let entry = self.disk_mut(disk)?;

        match entry.claim {
            Some(owner) if owner == session => {
                entry.claim = None;
                tracing::debug!(%session, %disk, "claim released");
                Ok(())
            }
            Some(owner) => Err(ArbitrationError::new(
                ArbitrationErrorKind::NotPrivileged,
                format!("disk {disk} is claimed by {owner}"),
            )),
            None => Ok(()),
        }
    }

    /// Queues a description refresh without a completion registration
    pub fn refresh(
        &mut self,
        session: SessionId,
        disk: &DiskId,
    ) -> Result<RequestId, ArbitrationError> {
        let caller = self.session_mut(session)?.caller().clone();
        self.submit(
            session,
            SubmitSpec::new(RequestKind::Refresh, disk.clone(), caller),
        )
    }

    // Device feed

    pub fn device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Appeared(disk) => self.disk_appeared(disk),
            DeviceEvent::DescriptionChanged { disk, description } => {
                self.disk_description_changed(&disk, description)
            }
            DeviceEvent::Disappeared(disk) => self.disk_disappeared(&disk),
            DeviceEvent::EnumerationComplete => self.enumeration_complete(),
        }
    }

    pub fn disk_appeared(&mut self, mut disk: Disk) {
        if self.disks.contains(&disk.id) {
            tracing::debug!(disk = %disk.id, "disk re-announced; treating as a description change");
            let id = disk.id.clone();
            self.disk_description_changed(&id, disk.description);
            return;
        }

        let id = disk.id.clone();
        disk.state.insert(DiskState::StagedProbe);
        tracing::info!(disk = %id, device = %disk.device_path, whole = disk.is_whole(), "disk appeared");
        self.disks.insert(disk);

        self.begin_peek(&id);
        self.settle();
    }

    pub fn disk_description_changed(&mut self, id: &DiskId, mut description: Description) {
        let Some(disk) = self.disks.get_mut(id) else {
            tracing::debug!(disk = %id, "description change for unknown disk");
            return;
        };

        // The feed knows nothing about adoption; carry the broker-owned key over.
        if disk.description.contains_key(keys::DISK_ADOPTED) {
            description.insert(
                keys::DISK_ADOPTED.to_string(),
                serde_json::Value::Bool(disk.adopted),
            );
        }

        let changed = arbiter_types::changed_keys(&disk.description, &description);
        disk.set_description(description);
        let appeared = disk.has_appeared();

        if changed.is_empty() {
            return;
        }

        tracing::debug!(disk = %id, ?changed, "description changed");
        if appeared {
            self.broadcast_to_all(
                CallbackKind::DescriptionChanged,
                Some(id),
                CallbackArgument::ChangedKeys(changed),
            );
        }
        self.settle();
    }

    pub fn disk_disappeared(&mut self, id: &DiskId) {
        let Some(disk) = self.disks.get(id) else {
            tracing::debug!(disk = %id, "disappearance of unknown disk");
            return;
        };
        let appeared = disk.has_appeared();

        tracing::info!(disk = %id, "disk disappeared");
        self.release_disk(id);

        if appeared {
            self.broadcast_to_all(CallbackKind::DiskDisappeared, Some(id), CallbackArgument::None);
        }
        self.disks.remove(id);
        self.settle();
    }

    pub fn enumeration_complete(&mut self) {
        if self.enumerated {
            return;
        }

        self.enumerated = true;
        tracing::info!(disks = self.disks.len(), "initial disk enumeration complete");
        self.broadcast_to_all(CallbackKind::ListComplete, None, CallbackArgument::None);
        self.settle();
    }

    // Internal helpers

    pub(crate) fn session_mut(&mut self, id: SessionId) -> Result<&mut Session, ArbitrationError> {
        match self.sessions.get_mut(id) {
            Some(session) if !session.is_zombie() => Ok(session),
            _ => Err(ArbitrationError::new(
                ArbitrationErrorKind::NotFound,
                format!("unknown session {id}"),
            )),
        }
    }

    fn disk_ref(&self, id: &DiskId) -> Result<&Disk, ArbitrationError> {
        self.disks.get(id).ok_or_else(|| {
            ArbitrationError::new(ArbitrationErrorKind::NotFound, format!("unknown disk {id}"))
        })
    }

    fn disk_mut(&mut self, id: &DiskId) -> Result<&mut Disk, ArbitrationError> {
        self.disks.get_mut(id).ok_or_else(|| {
            ArbitrationError::new(ArbitrationErrorKind::NotFound, format!("unknown disk {id}"))
        })
    }

    fn allocate_request_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request);
        self.next_request += 1;
        id
    }

    pub(crate) fn allocate_response_id(&mut self) -> ResponseId {
        let id = ResponseId::new(self.next_response);
        self.next_response += 1;
        id
    }

    pub(crate) fn rearm_timer(&mut self) {
        let sessions = &self.sessions;
        let earliest = self.tracker.earliest(|id| {
            sessions
                .get(id)
                .is_some_and(|session| session.ignores_timeouts())
        });
        self.timer.rearm(
            earliest,
            self.config.response_timeout,
            self.config.timer_leeway,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, kinds, token_for, volume, whole_description, whole_disk};
    use serde_json::json;

    fn claim_outcome(fx: &mut Fixture, session: SessionId) -> CompletionStatus {
        let queue = fx.drain(session);
        let instance = queue
            .iter()
            .find(|instance| instance.kind == CallbackKind::Claim)
            .expect("claim completion");
        match &instance.argument {
            CallbackArgument::Outcome(status) => status.clone(),
            other => panic!("unexpected argument {other:?}"),
        }
    }

    #[test]
    fn peek_votes_delay_appearance_and_dissent_is_ignored() {
        let mut fx = Fixture::new();
        let watcher = fx.session("watcher");
        fx.subscribe(watcher, CallbackKind::Peek);
        fx.subscribe(watcher, CallbackKind::DiskAppeared);

        let sdb = fx.appear(whole_disk("sdb"));
        assert!(!fx.broker.disk(&sdb).is_some_and(Disk::has_appeared));
        assert!(!fx.broker.is_idle());

        let queue = fx.drain(watcher);
        assert_eq!(kinds(&queue), vec![CallbackKind::Peek]);
        let id = queue[0].response_id().expect("peek response id");

        fx.broker
            .respond(watcher, &sdb, id, Some(Dissenter::new(1, None)))
            .expect("respond");
        assert!(fx.broker.disk(&sdb).is_some_and(Disk::has_appeared));
        assert_eq!(kinds(&fx.drain(watcher)), vec![CallbackKind::DiskAppeared]);
    }

    #[test]
    fn unknown_disks_and_sessions_are_not_found() {
        let mut fx = Fixture::new();
        let session = fx.session("files");
        let missing = DiskId::from("nvme9n1");

        let error = fx
            .submit(session, RequestKind::Mount, &missing)
            .expect_err("unknown disk");
        assert_eq!(error.kind, ArbitrationErrorKind::NotFound);
        assert_eq!(kinds(&fx.drain(session)), vec![CallbackKind::Mount]);

        fx.broker.release_session(session).expect("release");
        let error = fx.broker.drain(session).expect_err("released session");
        assert_eq!(error.kind, ArbitrationErrorKind::NotFound);
    }

    #[test]
    fn list_complete_fires_immediately_once_enumerated() {
        let mut fx = Fixture::new();
        let early = fx.session("early");
        fx.subscribe(early, CallbackKind::ListComplete);
        assert!(fx.drain(early).is_empty());

        assert!(!fx.broker.enumeration_finished());
        fx.broker.device_event(DeviceEvent::EnumerationComplete);
        fx.broker.device_event(DeviceEvent::EnumerationComplete);
        assert!(fx.broker.enumeration_finished());
        assert_eq!(kinds(&fx.drain(early)), vec![CallbackKind::ListComplete]);

        let late = fx.session("late");
        fx.subscribe(late, CallbackKind::ListComplete);
        assert_eq!(kinds(&fx.drain(late)), vec![CallbackKind::ListComplete]);
    }

    #[test]
    fn watch_lists_narrow_description_changes() {
        let mut fx = Fixture::new();
        let session = fx.session("panel");
        let sdb = fx.appear(whole_disk("sdb"));

        let mut spec = RegistrationSpec::new(
            token_for(CallbackKind::DescriptionChanged),
            CallbackKind::DescriptionChanged,
        );
        spec.watch = Some(vec![keys::VOLUME_PATH.to_string()]);
        fx.broker.register(session, spec).expect("register");

        let mut description = fx.broker.copy_description(&sdb).expect("description");
        description.insert(keys::VOLUME_NAME.to_string(), json!("BACKUP"));
        fx.broker.disk_description_changed(&sdb, description.clone());
        assert!(fx.drain(session).is_empty());

        description.insert(keys::VOLUME_PATH.to_string(), json!("/media/BACKUP"));
        description.insert(keys::VOLUME_NAME.to_string(), json!("BACKUP2"));
        fx.broker.disk_description_changed(&sdb, description);

        let queue = fx.drain(session);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue[0].argument,
            CallbackArgument::ChangedKeys(vec![keys::VOLUME_PATH.to_string()])
        );
    }

    #[test]
    fn matching_predicates_filter_disks() {
        let mut fx = Fixture::new();
        let session = fx.session("automounter");
        fx.appear(whole_disk("sdb"));
        fx.appear(volume("sdb1", "sdb"));

        let mut spec = RegistrationSpec::new(
            token_for(CallbackKind::DiskAppeared),
            CallbackKind::DiskAppeared,
        );
        let mut matching = Description::new();
        matching.insert(keys::MEDIA_WHOLE.to_string(), json!(false));
        spec.matching = Some(matching);
        fx.broker.register(session, spec).expect("register");

        let queue = fx.drain(session);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue[0].disk.as_ref().map(|disk| disk.id.as_str()),
            Some("sdb1")
        );
    }

    #[test]
    fn claims_move_only_with_the_owners_consent() {
        let mut fx = Fixture::new();
        let owner = fx.session("owner");
        let rival = fx.session("rival");
        let sdb = fx.appear(whole_disk("sdb"));

        fx.submit(owner, RequestKind::Claim, &sdb).expect("claim");
        assert_eq!(claim_outcome(&mut fx, owner), CompletionStatus::Success);
        assert!(fx.broker.is_claimed(&sdb).expect("claimed"));

        fx.submit(rival, RequestKind::Claim, &sdb).expect("contested claim");
        let status = claim_outcome(&mut fx, rival);
        assert!(matches!(
            status,
            CompletionStatus::Failed(ArbitrationError { kind: ArbitrationErrorKind::Busy, .. })
        ));

        fx.subscribe(owner, CallbackKind::ClaimRelease);
        fx.submit(rival, RequestKind::Claim, &sdb).expect("contested claim");
        let queue = fx.drain(owner);
        assert_eq!(kinds(&queue), vec![CallbackKind::ClaimRelease]);
        let id = queue[0].response_id().expect("release response id");

        fx.broker.respond(owner, &sdb, id, None).expect("release");
        assert_eq!(claim_outcome(&mut fx, rival), CompletionStatus::Success);
        assert_eq!(fx.broker.disk(&sdb).and_then(|disk| disk.claim), Some(rival));

        let error = fx.broker.unclaim(owner, &sdb).expect_err("not the owner");
        assert_eq!(error.kind, ArbitrationErrorKind::NotPrivileged);
        fx.broker.unclaim(rival, &sdb).expect("unclaim");
        assert!(!fx.broker.is_claimed(&sdb).expect("claimed"));
    }

    #[test]
    fn adoption_is_published_in_the_description() {
        let mut fx = Fixture::new();
        let session = fx.session("files");
        fx.subscribe(session, CallbackKind::DescriptionChanged);
        let sdb = fx.appear(whole_disk("sdb"));

        fx.broker.set_adoption(&sdb, true).expect("adopt");
        let description = fx.broker.copy_description(&sdb).expect("description");
        assert_eq!(description.get(keys::DISK_ADOPTED), Some(&json!(true)));
        assert_eq!(kinds(&fx.drain(session)), vec![CallbackKind::DescriptionChanged]);

        fx.broker
            .set_disk_options(&sdb, DiskOption::NoAutomount.into(), true)
            .expect("options");
        fx.broker
            .set_disk_options(&sdb, DiskOption::Private.into(), true)
            .expect("options");
        fx.broker
            .set_disk_options(&sdb, DiskOption::NoAutomount.into(), false)
            .expect("options");
        assert_eq!(
            fx.broker.disk_options(&sdb).expect("options"),
            BitFlags::from(DiskOption::Private)
        );
    }

    #[test]
    fn feed_updates_keep_the_adoption_key() {
        let mut fx = Fixture::new();
        let sdb = fx.appear(whole_disk("sdb"));
        fx.broker.set_adoption(&sdb, true).expect("adopt");

        fx.broker
            .disk_description_changed(&sdb, whole_description("sdb"));

        let description = fx.broker.copy_description(&sdb).expect("description");
        assert_eq!(description.get(keys::DISK_ADOPTED), Some(&json!(true)));
    }

    #[test]
    fn zombie_disks_report_no_description_changes() {
        let mut fx = Fixture::new();
        let watcher = fx.session("watcher");
        fx.subscribe(watcher, CallbackKind::DescriptionChanged);
        let sdb = fx.appear(whole_disk("sdb"));
        fx.drain(watcher);

        let mut description = whole_description("sdb");
        description.insert(keys::VOLUME_NAME.to_string(), json!("live"));
        fx.broker.disk_description_changed(&sdb, description.clone());
        assert_eq!(kinds(&fx.drain(watcher)), vec![CallbackKind::DescriptionChanged]);

        if let Some(disk) = fx.broker.disks.get_mut(&sdb) {
            disk.state.insert(DiskState::Zombie);
        }
        description.insert(keys::VOLUME_NAME.to_string(), json!("gone"));
        fx.broker.disk_description_changed(&sdb, description);
        assert!(fx.drain(watcher).is_empty());
        assert_eq!(
            fx.broker
                .copy_description(&sdb)
                .ok()
                .and_then(|description| description.get(keys::VOLUME_NAME).cloned()),
            Some(json!("gone"))
        );
    }

    #[test]
    fn private_disks_are_hidden_from_other_sessions() {
        let mut fx = Fixture::new();
        let owner = fx.session("owner");
        let other = fx.session("other");
        let sdb = fx.appear(whole_disk("sdb"));

        fx.submit(owner, RequestKind::Claim, &sdb).expect("claim");
        fx.broker
            .set_disk_options(&sdb, DiskOption::Private.into(), true)
            .expect("options");

        fx.subscribe(owner, CallbackKind::DiskAppeared);
        fx.subscribe(other, CallbackKind::DiskAppeared);
        assert!(
            kinds(&fx.drain(owner)).contains(&CallbackKind::DiskAppeared),
            "owner still sees its disk"
        );
        assert!(fx.drain(other).is_empty());
    }

    #[test]
    fn refresh_completes_without_a_callback() {
        let mut fx = Fixture::new();
        let session = fx.session("files");
        let sdb = fx.appear(whole_disk("sdb"));

        fx.broker.refresh(session, &sdb).expect("refresh");
        let jobs = fx.stage.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, RequestKind::Refresh);

        fx.finish_stage(&sdb, CompletionStatus::Success);
        assert!(fx.drain(session).is_empty());
        assert!(fx.broker.queue().is_empty());
    }

    #[test]
    fn wakes_follow_enqueued_instances() {
        let mut fx = Fixture::new();
        let session = fx.session("files");
        fx.subscribe(session, CallbackKind::DiskAppeared);
        fx.appear(whole_disk("sdb"));

        assert_eq!(fx.notifier.wakes(), vec![session]);
    }
}
