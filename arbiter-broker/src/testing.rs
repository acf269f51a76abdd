// SPDX-License-Identifier: GPL-3.0-only

//! Deterministic collaborators for exercising the broker without a bus,
//! a device feed or a wall clock.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arbiter_contracts::{
    CallbackInstance, Clock, CompletionStatus, StageEngine, StageJob, StageOutcome, WakeNotifier,
};
use arbiter_types::description::keys;
use arbiter_types::{
    CallbackKind, CallbackToken, CallerInfo, Description, Disk, DiskId, RequestKind, SessionId,
};
use serde_json::json;

use crate::broker::{Broker, BrokerConfig, RegistrationSpec, SubmitSpec};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

/// Stage engine that records jobs and leaves completion to the test
#[derive(Debug, Clone, Default)]
pub struct RecordingStage {
    jobs: Arc<Mutex<Vec<StageJob>>>,
}

impl RecordingStage {
    pub fn jobs(&self) -> Vec<StageJob> {
        lock(&self.jobs).clone()
    }

    /// Removes the oldest job for `disk`
    pub fn take_for(&self, disk: &DiskId) -> Option<StageJob> {
        let mut jobs = lock(&self.jobs);
        let index = jobs.iter().position(|job| &job.disk == disk)?;
        Some(jobs.remove(index))
    }
}

impl StageEngine for RecordingStage {
    fn start(&mut self, job: StageJob) {
        lock(&self.jobs).push(job);
    }
}

/// Notifier that records every wake
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    wakes: Arc<Mutex<Vec<SessionId>>>,
}

impl RecordingNotifier {
    pub fn wakes(&self) -> Vec<SessionId> {
        lock(&self.wakes).clone()
    }
}

impl WakeNotifier for RecordingNotifier {
    fn wake(&mut self, session: SessionId) {
        lock(&self.wakes).push(session);
    }
}

/// Description of a whole medium on `unit`
pub fn whole_description(unit: &str) -> Description {
    let mut description = Description::new();
    description.insert(keys::MEDIA_WHOLE.to_string(), json!(true));
    description.insert(keys::MEDIA_REMOVABLE.to_string(), json!(true));
    description.insert(keys::MEDIA_EJECTABLE.to_string(), json!(true));
    description.insert(keys::DEVICE_UNIT.to_string(), json!(unit));
    description
}

/// Description of a volume on `unit`
pub fn volume_description(unit: &str, name: &str) -> Description {
    let mut description = Description::new();
    description.insert(keys::MEDIA_WHOLE.to_string(), json!(false));
    description.insert(keys::DEVICE_UNIT.to_string(), json!(unit));
    description.insert(keys::VOLUME_KIND.to_string(), json!("vfat"));
    description.insert(keys::VOLUME_NAME.to_string(), json!(name));
    description
}

pub fn whole_disk(id: &str) -> Disk {
    Disk::new(id, format!("/dev/{id}"), whole_description(id))
}

pub fn volume(id: &str, unit: &str) -> Disk {
    Disk::new(id, format!("/dev/{id}"), volume_description(unit, id))
}

/// A broker wired to recording collaborators and a manual clock
pub struct Fixture {
    pub broker: Broker,
    pub clock: ManualClock,
    pub stage: RecordingStage,
    pub notifier: RecordingNotifier,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        let clock = ManualClock::new();
        let stage = RecordingStage::default();
        let notifier = RecordingNotifier::default();
        let broker = Broker::with_clock(
            config,
            Box::new(stage.clone()),
            Box::new(notifier.clone()),
            Box::new(clock.clone()),
        );

        Self {
            broker,
            clock,
            stage,
            notifier,
        }
    }

    pub fn session(&mut self, name: &str) -> SessionId {
        self.broker.create_session(name, 1000, CallerInfo::new(1000, 1000))
    }

    /// Registers `kind` with a token derived from the kind's position
    pub fn subscribe(&mut self, session: SessionId, kind: CallbackKind) -> CallbackToken {
        let token = token_for(kind);
        self.broker
            .register(session, RegistrationSpec::new(token, kind))
            .unwrap_or_else(|error| panic!("register {kind}: {error}"));
        token
    }

    /// Feeds `disk` in; without peek voters it appears immediately
    pub fn appear(&mut self, disk: Disk) -> DiskId {
        let id = disk.id.clone();
        self.broker.disk_appeared(disk);
        id
    }

    pub fn submit(
        &mut self,
        session: SessionId,
        kind: RequestKind,
        disk: &DiskId,
    ) -> Result<arbiter_types::RequestId, arbiter_contracts::ArbitrationError> {
        let mut spec = SubmitSpec::new(kind, disk.clone(), CallerInfo::new(1000, 1000));
        spec.callback = Some(token_for(kind.completion_kind()));
        self.broker.submit(session, spec)
    }

    pub fn drain(&mut self, session: SessionId) -> Vec<CallbackInstance> {
        self.broker
            .drain(session)
            .unwrap_or_else(|error| panic!("drain {session}: {error}"))
    }

    /// Completes the oldest recorded stage job on `disk` with `status`
    pub fn finish_stage(&mut self, disk: &DiskId, status: CompletionStatus) {
        let Some(job) = self.stage.take_for(disk) else {
            panic!("no stage job for {disk}");
        };
        let outcome = StageOutcome::for_job(&job, status);
        self.broker.stage_completed(outcome);
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn token_for(kind: CallbackKind) -> CallbackToken {
    let position = CallbackKind::ALL
        .iter()
        .position(|candidate| *candidate == kind)
        .unwrap_or_default();
    CallbackToken::new(position as u64 + 1, 0)
}

/// Kinds of the instances in `queue`, in order
pub fn kinds(queue: &[CallbackInstance]) -> Vec<CallbackKind> {
    queue.iter().map(|instance| instance.kind).collect()
}
