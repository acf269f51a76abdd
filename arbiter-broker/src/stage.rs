// SPDX-License-Identifier: GPL-3.0-only

//! Request staging
//!
//! Queued requests advance FIFO through approval, claim resolution and the
//! stage engine. Every entry point that changes state ends in `settle`, which
//! keeps advancing until a full pass changes nothing, then re-arms the
//! response timer and updates idle tracking.

use arbiter_contracts::{
    ArbitrationError, ArbitrationErrorKind, CallbackArgument, CompletionStatus, Dissenter,
    StageJob, StageOutcome,
};
use arbiter_types::{CallbackKind, DiskId, DiskState, RequestId, RequestKind, SessionFlag};

use crate::broker::Broker;
use crate::directory::CallbackRegistration;
use crate::request::RequestState;
use crate::response::PendingCompletion;

impl Broker {
    pub(crate) fn settle(&mut self) {
        while self.advance_queue() {}
        self.rearm_timer();
        self.update_idle();
    }

    fn advance_queue(&mut self) -> bool {
        let mut progressed = false;
        for id in self.queue.ids() {
            progressed |= self.advance(id);
        }
        progressed
    }

    /// Moves one queued request forward if nothing blocks it
    fn advance(&mut self, id: RequestId) -> bool {
        let Some(request) = self.queue.get(id) else {
            return false;
        };
        if request.state != RequestState::Queued {
            return false;
        }

        let (disk_id, kind) = (request.disk.clone(), request.kind);
        let Some(disk) = self.disks.get(&disk_id).filter(|disk| !disk.is_zombie()) else {
            self.complete_request(id, not_found(&disk_id));
            return true;
        };

        if !request.links_settled() {
            return false;
        }
        if let Some(failed) = request.failed_link() {
            tracing::debug!(%id, "linked request failed; completing parent");
            self.complete_request(id, failed);
            return true;
        }
        if disk.is_busy() || self.tracker.has_pending(&disk_id) {
            return false;
        }

        match (kind, kind.approval_kind()) {
            (_, Some(approval)) => self.begin_approval(id, &disk_id, approval),
            (RequestKind::Claim, None) => self.begin_claim(id, &disk_id),
            _ => self.start_stage(id),
        }
        true
    }

    /// Starts the peek vote for a newly discovered disk
    pub(crate) fn begin_peek(&mut self, disk: &DiskId) {
        if let Err(error) = self.tracker.record_pending(disk, PendingCompletion::Appear) {
            tracing::warn!(%disk, %error, "cannot stage disk");
            return;
        }
        self.broadcast_to_all(CallbackKind::Peek, Some(disk), CallbackArgument::None);
        self.complete_response(disk);
    }

    fn begin_approval(&mut self, id: RequestId, disk: &DiskId, approval: CallbackKind) {
        if let Err(error) = self.tracker.record_pending(disk, PendingCompletion::Request(id)) {
            self.complete_request(id, CompletionStatus::Failed(error));
            return;
        }
        if let Some(request) = self.queue.get_mut(id) {
            request.state = RequestState::AwaitingApproval;
        }

        let voters = self.broadcast_to_all(approval, Some(disk), CallbackArgument::None);
        tracing::debug!(%id, %disk, %approval, voters, "approval requested");
        self.complete_response(disk);
    }

    fn begin_claim(&mut self, id: RequestId, disk_id: &DiskId) {
        let Some(session) = self.queue.get(id).map(|request| request.session) else {
            return;
        };
        let owner = self.disks.get(disk_id).and_then(|disk| disk.claim);

        match owner {
            None => {
                self.grant_claim(disk_id, session);
                self.complete_request(id, CompletionStatus::Success);
            }
            Some(owner) if owner == session => {
                self.complete_request(id, CompletionStatus::Success);
            }
            Some(owner) => {
                let release: Vec<CallbackRegistration> = self
                    .sessions
                    .get(owner)
                    .map(|entry| {
                        entry
                            .directory
                            .of_kind(CallbackKind::ClaimRelease)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();

                if release.is_empty() {
                    let error = ArbitrationError::new(
                        ArbitrationErrorKind::Busy,
                        format!("disk {disk_id} is claimed by {owner}"),
                    );
                    self.complete_request(id, CompletionStatus::Failed(error));
                    return;
                }

                if let Err(error) =
                    self.tracker.record_pending(disk_id, PendingCompletion::Request(id))
                {
                    self.complete_request(id, CompletionStatus::Failed(error));
                    return;
                }
                if let Some(request) = self.queue.get_mut(id) {
                    request.state = RequestState::AwaitingApproval;
                }

                for registration in &release {
                    self.dispatch_logged(registration, Some(disk_id), CallbackArgument::None);
                }
                tracing::debug!(%id, disk = %disk_id, %owner, "claim release requested");
                self.complete_response(disk_id);
            }
        }
    }

    fn grant_claim(&mut self, disk_id: &DiskId, session: arbiter_types::SessionId) {
        if let Some(disk) = self.disks.get_mut(disk_id) {
            disk.claim = Some(session);
            tracing::info!(disk = %disk_id, %session, "disk claimed");
        }
    }

    /// Fires the pending completion for `disk` once its last vote is in
    pub(crate) fn complete_response(&mut self, disk: &DiskId) {
        let Some((completion, dissent)) = self.tracker.complete(disk) else {
            return;
        };

        match completion {
            PendingCompletion::Appear => self.finish_appear(disk, dissent),
            PendingCompletion::Request(id) => self.finish_approval(id, dissent),
        }
    }

    fn finish_appear(&mut self, id: &DiskId, dissent: Option<Dissenter>) {
        if let Some(dissent) = dissent {
            tracing::debug!(disk = %id, status = dissent.status, "peek dissent ignored");
        }

        let Some(disk) = self.disks.get_mut(id).filter(|disk| !disk.is_zombie()) else {
            return;
        };
        disk.state |= DiskState::StagedPeek | DiskState::StagedAppear;

        self.broadcast_to_all(CallbackKind::DiskAppeared, Some(id), CallbackArgument::None);
    }

    fn finish_approval(&mut self, id: RequestId, dissent: Option<Dissenter>) {
        let Some(request) = self.queue.get_mut(id) else {
            return;
        };
        request.state = RequestState::Queued;
        let (disk, kind, session) = (request.disk.clone(), request.kind, request.session);

        if let Some(dissent) = dissent {
            tracing::info!(%id, %disk, %kind, status = dissent.status, "request dissented");
            self.complete_request(id, CompletionStatus::Dissented(dissent));
            return;
        }
        if self.disks.get(&disk).is_none_or(|entry| entry.is_zombie()) {
            self.complete_request(id, not_found(&disk));
            return;
        }

        if kind == RequestKind::Claim {
            self.grant_claim(&disk, session);
            self.complete_request(id, CompletionStatus::Success);
        } else {
            self.start_stage(id);
        }
    }

    fn start_stage(&mut self, id: RequestId) {
        let Some(request) = self.queue.get_mut(id) else {
            return;
        };
        request.state = RequestState::Dispatched;
        let (kind, disk_id) = (request.kind, request.disk.clone());
        let (options, arguments, caller) = (
            request.options,
            request.arguments.clone(),
            request.caller.clone(),
        );

        let now = self.clock.now();
        let Some(disk) = self.disks.get_mut(&disk_id) else {
            return;
        };
        disk.state.insert(DiskState::CommandActive);
        disk.busy_since = Some(now);

        let job = StageJob {
            request: id,
            kind,
            disk: disk_id,
            device_path: disk.device_path.clone(),
            options,
            arguments,
            caller,
        };
        tracing::info!(%id, %kind, disk = %job.disk, device = %job.device_path, "stage started");
        self.stage.start(job);
    }

    /// Removes a request and delivers its outcome to the requester and its parent
    pub(crate) fn complete_request(&mut self, id: RequestId, status: CompletionStatus) {
        let Some(request) = self.queue.remove(id) else {
            return;
        };

        if request.state == RequestState::AwaitingApproval {
            self.tracker.abandon(&request.disk);
        }

        match &status {
            CompletionStatus::Success => {
                tracing::info!(%id, kind = %request.kind, disk = %request.disk, "request completed")
            }
            CompletionStatus::Failed(error) => {
                tracing::info!(%id, kind = %request.kind, disk = %request.disk, %error, "request failed")
            }
            CompletionStatus::Dissented(dissent) => {
                tracing::info!(%id, kind = %request.kind, disk = %request.disk, status = dissent.status, "request dissented")
            }
        }

        if let Some(parent) = request.parent
            && let Some(parent) = self.queue.get_mut(parent)
        {
            parent.record_link(id, status.clone());
        }

        if let Some(callback) = &request.callback {
            self.dispatch_logged(
                callback,
                Some(&request.disk),
                CallbackArgument::Outcome(status),
            );
        }
    }

    /// Handles the stage engine's report for a dispatched request
    pub fn stage_completed(&mut self, outcome: StageOutcome) {
        if let Some(disk) = self.disks.get_mut(&outcome.disk) {
            disk.state.remove(DiskState::CommandActive);
            disk.busy_since = None;

            if outcome.status.is_success() {
                match outcome.kind {
                    RequestKind::Mount => disk.state.insert(DiskState::StagedMount),
                    RequestKind::Unmount | RequestKind::Eject => {
                        disk.state.remove(DiskState::StagedMount)
                    }
                    RequestKind::Probe | RequestKind::Refresh => {
                        disk.state.remove(DiskState::RequireReprobe)
                    }
                    RequestKind::Claim | RequestKind::Rename => {}
                }
            }
        }

        match self.queue.find_dispatched(&outcome.disk, outcome.kind) {
            Some(id) => self.complete_request(id, outcome.status),
            None => {
                tracing::debug!(disk = %outcome.disk, kind = %outcome.kind, "stage outcome for a request that is gone");
            }
        }
        self.settle();
    }

    /// Expires overdue votes as implicit approvals
    pub fn on_timer(&mut self) {
        let now = self.clock.now();
        let sessions = &self.sessions;
        let expired = self.tracker.expire(now, self.config.response_timeout, |id| {
            sessions
                .get(id)
                .is_some_and(|session| session.ignores_timeouts())
        });

        let mut disks: Vec<DiskId> = Vec::new();
        for row in expired {
            if let Some(session) = self.sessions.get_mut(row.session)
                && !session.is_timed_out()
            {
                session.flags.insert(SessionFlag::TimedOut);
                tracing::warn!(
                    session = %row.session,
                    name = session.name(),
                    disk = %row.disk,
                    "session did not respond in time; treating as approval"
                );
            }
            if !disks.contains(&row.disk) {
                disks.push(row.disk);
            }
        }

        for disk in &disks {
            self.complete_response(disk);
        }
        self.settle();
    }

    fn update_idle(&mut self) {
        let idle = self.queue.is_empty() && self.tracker.is_empty();
        if idle && !self.idle {
            self.idle = true;
            tracing::debug!("broker idle");
            self.broadcast_to_all(CallbackKind::Idle, None, CallbackArgument::None);
        } else {
            self.idle = idle;
        }
    }
}

fn not_found(disk: &DiskId) -> CompletionStatus {
    CompletionStatus::Failed(ArbitrationError::new(
        ArbitrationErrorKind::NotFound,
        format!("disk {disk} is gone"),
    ))
}
