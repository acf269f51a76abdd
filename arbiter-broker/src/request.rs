// SPDX-License-Identifier: GPL-3.0-only

//! Queued operations
//!
//! A request lives in the queue from submission until its completion is
//! dispatched. Whole-disk requests own a link-set: one sub-request per sibling
//! volume, each of which reports its outcome back into the parent's link
//! entry before leaving the queue.

use std::collections::VecDeque;

use arbiter_contracts::{ArbitrationError, ArbitrationErrorKind, CompletionStatus};
use arbiter_types::{
    CallbackToken, CallerInfo, Disk, DiskId, RequestArguments, RequestId, RequestKind,
    RequestOption, SessionId,
};
use enumflags2::BitFlags;

use crate::directory::CallbackRegistration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for its disk, its links, or its turn
    Queued,
    /// Approval callbacks are out
    AwaitingApproval,
    /// Handed to the stage engine
    Dispatched,
}

/// A sibling sub-request and the outcome it recorded
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub request: RequestId,
    pub disk: DiskId,
    pub outcome: Option<CompletionStatus>,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) id: RequestId,
    pub(crate) kind: RequestKind,
    pub(crate) disk: DiskId,
    pub(crate) session: SessionId,
    pub(crate) options: BitFlags<RequestOption>,
    pub(crate) arguments: RequestArguments,
    pub(crate) caller: CallerInfo,
    pub(crate) callback: Option<CallbackRegistration>,
    pub(crate) links: Vec<Link>,
    pub(crate) parent: Option<RequestId>,
    pub(crate) state: RequestState,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: RequestId,
        kind: RequestKind,
        disk: DiskId,
        session: SessionId,
        options: BitFlags<RequestOption>,
        arguments: RequestArguments,
        caller: CallerInfo,
        callback: Option<CallbackRegistration>,
    ) -> Self {
        Self {
            id,
            kind,
            disk,
            session,
            options,
            arguments,
            caller,
            callback,
            links: Vec::new(),
            parent: None,
            state: RequestState::Queued,
        }
    }

    /// Sub-request for a sibling; shares everything but the disk and has no completion
    pub(crate) fn linked(id: RequestId, parent: &Request, disk: DiskId) -> Self {
        Self {
            id,
            kind: linked_kind(parent.kind),
            disk,
            session: parent.session,
            options: parent.options,
            arguments: parent.arguments.clone(),
            caller: parent.caller.clone(),
            callback: None,
            links: Vec::new(),
            parent: Some(parent.id),
            state: RequestState::Queued,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn disk(&self) -> &DiskId {
        &self.disk
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn options(&self) -> BitFlags<RequestOption> {
        self.options
    }

    pub fn caller(&self) -> &CallerInfo {
        &self.caller
    }

    pub fn callback(&self) -> Option<&CallbackRegistration> {
        self.callback.as_ref()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn links_settled(&self) -> bool {
        self.links.iter().all(|link| link.outcome.is_some())
    }

    /// Outcome of the first link, in link order, that did not succeed
    pub(crate) fn failed_link(&self) -> Option<CompletionStatus> {
        self.links
            .iter()
            .filter_map(|link| link.outcome.as_ref())
            .find(|outcome| !outcome.is_success())
            .cloned()
    }

    pub(crate) fn record_link(&mut self, child: RequestId, status: CompletionStatus) {
        if let Some(link) = self.links.iter_mut().find(|link| link.request == child) {
            link.outcome = Some(status);
        }
    }

    fn completes_to(&self, session: SessionId, token: CallbackToken) -> bool {
        self.callback
            .as_ref()
            .is_some_and(|callback| callback.session == session && callback.token == token)
    }
}

/// FIFO of live requests
#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: VecDeque<Request>,
}

impl RequestQueue {
    pub(crate) fn push(&mut self, request: Request) {
        self.requests.push_back(request);
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.requests.iter().find(|request| request.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.iter_mut().find(|request| request.id == id)
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<Request> {
        let index = self.requests.iter().position(|request| request.id == id)?;
        self.requests.remove(index)
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(Request::id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    /// The request the stage engine is running for `disk` and `kind`
    pub(crate) fn find_dispatched(&self, disk: &DiskId, kind: RequestKind) -> Option<RequestId> {
        self.requests
            .iter()
            .find(|request| {
                request.state == RequestState::Dispatched
                    && &request.disk == disk
                    && request.kind == kind
            })
            .map(Request::id)
    }

    pub(crate) fn referencing_disk(&self, disk: &DiskId) -> Vec<RequestId> {
        self.requests
            .iter()
            .filter(|request| &request.disk == disk)
            .map(Request::id)
            .collect()
    }

    /// Requests of `session` the stage engine has not started yet
    pub(crate) fn undispatched_for_session(&self, session: SessionId) -> Vec<RequestId> {
        self.requests
            .iter()
            .filter(|request| request.session == session && request.state != RequestState::Dispatched)
            .map(Request::id)
            .collect()
    }

    /// Detaches completion registrations owned by `session` from in-flight requests
    pub(crate) fn strip_session_callbacks(&mut self, session: SessionId) -> usize {
        let mut stripped = 0;
        for request in self.requests.iter_mut() {
            if request
                .callback
                .as_ref()
                .is_some_and(|callback| callback.session == session)
            {
                request.callback = None;
                stripped += 1;
            }
        }
        stripped
    }

    pub(crate) fn strip_callback(&mut self, session: SessionId, token: CallbackToken) {
        for request in self.requests.iter_mut() {
            if request.completes_to(session, token) {
                request.callback = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Rejects option combinations that can never succeed on `disk`
pub(crate) fn validate(
    kind: RequestKind,
    disk: &Disk,
    options: BitFlags<RequestOption>,
    arguments: &RequestArguments,
) -> Result<(), ArbitrationError> {
    if disk.is_zombie() {
        return Err(ArbitrationError::new(
            ArbitrationErrorKind::NotFound,
            format!("disk {} is going away", disk.id),
        ));
    }

    let whole = options.contains(RequestOption::Whole);

    match kind {
        RequestKind::Mount => {
            if whole && arguments.mount_point.is_some() {
                return Err(ArbitrationError::new(
                    ArbitrationErrorKind::BadArgument,
                    "an explicit mount point cannot be combined with whole-disk mounting",
                ));
            }
            require_whole_if(whole, disk)
        }
        RequestKind::Unmount => require_whole_if(whole, disk),
        RequestKind::Eject => require_whole_if(true, disk),
        RequestKind::Rename => {
            if whole {
                return Err(ArbitrationError::new(
                    ArbitrationErrorKind::BadArgument,
                    "rename applies to a single volume",
                ));
            }
            match arguments.name.as_deref() {
                Some(name) if !name.trim().is_empty() => Ok(()),
                _ => Err(ArbitrationError::new(
                    ArbitrationErrorKind::BadArgument,
                    "rename requires a non-empty name",
                )),
            }
        }
        RequestKind::Claim | RequestKind::Probe | RequestKind::Refresh => Ok(()),
    }
}

fn require_whole_if(required: bool, disk: &Disk) -> Result<(), ArbitrationError> {
    if required && !disk.is_whole() {
        return Err(ArbitrationError::new(
            ArbitrationErrorKind::Unsupported,
            format!("disk {} is not a whole disk", disk.id),
        ));
    }
    Ok(())
}

/// Whether a submission is duplicated onto every sibling volume
pub(crate) fn fans_out(kind: RequestKind, disk: &Disk, options: BitFlags<RequestOption>) -> bool {
    let whole = options.contains(RequestOption::Whole)
        && matches!(kind, RequestKind::Mount | RequestKind::Unmount);
    whole || kind == RequestKind::Eject || (kind == RequestKind::Unmount && disk.is_multi_volume())
}

/// Kind given to the sibling sub-requests of a fanned-out submission.
///
/// Ejecting a drive first unmounts each of its volumes.
pub(crate) fn linked_kind(kind: RequestKind) -> RequestKind {
    match kind {
        RequestKind::Eject => RequestKind::Unmount,
        other => other,
    }
}
