// SPDX-License-Identifier: GPL-3.0-only

//! Turning registrations into queued callback instances

use arbiter_contracts::{ArbitrationError, ArbitrationErrorKind, CallbackArgument, CallbackInstance};
use arbiter_types::{CallbackClass, CallbackKind, DiskId, DiskOption, SessionFlag, SessionId};

use crate::broker::Broker;
use crate::directory::CallbackRegistration;
use crate::response::ResponseRow;

impl Broker {
    /// Fires `registration` for `disk`.
    ///
    /// Returns `Ok(false)` when the registration filtered the event out. For
    /// approval kinds the caller supplies `CallbackArgument::None`; the
    /// response id is allocated here and a row is added to the tracker,
    /// which must already hold a pending completion for the disk.
    pub(crate) fn dispatch(
        &mut self,
        registration: &CallbackRegistration,
        disk: Option<&DiskId>,
        argument: CallbackArgument,
    ) -> Result<bool, ArbitrationError> {
        let kind = registration.kind;
        let session_id = registration.session;

        let Some(session) = self.sessions.get(session_id) else {
            return Ok(false);
        };
        if session.is_zombie() {
            return Ok(false);
        }
        let timed_out = session.is_timed_out();

        let target = disk.and_then(|id| self.disks.get(id));

        if let (Some(pattern), Some(target)) = (&registration.matching, target)
            && !target.matches(pattern)
        {
            return Ok(false);
        }

        if let Some(target) = target
            && target.options.contains(DiskOption::Private)
            && target.claim.is_some_and(|owner| owner != session_id)
            && matches!(
                kind.class(),
                CallbackClass::Notify | CallbackClass::DescriptionChanged
            )
        {
            return Ok(false);
        }

        let zombie = target.is_some_and(|target| target.is_zombie());
        let snapshot = target.map(|target| target.snapshot());

        let argument = match kind.class() {
            CallbackClass::Notify => CallbackArgument::None,
            CallbackClass::Completion => argument,
            CallbackClass::DescriptionChanged => {
                if zombie {
                    return Ok(false);
                }
                let CallbackArgument::ChangedKeys(changed) = argument else {
                    return Err(mismatch(kind));
                };
                let changed = registration.filter_keys(&changed);
                if changed.is_empty() {
                    return Ok(false);
                }
                CallbackArgument::ChangedKeys(changed)
            }
            CallbackClass::Approval => {
                if timed_out {
                    tracing::debug!(session = %session_id, %kind, "skipping timed-out session");
                    return Ok(false);
                }
                let Some(disk) = disk else {
                    return Err(ArbitrationError::new(
                        ArbitrationErrorKind::Internal,
                        format!("{kind} approval without a disk"),
                    ));
                };

                let id = self.allocate_response_id();
                self.tracker.add_row(ResponseRow {
                    disk: disk.clone(),
                    session: session_id,
                    token: registration.token,
                    id,
                    issued: self.clock.now(),
                })?;
                CallbackArgument::Response(id)
            }
        };

        if !argument.fits(kind) {
            return Err(mismatch(kind));
        }

        let instance = CallbackInstance::new(kind, registration.token, snapshot, argument);
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.directory.enqueue(instance);
            if kind != CallbackKind::Idle {
                session.flags.remove(SessionFlag::Idle);
            }
        }
        self.notifier.wake(session_id);

        if kind.is_approval() {
            self.rearm_timer();
        }
        Ok(true)
    }

    /// `dispatch`, logging instead of returning failures
    pub(crate) fn dispatch_logged(
        &mut self,
        registration: &CallbackRegistration,
        disk: Option<&DiskId>,
        argument: CallbackArgument,
    ) -> bool {
        match self.dispatch(registration, disk, argument) {
            Ok(fired) => fired,
            Err(error) => {
                tracing::warn!(
                    session = %registration.session,
                    kind = %registration.kind,
                    %error,
                    "callback dispatch failed"
                );
                false
            }
        }
    }

    /// Fires every registration of `kind`, session by session in registry order.
    ///
    /// Returns the number of instances queued.
    pub(crate) fn broadcast_to_all(
        &mut self,
        kind: CallbackKind,
        disk: Option<&DiskId>,
        argument: CallbackArgument,
    ) -> usize {
        self.sessions
            .ids()
            .into_iter()
            .map(|session| self.broadcast_to_session(session, kind, disk, argument.clone()))
            .sum()
    }

    pub(crate) fn broadcast_to_session(
        &mut self,
        session: SessionId,
        kind: CallbackKind,
        disk: Option<&DiskId>,
        argument: CallbackArgument,
    ) -> usize {
        let registrations: Vec<CallbackRegistration> = match self.sessions.get(session) {
            Some(entry) if !entry.is_zombie() => {
                if kind == CallbackKind::Idle && entry.is_idle() {
                    return 0;
                }
                entry.directory.of_kind(kind).cloned().collect()
            }
            _ => return 0,
        };

        let fired = registrations
            .iter()
            .filter(|registration| self.dispatch_logged(registration, disk, argument.clone()))
            .count();

        if kind == CallbackKind::Idle
            && let Some(entry) = self.sessions.get_mut(session)
        {
            entry.flags.insert(SessionFlag::Idle);
        }
        fired
    }
}

fn mismatch(kind: CallbackKind) -> ArbitrationError {
    ArbitrationError::new(
        ArbitrationErrorKind::Internal,
        format!("argument does not fit callback kind {kind}"),
    )
}
