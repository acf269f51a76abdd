// SPDX-License-Identifier: GPL-3.0-only

//! Disk and session teardown
//!
//! Releasing an entity completes everything waiting on it right away, so
//! nothing is left behind to expire later.

use arbiter_contracts::{ArbitrationError, ArbitrationErrorKind, CompletionStatus};
use arbiter_types::{DiskId, DiskState, SessionFlag, SessionId};

use crate::broker::Broker;

impl Broker {
    /// Marks `id` as a zombie and settles every vote and request that references it.
    ///
    /// The disk stays in the registry; the caller removes it once any final
    /// notification has been sent.
    pub(crate) fn release_disk(&mut self, id: &DiskId) {
        if let Some(disk) = self.disks.get_mut(id) {
            disk.state.insert(DiskState::Zombie);
            disk.state.remove(DiskState::CommandActive);
            disk.busy_since = None;
            disk.claim = None;
        }

        let rows = self.tracker.release_disk(id);
        self.complete_response(id);

        let requests = self.queue.referencing_disk(id);
        for request in &requests {
            self.complete_request(
                *request,
                CompletionStatus::Failed(ArbitrationError::new(
                    ArbitrationErrorKind::NotFound,
                    format!("disk {id} disappeared"),
                )),
            );
        }

        tracing::debug!(disk = %id, rows, requests = requests.len(), "disk released");
    }

    /// Tears down a session: its votes count as approvals, its unstarted
    /// requests are dropped, and completions of its running requests are
    /// discarded.
    pub fn release_session(&mut self, id: SessionId) -> Result<(), ArbitrationError> {
        let Some(session) = self.sessions.get_mut(id) else {
            return Err(ArbitrationError::new(
                ArbitrationErrorKind::NotFound,
                format!("unknown session {id}"),
            ));
        };
        session.flags.insert(SessionFlag::Zombie);
        tracing::info!(%id, name = session.name(), "releasing session");

        for request in self.queue.undispatched_for_session(id) {
            self.complete_request(
                request,
                CompletionStatus::Failed(ArbitrationError::new(
                    ArbitrationErrorKind::NotFound,
                    format!("session {id} released"),
                )),
            );
        }
        let stripped = self.queue.strip_session_callbacks(id);

        let disks = self.tracker.release_session(id);
        for disk in &disks {
            self.complete_response(disk);
        }

        for disk in self.disks.iter_mut() {
            if disk.claim == Some(id) {
                disk.claim = None;
            }
        }

        self.sessions.remove(id);
        tracing::debug!(%id, votes = disks.len(), stripped, "session released");

        self.settle();
        Ok(())
    }
}
