// SPDX-License-Identifier: GPL-3.0-only

//! Approval vote bookkeeping
//!
//! A disk has at most one pending completion at a time. Each approval
//! instance handed to a session adds a row; the completion fires once the
//! last row for its disk is answered, expired, or released.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use arbiter_contracts::{ArbitrationError, ArbitrationErrorKind, Dissenter};
use arbiter_types::{CallbackToken, DiskId, RequestId, ResponseId, SessionId};

/// What the broker does once every vote for a disk is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCompletion {
    /// Finish staging a newly discovered disk
    Appear,
    /// Continue with a queued request
    Request(RequestId),
}

/// One outstanding vote
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRow {
    pub disk: DiskId,
    pub session: SessionId,
    pub token: CallbackToken,
    pub id: ResponseId,
    pub issued: Instant,
}

#[derive(Debug)]
struct PendingEntry {
    completion: PendingCompletion,
    dissent: Option<Dissenter>,
}

#[derive(Debug, Default)]
pub struct ResponseTracker {
    pending: HashMap<DiskId, PendingEntry>,
    rows: Vec<ResponseRow>,
}

impl ResponseTracker {
    pub(crate) fn record_pending(
        &mut self,
        disk: &DiskId,
        completion: PendingCompletion,
    ) -> Result<(), ArbitrationError> {
        if self.pending.contains_key(disk) {
            return Err(ArbitrationError::new(
                ArbitrationErrorKind::Busy,
                format!("disk {disk} already has a pending response"),
            ));
        }

        self.pending.insert(
            disk.clone(),
            PendingEntry {
                completion,
                dissent: None,
            },
        );
        Ok(())
    }

    pub(crate) fn add_row(&mut self, row: ResponseRow) -> Result<(), ArbitrationError> {
        if !self.pending.contains_key(&row.disk) {
            return Err(ArbitrationError::new(
                ArbitrationErrorKind::Internal,
                format!("no pending completion for disk {}", row.disk),
            ));
        }

        self.rows.push(row);
        Ok(())
    }

    /// Removes the row answered by `session`, recording the first dissent for its disk.
    ///
    /// Returns the row's disk, or `None` when no such row exists.
    pub(crate) fn on_response(
        &mut self,
        session: SessionId,
        id: ResponseId,
        dissent: Option<Dissenter>,
    ) -> Option<DiskId> {
        let index = self
            .rows
            .iter()
            .position(|row| row.id == id && row.session == session)?;
        let row = self.rows.remove(index);

        if let Some(dissent) = dissent
            && let Some(entry) = self.pending.get_mut(&row.disk)
            && entry.dissent.is_none()
        {
            entry.dissent = Some(dissent);
        }

        Some(row.disk)
    }

    /// Pops the completion for `disk` once no row references it
    pub(crate) fn complete(
        &mut self,
        disk: &DiskId,
    ) -> Option<(PendingCompletion, Option<Dissenter>)> {
        if self.rows.iter().any(|row| &row.disk == disk) {
            return None;
        }

        self.pending
            .remove(disk)
            .map(|entry| (entry.completion, entry.dissent))
    }

    /// Removes and returns every row past its deadline whose session is not exempt
    pub(crate) fn expire(
        &mut self,
        now: Instant,
        limit: Duration,
        exempt: impl Fn(SessionId) -> bool,
    ) -> Vec<ResponseRow> {
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .rows
            .drain(..)
            .partition(|row| !exempt(row.session) && row.issued + limit <= now);
        self.rows = kept;
        expired
    }

    /// Earliest issue time among rows that can expire
    pub(crate) fn earliest(&self, exempt: impl Fn(SessionId) -> bool) -> Option<Instant> {
        self.rows
            .iter()
            .filter(|row| !exempt(row.session))
            .map(|row| row.issued)
            .min()
    }

    pub(crate) fn release_disk(&mut self, disk: &DiskId) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| &row.disk != disk);
        before - self.rows.len()
    }

    /// Forgets the pending completion for `disk` and every row waiting on it
    pub(crate) fn abandon(&mut self, disk: &DiskId) -> usize {
        self.pending.remove(disk);
        self.release_disk(disk)
    }

    /// Drops the session's rows, returning the affected disks in row order
    pub(crate) fn release_session(&mut self, session: SessionId) -> Vec<DiskId> {
        self.release_where(|row| row.session == session)
    }

    pub(crate) fn release_registration(
        &mut self,
        session: SessionId,
        token: CallbackToken,
    ) -> Vec<DiskId> {
        self.release_where(|row| row.session == session && row.token == token)
    }

    fn release_where(&mut self, released: impl Fn(&ResponseRow) -> bool) -> Vec<DiskId> {
        let mut disks: Vec<DiskId> = Vec::new();
        self.rows.retain(|row| {
            if released(row) {
                if !disks.contains(&row.disk) {
                    disks.push(row.disk.clone());
                }
                false
            } else {
                true
            }
        });
        disks
    }

    pub fn has_pending(&self, disk: &DiskId) -> bool {
        self.pending.contains_key(disk)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn rows(&self) -> &[ResponseRow] {
        &self.rows
    }

    pub fn rows_for(&self, disk: &DiskId) -> usize {
        self.rows.iter().filter(|row| &row.disk == disk).count()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(disk: &str, session: u64, id: u64, issued: Instant) -> ResponseRow {
        ResponseRow {
            disk: DiskId::new(disk),
            session: SessionId::new(session),
            token: CallbackToken::new(session, 0),
            id: ResponseId::new(id),
            issued,
        }
    }

    #[test]
    fn second_pending_completion_for_a_disk_is_busy() {
        let mut tracker = ResponseTracker::default();
        let disk = DiskId::new("sdb1");

        tracker
            .record_pending(&disk, PendingCompletion::Appear)
            .expect("first completion");
        let error = tracker
            .record_pending(&disk, PendingCompletion::Request(RequestId::new(1)))
            .expect_err("second completion");
        assert_eq!(error.kind, ArbitrationErrorKind::Busy);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn rows_need_a_pending_completion() {
        let mut tracker = ResponseTracker::default();
        assert!(tracker.add_row(row("sdb1", 1, 1, Instant::now())).is_err());
    }

    #[test]
    fn first_dissent_wins_and_completion_waits_for_last_row() {
        let mut tracker = ResponseTracker::default();
        let disk = DiskId::new("sdb1");
        let now = Instant::now();
        tracker
            .record_pending(&disk, PendingCompletion::Request(RequestId::new(5)))
            .expect("pending");
        tracker.add_row(row("sdb1", 1, 1, now)).expect("row 1");
        tracker.add_row(row("sdb1", 2, 2, now)).expect("row 2");

        let first = Dissenter::new(1, Some("first".to_string()));
        let second = Dissenter::new(2, Some("second".to_string()));

        assert_eq!(
            tracker.on_response(SessionId::new(1), ResponseId::new(1), Some(first.clone())),
            Some(disk.clone())
        );
        assert!(tracker.complete(&disk).is_none());

        tracker.on_response(SessionId::new(2), ResponseId::new(2), Some(second));
        assert_eq!(
            tracker.complete(&disk),
            Some((PendingCompletion::Request(RequestId::new(5)), Some(first)))
        );
        assert!(tracker.complete(&disk).is_none());
    }

    #[test]
    fn responses_from_another_session_are_orphans() {
        let mut tracker = ResponseTracker::default();
        let disk = DiskId::new("sdb1");
        tracker
            .record_pending(&disk, PendingCompletion::Appear)
            .expect("pending");
        tracker.add_row(row("sdb1", 1, 1, Instant::now())).expect("row");

        assert_eq!(
            tracker.on_response(SessionId::new(2), ResponseId::new(1), None),
            None
        );
        assert_eq!(tracker.rows_for(&disk), 1);
    }

    #[test]
    fn expiry_skips_exempt_sessions() {
        let mut tracker = ResponseTracker::default();
        let start = Instant::now();
        tracker
            .record_pending(&DiskId::new("a"), PendingCompletion::Appear)
            .expect("pending a");
        tracker
            .record_pending(&DiskId::new("b"), PendingCompletion::Appear)
            .expect("pending b");
        tracker.add_row(row("a", 1, 1, start)).expect("row a");
        tracker.add_row(row("b", 2, 2, start)).expect("row b");

        let limit = Duration::from_secs(10);
        let exempt = |session: SessionId| session == SessionId::new(2);

        assert!(tracker.expire(start + Duration::from_secs(9), limit, exempt).is_empty());
        let expired = tracker.expire(start + limit, limit, exempt);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].disk, DiskId::new("a"));
        assert_eq!(tracker.earliest(exempt), None);
        assert_eq!(tracker.rows().len(), 1);
    }

    #[test]
    fn releasing_a_session_reports_each_disk_once() {
        let mut tracker = ResponseTracker::default();
        let now = Instant::now();
        for disk in ["a", "b"] {
            tracker
                .record_pending(&DiskId::new(disk), PendingCompletion::Appear)
                .expect("pending");
        }
        tracker.add_row(row("a", 1, 1, now)).expect("row");
        tracker.add_row(row("a", 1, 2, now)).expect("row");
        tracker.add_row(row("b", 1, 3, now)).expect("row");
        tracker.add_row(row("b", 2, 4, now)).expect("row");

        assert_eq!(
            tracker.release_session(SessionId::new(1)),
            vec![DiskId::new("a"), DiskId::new("b")]
        );
        assert_eq!(tracker.rows().len(), 1);
    }
}
