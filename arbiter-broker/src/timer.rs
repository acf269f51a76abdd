// SPDX-License-Identifier: GPL-3.0-only

use std::time::{Duration, Instant};

/// Single re-armed deadline for the response timeout sweep.
///
/// The broker recomputes the deadline after every change to the response
/// rows; the event loop only has to sleep until `deadline()`.
#[derive(Debug, Default)]
pub struct ResponseTimer {
    deadline: Option<Instant>,
}

impl ResponseTimer {
    pub(crate) fn rearm(&mut self, earliest_issue: Option<Instant>, limit: Duration, leeway: Duration) {
        self.deadline = earliest_issue.map(|issued| issued + limit + leeway);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}
