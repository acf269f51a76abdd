// SPDX-License-Identifier: GPL-3.0-only

use arbiter_types::SessionId;

/// Best-effort signal that a session has queued callbacks to drain.
///
/// Implementations must not block; a lost wake only delays delivery until the
/// client's next drain.
pub trait WakeNotifier: Send {
    fn wake(&mut self, session: SessionId);
}
