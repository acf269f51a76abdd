// SPDX-License-Identifier: GPL-3.0-only

use std::time::Instant;

/// Monotonic time source for response deadlines
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
