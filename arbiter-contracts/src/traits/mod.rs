// SPDX-License-Identifier: GPL-3.0-only

pub mod clock;
pub mod notify;
pub mod stage;

pub use clock::{Clock, SystemClock};
pub use notify::WakeNotifier;
pub use stage::{StageEngine, StageJob, StageOutcome};
