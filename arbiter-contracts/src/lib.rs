// SPDX-License-Identifier: GPL-3.0-only

pub mod protocol;
pub mod traits;

pub use protocol::{
    ArbitrationError, ArbitrationErrorKind, CallbackArgument, CallbackInstance, CompletionStatus,
    Dissenter,
};
pub use traits::{Clock, StageEngine, StageJob, StageOutcome, SystemClock, WakeNotifier};
