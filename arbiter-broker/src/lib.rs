// SPDX-License-Identifier: GPL-3.0-only

//! Arbitration core
//!
//! Everything here runs on one execution context and performs no I/O. The
//! daemon feeds the [`Broker`] device events, client calls, stage outcomes
//! and timer ticks one at a time; the broker answers through its
//! collaborators ([`arbiter_contracts::StageEngine`],
//! [`arbiter_contracts::WakeNotifier`]) and the per-session callback queues.

pub mod broker;
pub mod directory;
mod dispatch;
pub mod registry;
pub mod request;
pub mod response;
pub mod session;
mod stage;
mod teardown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod timer;

pub use broker::{
    Broker, BrokerConfig, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_TIMER_LEEWAY, DeviceEvent,
    RegistrationSpec, SubmitSpec,
};
pub use directory::{CallbackDirectory, CallbackRegistration};
pub use registry::DiskRegistry;
pub use request::{Link, Request, RequestQueue, RequestState};
pub use response::{PendingCompletion, ResponseRow, ResponseTracker};
pub use session::{Session, SessionRegistry};
