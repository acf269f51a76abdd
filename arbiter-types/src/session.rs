// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use enumflags2::bitflags;
use serde::{Deserialize, Serialize};

/// Transport handle of one connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Options a client chooses when it connects
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOption {
    /// Approval votes from this session never expire
    NoTimeout = 1 << 0,
}

/// Broker-maintained state of a session
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlag {
    /// An idle notification was delivered and nothing happened since
    Idle = 1 << 0,
    /// The session missed an approval deadline and has not drained its queue since
    TimedOut = 1 << 1,
    /// The session is being torn down
    Zombie = 1 << 2,
}
