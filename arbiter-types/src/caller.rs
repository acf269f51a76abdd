// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

/// Credentials of the process that issued a request, as reported by the bus
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallerInfo {
    /// Effective user id
    pub uid: u32,

    /// Process id of the caller
    pub pid: u32,
}

impl CallerInfo {
    pub fn new(uid: u32, pid: u32) -> Self {
        Self { uid, pid }
    }
}
