// SPDX-License-Identifier: GPL-3.0-only

use arbiter_types::{CallbackClass, CallbackKind, CallbackToken, DiskSnapshot, ResponseId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ArbitrationError;

/// Veto attached to an approval response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dissenter {
    /// Client-chosen status code explaining the veto
    pub status: u32,

    /// Human-readable reason, shown to the requester
    pub reason: Option<String>,
}

impl Dissenter {
    pub fn new(status: u32, reason: Option<String>) -> Self {
        Self { status, reason }
    }
}

/// Final outcome of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum CompletionStatus {
    Success,
    Failed(ArbitrationError),
    /// A session vetoed the request; not a failure of the broker
    Dissented(Dissenter),
}

impl CompletionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Payload of a callback instance, keyed by the kind's class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum CallbackArgument {
    #[default]
    None,
    ChangedKeys(Vec<String>),
    Response(ResponseId),
    Outcome(CompletionStatus),
}

impl CallbackArgument {
    /// Whether this payload is the one `kind` delivers
    pub fn fits(&self, kind: CallbackKind) -> bool {
        match kind.class() {
            CallbackClass::Notify => matches!(self, Self::None),
            CallbackClass::DescriptionChanged => matches!(self, Self::ChangedKeys(_)),
            CallbackClass::Approval => matches!(self, Self::Response(_)),
            CallbackClass::Completion => matches!(self, Self::Outcome(_)),
        }
    }
}

/// One concrete firing of a registration, waiting in a session's outbound queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackInstance {
    pub kind: CallbackKind,
    pub token: CallbackToken,
    pub disk: Option<DiskSnapshot>,
    pub argument: CallbackArgument,
    pub issued_at: DateTime<Utc>,
}

impl CallbackInstance {
    pub fn new(
        kind: CallbackKind,
        token: CallbackToken,
        disk: Option<DiskSnapshot>,
        argument: CallbackArgument,
    ) -> Self {
        Self {
            kind,
            token,
            disk,
            argument,
            issued_at: Utc::now(),
        }
    }

    pub fn response_id(&self) -> Option<ResponseId> {
        match self.argument {
            CallbackArgument::Response(id) => Some(id),
            _ => None,
        }
    }
}
