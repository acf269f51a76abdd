// SPDX-License-Identifier: GPL-3.0-only

//! Request kinds, options and arguments

use std::fmt;

use enumflags2::bitflags;
use serde::{Deserialize, Serialize};

use crate::callback::CallbackKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

/// Operations a session can queue against a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Claim,
    Eject,
    Mount,
    Probe,
    Refresh,
    Rename,
    Unmount,
}

impl RequestKind {
    pub const ALL: [RequestKind; 7] = [
        Self::Claim,
        Self::Eject,
        Self::Mount,
        Self::Probe,
        Self::Refresh,
        Self::Rename,
        Self::Unmount,
    ];

    /// Callback kind used to report this request's completion
    pub fn completion_kind(self) -> CallbackKind {
        match self {
            Self::Claim => CallbackKind::Claim,
            Self::Eject => CallbackKind::Eject,
            Self::Mount => CallbackKind::Mount,
            Self::Probe => CallbackKind::Probe,
            Self::Refresh => CallbackKind::SetAdditions,
            Self::Rename => CallbackKind::Rename,
            Self::Unmount => CallbackKind::Unmount,
        }
    }

    /// Approval sessions vote on before the stage engine runs this request
    pub fn approval_kind(self) -> Option<CallbackKind> {
        match self {
            Self::Eject => Some(CallbackKind::EjectApproval),
            Self::Mount => Some(CallbackKind::MountApproval),
            Self::Unmount => Some(CallbackKind::UnmountApproval),
            Self::Claim | Self::Probe | Self::Refresh | Self::Rename => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Eject => "eject",
            Self::Mount => "mount",
            Self::Probe => "probe",
            Self::Refresh => "refresh",
            Self::Rename => "rename",
            Self::Unmount => "unmount",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOption {
    /// Apply the operation to the whole medium and every volume on it
    Whole = 1 << 0,
    /// Proceed even if the filesystem is in use
    Force = 1 << 1,
    /// Mount read-only
    ReadOnly = 1 << 2,
}

/// Kind-specific extra arguments
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestArguments {
    /// Explicit mount point for a mount request
    pub mount_point: Option<String>,

    /// Filesystem mount options
    pub mount_options: Vec<String>,

    /// New volume name for a rename request
    pub name: Option<String>,
}
