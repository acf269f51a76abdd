// SPDX-License-Identifier: GPL-3.0-only

//! Callback kinds and identities

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every event a session can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    DiskAppeared,
    DiskDisappeared,
    Idle,
    ListComplete,
    DescriptionChanged,
    ClaimRelease,
    EjectApproval,
    MountApproval,
    UnmountApproval,
    Peek,
    Claim,
    Eject,
    Mount,
    Probe,
    Rename,
    Unmount,
    SetAdditions,
}

/// How the dispatcher treats a callback kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackClass {
    /// Fire-and-forget notification carrying a disk snapshot
    Notify,
    /// Result of a request the session submitted
    Completion,
    /// Vote the broker waits for before proceeding
    Approval,
    /// Notification filtered by the registration's watch list
    DescriptionChanged,
}

impl CallbackKind {
    pub const ALL: [CallbackKind; 17] = [
        Self::DiskAppeared,
        Self::DiskDisappeared,
        Self::Idle,
        Self::ListComplete,
        Self::DescriptionChanged,
        Self::ClaimRelease,
        Self::EjectApproval,
        Self::MountApproval,
        Self::UnmountApproval,
        Self::Peek,
        Self::Claim,
        Self::Eject,
        Self::Mount,
        Self::Probe,
        Self::Rename,
        Self::Unmount,
        Self::SetAdditions,
    ];

    pub fn class(self) -> CallbackClass {
        match self {
            Self::DiskAppeared | Self::DiskDisappeared | Self::Idle | Self::ListComplete => {
                CallbackClass::Notify
            }
            Self::DescriptionChanged => CallbackClass::DescriptionChanged,
            Self::ClaimRelease
            | Self::EjectApproval
            | Self::MountApproval
            | Self::UnmountApproval
            | Self::Peek => CallbackClass::Approval,
            Self::Claim
            | Self::Eject
            | Self::Mount
            | Self::Probe
            | Self::Rename
            | Self::Unmount
            | Self::SetAdditions => CallbackClass::Completion,
        }
    }

    pub fn is_approval(self) -> bool {
        self.class() == CallbackClass::Approval
    }

    /// Stable wire name
    pub fn name(self) -> &'static str {
        match self {
            Self::DiskAppeared => "disk_appeared",
            Self::DiskDisappeared => "disk_disappeared",
            Self::Idle => "idle",
            Self::ListComplete => "list_complete",
            Self::DescriptionChanged => "description_changed",
            Self::ClaimRelease => "claim_release",
            Self::EjectApproval => "eject_approval",
            Self::MountApproval => "mount_approval",
            Self::UnmountApproval => "unmount_approval",
            Self::Peek => "peek",
            Self::Claim => "claim",
            Self::Eject => "eject",
            Self::Mount => "mount",
            Self::Probe => "probe",
            Self::Rename => "rename",
            Self::Unmount => "unmount",
            Self::SetAdditions => "set_additions",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Client-side identity of a subscription: the function and context it registered with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackToken {
    pub function: u64,
    pub context: u64,
}

impl CallbackToken {
    pub fn new(function: u64, context: u64) -> Self {
        Self { function, context }
    }
}

/// Correlates an approval instance with the vote that answers it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(u64);

impl ResponseId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response-{}", self.0)
    }
}
