// SPDX-License-Identifier: GPL-3.0-only

//! Disk data model
//!
//! A `Disk` is the broker's record of one tracked storage entity, either a
//! whole medium or a volume on it. The broker owns every `Disk` by value in its
//! registry; everything else refers to disks through `DiskId`.

use std::fmt;
use std::time::Instant;

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

use crate::description::{self, Description, keys};
use crate::session::SessionId;

/// Stable identifier of a disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiskId(String);

impl DiskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DiskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DiskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle and activity bits of a disk
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    /// The device feed finished probing the disk
    StagedProbe = 1 << 0,
    /// Peek approvals for the disk completed
    StagedPeek = 1 << 1,
    /// Sessions were told the disk appeared
    StagedAppear = 1 << 2,
    /// A mount of the disk completed
    StagedMount = 1 << 3,
    /// The disk disappeared; retained only until teardown finishes
    Zombie = 1 << 4,
    /// The stage engine is executing a command on the disk
    CommandActive = 1 << 5,
    /// The filesystem needs a repair before it can be mounted
    RequireRepair = 1 << 6,
    /// The description is stale and the disk should be probed again
    RequireReprobe = 1 << 7,
}

/// Per-disk options clients can toggle
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOption {
    /// Do not mount the disk automatically after it appears
    NoAutomount = 1 << 0,
    /// Hide the disk from sessions other than its claimant
    Private = 1 << 1,
}

/// Broker record of one disk
#[derive(Debug, Clone)]
pub struct Disk {
    pub id: DiskId,

    /// Device node path (e.g. "/dev/sdb1")
    pub device_path: String,

    /// Physical unit shared with sibling volumes, when the feed knows it
    pub unit: Option<String>,

    pub state: BitFlags<DiskState>,

    pub options: BitFlags<DiskOption>,

    /// Session holding an exclusive claim on the disk
    pub claim: Option<SessionId>,

    pub adopted: bool,

    /// When the current command started
    pub busy_since: Option<Instant>,

    pub description: Description,
}

impl Disk {
    pub fn new(id: impl Into<DiskId>, device_path: impl Into<String>, description: Description) -> Self {
        let unit = description::text(&description, keys::DEVICE_UNIT).map(str::to_string);

        Self {
            id: id.into(),
            device_path: device_path.into(),
            unit,
            state: BitFlags::empty(),
            options: BitFlags::empty(),
            claim: None,
            adopted: false,
            busy_since: None,
            description,
        }
    }

    /// Replaces the cached description and re-derives the fields taken from it
    pub fn set_description(&mut self, description: Description) {
        if let Some(unit) = description::text(&description, keys::DEVICE_UNIT) {
            self.unit = Some(unit.to_string());
        }
        self.description = description;
    }

    pub fn is_whole(&self) -> bool {
        description::flag(&self.description, keys::MEDIA_WHOLE)
    }

    pub fn is_multi_volume(&self) -> bool {
        description::flag(&self.description, keys::VOLUME_MULTI)
    }

    pub fn is_zombie(&self) -> bool {
        self.state.contains(DiskState::Zombie)
    }

    pub fn has_appeared(&self) -> bool {
        self.state.contains(DiskState::StagedAppear)
    }

    pub fn is_busy(&self) -> bool {
        self.state.contains(DiskState::CommandActive)
    }

    pub fn matches(&self, pattern: &Description) -> bool {
        description::description_matches(&self.description, pattern)
    }

    /// Whether `other` lives on the same physical unit as this disk.
    ///
    /// Falls back to device path nesting when either side has no unit.
    pub fn shares_unit_with(&self, other: &Disk) -> bool {
        if self.id == other.id {
            return false;
        }

        match (&self.unit, &other.unit) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => {
                let (short, long) = if self.device_path.len() <= other.device_path.len() {
                    (&self.device_path, &other.device_path)
                } else {
                    (&other.device_path, &self.device_path)
                };
                !short.is_empty()
                    && long
                        .strip_prefix(short.as_str())
                        .is_some_and(|rest| is_partition_suffix(short, rest))
            }
        }
    }

    pub fn snapshot(&self) -> DiskSnapshot {
        DiskSnapshot {
            id: self.id.clone(),
            device_path: self.device_path.clone(),
            whole: self.is_whole(),
            state: self.state,
            claimed: self.claim.is_some(),
            description: self.description.clone(),
        }
    }
}

/// Whether `rest` turns the device node `parent` into one of its partitions.
///
/// "sdb" + "1" and "nvme0n1" + "p1" qualify; "sda" + "a" and "nvme0n1" + "0"
/// name other drives.
fn is_partition_suffix(parent: &str, rest: &str) -> bool {
    let digits = if parent.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Copy of a disk taken when a callback fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub id: DiskId,
    pub device_path: String,
    pub whole: bool,
    pub state: BitFlags<DiskState>,
    pub claimed: bool,
    pub description: Description,
}
