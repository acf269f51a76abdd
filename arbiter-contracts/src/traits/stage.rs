// SPDX-License-Identifier: GPL-3.0-only

use arbiter_types::{CallerInfo, DiskId, RequestArguments, RequestId, RequestKind, RequestOption};
use enumflags2::BitFlags;

use crate::CompletionStatus;

/// An accepted request handed to the stage engine for execution
#[derive(Debug, Clone, PartialEq)]
pub struct StageJob {
    pub request: RequestId,
    pub kind: RequestKind,
    pub disk: DiskId,
    pub device_path: String,
    pub options: BitFlags<RequestOption>,
    pub arguments: RequestArguments,
    pub caller: CallerInfo,
}

/// Report from the stage engine once a job finished
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub disk: DiskId,
    pub kind: RequestKind,
    pub status: CompletionStatus,
}

impl StageOutcome {
    pub fn for_job(job: &StageJob, status: CompletionStatus) -> Self {
        Self {
            disk: job.disk.clone(),
            kind: job.kind,
            status,
        }
    }
}

/// Executes mount, unmount, eject, probe and rename operations.
///
/// `start` must return immediately; the outcome is reported back to the
/// broker later as a `StageOutcome`.
pub trait StageEngine: Send {
    fn start(&mut self, job: StageJob);
}
