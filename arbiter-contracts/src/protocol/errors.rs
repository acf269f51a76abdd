// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationErrorKind {
    /// Contradictory or malformed options
    BadArgument,
    /// The operation does not apply to this disk
    Unsupported,
    /// The disk or session went away before the operation completed
    NotFound,
    Busy,
    NotPrivileged,
    Internal,
}

impl ArbitrationErrorKind {
    pub fn code(self) -> u16 {
        match self {
            Self::BadArgument => 400,
            Self::NotPrivileged => 403,
            Self::NotFound => 404,
            Self::Busy => 423,
            Self::Internal => 500,
            Self::Unsupported => 501,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            400 => Some(Self::BadArgument),
            403 => Some(Self::NotPrivileged),
            404 => Some(Self::NotFound),
            423 => Some(Self::Busy),
            500 => Some(Self::Internal),
            501 => Some(Self::Unsupported),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ArbitrationError {
    pub kind: ArbitrationErrorKind,
    pub message: String,
}

impl ArbitrationError {
    pub fn new(kind: ArbitrationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
