// SPDX-License-Identifier: GPL-3.0-only

use arbiter_contracts::{ArbitrationError, ArbitrationErrorKind};
use thiserror::Error;
use zbus::fdo;

/// Service-specific errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),

    #[error("Broker task is not running")]
    BrokerStopped,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("D-Bus error: {0}")]
    DBus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<ServiceError> for fdo::Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Arbitration(error) => match error.kind {
                ArbitrationErrorKind::BadArgument => fdo::Error::InvalidArgs(error.message),
                ArbitrationErrorKind::Unsupported => fdo::Error::NotSupported(error.message),
                ArbitrationErrorKind::NotPrivileged => fdo::Error::AccessDenied(error.message),
                _ => fdo::Error::Failed(error.to_string()),
            },
            ServiceError::AccessDenied(msg) => fdo::Error::AccessDenied(msg),
            ServiceError::InvalidArgument(msg) => fdo::Error::InvalidArgs(msg),
            _ => fdo::Error::Failed(err.to_string()),
        }
    }
}

impl From<zbus::Error> for ServiceError {
    fn from(err: zbus::Error) -> Self {
        ServiceError::DBus(err.to_string())
    }
}

impl From<zbus::fdo::Error> for ServiceError {
    fn from(err: zbus::fdo::Error) -> Self {
        ServiceError::DBus(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
