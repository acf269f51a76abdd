// SPDX-License-Identifier: GPL-3.0-only

pub mod callback;
pub mod errors;

pub use callback::{CallbackArgument, CallbackInstance, CompletionStatus, Dissenter};
pub use errors::{ArbitrationError, ArbitrationErrorKind};
