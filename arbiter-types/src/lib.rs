// SPDX-License-Identifier: GPL-3.0-only

//! Canonical data model for the COSMIC Ext disk arbitration broker
//!
//! These types are shared by every layer of the stack:
//!
//! - **arbiter-broker**: owns registries of these types and mutates them
//! - **arbiter-contracts**: carries them across the collaborator seams
//! - **arbiter-service**: serializes them for D-Bus transport
//!
//! ## Identity
//!
//! Disks, sessions, requests and responses are referenced by id everywhere
//! outside their owning registry. Nothing in this crate holds a reference to
//! another entity, which keeps the broker free of ownership cycles.

pub mod callback;
pub mod caller;
pub mod description;
pub mod disk;
pub mod request;
pub mod session;

pub use callback::{CallbackClass, CallbackKind, CallbackToken, ResponseId};
pub use caller::CallerInfo;
pub use description::{Description, changed_keys, description_matches};
pub use disk::{Disk, DiskId, DiskOption, DiskSnapshot, DiskState};
pub use request::{RequestArguments, RequestId, RequestKind, RequestOption};
pub use session::{SessionFlag, SessionId, SessionOption};
