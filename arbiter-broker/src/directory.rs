// SPDX-License-Identifier: GPL-3.0-only

//! Per-session callback directory
//!
//! Each session owns the list of its standing registrations and the queue of
//! instances waiting to be drained.

use std::collections::VecDeque;

use arbiter_contracts::CallbackInstance;
use arbiter_types::{CallbackKind, CallbackToken, Description, SessionId};

/// A standing subscription
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackRegistration {
    pub session: SessionId,
    pub token: CallbackToken,
    pub kind: CallbackKind,
    /// Lower orders are dispatched first
    pub order: i32,
    /// Description entries a disk must carry for the callback to fire
    pub matching: Option<Description>,
    /// Description keys a description-changed callback cares about
    pub watch: Option<Vec<String>>,
}

impl CallbackRegistration {
    pub fn new(session: SessionId, token: CallbackToken, kind: CallbackKind) -> Self {
        Self {
            session,
            token,
            kind,
            order: 0,
            matching: None,
            watch: None,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_matching(mut self, matching: Description) -> Self {
        self.matching = Some(matching);
        self
    }

    pub fn with_watch(mut self, watch: Vec<String>) -> Self {
        self.watch = Some(watch);
        self
    }

    /// Narrows changed keys to the watch list; no watch list passes everything
    pub(crate) fn filter_keys(&self, changed: &[String]) -> Vec<String> {
        match &self.watch {
            Some(watch) => changed
                .iter()
                .filter(|key| watch.contains(*key))
                .cloned()
                .collect(),
            None => changed.to_vec(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CallbackDirectory {
    registrations: Vec<CallbackRegistration>,
    outbound: VecDeque<CallbackInstance>,
}

impl CallbackDirectory {
    /// Inserts after every registration with an order less than or equal to the new one
    pub fn register(&mut self, registration: CallbackRegistration) {
        let position = self
            .registrations
            .iter()
            .position(|existing| existing.order > registration.order)
            .unwrap_or(self.registrations.len());
        self.registrations.insert(position, registration);
    }

    /// Removes every registration made with `token`, returning how many were removed
    pub fn unregister(&mut self, token: CallbackToken) -> usize {
        let before = self.registrations.len();
        self.registrations.retain(|registration| registration.token != token);
        before - self.registrations.len()
    }

    pub fn of_kind(&self, kind: CallbackKind) -> impl Iterator<Item = &CallbackRegistration> {
        self.registrations
            .iter()
            .filter(move |registration| registration.kind == kind)
    }

    pub fn has_kind(&self, kind: CallbackKind) -> bool {
        self.of_kind(kind).next().is_some()
    }

    pub fn registrations(&self) -> &[CallbackRegistration] {
        &self.registrations
    }

    pub(crate) fn enqueue(&mut self, instance: CallbackInstance) {
        self.outbound.push_back(instance);
    }

    pub(crate) fn drain(&mut self) -> Vec<CallbackInstance> {
        self.outbound.drain(..).collect()
    }

    pub fn queued(&self) -> impl Iterator<Item = &CallbackInstance> {
        self.outbound.iter()
    }

    pub fn queued_len(&self) -> usize {
        self.outbound.len()
    }
}
