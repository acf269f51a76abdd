// SPDX-License-Identifier: GPL-3.0-only

use arbiter_types::{CallerInfo, SessionFlag, SessionId, SessionOption};
use enumflags2::BitFlags;

use crate::directory::CallbackDirectory;

/// One connected client
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    name: String,
    pid: u32,
    caller: CallerInfo,
    pub(crate) options: BitFlags<SessionOption>,
    pub(crate) flags: BitFlags<SessionFlag>,
    pub(crate) directory: CallbackDirectory,
}

impl Session {
    pub(crate) fn new(id: SessionId, name: String, pid: u32, caller: CallerInfo) -> Self {
        Self {
            id,
            name,
            pid,
            caller,
            options: BitFlags::empty(),
            flags: BitFlags::empty(),
            directory: CallbackDirectory::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn caller(&self) -> &CallerInfo {
        &self.caller
    }

    pub fn options(&self) -> BitFlags<SessionOption> {
        self.options
    }

    pub fn directory(&self) -> &CallbackDirectory {
        &self.directory
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(SessionFlag::Idle)
    }

    pub fn is_timed_out(&self) -> bool {
        self.flags.contains(SessionFlag::TimedOut)
    }

    pub fn is_zombie(&self) -> bool {
        self.flags.contains(SessionFlag::Zombie)
    }

    pub fn ignores_timeouts(&self) -> bool {
        self.options.contains(SessionOption::NoTimeout)
    }
}

/// Connected sessions in connection order
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
}

impl SessionRegistry {
    pub(crate) fn insert(&mut self, session: Session) {
        self.sessions.push(session);
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|session| session.id == id)
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Session> {
        let index = self.sessions.iter().position(|session| session.id == id)?;
        Some(self.sessions.remove(index))
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(Session::id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
