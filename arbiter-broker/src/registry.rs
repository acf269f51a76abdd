// SPDX-License-Identifier: GPL-3.0-only

use arbiter_types::{Disk, DiskId, DiskState};

/// Known disks in discovery order
#[derive(Debug, Default)]
pub struct DiskRegistry {
    disks: Vec<Disk>,
}

impl DiskRegistry {
    pub(crate) fn insert(&mut self, disk: Disk) {
        self.disks.push(disk);
    }

    pub fn contains(&self, id: &DiskId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &DiskId) -> Option<&Disk> {
        self.disks.iter().find(|disk| &disk.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &DiskId) -> Option<&mut Disk> {
        self.disks.iter_mut().find(|disk| &disk.id == id)
    }

    pub(crate) fn remove(&mut self, id: &DiskId) -> Option<Disk> {
        let index = self.disks.iter().position(|disk| &disk.id == id)?;
        Some(self.disks.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Disk> {
        self.disks.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Disk> {
        self.disks.iter_mut()
    }

    /// Live disks that already went through the appear stage
    pub fn appeared(&self) -> Vec<DiskId> {
        self.disks
            .iter()
            .filter(|disk| disk.has_appeared() && !disk.is_zombie())
            .map(|disk| disk.id.clone())
            .collect()
    }

    /// Live disks on the same physical unit as `disk`
    pub fn siblings_of(&self, disk: &Disk) -> Vec<DiskId> {
        self.disks
            .iter()
            .filter(|candidate| !candidate.state.contains(DiskState::Zombie))
            .filter(|candidate| disk.shares_unit_with(candidate))
            .map(|candidate| candidate.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }
}
