// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The physical paths available to a virtual link or a big-switch route:
//! the primary, the backups waiting to replace it, and the paths taken out
//! of service by a failure.  Paths are ranked by an unsigned priority, the
//! highest winning.
//!
//! `PathSet` only decides.  When a decision requires moving traffic to a
//! different path it returns that path, and the owner performs the switch
//! (remapping, re-issuing flows) before calling [`PathSet::set_primary`].

use std::collections::BTreeMap;

use crate::types::LinkKey;

pub type Path = Vec<LinkKey>;

#[derive(Clone, Debug, Default)]
pub struct PathSet {
    path: Path,
    priority: u8,
    backups: BTreeMap<u8, Path>,
    unusable: BTreeMap<u8, Path>,
}

/// Outcome of a revert attempt.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct Revert {
    /// Some unusable path contained the recovered link.
    pub reverted: bool,
    /// The path to switch to, if a restored path outranks the primary.
    pub switch_to: Option<(Path, u8)>,
}

impl PathSet {
    pub fn path(&self) -> &[LinkKey] {
        &self.path
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn backups(&self) -> &BTreeMap<u8, Path> {
        &self.backups
    }

    pub fn unusable(&self) -> &BTreeMap<u8, Path> {
        &self.unusable
    }

    pub fn has_primary(&self) -> bool {
        !self.path.is_empty()
    }

    /// Every physical link on the primary or a backup path.
    pub fn all_links(&self) -> impl Iterator<Item = &LinkKey> {
        self.path.iter().chain(self.backups.values().flatten())
    }

    pub fn set_primary(&mut self, path: Path, priority: u8) {
        self.path = path;
        self.priority = priority;
    }

    /// Offer `path` at `priority`.  The first path becomes the primary
    /// outright.  A path that does not outrank the primary is kept as a
    /// backup.  One that does demotes the primary to a backup, and is
    /// returned so the owner can switch to it.
    pub fn register(&mut self, path: Path, priority: u8) -> Option<(Path, u8)> {
        if !self.has_primary() {
            self.set_primary(path, priority);
            return None;
        }
        if priority <= self.priority {
            self.backups.insert(priority, path);
            return None;
        }
        self.backups.insert(self.priority, self.path.clone());
        Some((path, priority))
    }

    /// The primary has failed: set it aside and hand back the best backup,
    /// if there is one.
    pub fn try_recovery(&mut self) -> Option<(Path, u8)> {
        self.unusable.insert(self.priority, self.path.clone());
        self.backups.pop_last().map(|(prio, path)| (path, prio))
    }

    /// `recovered` is usable again.  Every set-aside path containing it is
    /// put back in service, highest priority first: as a backup if it does
    /// not outrank the primary, otherwise as the new primary.
    pub fn try_revert(&mut self, recovered: &LinkKey) -> Revert {
        let mut out = Revert::default();
        let candidates: Vec<u8> = self
            .unusable
            .iter()
            .rev()
            .filter(|(_, p)| p.contains(recovered))
            .map(|(prio, _)| *prio)
            .collect();

        // The primary as it will stand once any switch has been made.
        let (mut cur_path, mut cur_prio) = (self.path.clone(), self.priority);
        for prio in candidates {
            let Some(path) = self.unusable.remove(&prio) else {
                continue;
            };
            out.reverted = true;
            if path == cur_path {
                continue;
            }
            if cur_prio >= prio {
                self.backups.insert(prio, path);
            } else {
                self.backups.insert(cur_prio, cur_path);
                cur_path = path;
                cur_prio = prio;
                out.switch_to = Some((cur_path.clone(), cur_prio));
            }
        }
        if let Some((ref path, prio)) = out.switch_to {
            // The target may have been parked as a backup earlier in the walk.
            if self.backups.get(&prio) == Some(path) {
                self.backups.remove(&prio);
            }
        }
        out
    }
}
