// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The flow table a tenant controller believes it has programmed on one of
//! its virtual switches.  Entries are keyed by the cookie the hypervisor
//! substitutes for the controller's own, which carries the tenant id in its
//! high 32 bits so that flows can be traced back from physical switches.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use openflow::FlowMod;
use openflow::FlowModCommand;
use openflow::MatchRelation;
use openflow::OFPFF_CHECK_OVERLAP;
use slog::debug;

use crate::types::OvxError;
use crate::types::OvxResult;
use crate::types::TenantId;

const FREELIST_SIZE: usize = 1024;

/// What the caller should do with a flow-mod after the table has seen it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FlowModOutcome {
    /// Devirtualize and send the mod, using this cookie.
    Apply(u64),
    /// Nothing to do.
    Ignore,
    /// An ADD with CHECK_OVERLAP collided with an existing entry.
    Overlap,
    /// These entries were deleted, and must be deleted from the physical
    /// switches too.
    Removed(Vec<FlowMod>),
    /// A wildcard delete emptied the table; the tenant's flows must be
    /// purged from the physical switches.
    Cleared,
}

pub struct FlowTable {
    log: slog::Logger,
    tenant: TenantId,
    entries: BTreeMap<u64, FlowMod>,
    counter: u32,
    freelist: VecDeque<u64>,
}

impl FlowTable {
    pub fn new(log: &slog::Logger, tenant: TenantId) -> Self {
        FlowTable {
            log: log.new(slog::o!("unit" => "flow_table")),
            tenant,
            entries: BTreeMap::new(),
            counter: 1,
            freelist: VecDeque::new(),
        }
    }

    fn next_cookie(&mut self) -> u64 {
        if let Some(cookie) = self.freelist.pop_front() {
            return cookie;
        }
        let cookie = (self.tenant as u64) << 32 | self.counter as u64;
        self.counter = self.counter.wrapping_add(1).max(1);
        cookie
    }

    fn release_cookie(&mut self, cookie: u64) {
        if self.freelist.len() >= FREELIST_SIZE {
            self.freelist.pop_front();
        }
        self.freelist.push_back(cookie);
    }

    /// Apply `fm` to the table.
    pub fn handle_flow_mod(&mut self, fm: &FlowMod) -> FlowModOutcome {
        match fm.command {
            FlowModCommand::Add => {
                if fm.has_flag(OFPFF_CHECK_OVERLAP) {
                    let overlap = self.entries.values().any(|e| {
                        e.priority == fm.priority
                            && e.ofmatch.compare(&fm.ofmatch, false)
                                != MatchRelation::Disjoint
                    });
                    if overlap {
                        return FlowModOutcome::Overlap;
                    }
                }
                FlowModOutcome::Apply(self.do_add(fm))
            }
            FlowModCommand::Modify | FlowModCommand::ModifyStrict => {
                FlowModOutcome::Apply(self.do_add(fm))
            }
            FlowModCommand::Delete | FlowModCommand::DeleteStrict => {
                self.do_delete(fm)
            }
        }
    }

    // Replace an identical entry in place, or store a new one.
    fn do_add(&mut self, fm: &FlowMod) -> u64 {
        let existing = self.entries.iter().find_map(|(cookie, e)| {
            (e.priority == fm.priority
                && e.ofmatch.compare(&fm.ofmatch, true) == MatchRelation::Equal)
                .then_some(*cookie)
        });
        let cookie = existing.unwrap_or_else(|| self.next_cookie());
        debug!(self.log, "storing flow";
            "tenant" => self.tenant,
            "cookie" => format!("{cookie:#x}"),
            "replaced" => existing.is_some(),
        );
        self.entries.insert(cookie, fm.clone());
        cookie
    }

    fn do_delete(&mut self, fm: &FlowMod) -> FlowModOutcome {
        if self.entries.is_empty() {
            return FlowModOutcome::Ignore;
        }
        if fm.ofmatch.is_wildcard_all() {
            debug!(self.log, "clearing flow table"; "tenant" => self.tenant);
            self.entries.clear();
            return FlowModOutcome::Cleared;
        }
        let strict = fm.command == FlowModCommand::DeleteStrict;
        let doomed: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                (!strict || e.priority == fm.priority)
                    && e.ofmatch.compare(&fm.ofmatch, strict)
                        == MatchRelation::Equal
            })
            .map(|(cookie, _)| *cookie)
            .collect();
        let removed: Vec<FlowMod> = doomed
            .into_iter()
            .filter_map(|cookie| self.delete_flow_mod(cookie))
            .collect();
        if removed.is_empty() {
            FlowModOutcome::Ignore
        } else {
            FlowModOutcome::Removed(removed)
        }
    }

    /// Move the entry matching `fm` to a fresh cookie, or store `fm` under
    /// one if no such entry exists.  Used when a flow is re-installed along
    /// a new physical path, so the old physical entries can age out
    /// independently.  The old cookie goes back on the free list.
    pub fn regenerate_cookie(&mut self, fm: &FlowMod) -> u64 {
        let cookie = self.next_cookie();
        let old = self.entries.iter().find_map(|(c, e)| {
            (e.priority == fm.priority
                && e.ofmatch.compare(&fm.ofmatch, true) == MatchRelation::Equal)
                .then_some(*c)
        });
        let entry = match old.and_then(|c| self.entries.remove(&c).map(|e| (c, e))) {
            Some((c, e)) => {
                self.release_cookie(c);
                e
            }
            None => fm.clone(),
        };
        self.entries.insert(cookie, entry);
        cookie
    }

    pub fn get_flow_mod(&self, cookie: u64) -> OvxResult<&FlowMod> {
        self.entries.get(&cookie).ok_or_else(|| {
            OvxError::Mapping(format!("no flow with cookie {cookie:#x}"))
        })
    }

    pub fn has_flow_mod(&self, cookie: u64) -> bool {
        self.entries.contains_key(&cookie)
    }

    pub fn delete_flow_mod(&mut self, cookie: u64) -> Option<FlowMod> {
        let fm = self.entries.remove(&cookie);
        if fm.is_some() {
            self.release_cookie(cookie);
        }
        fm
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &FlowMod)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use openflow::Action;
    use std::collections::BTreeSet;
    use openflow::Match;
    use openflow::OFPFF_SEND_FLOW_REM;

    fn add(in_port: u16) -> FlowMod {
        let mut m = Match::all();
        m.set_in_port(in_port);
        let mut fm = FlowMod::new(FlowModCommand::Add, m);
        fm.actions = vec![Action::output(2)];
        fm
    }

    #[test]
    fn test_cookie_carries_tenant() {
        for tenant in [1u32, 255, (1 << 31) - 1] {
            let mut table = FlowTable::new(&test_log(), tenant);
            let FlowModOutcome::Apply(cookie) = table.handle_flow_mod(&add(1))
            else {
                panic!("add not applied");
            };
            assert_eq!((cookie >> 32) as u32, tenant);
            assert_eq!(cookie & 0xffff_ffff, 1);
        }
    }

    #[test]
    fn test_identical_add_replaces() {
        let mut table = FlowTable::new(&test_log(), 1);
        let a = table.handle_flow_mod(&add(1));
        let mut again = add(1);
        again.flags = OFPFF_SEND_FLOW_REM;
        let b = table.handle_flow_mod(&again);
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        let FlowModOutcome::Apply(cookie) = b else {
            panic!("not applied");
        };
        assert!(table.get_flow_mod(cookie).unwrap().has_flag(OFPFF_SEND_FLOW_REM));
    }

    #[test]
    fn test_overlap() {
        let mut table = FlowTable::new(&test_log(), 1);
        table.handle_flow_mod(&FlowMod::new(FlowModCommand::Add, Match::all()));
        let mut fm = add(3);
        fm.flags = OFPFF_CHECK_OVERLAP;
        assert_eq!(table.handle_flow_mod(&fm), FlowModOutcome::Overlap);
        fm.priority = 1;
        assert!(matches!(
            table.handle_flow_mod(&fm),
            FlowModOutcome::Apply(_)
        ));
    }

    #[test]
    fn test_delete() {
        let mut table = FlowTable::new(&test_log(), 1);
        let mut del = FlowMod::new(FlowModCommand::Delete, Match::all());
        assert_eq!(table.handle_flow_mod(&del), FlowModOutcome::Ignore);

        table.handle_flow_mod(&add(1));
        let mut wide = add(1);
        wide.ofmatch.set_dl_type(packet::ETHER_IPV4);
        table.handle_flow_mod(&wide);
        table.handle_flow_mod(&add(2));
        assert_eq!(table.len(), 3);

        // A strict delete only takes the exact entry.
        del.command = FlowModCommand::DeleteStrict;
        del.ofmatch = add(1).ofmatch;
        assert_eq!(
            table.handle_flow_mod(&del),
            FlowModOutcome::Removed(vec![add(1)])
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.handle_flow_mod(&del), FlowModOutcome::Ignore);

        // A loose delete also takes the more specific entries.
        table.handle_flow_mod(&add(1));
        del.command = FlowModCommand::Delete;
        let FlowModOutcome::Removed(gone) = table.handle_flow_mod(&del) else {
            panic!("nothing removed");
        };
        assert_eq!(gone.len(), 2);
        assert_eq!(table.len(), 1);

        del.ofmatch = Match::all();
        assert_eq!(table.handle_flow_mod(&del), FlowModOutcome::Cleared);
        assert!(table.is_empty());
    }

    #[test]
    fn test_freed_cookies_are_reused() {
        let mut table = FlowTable::new(&test_log(), 4);
        let FlowModOutcome::Apply(first) = table.handle_flow_mod(&add(1)) else {
            panic!("not applied");
        };
        assert!(table.delete_flow_mod(first).is_some());
        assert!(table.delete_flow_mod(first).is_none());
        assert!(!table.has_flow_mod(first));
        assert_eq!(table.handle_flow_mod(&add(7)), FlowModOutcome::Apply(first));
    }

    #[test]
    fn test_regenerate_cookie() {
        let mut table = FlowTable::new(&test_log(), 2);
        let fm = add(1);
        let FlowModOutcome::Apply(old) = table.handle_flow_mod(&fm) else {
            panic!("not applied");
        };
        let new = table.regenerate_cookie(&fm);
        assert_ne!(old, new);
        assert!(!table.has_flow_mod(old));
        assert_eq!(table.get_flow_mod(new).unwrap(), &fm);
        assert_eq!(table.len(), 1);

        // Unknown flows are stored under the new cookie.
        let other = table.regenerate_cookie(&add(9));
        assert!(table.has_flow_mod(other));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_regenerated_cookies_are_recycled() {
        let mut table = FlowTable::new(&test_log(), 3);
        let fm = add(1);
        table.handle_flow_mod(&fm);
        let mut seen = BTreeSet::new();
        for _ in 0..10 {
            seen.insert(table.regenerate_cookie(&fm));
        }
        // Each move frees the cookie it left behind.
        assert_eq!(seen.len(), 2);
        assert_eq!(table.len(), 1);
        assert!(seen.iter().all(|c| c & 0xffff_ffff <= 2));
    }
}
