// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Allocation of the small integer identifiers handed out by the
//! hypervisor: tenant ids, virtual dpids, link ids, port numbers, and so on.
//!
//! Index 0 is reserved in every allocator, so the first id issued is 1.  The
//! state is kept sparse: ids below a high-water mark that have been released
//! sit in an ordered free set, and everything at or above the mark has never
//! been issued.  This gives "lowest free id first" without materializing a
//! bitmap for the 2^32-entry spaces.

use std::collections::BTreeSet;

use crate::linkfield::LinkField;
use crate::types::OvxError;
use crate::types::OvxResult;

/// The kinds of identifier, each with its own capacity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum IndexType {
    TenantId,
    SwitchId,
    LinkId,
    RouteId,
    PortId,
    FlowId,
    HostId,
    FlowCounter,
    IpId,
    Default,
}

impl IndexType {
    /// Number of ids in this space, including the reserved 0.
    /// `tenant_bits` is the number of high-order bits reserved for the
    /// tenant id in encoded fields.
    pub fn capacity(self, tenant_bits: u32, link_field: LinkField) -> u64 {
        let link_bits = match link_field {
            LinkField::MacAddress => (48 - tenant_bits) / 2,
            LinkField::Vlan => 12u32.saturating_sub(tenant_bits) / 2,
        };
        match self {
            IndexType::TenantId => 1 << tenant_bits,
            IndexType::SwitchId => 1 << 32,
            IndexType::LinkId | IndexType::FlowCounter => 1 << link_bits,
            IndexType::RouteId => 1 << 24,
            IndexType::PortId => openflow::port::OFPP_MAX as u64,
            IndexType::FlowId => 1 << 24,
            IndexType::HostId => 1 << 32,
            IndexType::IpId => 1 << (32 - tenant_bits),
            IndexType::Default => 1000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BitSetIndex {
    kind: IndexType,
    capacity: u64,
    // Every id below this has been issued at least once.
    high: u64,
    // Released ids below `high`.
    free: BTreeSet<u32>,
}

impl BitSetIndex {
    pub fn new(kind: IndexType, capacity: u64) -> Self {
        BitSetIndex {
            kind,
            capacity,
            high: 1,
            free: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> IndexType {
        self.kind
    }

    /// Issue the lowest free id.
    pub fn get_new_index(&mut self) -> OvxResult<u32> {
        if let Some(id) = self.free.pop_first() {
            return Ok(id);
        }
        if self.high >= self.capacity {
            return Err(OvxError::IndexOutOfBound(self.kind));
        }
        let id = self.high as u32;
        self.high += 1;
        Ok(id)
    }

    /// Claim a specific id.
    pub fn get_new_index_with(&mut self, id: u32) -> OvxResult<u32> {
        let wanted = id as u64;
        if wanted >= self.capacity || id == 0 {
            return Err(OvxError::IndexOutOfBound(self.kind));
        }
        if wanted < self.high {
            if self.free.remove(&id) {
                Ok(id)
            } else {
                Err(OvxError::DuplicateIndex(self.kind, id))
            }
        } else {
            for skipped in self.high..wanted {
                self.free.insert(skipped as u32);
            }
            self.high = wanted + 1;
            Ok(id)
        }
    }

    /// Return an id to the pool.  Releasing an id that is not in use is
    /// harmless, and is reported by returning false.
    pub fn release_index(&mut self, id: u32) -> bool {
        let id64 = id as u64;
        if id == 0 || id64 >= self.high || self.free.contains(&id) {
            return false;
        }
        if id64 + 1 == self.high {
            self.high -= 1;
            while let Some(&top) = self.free.last() {
                if top as u64 + 1 != self.high {
                    break;
                }
                self.free.pop_last();
                self.high -= 1;
            }
        } else {
            self.free.insert(id);
        }
        true
    }

    pub fn is_used(&self, id: u32) -> bool {
        id != 0 && (id as u64) < self.high && !self.free.contains(&id)
    }

    pub fn reset(&mut self) {
        self.high = 1;
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut idx = BitSetIndex::new(IndexType::Default, 1000);
        assert_eq!(idx.get_new_index().unwrap(), 1);
        assert_eq!(idx.get_new_index().unwrap(), 2);
        assert_eq!(idx.get_new_index().unwrap(), 3);
        assert!(idx.release_index(2));
        assert_eq!(idx.get_new_index().unwrap(), 2);
        assert_eq!(idx.get_new_index().unwrap(), 4);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut idx = BitSetIndex::new(IndexType::LinkId, 16);
        let a = idx.get_new_index().unwrap();
        assert!(idx.release_index(a));
        assert!(!idx.release_index(a));
        assert!(!idx.release_index(0));
        assert!(!idx.release_index(12));
        assert_eq!(idx.get_new_index().unwrap(), a);
    }

    #[test]
    fn test_exhaustion() {
        let mut idx = BitSetIndex::new(IndexType::TenantId, 4);
        for want in 1..4 {
            assert_eq!(idx.get_new_index().unwrap(), want);
        }
        assert!(matches!(
            idx.get_new_index(),
            Err(OvxError::IndexOutOfBound(IndexType::TenantId))
        ));
        idx.release_index(1);
        assert_eq!(idx.get_new_index().unwrap(), 1);
    }

    #[test]
    fn test_specific_index() {
        let mut idx = BitSetIndex::new(IndexType::PortId, 100);
        assert_eq!(idx.get_new_index_with(5).unwrap(), 5);
        assert!(matches!(
            idx.get_new_index_with(5),
            Err(OvxError::DuplicateIndex(IndexType::PortId, 5))
        ));
        assert!(matches!(
            idx.get_new_index_with(100),
            Err(OvxError::IndexOutOfBound(_))
        ));
        // The ids skipped over remain available, lowest first.
        assert_eq!(idx.get_new_index().unwrap(), 1);
        assert_eq!(idx.get_new_index_with(3).unwrap(), 3);
        assert_eq!(idx.get_new_index().unwrap(), 2);
        assert_eq!(idx.get_new_index().unwrap(), 4);
        assert_eq!(idx.get_new_index().unwrap(), 6);
    }

    #[test]
    fn test_release_top_shrinks() {
        let mut idx = BitSetIndex::new(IndexType::Default, 1000);
        for _ in 0..5 {
            idx.get_new_index().unwrap();
        }
        idx.release_index(4);
        idx.release_index(5);
        assert!(!idx.is_used(4));
        assert!(idx.is_used(3));
        idx.reset();
        assert!(!idx.is_used(3));
        assert_eq!(idx.get_new_index().unwrap(), 1);
    }

    #[test]
    fn test_capacities() {
        let mac = LinkField::MacAddress;
        assert_eq!(IndexType::TenantId.capacity(8, mac), 256);
        assert_eq!(IndexType::LinkId.capacity(8, mac), 1 << 20);
        assert_eq!(IndexType::LinkId.capacity(8, LinkField::Vlan), 4);
        assert_eq!(IndexType::IpId.capacity(8, mac), 1 << 24);
        assert_eq!(IndexType::PortId.capacity(8, mac), 0xff00);
    }
}
