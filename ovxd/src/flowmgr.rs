// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Per-tenant flow identifiers.  A flow id names an (original source MAC,
//! original destination MAC) pair, so the addresses overwritten by link
//! fields can be restored when a packet leaves a virtual link.

use std::collections::BTreeMap;

use slog::debug;

use common::network::MacAddr;

use crate::index::BitSetIndex;
use crate::index::IndexType;
use crate::types::OvxResult;
use crate::types::TenantId;

pub struct FlowManager {
    log: slog::Logger,
    tenant: TenantId,
    values: BTreeMap<u32, (MacAddr, MacAddr)>,
    ids: BTreeMap<(MacAddr, MacAddr), u32>,
    counter: BitSetIndex,
}

impl FlowManager {
    pub fn new(log: &slog::Logger, tenant: TenantId, capacity: u64) -> Self {
        FlowManager {
            log: log.new(slog::o!("unit" => "flow_manager")),
            tenant,
            values: BTreeMap::new(),
            ids: BTreeMap::new(),
            counter: BitSetIndex::new(IndexType::FlowCounter, capacity),
        }
    }

    pub fn store_flow_values(
        &mut self,
        src: MacAddr,
        dst: MacAddr,
    ) -> OvxResult<u32> {
        if let Some(id) = self.ids.get(&(src, dst)) {
            return Ok(*id);
        }
        let id = self.counter.get_new_index()?;
        debug!(self.log, "saved flow values";
            "tenant" => self.tenant,
            "flow" => id,
            "src" => %src,
            "dst" => %dst,
        );
        self.values.insert(id, (src, dst));
        self.ids.insert((src, dst), id);
        Ok(id)
    }

    pub fn get_flow_values(&self, flow: u32) -> Option<(MacAddr, MacAddr)> {
        self.values.get(&flow).copied()
    }

    /// The id of the pair, allocating one if the pair has not been seen.
    pub fn get_flow_id(&mut self, src: MacAddr, dst: MacAddr) -> OvxResult<u32> {
        self.store_flow_values(src, dst)
    }

    /// Pre-allocate ids for every host pair, and for each host to
    /// broadcast.
    pub fn boot(&mut self, macs: &[MacAddr]) -> OvxResult<()> {
        for src in macs {
            self.store_flow_values(*src, MacAddr::BROADCAST)?;
            for dst in macs {
                if src != dst {
                    self.store_flow_values(*src, *dst)?;
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use crate::types::OvxError;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new(0, 0, 0, 0, 0, n)
    }

    #[test]
    fn test_ids_are_stable() {
        let mut flows = FlowManager::new(&test_log(), 1, 1 << 20);
        let id = flows.get_flow_id(mac(1), mac(2)).unwrap();
        assert_eq!(flows.get_flow_id(mac(1), mac(2)).unwrap(), id);
        assert_ne!(flows.get_flow_id(mac(2), mac(1)).unwrap(), id);
        assert_eq!(flows.get_flow_values(id), Some((mac(1), mac(2))));
        assert_eq!(flows.get_flow_values(999), None);
    }

    #[test]
    fn test_boot_covers_all_pairs() {
        let mut flows = FlowManager::new(&test_log(), 1, 1 << 20);
        flows.boot(&[mac(1), mac(2), mac(3)]).unwrap();
        // 3 broadcast pairs plus 3 * 2 ordered host pairs.
        assert_eq!(flows.len(), 9);
    }

    #[test]
    fn test_boot_fails_when_exhausted() {
        let mut flows = FlowManager::new(&test_log(), 1, 4);
        assert!(matches!(
            flows.boot(&[mac(1), mac(2)]),
            Err(OvxError::IndexOutOfBound(IndexType::FlowCounter))
        ));
    }
}
