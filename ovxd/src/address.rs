// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Translation between tenant (virtual) IPv4 addresses and the physical
//! addresses that stand in for them on the shared network.  Each tenant owns
//! the physical prefix `tenant << (32 - v)`, with suffixes issued by its IP
//! counter.

use std::net::Ipv4Addr;

use openflow::Action;
use openflow::Match;
use parking_lot::Mutex;
use slog::debug;
use slog::error;
use slog::info;

use crate::index::BitSetIndex;
use crate::map::OvxMap;
use crate::types::OvxResult;
use crate::types::TenantId;

pub fn next_ip(
    tenant: TenantId,
    tenant_bits: u32,
    counter: &mut BitSetIndex,
) -> OvxResult<Ipv4Addr> {
    let suffix = counter.get_new_index()?;
    let base = (tenant as u64) << (32 - tenant_bits);
    Ok(Ipv4Addr::from((base + suffix as u64) as u32))
}

/// Everything needed to allocate physical addresses for one tenant.
pub struct IpMapper<'a> {
    pub log: &'a slog::Logger,
    pub map: &'a Mutex<OvxMap>,
    pub tenant: TenantId,
    pub tenant_bits: u32,
    pub counter: &'a mut BitSetIndex,
}

impl IpMapper<'_> {
    /// The physical address standing in for `vip`, allocating one on first
    /// use.  Failures are logged and yield 0.0.0.0.
    pub fn physical_ip(&mut self, vip: Ipv4Addr) -> Ipv4Addr {
        let mut map = self.map.lock();
        if let Ok(pip) = map.get_physical_ip(self.tenant, vip) {
            debug!(self.log, "address mapped";
                "tenant" => self.tenant, "vip" => %vip, "pip" => %pip);
            return pip;
        }
        match next_ip(self.tenant, self.tenant_bits, self.counter) {
            Ok(pip) => {
                info!(self.log, "adding address mapping";
                    "tenant" => self.tenant, "vip" => %vip, "pip" => %pip);
                map.add_ip(self.tenant, pip, vip);
                pip
            }
            Err(e) => {
                error!(self.log, "no physical address available";
                    "tenant" => self.tenant, "vip" => %vip, "error" => %e);
                Ipv4Addr::UNSPECIFIED
            }
        }
    }

    /// Replace the addresses matched by `m` with their physical stand-ins.
    pub fn rewrite_match(&mut self, m: &mut Match) {
        if let Some(src) = m.nw_src() {
            let pip = self.physical_ip(src);
            m.set_nw_src(pip, 32);
            m.set_dl_type(packet::ETHER_IPV4);
        }
        if let Some(dst) = m.nw_dst() {
            let pip = self.physical_ip(dst);
            m.set_nw_dst(pip, 32);
            m.set_dl_type(packet::ETHER_IPV4);
        }
    }

    /// Actions translating the addresses matched by `m` into physical
    /// space, prepended to the actions of packets entering the network.
    pub fn rewrite_actions(&mut self, m: &Match) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(src) = m.nw_src().filter(|ip| !ip.is_unspecified()) {
            actions.push(Action::SetNwSrc(self.physical_ip(src)));
        }
        if let Some(dst) = m.nw_dst().filter(|ip| !ip.is_unspecified()) {
            actions.push(Action::SetNwDst(self.physical_ip(dst)));
        }
        actions
    }
}

/// Actions restoring the tenant addresses matched by `m`, for packets
/// leaving the network toward a host.
pub fn unrewrite_actions(m: &Match) -> Vec<Action> {
    let mut actions = Vec::new();
    if let Some(src) = m.nw_src().filter(|ip| !ip.is_unspecified()) {
        actions.push(Action::SetNwSrc(src));
    }
    if let Some(dst) = m.nw_dst().filter(|ip| !ip.is_unspecified()) {
        actions.push(Action::SetNwDst(dst));
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexType;
    use crate::test_log;

    #[test]
    fn test_prefix_per_tenant() {
        let mut counter = BitSetIndex::new(IndexType::IpId, 1 << 24);
        assert_eq!(
            next_ip(2, 8, &mut counter).unwrap(),
            Ipv4Addr::new(2, 0, 0, 1)
        );
        assert_eq!(
            next_ip(2, 8, &mut counter).unwrap(),
            Ipv4Addr::new(2, 0, 0, 2)
        );
    }

    #[test]
    fn test_mapping_is_reused() {
        let log = test_log();
        let map = Mutex::new(OvxMap::new(&log));
        let mut counter = BitSetIndex::new(IndexType::IpId, 1 << 24);
        let mut ips = IpMapper {
            log: &log,
            map: &map,
            tenant: 1,
            tenant_bits: 8,
            counter: &mut counter,
        };
        let vip = Ipv4Addr::new(10, 0, 0, 1);
        let pip = ips.physical_ip(vip);
        assert_eq!(pip, Ipv4Addr::new(1, 0, 0, 1));
        assert_eq!(ips.physical_ip(vip), pip);
        assert_eq!(map.lock().get_virtual_ip(pip).unwrap(), (1, vip));
    }

    #[test]
    fn test_rewrite_and_restore() {
        let log = test_log();
        let map = Mutex::new(OvxMap::new(&log));
        let mut counter = BitSetIndex::new(IndexType::IpId, 1 << 24);
        let mut ips = IpMapper {
            log: &log,
            map: &map,
            tenant: 3,
            tenant_bits: 8,
            counter: &mut counter,
        };
        let mut m = Match::all();
        m.set_dl_type(packet::ETHER_IPV4)
            .set_nw_src(Ipv4Addr::new(10, 0, 0, 1), 32)
            .set_nw_dst(Ipv4Addr::new(10, 0, 0, 2), 32);
        let original = m;

        assert_eq!(
            ips.rewrite_actions(&m),
            vec![
                Action::SetNwSrc(Ipv4Addr::new(3, 0, 0, 1)),
                Action::SetNwDst(Ipv4Addr::new(3, 0, 0, 2)),
            ]
        );
        ips.rewrite_match(&mut m);
        assert_eq!(m.nw_src(), Some(Ipv4Addr::new(3, 0, 0, 1)));
        assert_eq!(m.nw_dst(), Some(Ipv4Addr::new(3, 0, 0, 2)));

        assert_eq!(
            unrewrite_actions(&original),
            vec![
                Action::SetNwSrc(Ipv4Addr::new(10, 0, 0, 1)),
                Action::SetNwDst(Ipv4Addr::new(10, 0, 0, 2)),
            ]
        );
        assert!(ips.rewrite_actions(&Match::all()).is_empty());
    }

    #[test]
    fn test_exhaustion_yields_unspecified() {
        let log = test_log();
        let map = Mutex::new(OvxMap::new(&log));
        let mut counter = BitSetIndex::new(IndexType::IpId, 1);
        let mut ips = IpMapper {
            log: &log,
            map: &map,
            tenant: 1,
            tenant_bits: 8,
            counter: &mut counter,
        };
        assert_eq!(
            ips.physical_ip(Ipv4Addr::new(10, 0, 0, 9)),
            Ipv4Addr::UNSPECIFIED
        );
    }
}
