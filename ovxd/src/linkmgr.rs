// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Keepalive flows for a tenant.  Tenant ports send ARP to the hypervisor,
//! and the physical hops of every virtual link and route forward the
//! tenant's address range.  These flows carry timeouts and are refreshed
//! periodically, so a switch that lost them recovers on its own.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use openflow::port::OFPP_CONTROLLER;
use openflow::Action;
use openflow::FlowMod;
use openflow::FlowModCommand;
use openflow::Match;
use slog::debug;

use crate::types::*;

pub const KEEPALIVE_PRIORITY: u16 = 65535;
pub const KEEPALIVE_HARD_TIMEOUT: u16 = 30;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Keepalive {
    Port(PortRef),
    Link(LinkKey),
    Route(RouteKey),
}

pub struct LinkManager {
    log: slog::Logger,
    tenant: TenantId,
    tenant_bits: u32,
    flows: BTreeMap<Keepalive, Vec<(Dpid, FlowMod)>>,
}

impl LinkManager {
    pub fn new(log: &slog::Logger, tenant: TenantId, tenant_bits: u32) -> Self {
        LinkManager {
            log: log.new(slog::o!("unit" => "link_manager")),
            tenant,
            tenant_bits,
            flows: BTreeMap::new(),
        }
    }

    fn cookie(&self) -> u64 {
        (self.tenant as u64) << 32
    }

    /// ARP arriving at a tenant's physical port goes to the hypervisor.
    pub fn register_port(&mut self, phys: PortRef) -> Vec<(Dpid, FlowMod)> {
        let mut m = Match::all();
        m.set_in_port(phys.port).set_dl_type(packet::ETHER_ARP);
        let mut fm = FlowMod::new(FlowModCommand::Add, m);
        fm.priority = KEEPALIVE_PRIORITY;
        fm.hard_timeout = KEEPALIVE_HARD_TIMEOUT;
        fm.cookie = self.cookie();
        fm.actions = vec![Action::output(OFPP_CONTROLLER)];
        let flows = vec![(phys.dpid, fm)];
        self.flows.insert(Keepalive::Port(phys), flows.clone());
        flows
    }

    pub fn unregister_port(&mut self, phys: PortRef) -> Vec<(Dpid, FlowMod)> {
        self.remove(Keepalive::Port(phys))
    }

    fn hop_flows(&self, path: &[LinkKey]) -> Vec<(Dpid, FlowMod)> {
        let prefix = Ipv4Addr::from(
            ((self.tenant as u64) << (32 - self.tenant_bits)) as u32,
        );
        path.windows(2)
            .map(|hops| {
                let mut m = Match::all();
                m.set_in_port(hops[0].dst.port)
                    .set_dl_type(packet::ETHER_IPV4)
                    .set_nw_dst(prefix, self.tenant_bits);
                let mut fm = FlowMod::new(FlowModCommand::Modify, m);
                fm.cookie = self.cookie();
                fm.actions = vec![Action::output(hops[1].src.port)];
                (hops[0].dst.dpid, fm)
            })
            .collect()
    }

    /// Record the hop flows of a virtual link's current path.  Returns the
    /// flows to send now.
    pub fn register_link(&mut self, vlink: LinkKey, path: &[LinkKey]) -> Vec<(Dpid, FlowMod)> {
        let flows = self.hop_flows(path);
        debug!(self.log, "recording link keepalives";
            "link" => %vlink, "flows" => flows.len());
        self.flows.insert(Keepalive::Link(vlink), flows.clone());
        flows
    }

    pub fn register_route(&mut self, route: RouteKey, path: &[LinkKey]) -> Vec<(Dpid, FlowMod)> {
        let flows = self.hop_flows(path);
        self.flows.insert(Keepalive::Route(route), flows.clone());
        flows
    }

    pub fn unregister_link(&mut self, vlink: LinkKey) -> Vec<(Dpid, FlowMod)> {
        self.remove(Keepalive::Link(vlink))
    }

    pub fn unregister_route(&mut self, route: RouteKey) -> Vec<(Dpid, FlowMod)> {
        self.remove(Keepalive::Route(route))
    }

    // The deletions undoing a recorded set of flows.
    fn remove(&mut self, key: Keepalive) -> Vec<(Dpid, FlowMod)> {
        self.flows
            .remove(&key)
            .unwrap_or_default()
            .into_iter()
            .map(|(dpid, mut fm)| {
                fm.command = FlowModCommand::Delete;
                fm.actions.clear();
                (dpid, fm)
            })
            .collect()
    }

    /// Every recorded flow, for the periodic refresh.
    pub fn snapshot(&self) -> Vec<(Dpid, FlowMod)> {
        self.flows.values().flatten().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.flows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use pretty_assertions::assert_eq;

    fn hop(a: (Dpid, PortNo), b: (Dpid, PortNo)) -> LinkKey {
        LinkKey::new(PortRef::new(a.0, a.1), PortRef::new(b.0, b.1))
    }

    #[test]
    fn test_port_keepalive() {
        let mut lm = LinkManager::new(&test_log(), 2, 8);
        let flows = lm.register_port(PortRef::new(5, 3));
        assert_eq!(flows.len(), 1);
        let (dpid, fm) = &flows[0];
        assert_eq!(*dpid, 5);
        assert_eq!(fm.priority, 65535);
        assert_eq!(fm.hard_timeout, 30);
        assert_eq!(fm.ofmatch.dl_type(), Some(packet::ETHER_ARP));
        assert_eq!(fm.cookie >> 32, 2);
    }

    #[test]
    fn test_link_keepalive_hops() {
        let mut lm = LinkManager::new(&test_log(), 2, 8);
        let vlink = hop((0xa1, 1), (0xa2, 1));
        let path = [hop((1, 1), (2, 1)), hop((2, 2), (3, 1))];
        let flows = lm.register_link(vlink, &path);
        assert_eq!(flows.len(), 1);
        let (dpid, fm) = &flows[0];
        assert_eq!(*dpid, 2);
        assert_eq!(fm.command, FlowModCommand::Modify);
        assert_eq!(fm.ofmatch.in_port(), Some(1));
        assert_eq!(fm.ofmatch.nw_dst(), Some(Ipv4Addr::new(2, 0, 0, 0)));
        assert_eq!(fm.ofmatch.nw_dst_prefix_len(), 8);
        assert_eq!(fm.actions, vec![Action::output(2)]);

        assert_eq!(lm.snapshot().len(), 1);
        let deletes = lm.unregister_link(vlink);
        assert_eq!(deletes[0].1.command, FlowModCommand::Delete);
        assert!(lm.snapshot().is_empty());
    }
}
