// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The shared physical network: the switches connected to the hypervisor
//! and the links discovered between them.
//!
//! Nothing here sends messages.  Operations return the messages they want
//! sent, and the links they created or lost, so the caller can do the
//! sending and run recovery once the physical network lock is released.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use openflow::OfBody;
use openflow::OfMessage;
use openflow::PacketIn;
use openflow::PhyPort;
use slog::debug;
use slog::info;
use slog::warn;

use common::network::MacAddr;

use crate::discovery::DiscoveryManager;
use crate::link::PhysicalLink;
use crate::port::PhysicalPort;
use crate::state::State;
use crate::state::Transition;
use crate::switch::PhysicalSwitch;
use crate::topology::Network;
use crate::types::*;

pub struct PhysicalNetwork {
    log: slog::Logger,
    pub state: State,
    pub topo: Network<PhysicalSwitch, PhysicalLink>,
    discovery: BTreeMap<Dpid, DiscoveryManager>,
    next_link_id: u32,
}

impl PhysicalNetwork {
    pub fn new(log: &slog::Logger) -> Self {
        PhysicalNetwork {
            log: log.new(slog::o!("unit" => "physical_network")),
            state: State::Init,
            topo: Network::new(),
            discovery: BTreeMap::new(),
            next_link_id: 1,
        }
    }

    pub fn transition(&mut self, t: Transition) -> bool {
        self.state.apply(&self.log, "physical network", t)
    }

    /// Admit a switch that has completed its handshake.  Returns the
    /// messages to send it: the default flows and a first discovery probe
    /// out of every port.
    pub fn add_switch(&mut self, mut sw: PhysicalSwitch) -> Vec<OfMessage> {
        if !self.state.is_active() {
            warn!(self.log, "network not active, ignoring switch";
                "dpid" => sw.name(), "state" => %self.state);
            return Vec::new();
        }
        let dpid = sw.dpid;
        if self.topo.switches.contains_key(&dpid) {
            warn!(self.log, "switch already connected"; "dpid" => sw.name());
            return Vec::new();
        }
        sw.transition(Transition::Register);
        sw.transition(Transition::Boot);
        info!(self.log, "adding switch";
            "dpid" => sw.name(), "ports" => sw.ports.len());

        let mut out: Vec<OfMessage> = PhysicalSwitch::default_flows()
            .into_iter()
            .map(|fm| OfMessage::new(0, OfBody::FlowMod(fm)))
            .collect();
        let mut dm = DiscoveryManager::new(dpid);
        for port in sw.ports.values() {
            out.extend(dm.add_port(port.port_no(), port.desc.hw_addr));
        }
        self.discovery.insert(dpid, dm);
        self.topo.add_switch(sw);
        out
    }

    /// Forget a switch whose channel has closed, along with its links.
    pub fn remove_switch(
        &mut self,
        dpid: Dpid,
    ) -> Option<(PhysicalSwitch, Vec<LinkKey>)> {
        self.discovery.remove(&dpid);
        let lost = self.links_of_switch(dpid);
        let mut sw = self.topo.remove_switch(dpid)?;
        info!(self.log, "removing switch";
            "dpid" => sw.name(), "links" => lost.len());
        sw.transition(Transition::TearDown);
        sw.transition(Transition::Unregister);
        sw.ports.clear();
        Some((sw, lost))
    }

    /// Add or update a port.  Returns a probe if the port is new.
    pub fn update_port(&mut self, dpid: Dpid, desc: PhyPort) -> Option<OfMessage> {
        let (port, hw) = (desc.port_no, desc.hw_addr);
        let sw = self.topo.switches.get_mut(&dpid)?;
        if !sw.update_port(desc) {
            return None;
        }
        self.discovery.get_mut(&dpid)?.add_port(port, hw)
    }

    /// Remove a port, and the links attached to it.  Returns the links.
    pub fn remove_port(&mut self, port: PortRef) -> Vec<LinkKey> {
        let lost: Vec<LinkKey> = self
            .topo
            .links
            .keys()
            .filter(|k| k.src == port || k.dst == port)
            .copied()
            .collect();
        for key in &lost {
            self.topo.remove_link(*key);
        }
        if let Some(dm) = self.discovery.get_mut(&port.dpid) {
            dm.remove_port(port.port);
        }
        if let Some(sw) = self.topo.switches.get_mut(&port.dpid) {
            sw.remove_port(port.port);
        }
        lost
    }

    fn links_of_switch(&self, dpid: Dpid) -> Vec<LinkKey> {
        self.topo
            .links
            .keys()
            .filter(|k| k.src.dpid == dpid || k.dst.dpid == dpid)
            .copied()
            .collect()
    }

    pub fn get_port(&self, port: PortRef) -> OvxResult<&PhysicalPort> {
        self.topo.get_switch(port.dpid)?.get_port(port.port)
    }

    pub fn get_port_mut(&mut self, port: PortRef) -> OvxResult<&mut PhysicalPort> {
        self.topo.get_switch_mut(port.dpid)?.get_port_mut(port.port)
    }

    pub fn port_hw_addr(&self, port: PortRef) -> Option<MacAddr> {
        self.get_port(port).ok().map(|p| p.desc.hw_addr)
    }

    pub fn is_port_enabled(&self, port: PortRef) -> bool {
        self.get_port(port).is_ok_and(|p| p.is_enabled())
    }

    fn set_link_down(&mut self, port: PortRef, down: bool) {
        if let Ok(p) = self.get_port_mut(port) {
            p.desc.set_link_down(down);
        }
    }

    /// Record a link found by discovery.  Returns false if `src` is already
    /// known to lead to `dst`.
    pub fn create_link(&mut self, src: PortRef, dst: PortRef) -> bool {
        if self.topo.get_neighbor_port(src) == Some(dst) {
            return false;
        }
        if !self.topo.switches.contains_key(&src.dpid)
            || !self.topo.switches.contains_key(&dst.dpid)
        {
            return false;
        }
        let key = LinkKey::new(src, dst);
        // A port leads to one place at a time.
        if let Some(old) = self.topo.get_neighbor_port(src) {
            self.topo.remove_link(LinkKey::new(src, old));
        }
        let mut link = PhysicalLink::new(self.next_link_id, key);
        self.next_link_id = self.next_link_id.wrapping_add(1).max(1);
        link.transition(&self.log, Transition::Register);
        link.transition(&self.log, Transition::Boot);
        info!(self.log, "adding link"; "link" => %key, "id" => link.id);
        self.topo.add_link(link);
        self.set_link_down(src, false);
        self.set_link_down(dst, false);
        true
    }

    /// Drop a link that has stopped working.  Returns its key if it was
    /// known.
    pub fn remove_link(&mut self, src: PortRef, dst: PortRef) -> Option<LinkKey> {
        if self.topo.get_neighbor_port(src) != Some(dst) {
            return None;
        }
        let key = LinkKey::new(src, dst);
        let mut link = self.topo.remove_link(key)?;
        info!(self.log, "removing link"; "link" => %key);
        link.transition(&self.log, Transition::TearDown);
        link.transition(&self.log, Transition::Unregister);
        self.set_link_down(src, true);
        self.set_link_down(dst, true);
        Some(key)
    }

    pub fn ack_probe(&mut self, port: PortRef) {
        if let Some(dm) = self.discovery.get_mut(&port.dpid) {
            dm.ack_probe(port.port);
        }
    }

    /// A discovery probe arrived at switch `dpid`.  Returns the link it
    /// proves, if the link is new.
    pub fn handle_lldp(&mut self, dpid: Dpid, pi: &PacketIn) -> Option<LinkKey> {
        let Some(origin) = packet::lldp::parse_probe(&pi.data) else {
            debug!(self.log, "ignoring foreign LLDP frame";
                "dpid" => format!("{dpid:016x}"), "port" => pi.in_port);
            return None;
        };
        let src = PortRef::new(origin.dpid, origin.port);
        let dst = PortRef::new(dpid, pi.in_port);
        self.ack_probe(src);
        self.create_link(src, dst)
            .then_some(LinkKey::new(src, dst))
    }

    /// One discovery round over every switch.  Returns the probes to send,
    /// and the links whose probes stopped arriving, which have been removed.
    pub fn tick(&mut self) -> (Vec<(Dpid, OfMessage)>, Vec<LinkKey>) {
        let mut probes = Vec::new();
        let mut expired = Vec::new();
        for (dpid, dm) in self.discovery.iter_mut() {
            let t = dm.tick();
            probes.extend(t.probes.into_iter().map(|m| (*dpid, m)));
            expired.extend(t.expired.into_iter().map(|p| PortRef::new(*dpid, p)));
        }
        let lost = expired
            .into_iter()
            .filter_map(|src| {
                let dst = self.topo.get_neighbor_port(src)?;
                self.remove_link(src, dst)
            })
            .collect();
        (probes, lost)
    }

    /// Links currently usable for paths.
    pub fn active_links(&self) -> BTreeSet<LinkKey> {
        self.topo
            .links
            .values()
            .filter(|l| l.state.is_active())
            .map(|l| l.key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use openflow::DescStats;
    use openflow::FeaturesReply;

    pub(crate) fn switch(dpid: Dpid, ports: &[PortNo]) -> PhysicalSwitch {
        let features = FeaturesReply {
            datapath_id: dpid,
            n_buffers: 256,
            n_tables: 1,
            capabilities: 0,
            actions: 0,
            ports: ports
                .iter()
                .map(|p| PhyPort::new(*p, MacAddr::ovx(*p as u32), format!("eth{p}")))
                .collect(),
        };
        PhysicalSwitch::new(&test_log(), features, DescStats::default())
    }

    fn network() -> PhysicalNetwork {
        let mut net = PhysicalNetwork::new(&test_log());
        net.transition(Transition::Register);
        net.transition(Transition::Boot);
        net
    }

    fn lldp_in(from: PortRef, in_port: PortNo) -> PacketIn {
        PacketIn {
            buffer_id: openflow::OFP_NO_BUFFER,
            total_len: 0,
            in_port,
            reason: 0,
            data: packet::lldp::make_probe(MacAddr::ZERO, from.port, from.dpid),
        }
    }

    #[test]
    fn test_switch_requires_active_network() {
        let mut net = PhysicalNetwork::new(&test_log());
        assert!(net.add_switch(switch(1, &[1])).is_empty());
        assert!(net.topo.switches.is_empty());

        let mut net = network();
        let msgs = net.add_switch(switch(1, &[1, 2]));
        // four default flows and a probe per port
        assert_eq!(msgs.len(), 6);
        assert_eq!(net.topo.get_switch(1).unwrap().state, State::Active);
    }

    #[test]
    fn test_discovered_link() {
        let mut net = network();
        net.add_switch(switch(1, &[1]));
        net.add_switch(switch(2, &[1]));
        let (a, b) = (PortRef::new(1, 1), PortRef::new(2, 1));

        let key = net.handle_lldp(2, &lldp_in(a, 1));
        assert_eq!(key, Some(LinkKey::new(a, b)));
        // The same probe again proves nothing new.
        assert_eq!(net.handle_lldp(2, &lldp_in(a, 1)), None);
        assert!(!net.get_port(a).unwrap().is_edge);
        assert_eq!(net.active_links().len(), 1);

        assert_eq!(net.remove_link(b, a), None);
        assert_eq!(net.remove_link(a, b), Some(LinkKey::new(a, b)));
        assert!(net.get_port(a).unwrap().desc.is_link_down());
        assert!(net.active_links().is_empty());
    }

    #[test]
    fn test_silent_link_expires() {
        let mut net = network();
        net.add_switch(switch(1, &[1]));
        net.add_switch(switch(2, &[1]));
        let (a, b) = (PortRef::new(1, 1), PortRef::new(2, 1));
        net.handle_lldp(2, &lldp_in(a, 1));

        let mut lost = Vec::new();
        for _ in 0..=crate::discovery::MAX_PROBE {
            let (_, l) = net.tick();
            lost.extend(l);
        }
        assert_eq!(lost, vec![LinkKey::new(a, b)]);
    }

    #[test]
    fn test_remove_switch_reports_links() {
        let mut net = network();
        net.add_switch(switch(1, &[1]));
        net.add_switch(switch(2, &[1]));
        let (a, b) = (PortRef::new(1, 1), PortRef::new(2, 1));
        net.create_link(a, b);
        net.create_link(b, a);
        let (sw, lost) = net.remove_switch(2).unwrap();
        assert_eq!(sw.state, State::Stopped);
        assert_eq!(lost.len(), 2);
        assert!(net.topo.links.is_empty());
    }
}
