// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

use openflow::port::OFPP_LOCAL;
use openflow::FeaturesReply;
use openflow::PacketIn;
use openflow::PhyPort;
use openflow::OFPC_ARP_MATCH_IP;
use openflow::OFPC_FLOW_STATS;
use openflow::OFPC_PORT_STATS;
use openflow::OFPC_TABLE_STATS;
use openflow::OFP_ALL_ACTIONS;
use openflow::OFP_DEFAULT_MISS_SEND_LEN;
use slog::debug;

use common::network::MacAddr;

use crate::flowtable::FlowTable;
use crate::index::BitSetIndex;
use crate::index::IndexType;
use crate::port::OvxPort;
use crate::route::SwitchRoute;
use crate::routing::RoutingAlgorithm;
use crate::state::State;
use crate::state::Transition;
use crate::switch::buffer::BufferMap;
use crate::switch::buffer::Buffered;
use crate::switch::buffer::BUFFER_CAPACITY;
use crate::topology::Node;
use crate::types::*;

/// A virtual switch spanning several physical switches.
pub struct BigSwitch {
    pub alg: RoutingAlgorithm,
    pub backups: u8,
    // ingress -> egress -> route
    routes: BTreeMap<PortNo, BTreeMap<PortNo, SwitchRoute>>,
    route_counter: BitSetIndex,
}

impl BigSwitch {
    pub fn new(alg: RoutingAlgorithm, backups: u8) -> Self {
        BigSwitch {
            alg,
            backups,
            routes: BTreeMap::new(),
            route_counter: BitSetIndex::new(
                IndexType::RouteId,
                IndexType::RouteId.capacity(0, Default::default()),
            ),
        }
    }

    pub fn next_route_id(&mut self) -> OvxResult<u32> {
        self.route_counter.get_new_index()
    }

    pub fn get_route(&self, ingress: PortNo, egress: PortNo) -> Option<&SwitchRoute> {
        self.routes.get(&ingress)?.get(&egress)
    }

    pub fn get_route_mut(
        &mut self,
        ingress: PortNo,
        egress: PortNo,
    ) -> Option<&mut SwitchRoute> {
        self.routes.get_mut(&ingress)?.get_mut(&egress)
    }

    pub fn route_by_id(&self, route_id: u32) -> Option<&SwitchRoute> {
        self.routes()
            .find(|r| r.route_id == route_id)
    }

    pub fn route_by_id_mut(&mut self, route_id: u32) -> Option<&mut SwitchRoute> {
        self.routes
            .values_mut()
            .flat_map(|m| m.values_mut())
            .find(|r| r.route_id == route_id)
    }

    pub fn add_route(&mut self, route: SwitchRoute) {
        self.routes
            .entry(route.ingress)
            .or_default()
            .insert(route.egress, route);
    }

    pub fn routes(&self) -> impl Iterator<Item = &SwitchRoute> {
        self.routes.values().flat_map(|m| m.values())
    }

    /// Remove one direction of a route, returning its id to the pool.
    pub fn remove_route(
        &mut self,
        ingress: PortNo,
        egress: PortNo,
    ) -> Option<SwitchRoute> {
        let by_egress = self.routes.get_mut(&ingress)?;
        let route = by_egress.remove(&egress)?;
        if by_egress.is_empty() {
            self.routes.remove(&ingress);
        }
        self.route_counter.release_index(route.route_id);
        Some(route)
    }

    /// Remove every route entering or leaving `port`.
    pub fn remove_routes_for(&mut self, port: PortNo) -> Vec<SwitchRoute> {
        let pairs: Vec<(PortNo, PortNo)> = self
            .routes()
            .filter(|r| r.ingress == port || r.egress == port)
            .map(|r| (r.ingress, r.egress))
            .collect();
        pairs
            .into_iter()
            .filter_map(|(i, e)| self.remove_route(i, e))
            .collect()
    }
}

pub enum SwitchKind {
    Single,
    Big(BigSwitch),
}

/// A tenant's switch, as its controller sees it.
pub struct OvxSwitch {
    log: slog::Logger,
    pub tenant: TenantId,
    pub dpid: Dpid,
    pub name: String,
    pub state: State,
    pub kind: SwitchKind,
    pub ports: BTreeMap<PortNo, OvxPort>,
    port_counter: BitSetIndex,
    pub miss_send_len: u16,
    pub config_flags: u16,
    backoff: i32,
    buffers: BufferMap,
    pub flow_table: FlowTable,
    /// The controller has completed its handshake with this switch.
    pub connected: bool,
    physical: Vec<Dpid>,
}

impl Node for OvxSwitch {
    fn dpid(&self) -> Dpid {
        self.dpid
    }

    fn set_port_edge(&mut self, port: PortNo, edge: bool) {
        if let Some(p) = self.ports.get_mut(&port) {
            p.is_edge = edge;
        }
    }
}

impl OvxSwitch {
    pub fn new(
        log: &slog::Logger,
        tenant: TenantId,
        dpid: Dpid,
        physical: Vec<Dpid>,
        kind: SwitchKind,
    ) -> Self {
        let name = format!("{dpid:016x}");
        OvxSwitch {
            log: log.new(slog::o!(
                "unit" => "virtual_switch",
                "tenant" => tenant,
                "dpid" => name.clone(),
            )),
            tenant,
            dpid,
            name,
            state: State::Init,
            kind,
            ports: BTreeMap::new(),
            port_counter: BitSetIndex::new(
                IndexType::PortId,
                IndexType::PortId.capacity(0, Default::default()),
            ),
            miss_send_len: OFP_DEFAULT_MISS_SEND_LEN,
            config_flags: 0,
            backoff: -1,
            buffers: BufferMap::default(),
            flow_table: FlowTable::new(log, tenant),
            connected: false,
            physical,
        }
    }

    pub fn vswitch_ref(&self) -> VSwitchRef {
        VSwitchRef::new(self.tenant, self.dpid)
    }

    pub fn physical_dpids(&self) -> &[Dpid] {
        &self.physical
    }

    pub fn drop_physical(&mut self, dpid: Dpid) {
        self.physical.retain(|d| *d != dpid);
    }

    pub fn is_big(&self) -> bool {
        matches!(self.kind, SwitchKind::Big(_))
    }

    pub fn big(&self) -> Option<&BigSwitch> {
        match &self.kind {
            SwitchKind::Big(b) => Some(b),
            SwitchKind::Single => None,
        }
    }

    pub fn big_mut(&mut self) -> Option<&mut BigSwitch> {
        match &mut self.kind {
            SwitchKind::Big(b) => Some(b),
            SwitchKind::Single => None,
        }
    }

    pub fn transition(&mut self, t: Transition) -> bool {
        let name = format!("virtual switch {}", self.name);
        self.state.apply(&self.log, &name, t)
    }

    pub fn next_port_number(&mut self) -> OvxResult<PortNo> {
        Ok(self.port_counter.get_new_index()? as PortNo)
    }

    pub fn add_port(&mut self, port: OvxPort) {
        self.ports.insert(port.port_no, port);
    }

    pub fn remove_port(&mut self, port: PortNo) -> Option<OvxPort> {
        let p = self.ports.remove(&port)?;
        self.port_counter.release_index(port as u32);
        Some(p)
    }

    pub fn get_port(&self, port: PortNo) -> OvxResult<&OvxPort> {
        self.ports
            .get(&port)
            .ok_or(OvxError::InvalidPort(PortRef::new(self.dpid, port)))
    }

    pub fn get_port_mut(&mut self, port: PortNo) -> OvxResult<&mut OvxPort> {
        self.ports
            .get_mut(&port)
            .ok_or(OvxError::InvalidPort(PortRef::new(self.dpid, port)))
    }

    /// The virtual port bound to a physical port.
    pub fn port_for(&self, phys: PortRef) -> Option<&OvxPort> {
        self.ports.values().find(|p| p.phys == phys)
    }

    /// Bring the switch up, along with every port whose physical port is
    /// enabled according to `enabled`.
    pub fn boot(&mut self, enabled: impl Fn(PortRef) -> bool) -> bool {
        if !self.transition(Transition::Boot) {
            return false;
        }
        for port in self.ports.values_mut() {
            if enabled(port.phys) {
                port.boot();
            }
        }
        true
    }

    pub fn tear_down(&mut self) -> bool {
        if !self.transition(Transition::TearDown) {
            return false;
        }
        for port in self.ports.values_mut() {
            port.tear_down();
        }
        self.connected = false;
        true
    }

    /// Returns the new value.  Retries start from 0.
    pub fn increment_backoff(&mut self) -> i32 {
        self.backoff = self.backoff.saturating_add(1);
        self.backoff
    }

    pub fn reset_backoff(&mut self) {
        self.backoff = -1;
    }

    pub fn add_to_buffer_map(&mut self, dpid: Dpid, pi: PacketIn) -> u32 {
        self.buffers.add(dpid, pi)
    }

    pub fn get_from_buffer_map(&mut self, id: u32) -> Option<Buffered> {
        self.buffers.get(id).cloned()
    }

    pub fn features_reply(&self) -> FeaturesReply {
        let mut ports: Vec<PhyPort> =
            self.ports.values().map(|p| p.desc.clone()).collect();
        ports.push(PhyPort::new(
            OFPP_LOCAL,
            MacAddr::from_slice(&[0xa4, 0x23, 0x05, 0, 0, 0]),
            "OVX Local Port",
        ));
        debug!(self.log, "features reply"; "ports" => ports.len());
        FeaturesReply {
            datapath_id: self.dpid,
            n_buffers: BUFFER_CAPACITY as u32,
            n_tables: 1,
            capabilities: OFPC_FLOW_STATS
                | OFPC_TABLE_STATS
                | OFPC_PORT_STATS
                | OFPC_ARP_MATCH_IP,
            actions: OFP_ALL_ACTIONS,
            ports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;

    const VDPID: Dpid = 0xa42305_0000_0001;

    fn switch() -> OvxSwitch {
        let mut sw =
            OvxSwitch::new(&test_log(), 1, VDPID, vec![1], SwitchKind::Single);
        for phys in [1, 2] {
            let no = sw.next_port_number().unwrap();
            sw.add_port(OvxPort::new(
                1,
                VDPID,
                no,
                PortRef::new(1, phys),
                MacAddr::ZERO,
            ));
        }
        sw
    }

    #[test]
    fn test_features_reply() {
        let sw = switch();
        let f = sw.features_reply();
        assert_eq!(f.datapath_id, VDPID);
        assert_eq!(f.n_buffers, 4096);
        assert_eq!(f.n_tables, 1);
        assert_eq!(f.ports.len(), 3);
        let local = f.ports.last().unwrap();
        assert_eq!(local.port_no, OFPP_LOCAL);
        assert_eq!(local.name, "OVX Local Port");
    }

    #[test]
    fn test_backoff() {
        let mut sw = switch();
        assert_eq!(sw.increment_backoff(), 0);
        assert_eq!(sw.increment_backoff(), 1);
        sw.reset_backoff();
        assert_eq!(sw.increment_backoff(), 0);
    }

    #[test]
    fn test_boot_requires_registration() {
        let mut sw = switch();
        assert!(!sw.boot(|_| true));
        assert_eq!(sw.state, State::Init);
        assert!(sw.transition(Transition::Register));
        assert!(sw.boot(|p| p.port == 1));
        assert!(sw.get_port(1).unwrap().active);
        assert!(!sw.get_port(2).unwrap().active);
        assert!(sw.tear_down());
        assert!(!sw.get_port(1).unwrap().active);
    }

    #[test]
    fn test_port_numbers_are_reused() {
        let mut sw = switch();
        assert!(sw.remove_port(1).is_some());
        assert_eq!(sw.next_port_number().unwrap(), 1);
        assert_eq!(sw.next_port_number().unwrap(), 3);
    }

    #[test]
    fn test_big_switch_routes() {
        let mut big = BigSwitch::new(RoutingAlgorithm::Spf, 1);
        let id = big.next_route_id().unwrap();
        big.add_route(SwitchRoute::new(id, 1, VDPID, 1, 2));
        let id = big.next_route_id().unwrap();
        big.add_route(SwitchRoute::new(id, 1, VDPID, 2, 1));
        big.add_route(SwitchRoute::new(9, 1, VDPID, 3, 4));
        assert_eq!(big.get_route(2, 1).unwrap().route_id, 2);
        assert!(big.route_by_id(9).is_some());
        assert_eq!(big.remove_routes_for(1).len(), 2);
        assert_eq!(big.routes().count(), 1);
        assert_eq!(big.next_route_id().unwrap(), 1);
    }
}
