// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A tenant's virtual network: its switches, ports, links and hosts, and
//! the bookkeeping binding them to the physical network.
//!
//! Methods take the hypervisor context for access to the physical network,
//! the mapping store and the channels.  The caller holds this network's
//! lock; the methods take the physical network and mapping store locks as
//! they need them, in that order, and never hold them across a send.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use openflow::port::OFPP_ALL;
use openflow::port::OFPP_FLOOD;
use openflow::FlowMod;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PacketIn;
use openflow::PacketOut;
use openflow::PortReason;
use openflow::OFPR_NO_MATCH;
use openflow::OFP_NO_BUFFER;
use slog::debug;
use slog::info;
use slog::warn;

use common::network::MacAddr;

use crate::actions::ActionVirtualizer;
use crate::address;
use crate::flowmgr::FlowManager;
use crate::index::BitSetIndex;
use crate::index::IndexType;
use crate::link::OvxLink;
use crate::linkfield::LinkField;
use crate::linkmgr::LinkManager;
use crate::pathset::Path;
use crate::persist::Record;
use crate::port::OvxPort;
use crate::route::SwitchRoute;
use crate::routing;
use crate::routing::RoutingAlgorithm;
use crate::state::State;
use crate::state::Transition;
use crate::switch::BigSwitch;
use crate::switch::OvxSwitch;
use crate::switch::SwitchKind;
use crate::topology::Network;
use crate::topology::Node;
use crate::types::*;
use crate::Hypervisor;

/// A host attached to an edge port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Host {
    pub id: u32,
    pub mac: MacAddr,
    pub port: PortRef,
}

pub struct OvxNetwork {
    log: slog::Logger,
    pub tenant: TenantId,
    pub controllers: Vec<String>,
    pub network: Ipv4Addr,
    pub mask: u8,
    pub state: State,
    pub topo: Network<OvxSwitch, OvxLink>,
    tenant_bits: u32,
    dpid_counter: BitSetIndex,
    link_counter: BitSetIndex,
    ip_counter: BitSetIndex,
    host_counter: BitSetIndex,
    pub hosts: BTreeMap<u32, Host>,
    pub flows: FlowManager,
    pub link_mgr: LinkManager,
    alive: Arc<AtomicBool>,
}

fn port_status(port: &OvxPort, reason: PortReason) -> OfMessage {
    OfMessage::new(0, OfBody::PortStatus(port.status(reason)))
}

// A path must start and end at the given physical ports, and each hop must
// leave from the switch the previous one arrived at.
fn validate_path(path: &[LinkKey], src: PortRef, dst: PortRef) -> OvxResult<()> {
    let (Some(first), Some(last)) = (path.first(), path.last()) else {
        return Err(OvxError::InvalidLink("empty path".to_string()));
    };
    if first.src != src || last.dst != dst {
        return Err(OvxError::InvalidLink(format!(
            "path runs {}->{}, wanted {src}->{dst}",
            first.src, last.dst
        )));
    }
    if let Some(gap) = path.windows(2).find(|h| h[0].dst.dpid != h[1].src.dpid) {
        return Err(OvxError::InvalidLink(format!(
            "path breaks between {} and {}",
            gap[0], gap[1]
        )));
    }
    Ok(())
}

impl OvxNetwork {
    pub fn new(
        log: &slog::Logger,
        tenant: TenantId,
        controllers: Vec<String>,
        network: Ipv4Addr,
        mask: u8,
        tenant_bits: u32,
        link_field: LinkField,
    ) -> Self {
        let log = log.new(slog::o!("unit" => "virtual_network", "tenant" => tenant));
        let cap = |t: IndexType| t.capacity(tenant_bits, link_field);
        let mut net = OvxNetwork {
            tenant,
            controllers,
            network,
            mask,
            state: State::Init,
            topo: Network::new(),
            tenant_bits,
            dpid_counter: BitSetIndex::new(
                IndexType::SwitchId,
                cap(IndexType::SwitchId),
            ),
            link_counter: BitSetIndex::new(
                IndexType::LinkId,
                cap(IndexType::LinkId),
            ),
            ip_counter: BitSetIndex::new(IndexType::IpId, cap(IndexType::IpId)),
            host_counter: BitSetIndex::new(
                IndexType::HostId,
                cap(IndexType::HostId),
            ),
            hosts: BTreeMap::new(),
            flows: FlowManager::new(&log, tenant, cap(IndexType::FlowCounter)),
            link_mgr: LinkManager::new(&log, tenant, tenant_bits),
            alive: Arc::new(AtomicBool::new(false)),
            log,
        };
        net.transition(Transition::Register);
        net
    }

    pub fn transition(&mut self, t: Transition) -> bool {
        let name = format!("virtual network {}", self.tenant);
        self.state.apply(&self.log, &name, t)
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Cleared when the network stops, ending its background tasks.
    pub fn alive(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    pub fn record(&self) -> Record {
        Record::Network {
            tenant: self.tenant,
            controllers: self.controllers.clone(),
            network: self.network,
            mask: self.mask,
        }
    }

    pub fn next_ip(&mut self) -> OvxResult<Ipv4Addr> {
        address::next_ip(self.tenant, self.tenant_bits, &mut self.ip_counter)
    }

    pub fn get_switch(&self, vdpid: Dpid) -> OvxResult<&OvxSwitch> {
        self.topo.get_switch(vdpid)
    }

    fn get_vport(&self, vport: PortRef) -> OvxResult<&OvxPort> {
        self.topo.get_switch(vport.dpid)?.get_port(vport.port)
    }

    fn get_vport_mut(&mut self, vport: PortRef) -> OvxResult<&mut OvxPort> {
        self.topo.get_switch_mut(vport.dpid)?.get_port_mut(vport.port)
    }

    /// An action virtualizer for switch `vdpid`.
    pub fn virtualizer<'a>(
        &'a mut self,
        hv: &'a Hypervisor,
        vdpid: Dpid,
    ) -> OvxResult<ActionVirtualizer<'a>> {
        let sw = self.topo.get_switch(vdpid)?;
        Ok(ActionVirtualizer {
            log: &self.log,
            tenant: self.tenant,
            topo: &self.topo,
            sw,
            flows: &mut self.flows,
            ips: hv.ip_mapper(self.tenant, &mut self.ip_counter),
            codec: &hv.link_fields,
        })
    }

    /// Both directions of a virtual link.
    pub fn get_links_by_id(&self, link_id: u32) -> Vec<&OvxLink> {
        self.topo
            .links
            .values()
            .filter(|l| l.link_id == link_id)
            .collect()
    }

    /// Bring a virtual port up or down, telling the controller if its
    /// switch is up and the port changed.
    pub fn set_port_active(&mut self, hv: &Hypervisor, vport: PortRef, up: bool) {
        let Ok(sw) = self.topo.get_switch_mut(vport.dpid) else {
            return;
        };
        let switch_up = sw.state.is_active();
        let Ok(port) = sw.get_port_mut(vport.port) else {
            return;
        };
        let changed = if up { port.boot() } else { port.tear_down() };
        if changed && switch_up {
            let msg = port_status(port, PortReason::Modify);
            hv.send_north(VSwitchRef::new(self.tenant, vport.dpid), msg);
        }
    }

    // Switches

    /// Create a virtual switch over one physical switch, or a big switch
    /// over several.  Returns the virtual dpid.
    pub fn create_switch(
        &mut self,
        hv: &Hypervisor,
        dpids: &[Dpid],
        alg: RoutingAlgorithm,
        backups: u8,
    ) -> OvxResult<Dpid> {
        if dpids.is_empty() {
            return Err(OvxError::SwitchMapping(
                "a virtual switch needs a physical switch".to_string(),
            ));
        }
        {
            let physical = hv.physical.lock();
            let map = hv.map.lock();
            for dpid in dpids {
                if !physical.topo.switches.contains_key(dpid) {
                    return Err(OvxError::InvalidDpid(*dpid));
                }
                if map.has_virtual_switch(*dpid, self.tenant) {
                    return Err(OvxError::SwitchMapping(format!(
                        "{dpid:016x} already belongs to a virtual switch of \
                         tenant {}",
                        self.tenant
                    )));
                }
            }
        }

        let id = self.dpid_counter.get_new_index()?;
        let vdpid = (common::OVX_OUI as u64) << 32 | id as u64;
        let kind = match dpids.len() {
            1 => SwitchKind::Single,
            _ => SwitchKind::Big(BigSwitch::new(alg, backups)),
        };
        let mut sw =
            OvxSwitch::new(&self.log, self.tenant, vdpid, dpids.to_vec(), kind);
        sw.transition(Transition::Register);
        let vref = sw.vswitch_ref();
        hv.map.lock().add_switches(dpids, vref);
        info!(self.log, "created virtual switch";
            "dpid" => format!("{vdpid:016x}"),
            "physical" => format!("{dpids:x?}"),
        );

        let boot = self.is_active();
        if boot {
            let physical = hv.physical.lock();
            sw.boot(|p| physical.is_port_enabled(p));
        }
        self.topo.add_switch(sw);
        hv.persistence.save(&Record::Switch {
            tenant: self.tenant,
            dpid: vdpid,
            physical: dpids.to_vec(),
            alg,
            backups,
        });
        if boot {
            hv.request_connect(vref);
        }
        Ok(vdpid)
    }

    /// Bind a new virtual port to a physical port.  Returns the virtual
    /// port.
    pub fn create_port(
        &mut self,
        hv: &Hypervisor,
        pdpid: Dpid,
        pport: PortNo,
    ) -> OvxResult<PortRef> {
        let phys = PortRef::new(pdpid, pport);
        let vdpid = hv.map.lock().get_virtual_switch(pdpid, self.tenant)?;

        let mut physical = hv.physical.lock();
        let ppt = physical.get_port_mut(phys)?;
        if let Some(existing) = ppt.get_ovx_port(self.tenant, 0) {
            return Err(OvxError::PortMapping(format!(
                "{phys} is already bound to {existing}"
            )));
        }
        let hw_addr = ppt.desc.hw_addr;
        let enabled = ppt.is_enabled();

        let sw = self.topo.get_switch_mut(vdpid)?;
        let port_no = sw.next_port_number()?;
        let mut port = OvxPort::new(self.tenant, vdpid, port_no, phys, hw_addr);
        ppt.set_ovx_port(self.tenant, 0, port.port_ref());
        drop(physical);

        let announce = sw.state.is_active();
        if announce && enabled {
            port.boot();
        }
        let status = port_status(&port, PortReason::Add);
        let vport = port.port_ref();
        sw.add_port(port);
        let spf = sw.big().is_some_and(|b| b.alg == RoutingAlgorithm::Spf);
        info!(self.log, "created virtual port"; "port" => %vport, "physical" => %phys);

        if announce {
            hv.send_north(VSwitchRef::new(self.tenant, vdpid), status);
        }
        hv.send_flow_mods(self.link_mgr.register_port(phys));
        if spf {
            self.ensure_spf_routes(hv, vdpid)?;
        }
        hv.persistence.save(&Record::Port {
            tenant: self.tenant,
            dpid: vdpid,
            port: port_no,
            physical: phys,
        });
        Ok(vport)
    }

    /// Attach a host to an edge port.  Returns the host id.
    pub fn create_host(
        &mut self,
        hv: &Hypervisor,
        vport: PortRef,
        mac: MacAddr,
    ) -> OvxResult<u32> {
        let port = self.get_vport(vport)?;
        if port.is_link() {
            return Err(OvxError::InvalidHost(format!(
                "{vport} is the endpoint of a virtual link"
            )));
        }
        hv.map.lock().add_mac(mac, self.tenant)?;
        let id = match self.host_counter.get_new_index() {
            Ok(id) => id,
            Err(e) => {
                hv.map.lock().remove_mac(mac);
                return Err(e);
            }
        };
        if let Ok(sw) = self.topo.get_switch_mut(vport.dpid) {
            sw.set_port_edge(vport.port, true);
        }
        info!(self.log, "created host"; "host" => id, "mac" => %mac, "port" => %vport);
        self.hosts.insert(id, Host { id, mac, port: vport });
        hv.persistence.save(&Record::Host {
            tenant: self.tenant,
            host_id: id,
            mac,
            port: vport,
        });
        Ok(id)
    }

    // Links

    /// Create a virtual link whose paths are computed by `alg`.  Returns
    /// the link id.
    pub fn create_link(
        &mut self,
        hv: &Hypervisor,
        vsrc: PortRef,
        vdst: PortRef,
        alg: RoutingAlgorithm,
        backups: u8,
    ) -> OvxResult<u32> {
        if alg == RoutingAlgorithm::Manual {
            return Err(OvxError::InvalidLink(
                "manual links need an explicit path".to_string(),
            ));
        }
        let src = self.get_vport(vsrc)?.phys;
        let dst = self.get_vport(vdst)?.phys;
        let found = {
            let physical = hv.physical.lock();
            routing::port_paths(
                &physical.active_links(),
                src,
                dst,
                1 + backups as usize,
            )
        };
        if found.is_empty() {
            return Err(OvxError::InvalidLink(format!(
                "no physical path from {src} to {dst}"
            )));
        }
        let n = found.len();
        let paths = found
            .into_iter()
            .enumerate()
            .map(|(i, p)| (p, routing::priority_of(i, n)))
            .collect();
        self.install_link(hv, vsrc, vdst, alg, backups, paths)
    }

    /// Create a virtual link over an explicit physical path, or offer
    /// another path to an existing link between the same ports.
    pub fn create_link_with_path(
        &mut self,
        hv: &Hypervisor,
        vsrc: PortRef,
        vdst: PortRef,
        path: Path,
        priority: u8,
    ) -> OvxResult<u32> {
        let src = self.get_vport(vsrc)?.phys;
        let dst = self.get_vport(vdst)?.phys;
        validate_path(&path, src, dst)?;
        {
            let physical = hv.physical.lock();
            if let Some(missing) =
                path.iter().find(|k| !physical.topo.links.contains_key(k))
            {
                return Err(OvxError::InvalidLink(format!(
                    "no physical link {missing}"
                )));
            }
        }

        let fwd = LinkKey::new(vsrc, vdst);
        let Some(link_id) = self.topo.links.get(&fwd).map(|l| l.link_id) else {
            return self.install_link(
                hv,
                vsrc,
                vdst,
                RoutingAlgorithm::Manual,
                0,
                vec![(path, priority)],
            );
        };

        for (key, p) in [(fwd, path.clone()), (fwd.reversed(), reverse_path(&path))] {
            let better = match self.topo.links.get_mut(&key) {
                Some(link) => link.paths.register(p, priority),
                None => None,
            };
            if let Some((p, prio)) = better {
                self.switch_link_path(hv, key, p, prio);
            }
        }
        Ok(link_id)
    }

    fn install_link(
        &mut self,
        hv: &Hypervisor,
        vsrc: PortRef,
        vdst: PortRef,
        alg: RoutingAlgorithm,
        backups: u8,
        paths: Vec<(Path, u8)>,
    ) -> OvxResult<u32> {
        for end in [vsrc, vdst] {
            let port = self.get_vport(end)?;
            if port.is_link() {
                return Err(OvxError::InvalidLink(format!(
                    "{end} is already the endpoint of a virtual link"
                )));
            }
            if self.hosts.values().any(|h| h.port == end) {
                return Err(OvxError::InvalidLink(format!(
                    "{end} has a host attached"
                )));
            }
        }
        let link_id = self.link_counter.get_new_index()?;
        let fwd_key = LinkKey::new(vsrc, vdst);
        let mut fwd = OvxLink::new(link_id, self.tenant, fwd_key, alg, backups);
        let mut rev =
            OvxLink::new(link_id, self.tenant, fwd_key.reversed(), alg, backups);
        for (path, prio) in &paths {
            if let Some((p, pr)) = fwd.paths.register(path.clone(), *prio) {
                fwd.paths.set_primary(p, pr);
            }
            if let Some((p, pr)) = rev.paths.register(reverse_path(path), *prio)
            {
                rev.paths.set_primary(p, pr);
            }
        }
        fwd.transition(&self.log, Transition::Register);
        rev.transition(&self.log, Transition::Register);

        let mut phys_ends = Vec::new();
        for end in [vsrc, vdst] {
            let port = self.get_vport_mut(end)?;
            port.link_id = Some(link_id);
            phys_ends.push((port.phys, end));
        }
        {
            let mut physical = hv.physical.lock();
            for (phys, end) in &phys_ends {
                if let Ok(ppt) = physical.get_port_mut(*phys) {
                    ppt.remove_ovx_port(self.tenant, 0);
                    ppt.set_ovx_port(self.tenant, link_id, *end);
                }
            }
        }
        {
            let mut map = hv.map.lock();
            map.add_links(fwd.paths.path(), fwd.vlink_key());
            map.add_links(rev.paths.path(), rev.vlink_key());
        }
        let mut keepalives =
            self.link_mgr.register_link(fwd.key, fwd.paths.path());
        keepalives.extend(self.link_mgr.register_link(rev.key, rev.paths.path()));

        if self.is_active() {
            fwd.transition(&self.log, Transition::Boot);
            rev.transition(&self.log, Transition::Boot);
        }
        info!(self.log, "created virtual link";
            "link" => link_id, "ends" => %fwd_key, "paths" => paths.len());
        hv.persistence.save(&Record::Link {
            tenant: self.tenant,
            link_id,
            src: vsrc,
            dst: vdst,
            alg,
            paths: paths.clone(),
        });
        self.topo.add_link(fwd);
        self.topo.add_link(rev);
        hv.send_flow_mods(keepalives);
        Ok(link_id)
    }

    // Big switch routes

    /// Add a route over an explicit path between two ports of a big switch.
    /// The reverse direction follows the reversed path.  Returns the id of
    /// the forward route.
    pub fn create_route(
        &mut self,
        hv: &Hypervisor,
        vdpid: Dpid,
        ingress: PortNo,
        egress: PortNo,
        path: Path,
        priority: u8,
    ) -> OvxResult<u32> {
        let sw = self.topo.get_switch(vdpid)?;
        if !sw.is_big() {
            return Err(OvxError::SwitchMapping(format!(
                "{vdpid:016x} is not a big switch"
            )));
        }
        let src = sw.get_port(ingress)?.phys;
        let dst = sw.get_port(egress)?.phys;
        let (Some(first), Some(last)) = (path.first(), path.last()) else {
            return Err(OvxError::InvalidLink("empty route".to_string()));
        };
        if first.src.dpid != src.dpid || last.dst.dpid != dst.dpid {
            return Err(OvxError::InvalidLink(format!(
                "route runs {:016x}->{:016x}, wanted {:016x}->{:016x}",
                first.src.dpid, last.dst.dpid, src.dpid, dst.dpid
            )));
        }
        validate_path(&path, first.src, last.dst)?;
        let inside = sw.physical_dpids();
        if let Some(outside) = path
            .iter()
            .find(|k| !inside.contains(&k.src.dpid) || !inside.contains(&k.dst.dpid))
        {
            return Err(OvxError::InvalidLink(format!(
                "{outside} leaves the big switch"
            )));
        }
        self.install_route(hv, vdpid, ingress, egress, vec![(path, priority)])
    }

    // Compute routes between every pair of ports of an SPF big switch that
    // sit on different physical switches and have none yet.
    fn ensure_spf_routes(&mut self, hv: &Hypervisor, vdpid: Dpid) -> OvxResult<()> {
        let sw = self.topo.get_switch(vdpid)?;
        let Some(big) = sw.big() else {
            return Ok(());
        };
        let count = 1 + big.backups as usize;
        let inside = sw.physical_dpids().to_vec();
        let links = {
            let physical = hv.physical.lock();
            let mut links = physical.active_links();
            links.retain(|k| inside.contains(&k.src.dpid) && inside.contains(&k.dst.dpid));
            links
        };

        let ports: Vec<(PortNo, Dpid)> =
            sw.ports.values().map(|p| (p.port_no, p.phys.dpid)).collect();
        let mut wanted = Vec::new();
        for (i, (a, a_dpid)) in ports.iter().enumerate() {
            for (b, b_dpid) in &ports[i + 1..] {
                if a_dpid == b_dpid || big.get_route(*a, *b).is_some() {
                    continue;
                }
                let found = routing::switch_paths(&links, *a_dpid, *b_dpid, count);
                if found.is_empty() {
                    warn!(self.log, "no route inside big switch";
                        "dpid" => format!("{vdpid:016x}"),
                        "ingress" => a, "egress" => b);
                    continue;
                }
                let n = found.len();
                let paths: Vec<(Path, u8)> = found
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| (p, routing::priority_of(i, n)))
                    .collect();
                wanted.push((*a, *b, paths));
            }
        }
        for (a, b, paths) in wanted {
            self.install_route(hv, vdpid, a, b, paths)?;
        }
        Ok(())
    }

    fn install_route(
        &mut self,
        hv: &Hypervisor,
        vdpid: Dpid,
        ingress: PortNo,
        egress: PortNo,
        paths: Vec<(Path, u8)>,
    ) -> OvxResult<u32> {
        let reversed: Vec<(Path, u8)> =
            paths.iter().map(|(p, pr)| (reverse_path(p), *pr)).collect();
        let mut forward_id = 0;
        for (from, to, dir_paths) in
            [(ingress, egress, &paths), (egress, ingress, &reversed)]
        {
            let (route_id, switch_to) =
                self.register_route_paths(hv, vdpid, from, to, dir_paths)?;
            if let Some((path, prio)) = switch_to {
                self.switch_route_path(hv, vdpid, route_id, path, prio);
            }
            if from == ingress {
                forward_id = route_id;
            }
        }
        Ok(forward_id)
    }

    // Offer paths to one direction of a route, creating the route if
    // needed.  Returns the route id and any path it should switch to.
    fn register_route_paths(
        &mut self,
        hv: &Hypervisor,
        vdpid: Dpid,
        from: PortNo,
        to: PortNo,
        paths: &[(Path, u8)],
    ) -> OvxResult<(u32, Option<(Path, u8)>)> {
        let tenant = self.tenant;
        let active = self.is_active();
        let sw = self.topo.get_switch_mut(vdpid)?;
        let switch_up = sw.state.is_active();
        let big = sw.big_mut().ok_or_else(|| {
            OvxError::SwitchMapping(format!("{vdpid:016x} is not a big switch"))
        })?;

        if let Some(route) = big.get_route_mut(from, to) {
            let mut switch_to = None;
            for (path, prio) in paths {
                if let Some(better) = route.paths.register(path.clone(), *prio) {
                    switch_to = Some(better);
                }
            }
            return Ok((route.route_id, switch_to));
        }

        let route_id = big.next_route_id()?;
        let mut route = SwitchRoute::new(route_id, tenant, vdpid, from, to);
        for (path, prio) in paths {
            if let Some((p, pr)) = route.paths.register(path.clone(), *prio) {
                route.paths.set_primary(p, pr);
            }
        }
        route.transition(&self.log, Transition::Register);
        if active && switch_up {
            route.transition(&self.log, Transition::Boot);
        }
        let key = route.route_key();
        let primary = route.paths.path().to_vec();
        let priority = route.paths.priority();
        big.add_route(route);

        hv.map.lock().add_route(key, &primary);
        hv.send_flow_mods(self.link_mgr.register_route(key, &primary));
        debug!(self.log, "created route";
            "dpid" => format!("{vdpid:016x}"),
            "route" => route_id, "ingress" => from, "egress" => to);
        hv.persistence.save(&Record::Route {
            tenant,
            dpid: vdpid,
            route_id,
            ingress: from,
            egress: to,
            path: primary,
            priority,
        });
        Ok((route_id, None))
    }

    // Lifecycle

    /// Bring the network up.  Flow ids for every host pair are allocated
    /// first.  If that fails, or any switch fails to boot, the network
    /// stays down.
    pub fn boot(&mut self, hv: &Hypervisor) -> bool {
        let macs: Vec<MacAddr> = self.hosts.values().map(|h| h.mac).collect();
        if let Err(e) = self.flows.boot(&macs) {
            warn!(self.log, "unable to allocate flow ids"; "error" => %e);
            return false;
        }
        if !self.transition(Transition::Boot) {
            return false;
        }

        let mut booted = Vec::new();
        let mut failed = Vec::new();
        {
            let physical = hv.physical.lock();
            for sw in self.topo.switches.values_mut() {
                if sw.boot(|p| physical.is_port_enabled(p)) {
                    booted.push(sw.dpid);
                } else {
                    failed.push(sw.dpid);
                }
            }
        }
        if !failed.is_empty() {
            warn!(self.log, "virtual switches failed to boot";
                "dpids" => format!("{failed:016x?}"));
            for dpid in booted {
                if let Some(sw) = self.topo.switches.get_mut(&dpid) {
                    sw.tear_down();
                }
            }
            self.transition(Transition::TearDown);
            return false;
        }

        for sw in self.topo.switches.values_mut() {
            if let Some(big) = sw.big_mut() {
                let ids: Vec<u32> = big.routes().map(|r| r.route_id).collect();
                for id in ids {
                    if let Some(r) = big.route_by_id_mut(id) {
                        r.transition(&self.log, Transition::Boot);
                    }
                }
            }
        }
        for link in self.topo.links.values_mut() {
            link.transition(&self.log, Transition::Boot);
        }
        // A fresh flag, so tasks from an earlier boot stay stopped.
        self.alive = Arc::new(AtomicBool::new(true));
        info!(self.log, "booted virtual network";
            "switches" => self.topo.switches.len(),
            "links" => self.topo.links.len() / 2,
            "hosts" => self.hosts.len(),
        );
        for sw in self.topo.switches.values() {
            hv.request_connect(sw.vswitch_ref());
        }
        true
    }

    /// Take the network down, closing its controller channels.
    pub fn stop(&mut self, hv: &Hypervisor) -> bool {
        if !self.transition(Transition::TearDown) {
            return false;
        }
        self.alive.store(false, Ordering::SeqCst);
        for link in self.topo.links.values_mut() {
            link.transition(&self.log, Transition::TearDown);
        }
        for sw in self.topo.switches.values_mut() {
            if let Some(big) = sw.big_mut() {
                let ids: Vec<u32> = big.routes().map(|r| r.route_id).collect();
                for id in ids {
                    if let Some(r) = big.route_by_id_mut(id) {
                        r.transition(&self.log, Transition::TearDown);
                    }
                }
            }
            sw.tear_down();
            hv.channels.remove_controller(sw.vswitch_ref());
        }
        info!(self.log, "stopped virtual network");
        true
    }

    /// Remove every element of the network and release its addresses.  The
    /// network must be down.
    pub fn unregister(&mut self, hv: &Hypervisor) -> bool {
        if self.is_active() {
            self.stop(hv);
        }
        let dpids: Vec<Dpid> = self.topo.switches.keys().copied().collect();
        for vdpid in dpids {
            if let Err(e) = self.remove_switch(hv, vdpid) {
                warn!(self.log, "failed to remove switch";
                    "dpid" => format!("{vdpid:016x}"), "error" => %e);
            }
        }
        {
            let mut map = hv.map.lock();
            map.remove_virtual_ips(self.tenant);
            for host in self.hosts.values() {
                map.remove_mac(host.mac);
            }
        }
        self.hosts.clear();
        self.link_mgr.clear();
        self.ip_counter.reset();
        self.transition(Transition::Unregister)
    }

    // Removal

    pub fn remove_link(&mut self, hv: &Hypervisor, link_id: u32) -> OvxResult<()> {
        let keys: Vec<LinkKey> = self
            .get_links_by_id(link_id)
            .iter()
            .map(|l| l.key)
            .collect();
        if keys.is_empty() {
            return Err(OvxError::InvalidLink(format!("no virtual link {link_id}")));
        }

        let mut deletes = Vec::new();
        for key in &keys {
            if let Some(mut link) = self.topo.remove_link(*key) {
                link.transition(&self.log, Transition::TearDown);
                link.transition(&self.log, Transition::Unregister);
                hv.map.lock().remove_virtual_link(link.vlink_key());
            }
            deletes.extend(self.link_mgr.unregister_link(*key));
        }

        let mut cleanups = Vec::new();
        for key in &keys {
            let Ok(port) = self.get_vport_mut(key.src) else {
                continue;
            };
            port.link_id = None;
            let phys = port.phys;
            let mut physical = hv.physical.lock();
            if let Ok(ppt) = physical.get_port_mut(phys) {
                ppt.remove_ovx_port(self.tenant, link_id);
                ppt.set_ovx_port(self.tenant, 0, key.src);
            }
            if let Ok(psw) = physical.topo.get_switch(phys.dpid) {
                cleanups.push((phys.dpid, psw.clean_up_tenant(self.tenant, phys.port)));
            }
        }
        self.link_counter.release_index(link_id);
        info!(self.log, "removed virtual link"; "link" => link_id);

        hv.send_flow_mods(deletes);
        for (dpid, msg) in cleanups {
            hv.send_south(dpid, msg);
        }
        if let Some(key) = keys.first() {
            hv.persistence.remove(&Record::Link {
                tenant: self.tenant,
                link_id,
                src: key.src,
                dst: key.dst,
                alg: RoutingAlgorithm::Manual,
                paths: Vec::new(),
            });
        }
        Ok(())
    }

    pub fn remove_host(&mut self, hv: &Hypervisor, host_id: u32) -> OvxResult<()> {
        let host = self
            .hosts
            .remove(&host_id)
            .ok_or_else(|| OvxError::InvalidHost(format!("no host {host_id}")))?;
        hv.map.lock().remove_mac(host.mac);
        self.host_counter.release_index(host_id);
        info!(self.log, "removed host"; "host" => host_id, "mac" => %host.mac);
        hv.persistence.remove(&Record::Host {
            tenant: self.tenant,
            host_id,
            mac: host.mac,
            port: host.port,
        });
        Ok(())
    }

    // Undo everything a port's physical binding set up.
    fn release_port(&mut self, hv: &Hypervisor, port: &OvxPort) {
        let mut cleanup = None;
        {
            let mut physical = hv.physical.lock();
            if let Ok(ppt) = physical.get_port_mut(port.phys) {
                ppt.remove_ovx_port(self.tenant, 0);
            }
            if let Ok(psw) = physical.topo.get_switch(port.phys.dpid) {
                cleanup = Some(psw.clean_up_tenant(self.tenant, port.phys.port));
            }
        }
        hv.send_flow_mods(self.link_mgr.unregister_port(port.phys));
        if let Some(msg) = cleanup {
            hv.send_south(port.phys.dpid, msg);
        }
    }

    // Remove the routes of a big switch entering or leaving `port`.
    fn remove_routes_for(&mut self, hv: &Hypervisor, vdpid: Dpid, port: PortNo) {
        let Ok(sw) = self.topo.get_switch_mut(vdpid) else {
            return;
        };
        let Some(big) = sw.big_mut() else {
            return;
        };
        let mut deletes = Vec::new();
        for mut route in big.remove_routes_for(port) {
            route.transition(&self.log, Transition::TearDown);
            route.transition(&self.log, Transition::Unregister);
            hv.map.lock().remove_route(route.route_key());
            deletes.extend(self.link_mgr.unregister_route(route.route_key()));
        }
        hv.send_flow_mods(deletes);
    }

    pub fn remove_port(
        &mut self,
        hv: &Hypervisor,
        vdpid: Dpid,
        port_no: PortNo,
    ) -> OvxResult<()> {
        let vport = PortRef::new(vdpid, port_no);
        if let Some(link_id) = self.get_vport(vport)?.link_id {
            self.remove_link(hv, link_id)?;
        }
        let hosts: Vec<u32> = self
            .hosts
            .values()
            .filter(|h| h.port == vport)
            .map(|h| h.id)
            .collect();
        for id in hosts {
            self.remove_host(hv, id)?;
        }
        self.remove_routes_for(hv, vdpid, port_no);

        let sw = self.topo.get_switch_mut(vdpid)?;
        let announce = sw.state.is_active();
        let port = sw
            .remove_port(port_no)
            .ok_or(OvxError::InvalidPort(vport))?;
        self.release_port(hv, &port);
        if announce {
            hv.send_north(
                VSwitchRef::new(self.tenant, vdpid),
                port_status(&port, PortReason::Delete),
            );
        }
        info!(self.log, "removed virtual port"; "port" => %vport);
        hv.persistence.remove(&Record::Port {
            tenant: self.tenant,
            dpid: vdpid,
            port: port_no,
            physical: port.phys,
        });
        Ok(())
    }

    pub fn remove_switch(&mut self, hv: &Hypervisor, vdpid: Dpid) -> OvxResult<()> {
        let sw = self.topo.get_switch(vdpid)?;
        let vref = sw.vswitch_ref();
        let physical_dpids = sw.physical_dpids().to_vec();

        let link_ids: Vec<u32> = self
            .topo
            .links
            .values()
            .filter(|l| l.key.src.dpid == vdpid)
            .map(|l| l.link_id)
            .collect();
        for link_id in link_ids {
            self.remove_link(hv, link_id)?;
        }
        let hosts: Vec<u32> = self
            .hosts
            .values()
            .filter(|h| h.port.dpid == vdpid)
            .map(|h| h.id)
            .collect();
        for id in hosts {
            self.remove_host(hv, id)?;
        }
        let ports: Vec<PortNo> = self.topo.get_switch(vdpid)?.ports.keys().copied().collect();
        for port in ports {
            self.remove_routes_for(hv, vdpid, port);
        }

        let Some(mut sw) = self.topo.remove_switch(vdpid) else {
            return Err(OvxError::InvalidDpid(vdpid));
        };
        let ports: Vec<OvxPort> = sw.ports.values().cloned().collect();
        for port in &ports {
            self.release_port(hv, port);
        }
        hv.map.lock().remove_virtual_switch(vref);
        hv.channels.remove_controller(vref);
        sw.tear_down();
        sw.transition(Transition::Unregister);
        self.dpid_counter.release_index(vdpid as u32);
        info!(self.log, "removed virtual switch"; "dpid" => sw.name.clone());
        hv.persistence.remove(&Record::Switch {
            tenant: self.tenant,
            dpid: vdpid,
            physical: physical_dpids,
            alg: RoutingAlgorithm::Manual,
            backups: 0,
        });
        Ok(())
    }

    /// A physical switch under a big switch has gone, but the big switch
    /// keeps running on the rest.
    pub fn drop_physical_switch(&mut self, hv: &Hypervisor, vdpid: Dpid, dpid: Dpid) {
        if let Ok(sw) = self.topo.get_switch_mut(vdpid) {
            sw.drop_physical(dpid);
        }
        hv.map.lock().remove_physical_switch(dpid);
    }

    // Discovery

    /// The controller sent a discovery probe.  Deliver it to the switch at
    /// the far end of every virtual link it was sent out of.
    pub fn handle_lldp(&self, hv: &Hypervisor, po: &PacketOut, vdpid: Dpid) {
        let Ok(sw) = self.topo.get_switch(vdpid) else {
            return;
        };
        let mut out_ports = Vec::new();
        for action in &po.actions {
            match action.out_port() {
                Some(OFPP_FLOOD) | Some(OFPP_ALL) => {
                    let skip_in = action.out_port() == Some(OFPP_FLOOD);
                    out_ports.extend(
                        sw.ports
                            .values()
                            .filter(|p| p.is_link())
                            .filter(|p| !(skip_in && p.port_no == po.in_port))
                            .map(|p| p.port_no),
                    );
                }
                Some(port) => out_ports.push(port),
                None => {}
            }
        }

        for port in out_ports {
            let src = PortRef::new(vdpid, port);
            let Some(dst) = self.topo.get_neighbor_port(src) else {
                continue;
            };
            let Ok(neighbor) = self.get_vport(dst) else {
                continue;
            };
            if !neighbor.active {
                continue;
            }
            let pi = PacketIn {
                buffer_id: OFP_NO_BUFFER,
                total_len: po.data.len() as u16,
                in_port: dst.port,
                reason: OFPR_NO_MATCH,
                data: po.data.clone(),
            };
            hv.send_north(
                VSwitchRef::new(self.tenant, dst.dpid),
                OfMessage::new(0, OfBody::PacketIn(pi)),
            );
        }
    }

    // Failure handling

    /// Move a virtual link to a new primary path, and re-install along it
    /// every flow that leaves through the link.
    pub fn switch_link_path(
        &mut self,
        hv: &Hypervisor,
        vkey: LinkKey,
        path: Path,
        priority: u8,
    ) {
        let Some(link) = self.topo.links.get_mut(&vkey) else {
            return;
        };
        link.paths.set_primary(path.clone(), priority);
        hv.map.lock().add_links(&path, link.vlink_key());
        hv.send_flow_mods(self.link_mgr.register_link(vkey, &path));
        info!(self.log, "switched link path";
            "link" => %vkey, "priority" => priority, "hops" => path.len());

        let Some(sw) = self.topo.switches.get_mut(&vkey.src.dpid) else {
            return;
        };
        let Some(link) = self.topo.links.get(&vkey) else {
            return;
        };
        let affected: Vec<FlowMod> = sw
            .flow_table
            .iter()
            .filter(|(_, fm)| {
                fm.actions.iter().any(|a| a.out_port() == Some(vkey.src.port))
            })
            .map(|(_, fm)| fm.clone())
            .collect();

        let mut ips = hv.ip_mapper(self.tenant, &mut self.ip_counter);
        let mut out = Vec::new();
        for mut fm in affected {
            fm.cookie = sw.flow_table.regenerate_cookie(&fm);
            let flow_id = match self.flows.get_flow_id(
                fm.ofmatch.dl_src().unwrap_or(MacAddr::ZERO),
                fm.ofmatch.dl_dst().unwrap_or(MacAddr::ZERO),
            ) {
                Ok(id) => id,
                Err(e) => {
                    warn!(self.log, "no flow id for re-installed flow";
                        "error" => %e);
                    continue;
                }
            };
            out.extend(link.generate_link_fms(&hv.link_fields, &mut ips, &fm, flow_id));
        }
        hv.send_flow_mods(out);
    }

    /// Move a big-switch route to a new primary path, and re-install along
    /// it every flow using the route.
    pub fn switch_route_path(
        &mut self,
        hv: &Hypervisor,
        vdpid: Dpid,
        route_id: u32,
        path: Path,
        priority: u8,
    ) {
        let Some(sw) = self.topo.switches.get_mut(&vdpid) else {
            return;
        };
        let OvxSwitch {
            kind,
            flow_table,
            ports,
            ..
        } = sw;
        let SwitchKind::Big(big) = kind else {
            return;
        };
        let Some(route) = big.route_by_id_mut(route_id) else {
            return;
        };
        route.paths.set_primary(path.clone(), priority);
        let key = route.route_key();
        hv.map.lock().add_route(key, &path);
        hv.send_flow_mods(self.link_mgr.register_route(key, &path));
        info!(self.log, "switched route path";
            "dpid" => format!("{vdpid:016x}"),
            "route" => route_id, "priority" => priority);

        let (Some(ingress), Some(egress)) =
            (ports.get(&route.ingress), ports.get(&route.egress))
        else {
            return;
        };
        let egress_link = self
            .topo
            .links
            .values()
            .find(|l| l.key.src == egress.port_ref());
        let affected: Vec<FlowMod> = flow_table
            .iter()
            .filter(|(_, fm)| {
                fm.ofmatch.in_port().map_or(true, |p| p == ingress.port_no)
                    && fm.actions.iter().any(|a| a.out_port() == Some(egress.port_no))
            })
            .map(|(_, fm)| fm.clone())
            .collect();

        let mut ips = hv.ip_mapper(self.tenant, &mut self.ip_counter);
        let mut out = Vec::new();
        for mut fm in affected {
            fm.cookie = flow_table.regenerate_cookie(&fm);
            let hops = route.generate_route_fms(
                &hv.link_fields,
                &mut self.flows,
                &mut ips,
                &fm,
                egress,
                egress_link,
            );
            let first = route.generate_first_fm(
                &self.log,
                &hv.link_fields,
                &mut self.flows,
                &mut ips,
                &fm,
                ingress,
            );
            match (hops, first) {
                (Ok(hops), Ok(first)) => {
                    out.extend(hops);
                    out.extend(first);
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(self.log, "unable to re-install flow on route";
                        "route" => route_id, "error" => %e);
                }
            }
        }
        hv.send_flow_mods(out);
    }

    /// A physical link crossed by this network has failed.  Each virtual
    /// link and route whose primary path used it moves to its best backup,
    /// or goes down if it has none.
    pub fn physical_link_down(&mut self, hv: &Hypervisor, failed: LinkKey) {
        let links: Vec<LinkKey> = self
            .topo
            .links
            .values()
            .filter(|l| l.state.is_active() && l.paths.path().contains(&failed))
            .map(|l| l.key)
            .collect();
        for vkey in links {
            let Some(link) = self.topo.links.get_mut(&vkey) else {
                continue;
            };
            match link.paths.try_recovery() {
                Some((path, prio)) => self.switch_link_path(hv, vkey, path, prio),
                None => {
                    warn!(self.log, "virtual link has no backup path";
                        "link" => %vkey, "failed" => %failed);
                    link.transition(&self.log, Transition::TearDown);
                    self.set_port_active(hv, vkey.src, false);
                }
            }
        }

        let mut routes = Vec::new();
        for sw in self.topo.switches.values_mut() {
            let vdpid = sw.dpid;
            let Some(big) = sw.big_mut() else {
                continue;
            };
            for route in big.routes() {
                if route.state.is_active() && route.paths.path().contains(&failed) {
                    routes.push((vdpid, route.route_id));
                }
            }
        }
        for (vdpid, route_id) in routes {
            let recovery = self
                .topo
                .switches
                .get_mut(&vdpid)
                .and_then(|sw| sw.big_mut())
                .and_then(|big| big.route_by_id_mut(route_id))
                .map(|route| {
                    let next = route.paths.try_recovery();
                    if next.is_none() {
                        warn!(self.log, "route has no backup path";
                            "route" => route_id, "failed" => %failed);
                        route.transition(&self.log, Transition::TearDown);
                    }
                    next
                });
            if let Some(Some((path, prio))) = recovery {
                self.switch_route_path(hv, vdpid, route_id, path, prio);
            }
        }
    }

    /// A physical link is back.  Paths set aside because of it return to
    /// service, and elements that went down for lack of a path come back.
    pub fn physical_link_up(&mut self, hv: &Hypervisor, recovered: LinkKey) {
        let active = self.is_active();
        let links: Vec<LinkKey> = self
            .topo
            .links
            .values()
            .filter(|l| l.paths.unusable().values().any(|p| p.contains(&recovered)))
            .map(|l| l.key)
            .collect();
        for vkey in links {
            let Some(link) = self.topo.links.get_mut(&vkey) else {
                continue;
            };
            let revert = link.paths.try_revert(&recovered);
            if !revert.reverted {
                continue;
            }
            let was_down = link.state == State::Inactive;
            let path = link.paths.path().to_vec();
            let vlink = link.vlink_key();
            if was_down && active {
                link.transition(&self.log, Transition::Boot);
            }
            match revert.switch_to {
                Some((path, prio)) => self.switch_link_path(hv, vkey, path, prio),
                None => {
                    hv.map.lock().add_links(&path, vlink);
                    hv.send_flow_mods(self.link_mgr.register_link(vkey, &path));
                }
            }
            if was_down && active {
                info!(self.log, "virtual link restored"; "link" => %vkey);
                self.set_port_active(hv, vkey.src, true);
            }
        }

        let mut routes = Vec::new();
        for sw in self.topo.switches.values() {
            let Some(big) = sw.big() else {
                continue;
            };
            for route in big.routes() {
                if route.paths.unusable().values().any(|p| p.contains(&recovered)) {
                    routes.push((sw.dpid, route.route_id));
                }
            }
        }
        for (vdpid, route_id) in routes {
            let Some(route) = self
                .topo
                .switches
                .get_mut(&vdpid)
                .and_then(|sw| sw.big_mut())
                .and_then(|big| big.route_by_id_mut(route_id))
            else {
                continue;
            };
            let revert = route.paths.try_revert(&recovered);
            if !revert.reverted {
                continue;
            }
            if route.state == State::Inactive && active {
                route.transition(&self.log, Transition::Boot);
            }
            let key = route.route_key();
            let path = route.paths.path().to_vec();
            match revert.switch_to {
                Some((path, prio)) => {
                    self.switch_route_path(hv, vdpid, route_id, path, prio)
                }
                None => {
                    hv.map.lock().add_route(key, &path);
                    hv.send_flow_mods(self.link_mgr.register_route(key, &path));
                }
            }
        }
    }
}
