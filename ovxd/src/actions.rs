// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Translation of a tenant's actions into physical ones.
//!
//! Output actions are the interesting case: an output to a virtual port may
//! become an output on the physical switch, the entry into a virtual link
//! (which also programs the switches along the link), a trip across a big
//! switch, or for packet-outs a delivery straight to the neighboring
//! virtual switch.

use openflow::port::OFPP_ALL;
use openflow::port::OFPP_CONTROLLER;
use openflow::port::OFPP_FLOOD;
use openflow::port::OFPP_IN_PORT;
use openflow::port::OFPP_LOCAL;
use openflow::port::OFPP_NONE;
use openflow::port::OFPP_NORMAL;
use openflow::port::OFPP_TABLE;
use openflow::Action;
use openflow::FlowMod;
use openflow::Match;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PacketIn;
use openflow::PacketOut;
use openflow::OFPBAC_BAD_TYPE;
use openflow::OFPBAC_EPERM;
use openflow::OFPR_NO_MATCH;
use openflow::OFP_NO_BUFFER;
use slog::debug;

use common::network::MacAddr;
use packet::eth::FrameSummary;

use crate::address::unrewrite_actions;
use crate::address::IpMapper;
use crate::flowmgr::FlowManager;
use crate::link::OvxLink;
use crate::linkfield::LinkFields;
use crate::port::OvxPort;
use crate::route::output_from;
use crate::switch::OvxSwitch;
use crate::topology::Network;
use crate::types::*;

fn denied(reason: String, code: u16) -> OvxError {
    OvxError::ActionVirtualizationDenied { reason, code }
}

/// An action left out of a translation.  The controller hears about it
/// with a bad-action error, while the remaining actions still apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Denial {
    pub reason: String,
    pub code: u16,
}

impl Denial {
    pub fn into_error(self) -> OvxError {
        denied(self.reason, self.code)
    }
}

/// A flow mod's actions, ready for the switch owning its in-port.
#[derive(Debug, Default)]
pub struct FlowActions {
    pub actions: Vec<Action>,
    /// Mods for the other switches the flow crosses.
    pub extra: Vec<(Dpid, FlowMod)>,
    /// The first action that was left out, if any.
    pub denied: Option<Denial>,
}

/// Everything a tenant's packet-out turns into.
#[derive(Debug, Default)]
pub struct PacketOutPlan {
    /// The switch owning the in-port, and its actions.  `None` when no
    /// output is local to it.
    pub local: Option<(Dpid, Vec<Action>)>,
    pub south: Vec<(Dpid, OfMessage)>,
    pub north: Vec<(VSwitchRef, OfMessage)>,
    pub denied: Option<Denial>,
}

pub struct ActionVirtualizer<'a> {
    pub log: &'a slog::Logger,
    pub tenant: TenantId,
    pub topo: &'a Network<OvxSwitch, OvxLink>,
    pub sw: &'a OvxSwitch,
    pub flows: &'a mut FlowManager,
    pub ips: IpMapper<'a>,
    pub codec: &'a LinkFields,
}

impl<'a> ActionVirtualizer<'a> {
    // The virtual ports an output to `port` reaches.  Only active ports
    // carry traffic.
    fn out_vports(&self, port: PortNo, in_port: Option<PortNo>) -> Vec<&'a OvxPort> {
        let sw: &'a OvxSwitch = self.sw;
        let active = sw.ports.values().filter(|p| p.active);
        match port {
            OFPP_FLOOD => active.filter(|p| Some(p.port_no) != in_port).collect(),
            OFPP_ALL => active.collect(),
            OFPP_IN_PORT => in_port
                .and_then(|p| sw.ports.get(&p))
                .filter(|p| p.active)
                .into_iter()
                .collect(),
            p => sw.ports.get(&p).filter(|p| p.active).into_iter().collect(),
        }
    }

    fn is_reserved(port: PortNo) -> bool {
        matches!(port, OFPP_CONTROLLER | OFPP_LOCAL | OFPP_NORMAL | OFPP_TABLE)
    }

    fn check_mac(&self, mac: MacAddr) -> OvxResult<()> {
        match self.ips.map.lock().get_mac(mac) {
            Ok(owner) if owner == self.tenant => Ok(()),
            _ => Err(denied(
                format!("{mac} does not belong to tenant {}", self.tenant),
                OFPBAC_EPERM,
            )),
        }
    }

    // Translate a non-output action.  A denied action is recorded in
    // `denial` and yields nothing; other errors abort the translation.
    fn keep_action(
        &mut self,
        action: &Action,
        denial: &mut Option<Denial>,
    ) -> OvxResult<Option<Action>> {
        match self.simple_action(action) {
            Ok(a) => Ok(Some(a)),
            Err(OvxError::ActionVirtualizationDenied { reason, code }) => {
                debug!(self.log, "action denied";
                    "tenant" => self.tenant, "reason" => &reason);
                denial.get_or_insert(Denial { reason, code });
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // Actions other than output, which are the same for flow mods and
    // packet-outs.
    fn simple_action(&mut self, action: &Action) -> OvxResult<Action> {
        match action {
            Action::SetDlSrc(mac) | Action::SetDlDst(mac) => {
                self.check_mac(*mac)?;
                Ok(action.clone())
            }
            Action::SetNwSrc(ip) => Ok(Action::SetNwSrc(self.ips.physical_ip(*ip))),
            Action::SetNwDst(ip) => Ok(Action::SetNwDst(self.ips.physical_ip(*ip))),
            Action::SetTpSrc(_)
            | Action::SetTpDst(_)
            | Action::SetNwTos(_)
            | Action::SetVlanVid(_)
            | Action::SetVlanPcp(_)
            | Action::StripVlan => Ok(action.clone()),
            Action::Vendor { vendor, .. } => Err(denied(
                format!("vendor action {vendor:#x} is not supported"),
                OFPBAC_BAD_TYPE,
            )),
            Action::Output { .. } | Action::Enqueue { .. } => {
                Err(OvxError::Other("output handled by caller".to_string()))
            }
        }
    }

    fn enqueue(
        &self,
        port: PortNo,
        queue_id: u32,
        in_port: Option<&OvxPort>,
    ) -> OvxResult<Action> {
        let target = match port {
            OFPP_IN_PORT => in_port.map(|p| p.port_no).unwrap_or(OFPP_NONE),
            p => p,
        };
        let out = self
            .sw
            .ports
            .get(&target)
            .filter(|p| p.active)
            .ok_or_else(|| {
                OvxError::DroppedMessage(format!("enqueue on unknown port {port}"))
            })?;
        let phys_port = match in_port {
            Some(inp) if inp.phys.port == out.phys.port => OFPP_IN_PORT,
            _ => out.phys.port,
        };
        Ok(Action::Enqueue {
            port: phys_port,
            queue_id,
        })
    }

    // The flow id of the host pair matched by `m`.
    fn flow_id(&mut self, m: &Match) -> OvxResult<u32> {
        self.flows.get_flow_id(
            m.dl_src().unwrap_or(MacAddr::ZERO),
            m.dl_dst().unwrap_or(MacAddr::ZERO),
        )
    }

    /// The physical match for traffic of `m` entering at `inp`, and the
    /// actions to apply ahead of the tenant's.  Traffic from a host has its
    /// addresses moved into physical space; traffic off a virtual link is
    /// recognized by its link fields.
    pub fn physical_match(
        &mut self,
        m: &Match,
        inp: &OvxPort,
    ) -> OvxResult<(Match, Vec<Action>)> {
        let mut pm = *m;
        pm.set_in_port(inp.phys.port);
        match inp.link_id {
            Some(link_id) => {
                let flow_id = self.flow_id(m)?;
                let tag = self.codec.encode(self.tenant, link_id, flow_id);
                tag.rewrite_match(&mut pm);
                self.ips.rewrite_match(&mut pm);
                Ok((pm, Vec::new()))
            }
            None => Ok((pm, self.ips.rewrite_actions(m))),
        }
    }

    // One output of a flow mod, from `inp` to `out`.
    fn flow_output(
        &mut self,
        fm: &FlowMod,
        inp: &OvxPort,
        out: &'a OvxPort,
        result: &mut FlowActions,
    ) -> OvxResult<()> {
        let m = &fm.ofmatch;
        let sw: &'a OvxSwitch = self.sw;

        if let Some(big) = sw.big() {
            if inp.phys.dpid != out.phys.dpid {
                let route = big.get_route(inp.port_no, out.port_no).ok_or_else(|| {
                    OvxError::DroppedMessage(format!(
                        "no route from port {} to {}",
                        inp.port_no, out.port_no
                    ))
                })?;
                let Some(first) = route.paths.path().first() else {
                    return Err(OvxError::DroppedMessage(format!(
                        "route {} has no path",
                        route.route_id
                    )));
                };
                if let Some(link_id) = inp.link_id {
                    let flow_id = self.flow_id(m)?;
                    let tag = self.codec.encode(self.tenant, link_id, flow_id);
                    result.actions.extend(tag.unset_link_fields(
                        self.log, false, false, self.flows,
                    ));
                }
                let egress_link = self.topo.link_from(out.port_ref());
                result.extra.extend(route.generate_route_fms(
                    self.codec,
                    self.flows,
                    &mut self.ips,
                    fm,
                    out,
                    egress_link,
                )?);
                result.actions.push(output_from(inp.phys.port, first.src.port));
                return Ok(());
            }
        }

        match (inp.link_id, out.is_link()) {
            (None, false) => {
                result.actions.extend(unrewrite_actions(m));
            }
            (_, true) => {
                let link = self.topo.link_from(out.port_ref()).ok_or_else(|| {
                    OvxError::DroppedMessage(format!(
                        "port {} has no virtual link",
                        out.port_ref()
                    ))
                })?;
                let flow_id = self.flows.store_flow_values(
                    m.dl_src().unwrap_or(MacAddr::ZERO),
                    m.dl_dst().unwrap_or(MacAddr::ZERO),
                )?;
                result.extra.extend(link.generate_link_fms(
                    self.codec,
                    &mut self.ips,
                    fm,
                    flow_id,
                ));
                let tag = self.codec.encode(self.tenant, link.link_id, flow_id);
                result.actions.extend(tag.set_link_fields());
            }
            (Some(link_id), false) => {
                result.actions.extend(unrewrite_actions(m));
                let skip_src =
                    fm.actions.iter().any(|a| matches!(a, Action::SetDlSrc(_)));
                let skip_dst =
                    fm.actions.iter().any(|a| matches!(a, Action::SetDlDst(_)));
                let flow_id = self.flow_id(m)?;
                let tag = self.codec.encode(self.tenant, link_id, flow_id);
                result.actions.extend(tag.unset_link_fields(
                    self.log, skip_src, skip_dst, self.flows,
                ));
            }
        }
        result.actions.push(output_from(inp.phys.port, out.phys.port));
        Ok(())
    }

    /// Translate the actions of `fm`, whose cookie is already the virtual
    /// table's, for traffic entering at `inp`.  Denied actions are left
    /// out; the mod only fails when nothing else remains.
    pub fn virtualize_flow_mod(
        &mut self,
        fm: &FlowMod,
        inp: &OvxPort,
    ) -> OvxResult<FlowActions> {
        let mut result = FlowActions::default();
        for action in &fm.actions {
            match action {
                Action::Output { port, .. } if Self::is_reserved(*port) => {
                    result.actions.push(action.clone());
                }
                Action::Output { port, .. } => {
                    let outs = self.out_vports(*port, Some(inp.port_no));
                    if outs.is_empty() {
                        return Err(OvxError::DroppedMessage(format!(
                            "no active port for output to {port}"
                        )));
                    }
                    for out in outs {
                        self.flow_output(fm, inp, out, &mut result)?;
                    }
                }
                Action::Enqueue { port, queue_id } => {
                    result.actions.push(self.enqueue(*port, *queue_id, Some(inp))?);
                }
                other => {
                    if let Some(a) = self.keep_action(other, &mut result.denied)? {
                        result.actions.push(a);
                    }
                }
            }
        }
        if result.actions.is_empty() {
            if let Some(d) = result.denied.take() {
                return Err(d.into_error());
            }
        }
        Ok(result)
    }

    /// Translate a packet-out.  `data` is the packet, already taken from
    /// the buffer map if the controller referred to a buffered one.
    pub fn virtualize_packet_out(
        &mut self,
        po: &PacketOut,
        data: &[u8],
        inp: Option<&OvxPort>,
    ) -> OvxResult<PacketOutPlan> {
        let local_dpid = inp
            .map(|p| p.phys.dpid)
            .or_else(|| self.sw.physical_dpids().first().copied())
            .ok_or_else(|| OvxError::InvalidDpid(self.sw.dpid))?;
        let in_phys = inp.map(|p| p.phys.port).unwrap_or(OFPP_NONE);
        let frame_match = FrameSummary::parse(data)
            .map(|f| Match::from_frame(&f, in_phys))
            .unwrap_or_else(|_| Match::all());

        let mut plan = PacketOutPlan::default();
        let mut local = Vec::new();
        let mut emitted = false;
        for action in &po.actions {
            match action {
                Action::Output { port, .. } if Self::is_reserved(*port) => {
                    local.push(action.clone());
                    emitted = true;
                }
                Action::Output { port, .. } => {
                    let outs = self.out_vports(*port, inp.map(|p| p.port_no));
                    for out in outs {
                        if out.is_link() {
                            self.deliver_to_neighbor(out, data, &mut plan);
                        } else if out.phys.dpid != local_dpid {
                            let mut actions = local
                                .iter()
                                .filter(|a| a.out_port().is_none())
                                .cloned()
                                .collect::<Vec<_>>();
                            actions.extend(unrewrite_actions(&frame_match));
                            actions.push(Action::output(out.phys.port));
                            let remote = PacketOut::new(data.to_vec(), actions);
                            plan.south.push((
                                out.phys.dpid,
                                OfMessage::new(0, OfBody::PacketOut(remote)),
                            ));
                        } else {
                            local.extend(unrewrite_actions(&frame_match));
                            local.push(output_from(in_phys, out.phys.port));
                            emitted = true;
                        }
                    }
                }
                Action::Enqueue { port, queue_id } => {
                    local.push(self.enqueue(*port, *queue_id, inp)?);
                    emitted = true;
                }
                other => {
                    if let Some(a) = self.keep_action(other, &mut plan.denied)? {
                        local.push(a);
                    }
                }
            }
        }

        if emitted {
            plan.local = Some((local_dpid, local));
        } else if plan.south.is_empty() && plan.north.is_empty() {
            if let Some(d) = plan.denied.take() {
                return Err(d.into_error());
            }
            return Err(OvxError::DroppedMessage(
                "packet-out reaches no port".to_string(),
            ));
        }
        Ok(plan)
    }

    // A packet sent into a virtual link arrives at the far end as a
    // packet-in from the neighboring virtual switch.
    fn deliver_to_neighbor(&self, out: &OvxPort, data: &[u8], plan: &mut PacketOutPlan) {
        let Some(dst) = self.topo.get_neighbor_port(out.port_ref()) else {
            return;
        };
        let active = self
            .topo
            .get_switch(dst.dpid)
            .and_then(|sw| sw.get_port(dst.port))
            .is_ok_and(|p| p.active);
        if !active {
            debug!(self.log, "neighbor port down"; "port" => %dst);
            return;
        }
        let pi = PacketIn {
            buffer_id: OFP_NO_BUFFER,
            total_len: data.len() as u16,
            in_port: dst.port,
            reason: OFPR_NO_MATCH,
            data: data.to_vec(),
        };
        plan.north.push((
            VSwitchRef::new(self.tenant, dst.dpid),
            OfMessage::new(0, OfBody::PacketIn(pi)),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BitSetIndex;
    use crate::index::IndexType;
    use crate::linkfield::LinkField;
    use crate::map::OvxMap;
    use crate::routing::RoutingAlgorithm;
    use crate::switch::SwitchKind;
    use crate::test_log;
    use openflow::FlowModCommand;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    const V1: Dpid = 0xa42305_0000_0001;
    const V2: Dpid = 0xa42305_0000_0002;

    struct Fixture {
        log: slog::Logger,
        map: Mutex<OvxMap>,
        counter: BitSetIndex,
        flows: FlowManager,
        codec: LinkFields,
        topo: Network<OvxSwitch, OvxLink>,
    }

    // Two virtual switches, each on its own physical switch, with hosts on
    // port 1 and a virtual link between their ports 2.
    fn fixture() -> Fixture {
        let log = test_log();
        let map = Mutex::new(OvxMap::new(&log));
        let mut topo = Network::new();
        for (vdpid, pdpid) in [(V1, 1), (V2, 2)] {
            let mut sw =
                OvxSwitch::new(&log, 1, vdpid, vec![pdpid], SwitchKind::Single);
            for port in [1, 2] {
                let mut p = OvxPort::new(
                    1,
                    vdpid,
                    port,
                    PortRef::new(pdpid, port + 10),
                    MacAddr::ZERO,
                );
                p.boot();
                if port == 2 {
                    p.link_id = Some(1);
                }
                sw.add_port(p);
            }
            topo.add_switch(sw);
        }
        let ends = LinkKey::new(PortRef::new(V1, 2), PortRef::new(V2, 2));
        for key in [ends, ends.reversed()] {
            let mut link = OvxLink::new(1, 1, key, RoutingAlgorithm::Manual, 0);
            let hop = LinkKey::new(
                PortRef::new(key.src.dpid & 0xff, 12),
                PortRef::new(key.dst.dpid & 0xff, 12),
            );
            link.paths.set_primary(vec![hop], 0);
            topo.add_link(link);
        }
        Fixture {
            flows: FlowManager::new(&log, 1, 1 << 16),
            codec: LinkFields::new(8, LinkField::MacAddress),
            counter: BitSetIndex::new(IndexType::IpId, 1 << 24),
            log,
            map,
            topo,
        }
    }

    fn virtualizer(f: &mut Fixture, vdpid: Dpid) -> ActionVirtualizer<'_> {
        ActionVirtualizer {
            log: &f.log,
            tenant: 1,
            topo: &f.topo,
            sw: f.topo.switches.get(&vdpid).unwrap(),
            flows: &mut f.flows,
            ips: IpMapper {
                log: &f.log,
                map: &f.map,
                tenant: 1,
                tenant_bits: 8,
                counter: &mut f.counter,
            },
            codec: &f.codec,
        }
    }

    fn host_mac(n: u8) -> MacAddr {
        MacAddr::new(0, 0, 0, 0, 0, n)
    }

    #[test]
    fn test_edge_to_link_tags_traffic() {
        let mut f = fixture();
        let inp = f.topo.switches[&V1].ports[&1].clone();
        let mut v = virtualizer(&mut f, V1);
        let mut m = Match::all();
        m.set_dl_src(host_mac(1)).set_dl_dst(host_mac(2));
        let mut fm = FlowMod::new(FlowModCommand::Add, m);
        fm.cookie = 1 << 32 | 1;
        fm.actions = vec![Action::output(2)];

        let out = v.virtualize_flow_mod(&fm, &inp).unwrap();
        let tag = f.codec.encode(1, 1, 1);
        let mut expected = tag.set_link_fields();
        expected.push(Action::output(12));
        assert_eq!(out.actions, expected);
        // A single-hop link has no intermediate switches to program.
        assert!(out.extra.is_empty());
        assert_eq!(f.flows.get_flow_values(1), Some((host_mac(1), host_mac(2))));
    }

    #[test]
    fn test_link_to_edge_restores_addresses() {
        let mut f = fixture();
        f.flows.store_flow_values(host_mac(1), host_mac(2)).unwrap();
        let inp = f.topo.switches[&V2].ports[&2].clone();
        let mut v = virtualizer(&mut f, V2);
        let mut m = Match::all();
        m.set_dl_src(host_mac(1)).set_dl_dst(host_mac(2));
        let mut fm = FlowMod::new(FlowModCommand::Add, m);
        fm.actions = vec![Action::output(1)];

        let out = v.virtualize_flow_mod(&fm, &inp).unwrap();
        assert_eq!(
            out.actions,
            vec![
                Action::SetDlSrc(host_mac(1)),
                Action::SetDlDst(host_mac(2)),
                Action::output(11),
            ]
        );
    }

    #[test]
    fn test_foreign_mac_is_denied() {
        let mut f = fixture();
        f.map.lock().add_mac(host_mac(9), 2).unwrap();
        let inp = f.topo.switches[&V1].ports[&1].clone();
        let mut v = virtualizer(&mut f, V1);
        let mut fm = FlowMod::new(FlowModCommand::Add, Match::all());
        fm.actions = vec![Action::SetDlDst(host_mac(9)), Action::output(2)];
        let out = v.virtualize_flow_mod(&fm, &inp).unwrap();

        // The rewrite is left out, but the output still goes into the link.
        let tag = f.codec.encode(1, 1, 1);
        let mut expected = tag.set_link_fields();
        expected.push(Action::output(12));
        assert_eq!(out.actions, expected);
        let denial = out.denied.unwrap();
        assert_eq!(denial.code, OFPBAC_EPERM);
        assert!(denial.reason.contains("00:00:00:00:00:09"));
    }

    #[test]
    fn test_only_foreign_mac_is_denied_outright() {
        let mut f = fixture();
        f.map.lock().add_mac(host_mac(9), 2).unwrap();
        let inp = f.topo.switches[&V1].ports[&1].clone();
        let mut v = virtualizer(&mut f, V1);
        let mut fm = FlowMod::new(FlowModCommand::Add, Match::all());
        fm.actions = vec![Action::SetDlSrc(host_mac(9))];
        match v.virtualize_flow_mod(&fm, &inp) {
            Err(OvxError::ActionVirtualizationDenied { code, .. }) => {
                assert_eq!(code, OFPBAC_EPERM)
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_packet_out_keeps_output_past_denied_action() {
        let mut f = fixture();
        f.map.lock().add_mac(host_mac(9), 2).unwrap();
        let inp = f.topo.switches[&V1].ports[&2].clone();
        let mut v = virtualizer(&mut f, V1);
        let po = PacketOut::new(
            vec![0; 60],
            vec![Action::SetDlSrc(host_mac(9)), Action::output(1)],
        );
        let plan = v.virtualize_packet_out(&po, &po.data, Some(&inp)).unwrap();
        let (dpid, actions) = plan.local.unwrap();
        assert_eq!(dpid, 1);
        assert!(!actions.contains(&Action::SetDlSrc(host_mac(9))));
        assert_eq!(actions.last(), Some(&Action::output(11)));
        assert_eq!(plan.denied.map(|d| d.code), Some(OFPBAC_EPERM));
    }

    #[test]
    fn test_output_to_down_port_is_dropped() {
        let mut f = fixture();
        f.topo
            .switches
            .get_mut(&V1)
            .unwrap()
            .ports
            .get_mut(&1)
            .unwrap()
            .tear_down();
        let inp = f.topo.switches[&V1].ports[&2].clone();
        let mut v = virtualizer(&mut f, V1);
        let mut fm = FlowMod::new(FlowModCommand::Add, Match::all());
        fm.actions = vec![Action::output(1)];
        assert!(matches!(
            v.virtualize_flow_mod(&fm, &inp),
            Err(OvxError::DroppedMessage(_))
        ));
    }

    #[test]
    fn test_packet_out_flood() {
        let mut f = fixture();
        let inp = f.topo.switches[&V1].ports[&1].clone();
        let mut v = virtualizer(&mut f, V1);
        let po = PacketOut::new(vec![0; 60], vec![Action::output(OFPP_FLOOD)]);
        let plan = v.virtualize_packet_out(&po, &po.data, Some(&inp)).unwrap();

        // Port 2 is a link, so the neighbor hears about it directly.
        assert!(plan.local.is_none());
        assert_eq!(plan.north.len(), 1);
        let (vref, msg) = &plan.north[0];
        assert_eq!(*vref, VSwitchRef::new(1, V2));
        match &msg.body {
            OfBody::PacketIn(pi) => assert_eq!(pi.in_port, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_packet_out_all_includes_local() {
        let mut f = fixture();
        let mut v = virtualizer(&mut f, V1);
        let po = PacketOut::new(vec![0; 60], vec![Action::output(OFPP_ALL)]);
        let plan = v.virtualize_packet_out(&po, &po.data, None).unwrap();
        let (dpid, actions) = plan.local.unwrap();
        assert_eq!(dpid, 1);
        assert_eq!(actions.last(), Some(&Action::output(11)));
        assert_eq!(plan.north.len(), 1);
    }
}
