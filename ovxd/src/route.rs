// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Routes inside a big switch.  A big switch spans several physical
//! switches, so traffic between two of its ports on different physical
//! switches crosses the physical links of a route.

use openflow::port::OFPP_IN_PORT;
use openflow::Action;
use openflow::FlowMod;
use openflow::OFPFF_SEND_FLOW_REM;
use openflow::OFP_NO_BUFFER;

use common::network::MacAddr;

use crate::address::unrewrite_actions;
use crate::address::IpMapper;
use crate::flowmgr::FlowManager;
use crate::link::OvxLink;
use crate::linkfield::LinkFields;
use crate::pathset::PathSet;
use crate::port::OvxPort;
use crate::state::State;
use crate::state::Transition;
use crate::types::*;

/// One direction of a route between two ports of a big switch.
#[derive(Clone, Debug)]
pub struct SwitchRoute {
    pub route_id: u32,
    pub tenant: TenantId,
    pub vdpid: Dpid,
    pub ingress: PortNo,
    pub egress: PortNo,
    pub state: State,
    pub paths: PathSet,
}

pub(crate) fn output_from(in_port: PortNo, out_port: PortNo) -> Action {
    if in_port == out_port {
        Action::output(OFPP_IN_PORT)
    } else {
        Action::output(out_port)
    }
}

impl SwitchRoute {
    pub fn new(
        route_id: u32,
        tenant: TenantId,
        vdpid: Dpid,
        ingress: PortNo,
        egress: PortNo,
    ) -> Self {
        SwitchRoute {
            route_id,
            tenant,
            vdpid,
            ingress,
            egress,
            state: State::Init,
            paths: PathSet::default(),
        }
    }

    pub fn route_key(&self) -> RouteKey {
        RouteKey::new(self.tenant, self.vdpid, self.route_id)
    }

    pub fn transition(&mut self, log: &slog::Logger, t: Transition) -> bool {
        let name = format!(
            "route {} ({}->{}) of {:016x}",
            self.route_id, self.ingress, self.egress, self.vdpid
        );
        self.state.apply(log, &name, t)
    }

    /// The flow mods carrying `fm`'s traffic along the route, on every
    /// switch after the first.  The last switch applies the egress
    /// treatment: entering the virtual link attached to `egress`, or
    /// restoring the tenant's addresses when leaving toward a host.
    pub fn generate_route_fms(
        &self,
        codec: &LinkFields,
        flows: &mut FlowManager,
        ips: &mut IpMapper<'_>,
        fm: &FlowMod,
        egress: &OvxPort,
        egress_link: Option<&OvxLink>,
    ) -> OvxResult<Vec<(Dpid, FlowMod)>> {
        let mut out = Vec::new();
        let path = self.paths.path();
        if path.is_empty() {
            return Ok(out);
        }

        let out_actions = match egress_link {
            Some(link) => {
                let flow_id = flows.store_flow_values(
                    fm.ofmatch.dl_src().unwrap_or(MacAddr::ZERO),
                    fm.ofmatch.dl_dst().unwrap_or(MacAddr::ZERO),
                )?;
                out.extend(link.generate_link_fms(codec, ips, fm, flow_id));
                codec
                    .encode(self.tenant, link.link_id, flow_id)
                    .set_link_fields()
            }
            None => unrewrite_actions(&fm.ofmatch),
        };

        let mut base = fm.clone();
        if base.ofmatch.dl_type() == Some(packet::ETHER_IPV4) {
            ips.rewrite_match(&mut base.ofmatch);
        }
        base.buffer_id = OFP_NO_BUFFER;
        base.flags &= !OFPFF_SEND_FLOW_REM;

        let last = path.len() - 1;
        for i in (0..path.len()).rev() {
            let into = path[i].dst;
            let mut hop_fm = base.clone();
            hop_fm.ofmatch.set_in_port(into.port);
            hop_fm.actions = if i == last {
                let mut a = out_actions.clone();
                a.push(output_from(into.port, egress.phys.port));
                a
            } else {
                vec![output_from(into.port, path[i + 1].src.port)]
            };
            out.push((into.dpid, hop_fm));
        }
        Ok(out)
    }

    /// The flow mod on the switch where traffic enters the route, for a
    /// tenant flow already installed there.  Traffic arriving over a
    /// virtual link has its link fields stripped; traffic from a host has
    /// its addresses moved into physical space.
    pub fn generate_first_fm(
        &self,
        log: &slog::Logger,
        codec: &LinkFields,
        flows: &mut FlowManager,
        ips: &mut IpMapper<'_>,
        fm: &FlowMod,
        ingress: &OvxPort,
    ) -> OvxResult<Option<(Dpid, FlowMod)>> {
        let Some(first) = self.paths.path().first() else {
            return Ok(None);
        };
        let mut out = fm.clone();
        out.buffer_id = OFP_NO_BUFFER;
        out.actions = match ingress.link_id {
            Some(link_id) => {
                let flow_id = flows.get_flow_id(
                    fm.ofmatch.dl_src().unwrap_or(MacAddr::ZERO),
                    fm.ofmatch.dl_dst().unwrap_or(MacAddr::ZERO),
                )?;
                let tag = codec.encode(self.tenant, link_id, flow_id);
                tag.rewrite_match(&mut out.ofmatch);
                ips.rewrite_match(&mut out.ofmatch);
                tag.unset_link_fields(log, false, false, flows)
            }
            None => ips.rewrite_actions(&fm.ofmatch),
        };
        out.ofmatch.set_in_port(ingress.phys.port);
        out.actions.push(output_from(ingress.phys.port, first.src.port));
        Ok(Some((ingress.phys.dpid, out)))
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
    use crate::test_log;
    use openflow::FlowModCommand;
    use openflow::Match;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    const VDPID: Dpid = 0xa42305_0000_0001;

    fn hop(a: (Dpid, PortNo), b: (Dpid, PortNo)) -> LinkKey {
        LinkKey::new(PortRef::new(a.0, a.1), PortRef::new(b.0, b.1))
    }

    fn route() -> SwitchRoute {
        let mut r = SwitchRoute::new(1, 1, VDPID, 1, 2);
        // ingress on switch 1 port 5, egress on switch 3 port 6
        r.paths.set_primary(vec![hop((1, 1), (2, 1)), hop((2, 2), (3, 1))], 0);
        r
    }

    fn tenant_fm() -> FlowMod {
        let mut m = Match::all();
        m.set_dl_type(packet::ETHER_IPV4);
        m.set_nw_dst(Ipv4Addr::new(10, 0, 0, 2), 32);
        m.set_dl_src(MacAddr::new(0, 0, 0, 0, 0, 1));
        m.set_dl_dst(MacAddr::new(0, 0, 0, 0, 0, 2));
        let mut fm = FlowMod::new(FlowModCommand::Add, m);
        fm.cookie = 1 << 32 | 1;
        fm
    }

    #[test]
    fn test_route_to_host() {
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
        let mut flows = FlowManager::new(&log, 1, 1 << 20);
        let codec = LinkFields::new(8, LinkField::MacAddress);
        let egress = OvxPort::new(1, VDPID, 2, PortRef::new(3, 6), MacAddr::ZERO);

        let fms = route()
            .generate_route_fms(&codec, &mut flows, &mut ips, &tenant_fm(), &egress, None)
            .unwrap();
        assert_eq!(fms.len(), 2);
        let (dpid, last) = &fms[0];
        assert_eq!(*dpid, 3);
        assert_eq!(last.ofmatch.in_port(), Some(1));
        // The tenant's address is restored on the way out.
        assert_eq!(
            last.actions,
            vec![
                Action::SetNwDst(Ipv4Addr::new(10, 0, 0, 2)),
                Action::output(6)
            ]
        );
        // In the middle the match expects the physical address.
        let (dpid, middle) = &fms[1];
        assert_eq!(*dpid, 2);
        assert_eq!(middle.actions, vec![Action::output(2)]);
        assert_ne!(middle.ofmatch.nw_dst(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(flows.len(), 0);
    }

    #[test]
    fn test_route_into_link() {
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
        let mut flows = FlowManager::new(&log, 1, 1 << 20);
        let codec = LinkFields::new(8, LinkField::MacAddress);
        let mut egress = OvxPort::new(1, VDPID, 2, PortRef::new(3, 6), MacAddr::ZERO);
        egress.link_id = Some(4);
        let mut link = OvxLink::new(
            4,
            1,
            hop((VDPID, 2), (0xa42305_0000_0002, 1)),
            RoutingAlgorithm::Manual,
            0,
        );
        link.paths.set_primary(vec![hop((3, 6), (7, 1))], 0);

        let fms = route()
            .generate_route_fms(
                &codec,
                &mut flows,
                &mut ips,
                &tenant_fm(),
                &egress,
                Some(&link),
            )
            .unwrap();
        assert_eq!(flows.len(), 1);
        let (dpid, last) = &fms[0];
        assert_eq!(*dpid, 3);
        let tag = codec.encode(1, 4, 1);
        let mut expected = tag.set_link_fields();
        expected.push(Action::output(6));
        assert_eq!(last.actions, expected);
    }

    #[test]
    fn test_first_fm_from_host() {
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
        let mut flows = FlowManager::new(&log, 1, 1 << 20);
        let codec = LinkFields::new(8, LinkField::MacAddress);
        let ingress = OvxPort::new(1, VDPID, 1, PortRef::new(1, 5), MacAddr::ZERO);

        let (dpid, fm) = route()
            .generate_first_fm(&log, &codec, &mut flows, &mut ips, &tenant_fm(), &ingress)
            .unwrap()
            .unwrap();
        assert_eq!(dpid, 1);
        assert_eq!(fm.ofmatch.in_port(), Some(5));
        assert!(matches!(fm.actions[0], Action::SetNwDst(_)));
        assert_eq!(fm.actions.last(), Some(&Action::output(1)));
    }
}
