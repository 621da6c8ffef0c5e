// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use openflow::port::OFPP_IN_PORT;
use openflow::Action;
use openflow::FlowMod;
use openflow::OFPFF_SEND_FLOW_REM;
use openflow::OFP_NO_BUFFER;

use crate::address::IpMapper;
use crate::linkfield::LinkFields;
use crate::pathset::PathSet;
use crate::routing::RoutingAlgorithm;
use crate::state::State;
use crate::state::Transition;
use crate::topology::Edge;
use crate::types::*;

/// A link of the physical network, found by discovery.
#[derive(Clone, Debug)]
pub struct PhysicalLink {
    pub id: u32,
    pub key: LinkKey,
    pub state: State,
}

impl Edge for PhysicalLink {
    fn key(&self) -> LinkKey {
        self.key
    }
}

impl PhysicalLink {
    pub fn new(id: u32, key: LinkKey) -> Self {
        PhysicalLink {
            id,
            key,
            state: State::Init,
        }
    }

    pub fn transition(&mut self, log: &slog::Logger, t: Transition) -> bool {
        let name = format!("physical link {}", self.key);
        self.state.apply(log, &name, t)
    }
}

/// One direction of a virtual link.  The reverse direction is a separate
/// `OvxLink` with the same `link_id`.
#[derive(Clone, Debug)]
pub struct OvxLink {
    pub link_id: u32,
    pub tenant: TenantId,
    /// The virtual ports joined by the link.
    pub key: LinkKey,
    pub state: State,
    pub alg: RoutingAlgorithm,
    pub backups: u8,
    pub paths: PathSet,
}

impl Edge for OvxLink {
    fn key(&self) -> LinkKey {
        self.key
    }
}

impl OvxLink {
    pub fn new(
        link_id: u32,
        tenant: TenantId,
        key: LinkKey,
        alg: RoutingAlgorithm,
        backups: u8,
    ) -> Self {
        OvxLink {
            link_id,
            tenant,
            key,
            state: State::Init,
            alg,
            backups,
            paths: PathSet::default(),
        }
    }

    pub fn vlink_key(&self) -> VLinkKey {
        VLinkKey::new(self.tenant, self.key)
    }

    pub fn transition(&mut self, log: &slog::Logger, t: Transition) -> bool {
        let name = format!("virtual link {} ({})", self.link_id, self.key);
        self.state.apply(log, &name, t)
    }

    /// The flow mods carrying `fm`'s traffic across the switches inside
    /// the link's current path.  Packets travel tagged with the link fields
    /// of `flow_id`, which the match is rewritten to expect.  The switches
    /// at either end are programmed by the caller.
    ///
    /// The mods are returned farthest switch first, so each hop is ready
    /// before traffic can reach it.
    pub fn generate_link_fms(
        &self,
        codec: &LinkFields,
        ips: &mut IpMapper<'_>,
        fm: &FlowMod,
        flow_id: u32,
    ) -> Vec<(Dpid, FlowMod)> {
        let tag = codec.encode(self.tenant, self.link_id, flow_id);
        let mut base = fm.clone();
        tag.rewrite_match(&mut base.ofmatch);
        ips.rewrite_match(&mut base.ofmatch);
        base.buffer_id = OFP_NO_BUFFER;
        base.flags &= !OFPFF_SEND_FLOW_REM;

        let mut out: Vec<(Dpid, FlowMod)> = self
            .paths
            .path()
            .windows(2)
            .map(|hops| {
                let (into, from) = (hops[0].dst, hops[1].src);
                let mut hop_fm = base.clone();
                hop_fm.ofmatch.set_in_port(into.port);
                let out_port = if from.port == into.port {
                    OFPP_IN_PORT
                } else {
                    from.port
                };
                hop_fm.actions = vec![Action::output(out_port)];
                (into.dpid, hop_fm)
            })
            .collect();
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BitSetIndex;
    use crate::index::IndexType;
    use crate::linkfield::LinkField;
    use crate::map::OvxMap;
    use crate::test_log;
    use common::network::MacAddr;
    use openflow::FlowModCommand;
    use openflow::Match;
    use parking_lot::Mutex;

    fn hop(a: (Dpid, PortNo), b: (Dpid, PortNo)) -> LinkKey {
        LinkKey::new(PortRef::new(a.0, a.1), PortRef::new(b.0, b.1))
    }

    #[test]
    fn test_fms_cover_inner_switches() {
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
        let codec = LinkFields::new(8, LinkField::MacAddress);

        let mut link = OvxLink::new(
            3,
            1,
            hop((0xa42305_0000_0001, 1), (0xa42305_0000_0002, 1)),
            RoutingAlgorithm::Manual,
            0,
        );
        // 1 -> 2 -> 3 -> 4: switches 2 and 3 forward.
        link.paths.set_primary(
            vec![hop((1, 1), (2, 1)), hop((2, 2), (3, 1)), hop((3, 2), (4, 1))],
            0,
        );

        let mut m = Match::all();
        m.set_dl_src(MacAddr::new(0, 0, 0, 0, 0, 1));
        let mut fm = FlowMod::new(FlowModCommand::Add, m);
        fm.cookie = 1 << 32 | 9;
        fm.flags = OFPFF_SEND_FLOW_REM;
        let fms = link.generate_link_fms(&codec, &mut ips, &fm, 5);

        assert_eq!(fms.len(), 2);
        assert_eq!(fms[0].0, 3);
        assert_eq!(fms[1].0, 2);
        let (_, first) = &fms[1];
        assert_eq!(first.ofmatch.in_port(), Some(1));
        assert_eq!(first.actions, vec![Action::output(2)]);
        assert_eq!(first.cookie, fm.cookie);
        assert_eq!(first.flags & OFPFF_SEND_FLOW_REM, 0);

        let tag = codec.encode(1, 3, 5);
        assert_eq!(first.ofmatch.dl_src(), tag.src);
        assert_eq!(first.ofmatch.dl_dst(), tag.dst);
    }

    #[test]
    fn test_single_hop_needs_no_fms() {
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
        let mut link = OvxLink::new(
            1,
            1,
            hop((0xa1, 1), (0xa2, 1)),
            RoutingAlgorithm::Manual,
            0,
        );
        link.paths.set_primary(vec![hop((1, 1), (2, 1))], 0);
        let fm = FlowMod::new(FlowModCommand::Add, Match::all());
        let codec = LinkFields::new(8, LinkField::MacAddress);
        assert!(link.generate_link_fms(&codec, &mut ips, &fm, 1).is_empty());
    }
}
