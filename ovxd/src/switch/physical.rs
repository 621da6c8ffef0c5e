// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

use openflow::port::OFPP_CONTROLLER;
use openflow::port::OFPP_NONE;
use openflow::Action;
use openflow::DescStats;
use openflow::FeaturesReply;
use openflow::FlowMod;
use openflow::FlowModCommand;
use openflow::FlowStats;
use openflow::FlowStatsRequest;
use openflow::Match;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PhyPort;
use openflow::PortStats;
use openflow::StatsRequest;
use openflow::StatsRequestBody;
use openflow::OFPFF_SEND_FLOW_REM;
use slog::debug;
use slog::info;

use crate::port::PhysicalPort;
use crate::state::State;
use crate::state::Transition;
use crate::switch::xid::XidTranslator;
use crate::topology::Node;
use crate::types::*;

/// Priority of the rules sending discovery traffic to the hypervisor.
pub const DISCOVERY_PRIORITY: u16 = 40000;
/// Priority of the catch-all rules for traffic no tenant flow matched.
pub const MISS_PRIORITY: u16 = 5;

/// A switch of the shared physical network, built once its handshake has
/// completed.
pub struct PhysicalSwitch {
    log: slog::Logger,
    pub dpid: Dpid,
    pub state: State,
    pub features: FeaturesReply,
    pub desc: DescStats,
    pub ports: BTreeMap<PortNo, PhysicalPort>,
    xids: XidTranslator<VSwitchRef>,
    port_stats: BTreeMap<PortNo, PortStats>,
    flow_stats: BTreeMap<TenantId, Vec<FlowStats>>,
}

impl Node for PhysicalSwitch {
    fn dpid(&self) -> Dpid {
        self.dpid
    }

    fn set_port_edge(&mut self, port: PortNo, edge: bool) {
        if let Some(p) = self.ports.get_mut(&port) {
            p.is_edge = edge;
        }
    }
}

impl PhysicalSwitch {
    pub fn new(log: &slog::Logger, features: FeaturesReply, desc: DescStats) -> Self {
        let dpid = features.datapath_id;
        let mut sw = PhysicalSwitch {
            log: log.new(slog::o!(
                "unit" => "physical_switch",
                "dpid" => format!("{dpid:016x}"),
            )),
            dpid,
            state: State::Init,
            features,
            desc,
            ports: BTreeMap::new(),
            xids: XidTranslator::new(),
            port_stats: BTreeMap::new(),
            flow_stats: BTreeMap::new(),
        };
        for p in sw.features.ports.clone() {
            if openflow::port::is_physical(p.port_no) {
                sw.ports.insert(p.port_no, PhysicalPort::new(dpid, p));
            }
        }
        sw
    }

    pub fn name(&self) -> String {
        format!("{:016x}", self.dpid)
    }

    pub fn transition(&mut self, t: Transition) -> bool {
        let name = self.name();
        self.state.apply(&self.log, &name, t)
    }

    pub fn get_port(&self, port: PortNo) -> OvxResult<&PhysicalPort> {
        self.ports
            .get(&port)
            .ok_or(OvxError::InvalidPort(PortRef::new(self.dpid, port)))
    }

    pub fn get_port_mut(&mut self, port: PortNo) -> OvxResult<&mut PhysicalPort> {
        self.ports
            .get_mut(&port)
            .ok_or(OvxError::InvalidPort(PortRef::new(self.dpid, port)))
    }

    /// Add or refresh a port from its description.  Returns true for a port
    /// not seen before.
    pub fn update_port(&mut self, desc: PhyPort) -> bool {
        match self.ports.get_mut(&desc.port_no) {
            Some(p) => {
                p.desc = desc;
                false
            }
            None => {
                info!(self.log, "adding port"; "port" => desc.port_no);
                self.ports
                    .insert(desc.port_no, PhysicalPort::new(self.dpid, desc));
                true
            }
        }
    }

    pub fn remove_port(&mut self, port: PortNo) -> Option<PhysicalPort> {
        self.port_stats.remove(&port);
        self.ports.remove(&port)
    }

    /// The virtual port standing for `port` in `tenant`, as the endpoint of
    /// virtual link `link_id` (0 for ports on no virtual link).
    pub fn ovx_port_number(
        &self,
        port: PortNo,
        tenant: TenantId,
        link_id: u32,
    ) -> Option<PortRef> {
        self.ports.get(&port)?.get_ovx_port(tenant, link_id)
    }

    pub fn translate_xid(&mut self, xid: u32, owner: VSwitchRef) -> u32 {
        self.xids.translate(xid, owner)
    }

    pub fn untranslate_xid(&mut self, xid: u32) -> Option<(u32, VSwitchRef)> {
        self.xids.untranslate(xid)
    }

    pub fn set_port_stats(&mut self, stats: Vec<PortStats>) {
        for s in stats {
            self.port_stats.insert(s.port_no, s);
        }
    }

    pub fn get_port_stats(&self, port: PortNo) -> Option<&PortStats> {
        self.port_stats.get(&port)
    }

    /// Cache the flow stats of a poll, split by the tenant in their cookies.
    pub fn set_flow_stats(&mut self, stats: Vec<FlowStats>) {
        self.flow_stats.clear();
        for s in stats {
            self.flow_stats
                .entry(tenant_from_cookie(s.cookie))
                .or_default()
                .push(s);
        }
    }

    pub fn get_flow_stats(&self, tenant: TenantId) -> &[FlowStats] {
        self.flow_stats
            .get(&tenant)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Rules installed on every switch as it comes up: discovery probes and
    /// ARP go to the hypervisor ahead of any tenant rule, and anything no
    /// tenant rule matched follows behind them.
    pub fn default_flows() -> Vec<FlowMod> {
        let rule = |dl_type: u16, priority: u16| {
            let mut m = Match::all();
            m.set_dl_type(dl_type);
            let mut fm = FlowMod::new(FlowModCommand::Add, m);
            fm.priority = priority;
            fm.flags = OFPFF_SEND_FLOW_REM;
            fm.actions = vec![Action::output(OFPP_CONTROLLER)];
            fm
        };
        vec![
            rule(packet::ETHER_LLDP, DISCOVERY_PRIORITY),
            rule(packet::ETHER_ARP, DISCOVERY_PRIORITY),
            rule(packet::ETHER_IPV4, MISS_PRIORITY),
            rule(packet::ETHER_ARP, MISS_PRIORITY),
        ]
    }

    /// Ask the switch for its flows, so those belonging to `tenant` (and
    /// touching `port`, unless it is OFPP_NONE) can be deleted when the
    /// reply comes in.
    pub fn clean_up_tenant(&self, tenant: TenantId, port: PortNo) -> OfMessage {
        debug!(self.log, "cleaning up tenant flows";
            "tenant" => tenant, "port" => port);
        let req = FlowStatsRequest {
            ofmatch: Match::all(),
            table_id: 0xff,
            out_port: OFPP_NONE,
        };
        OfMessage::new(
            cleanup_xid(tenant, port),
            OfBody::StatsRequest(StatsRequest::new(StatsRequestBody::Flow(req))),
        )
    }
}

pub fn tenant_from_cookie(cookie: u64) -> TenantId {
    (cookie >> 32) as TenantId
}

/// Xid tagging a flow stats request issued to clean up after a tenant.
pub fn cleanup_xid(tenant: TenantId, port: PortNo) -> u32 {
    tenant << 16 | port as u32
}

/// The deletions due for the flows in a clean-up reply with xid `xid`.
pub fn cleanup_flow_mods(xid: u32, stats: &[FlowStats]) -> Vec<FlowMod> {
    let tenant = xid >> 16;
    let port = (xid & 0xffff) as PortNo;
    stats
        .iter()
        .filter(|s| tenant_from_cookie(s.cookie) == tenant)
        .filter(|s| {
            port == OFPP_NONE
                || s.ofmatch.in_port() == Some(port)
                || s.actions.iter().any(|a| a.out_port() == Some(port))
        })
        .map(|s| {
            let mut fm = FlowMod::new(FlowModCommand::DeleteStrict, s.ofmatch);
            fm.priority = s.priority;
            fm.cookie = s.cookie;
            fm
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_log;
    use common::network::MacAddr;

    pub(crate) fn features(dpid: Dpid, ports: &[PortNo]) -> FeaturesReply {
        FeaturesReply {
            datapath_id: dpid,
            n_buffers: 256,
            n_tables: 1,
            capabilities: 0,
            actions: 0,
            ports: ports
                .iter()
                .map(|p| PhyPort::new(*p, MacAddr::ovx(*p as u32), format!("eth{p}")))
                .collect(),
        }
    }

    #[test]
    fn test_ports_from_features() {
        let mut f = features(1, &[1, 2]);
        f.ports.push(PhyPort::new(
            openflow::port::OFPP_LOCAL,
            MacAddr::ZERO,
            "local",
        ));
        let mut sw = PhysicalSwitch::new(&test_log(), f, DescStats::default());
        assert_eq!(sw.ports.len(), 2);
        assert!(sw.get_port(3).is_err());
        assert!(sw.update_port(PhyPort::new(3, MacAddr::ZERO, "eth3")));
        assert!(!sw.update_port(PhyPort::new(3, MacAddr::ZERO, "eth3")));
        assert!(sw.remove_port(3).is_some());
    }

    #[test]
    fn test_default_flows() {
        let flows = PhysicalSwitch::default_flows();
        assert_eq!(flows.len(), 4);
        assert_eq!(flows[0].ofmatch.dl_type(), Some(packet::ETHER_LLDP));
        assert_eq!(flows[0].priority, DISCOVERY_PRIORITY);
        assert!(flows.iter().all(|f| f.actions
            == vec![Action::output(OFPP_CONTROLLER)]));
    }

    #[test]
    fn test_cleanup_selects_tenant_flows() {
        let stat = |cookie: u64, in_port: PortNo, out: PortNo| {
            let mut m = Match::all();
            m.set_in_port(in_port);
            FlowStats {
                table_id: 0,
                ofmatch: m,
                duration_sec: 0,
                duration_nsec: 0,
                priority: 10,
                idle_timeout: 0,
                hard_timeout: 0,
                cookie,
                packet_count: 0,
                byte_count: 0,
                actions: vec![Action::output(out)],
            }
        };
        let stats = vec![
            stat(1 << 32 | 1, 1, 2),
            stat(1 << 32 | 2, 3, 4),
            stat(2 << 32 | 1, 1, 2),
        ];
        assert_eq!(cleanup_flow_mods(cleanup_xid(1, OFPP_NONE), &stats).len(), 2);
        let by_port = cleanup_flow_mods(cleanup_xid(1, 4), &stats);
        assert_eq!(by_port.len(), 1);
        assert_eq!(by_port[0].cookie, 1 << 32 | 2);
        assert_eq!(by_port[0].command, FlowModCommand::DeleteStrict);
    }

    #[test]
    fn test_flow_stats_by_tenant() {
        let mut sw =
            PhysicalSwitch::new(&test_log(), features(1, &[1]), DescStats::default());
        let mut s = FlowStats {
            table_id: 0,
            ofmatch: Match::all(),
            duration_sec: 0,
            duration_nsec: 0,
            priority: 0,
            idle_timeout: 0,
            hard_timeout: 0,
            cookie: 3 << 32,
            packet_count: 0,
            byte_count: 0,
            actions: vec![],
        };
        let t3 = s.clone();
        s.cookie = 4 << 32;
        sw.set_flow_stats(vec![t3, s]);
        assert_eq!(sw.get_flow_stats(3).len(), 1);
        assert!(sw.get_flow_stats(5).is_empty());
    }
}
