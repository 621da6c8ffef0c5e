// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Statistics.
//!
//! Tenant requests are answered from what the hypervisor already knows.
//! Flow and port counters come from the last poll of the physical switches,
//! which is refreshed in the background; those polls use xids below 2^16.
//! Flow replies with larger xids answer clean-up requests, and the flows
//! they list are deleted.

use std::collections::BTreeSet;

use openflow::ofmatch::OFPFW_ALL;
use openflow::port::OFPP_NONE;
use openflow::AggregateStats;
use openflow::DescStats;
use openflow::FlowStats;
use openflow::FlowStatsRequest;
use openflow::MatchRelation;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PortStats;
use openflow::StatsReply;
use openflow::StatsReplyBody;
use openflow::StatsRequestBody;
use openflow::TableStats;
use openflow::OFPBRC_BAD_VENDOR;
use openflow::OFPET_BAD_REQUEST;
use slog::debug;

use crate::physical::PhysicalNetwork;
use crate::switch::physical::cleanup_flow_mods;
use crate::switch::OvxSwitch;
use crate::types::*;
use crate::Hypervisor;

/// Xid of the periodic flow stats poll.
pub const FLOW_POLL_XID: u32 = 1;
/// Xid of the periodic port stats poll.
pub const PORT_POLL_XID: u32 = 2;

const TABLE_NAME: &str = "OVX vFlowTable";
const TABLE_MAX_ENTRIES: u32 = 1000;

pub fn desc_stats() -> DescStats {
    DescStats {
        mfr_desc: "Open Networking Laboratory".to_string(),
        hw_desc: "OpenVirteX".to_string(),
        sw_desc: env!("CARGO_PKG_VERSION").to_string(),
        serial_num: "0".to_string(),
        dp_desc: "OpenVirteX Virtual Switch".to_string(),
    }
}

// The tenant's flows on `sw` that `req` selects, with the counters of the
// physical flows standing for them.
fn flow_stats(
    physical: &PhysicalNetwork,
    sw: &OvxSwitch,
    req: &FlowStatsRequest,
) -> Vec<FlowStats> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for dpid in sw.physical_dpids() {
        let Ok(psw) = physical.topo.get_switch(*dpid) else {
            continue;
        };
        for s in psw.get_flow_stats(sw.tenant) {
            let Ok(fm) = sw.flow_table.get_flow_mod(s.cookie) else {
                continue;
            };
            if fm.ofmatch.compare(&req.ofmatch, false) != MatchRelation::Equal {
                continue;
            }
            if req.out_port != OFPP_NONE
                && !fm.actions.iter().any(|a| a.out_port() == Some(req.out_port))
            {
                continue;
            }
            if !seen.insert(s.cookie) {
                continue;
            }
            out.push(FlowStats {
                table_id: 0,
                ofmatch: fm.ofmatch,
                duration_sec: s.duration_sec,
                duration_nsec: s.duration_nsec,
                priority: fm.priority,
                idle_timeout: fm.idle_timeout,
                hard_timeout: fm.hard_timeout,
                cookie: fm.cookie,
                packet_count: s.packet_count,
                byte_count: s.byte_count,
                actions: fm.actions.clone(),
            });
        }
    }
    out
}

fn port_stats(
    physical: &PhysicalNetwork,
    sw: &OvxSwitch,
    port_no: PortNo,
) -> Vec<PortStats> {
    sw.ports
        .values()
        .filter(|p| port_no == OFPP_NONE || p.port_no == port_no)
        .filter_map(|p| {
            let psw = physical.topo.get_switch(p.phys.dpid).ok()?;
            let mut stats = *psw.get_port_stats(p.phys.port)?;
            stats.port_no = p.port_no;
            Some(stats)
        })
        .collect()
}

/// Answer a tenant controller's stats request.
pub fn handle_request(
    hv: &Hypervisor,
    vref: VSwitchRef,
    msg: &OfMessage,
) -> OvxResult<()> {
    let OfBody::StatsRequest(req) = &msg.body else {
        return Ok(());
    };
    let net = hv.network(vref.tenant)?;
    let net = net.lock();
    let sw = net.get_switch(vref.dpid)?;

    let body = match &req.body {
        StatsRequestBody::Desc => StatsReplyBody::Desc(desc_stats()),
        StatsRequestBody::Flow(freq) => {
            let physical = hv.physical.lock();
            StatsReplyBody::Flow(flow_stats(&physical, sw, freq))
        }
        StatsRequestBody::Aggregate(freq) => {
            let physical = hv.physical.lock();
            let agg = flow_stats(&physical, sw, freq).iter().fold(
                AggregateStats::default(),
                |mut agg, s| {
                    agg.packet_count += s.packet_count;
                    agg.byte_count += s.byte_count;
                    agg.flow_count += 1;
                    agg
                },
            );
            StatsReplyBody::Aggregate(agg)
        }
        StatsRequestBody::Table => StatsReplyBody::Table(vec![TableStats {
            table_id: 0,
            name: TABLE_NAME.to_string(),
            wildcards: OFPFW_ALL,
            max_entries: TABLE_MAX_ENTRIES,
            active_count: sw.flow_table.len() as u32,
            lookup_count: 0,
            matched_count: 0,
        }]),
        StatsRequestBody::Port { port_no } => {
            let physical = hv.physical.lock();
            StatsReplyBody::Port(port_stats(&physical, sw, *port_no))
        }
        StatsRequestBody::Queue { .. } => StatsReplyBody::Queue(Vec::new()),
        StatsRequestBody::Vendor { vendor, .. } => {
            debug!(hv.log, "vendor stats request";
                "vswitch" => %vref, "vendor" => *vendor);
            drop(net);
            hv.send_north(vref, msg.error_reply(OFPET_BAD_REQUEST, OFPBRC_BAD_VENDOR));
            return Ok(());
        }
    };
    drop(net);

    let reply = StatsReply { flags: 0, body };
    hv.send_north(vref, OfMessage::new(msg.xid, OfBody::StatsReply(reply)));
    Ok(())
}

/// Take in a stats reply from a physical switch.
pub fn handle_reply(
    hv: &Hypervisor,
    dpid: Dpid,
    xid: u32,
    reply: StatsReply,
) -> OvxResult<()> {
    if xid >> 16 != 0 {
        if let StatsReplyBody::Flow(stats) = &reply.body {
            let deletes = cleanup_flow_mods(xid, stats)
                .into_iter()
                .map(|fm| (dpid, fm))
                .collect();
            hv.send_flow_mods(deletes);
        }
        return Ok(());
    }

    let mut physical = hv.physical.lock();
    let psw = physical.topo.get_switch_mut(dpid)?;
    match reply.body {
        StatsReplyBody::Flow(stats) => psw.set_flow_stats(stats),
        StatsReplyBody::Port(stats) => psw.set_port_stats(stats),
        StatsReplyBody::Desc(desc) => psw.desc = desc,
        _ => {}
    }
    Ok(())
}
