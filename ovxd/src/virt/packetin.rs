// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Packet-ins from physical switches.
//!
//! A packet arriving at an edge port belongs to the tenant owning its
//! source MAC.  One arriving at the far end of a virtual link still
//! carries the link fields, which name the tenant, the link, and the flow
//! whose addresses must be restored before the controller sees it.

use std::net::Ipv4Addr;

use openflow::FlowMod;
use openflow::FlowModCommand;
use openflow::Match;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PacketIn;
use packet::eth::FrameSummary;
use slog::debug;
use slog::trace;

use crate::linkfield::LinkField;
use crate::types::*;
use crate::Hypervisor;

// Seconds a drop rule for traffic from unknown hosts stays installed.
const UNKNOWN_HOST_DROP_SECS: u16 = 1;

fn dropped(reason: impl ToString) -> OvxError {
    OvxError::DroppedMessage(reason.to_string())
}

// Ask the switch to drop packets like this one for a while.
fn drop_rule(frame: &FrameSummary, pi: &PacketIn) -> OfMessage {
    let mut fm = FlowMod::new(FlowModCommand::Add, Match::from_frame(frame, pi.in_port));
    fm.hard_timeout = UNKNOWN_HOST_DROP_SECS;
    fm.buffer_id = pi.buffer_id;
    OfMessage::new(0, OfBody::FlowMod(fm))
}

// Rewrite the physical addresses in an IPv4 or ARP frame back to the
// tenant's virtual ones.
fn restore_ips(hv: &Hypervisor, tenant: TenantId, data: &mut [u8]) {
    let Ok(Some((src, dst))) = packet::rewrite::ipv4_addrs(data) else {
        return;
    };
    let virt = |pip: Ipv4Addr| -> Option<Ipv4Addr> {
        match hv.map.lock().get_virtual_ip(pip) {
            Ok((t, vip)) if t == tenant => Some(vip),
            _ => None,
        }
    };
    let (vsrc, vdst) = (virt(src), virt(dst));
    if vsrc.is_none() && vdst.is_none() {
        return;
    }
    if let Err(e) = packet::rewrite::set_ipv4_addrs(data, vsrc, vdst) {
        debug!(hv.log, "unable to restore addresses"; "error" => %e);
    }
}

pub fn handle(hv: &Hypervisor, dpid: Dpid, pi: PacketIn) -> OvxResult<()> {
    if packet::lldp::is_lldp(&pi.data) {
        hv.handle_lldp(dpid, &pi);
        return Ok(());
    }
    let frame = FrameSummary::parse(&pi.data).map_err(dropped)?;
    let pport = PortRef::new(dpid, pi.in_port);

    let is_edge = hv.physical.lock().get_port(pport)?.is_edge;
    let bound = |tenant: TenantId, link_id: u32| {
        let physical = hv.physical.lock();
        physical
            .get_port(pport)
            .ok()
            .and_then(|p| p.get_ovx_port(tenant, link_id))
    };

    let (tenant, vport, tag) = if is_edge {
        let tenant = match hv.map.lock().get_mac(frame.dl_src) {
            Ok(t) => t,
            Err(_) => {
                trace!(hv.log, "packet from unknown host";
                    "port" => %pport, "src" => %frame.dl_src);
                hv.send_south(dpid, drop_rule(&frame, &pi));
                return Ok(());
            }
        };
        let vport = bound(tenant, 0)
            .ok_or_else(|| dropped(format!("{pport} has no port in tenant {tenant}")))?;
        (tenant, vport, None)
    } else {
        let tag = match hv.link_fields.field() {
            LinkField::MacAddress => hv.link_fields.decode(frame.dl_src, frame.dl_dst),
            LinkField::Vlan => hv.link_fields.decode_vlan(frame.dl_vlan),
        };
        if !tag.is_valid() {
            return Err(dropped(format!("untagged packet on link port {pport}")));
        }
        let vport = bound(tag.tenant, tag.link).ok_or_else(|| {
            dropped(format!(
                "{pport} is not on link {} of tenant {}",
                tag.link, tag.tenant
            ))
        })?;
        (tag.tenant, vport, Some(tag))
    };

    let net = hv.network(tenant)?;
    let mut net = net.lock();
    let mut data = pi.data.clone();
    if let Some(tag) = tag {
        if let Some((src, dst)) = net.flows.get_flow_values(tag.flow) {
            packet::eth::set_macs(&mut data, src, dst).map_err(dropped)?;
        }
        restore_ips(hv, tenant, &mut data);
    }

    let sw = net.topo.get_switch_mut(vport.dpid)?;
    if !sw.state.is_active() {
        return Err(dropped(format!("virtual switch {:016x} is down", vport.dpid)));
    }
    if !sw.get_port(vport.port)?.active {
        return Err(dropped(format!("virtual port {vport} is down")));
    }

    let total_len = data.len() as u16;
    let mut held = pi.clone();
    held.data = data.clone();
    let buffer_id = sw.add_to_buffer_map(dpid, held);
    data.truncate(sw.miss_send_len as usize);
    let vref = sw.vswitch_ref();
    drop(net);

    let vpi = PacketIn {
        buffer_id,
        total_len,
        in_port: vport.port,
        reason: pi.reason,
        data,
    };
    hv.send_north(vref, OfMessage::new(0, OfBody::PacketIn(vpi)));
    Ok(())
}
