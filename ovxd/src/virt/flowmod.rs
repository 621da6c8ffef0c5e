// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Flow mods from tenant controllers.
//!
//! The mod first updates the virtual switch's flow table, which decides the
//! cookie the physical flows carry.  It is then translated once for each
//! virtual in-port it applies to, and sent to the physical switch owning
//! that port, after the mods for any other switches the flow crosses.

use openflow::port::OFPP_TABLE;
use openflow::Action;
use openflow::FlowMod;
use openflow::FlowModCommand;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PacketOut;
use openflow::OFPBRC_BUFFER_UNKNOWN;
use openflow::OFPET_BAD_ACTION;
use openflow::OFPET_BAD_REQUEST;
use openflow::OFPET_FLOW_MOD_FAILED;
use openflow::OFPFF_SEND_FLOW_REM;
use openflow::OFPFMFC_OVERLAP;
use openflow::OFP_NO_BUFFER;
use slog::debug;
use slog::warn;

use crate::actions::Denial;
use crate::flowtable::FlowModOutcome;
use crate::switch::buffer::Buffered;
use crate::types::*;
use crate::virtnet::OvxNetwork;
use crate::Hypervisor;

// A translated mod for the switch owning one of the virtual in-ports.
struct PhysicalMod {
    dpid: Dpid,
    fm: FlowMod,
}

// The physical side of one flow mod.
struct Devirtualized {
    // Mods for switches a flow crosses without entering there.
    extra: Vec<(Dpid, FlowMod)>,
    mods: Vec<PhysicalMod>,
    denied: Option<Denial>,
}

/// Translate `fm` into the mods programming the physical network.  The
/// mods for intermediate switches and those for the switches owning the
/// in-ports are kept apart.
fn devirtualize(
    hv: &Hypervisor,
    net: &mut OvxNetwork,
    vdpid: Dpid,
    fm: &FlowMod,
) -> OvxResult<Devirtualized> {
    let sw = net.topo.get_switch(vdpid)?;
    let in_ports = match fm.ofmatch.in_port() {
        Some(p) => vec![sw.get_port(p)?.clone()],
        None => sw.ports.values().cloned().collect(),
    };

    let mut v = net.virtualizer(hv, vdpid)?;
    let mut extra = Vec::new();
    let mut mods = Vec::new();
    let mut denied = None;
    for inp in in_ports {
        let mut vfm = fm.clone();
        vfm.ofmatch.set_in_port(inp.port_no);
        let (ofmatch, mut actions) = v.physical_match(&vfm.ofmatch, &inp)?;
        let translated = v.virtualize_flow_mod(&vfm, &inp)?;
        actions.extend(translated.actions);
        extra.extend(translated.extra);
        if denied.is_none() {
            denied = translated.denied;
        }

        let mut pfm = vfm;
        pfm.ofmatch = ofmatch;
        pfm.actions = actions;
        pfm.flags |= OFPFF_SEND_FLOW_REM;
        pfm.buffer_id = OFP_NO_BUFFER;
        mods.push(PhysicalMod {
            dpid: inp.phys.dpid,
            fm: pfm,
        });
    }
    Ok(Devirtualized {
        extra,
        mods,
        denied,
    })
}

// Send the mods owning the in-ports under translated xids.  A buffered
// packet rides along with the mod for the switch holding it.
fn send_mods(
    hv: &Hypervisor,
    vref: VSwitchRef,
    xid: u32,
    mods: Vec<PhysicalMod>,
    buffered: Option<&Buffered>,
) {
    let mut release = None;
    for PhysicalMod { dpid, mut fm } in mods {
        if let Some(b) = buffered.filter(|b| b.dpid == dpid) {
            if b.packet_in.buffer_id != OFP_NO_BUFFER {
                fm.buffer_id = b.packet_in.buffer_id;
            } else if fm.ofmatch.in_port() == Some(b.packet_in.in_port) {
                release = Some((dpid, b.packet_in.in_port));
            }
        }
        let pxid = {
            let mut physical = hv.physical.lock();
            match physical.topo.get_switch_mut(dpid) {
                Ok(psw) => psw.translate_xid(xid, vref),
                Err(_) => continue,
            }
        };
        hv.send_south(dpid, OfMessage::new(pxid, OfBody::FlowMod(fm)));
    }

    // The switch never buffered the packet, so re-inject it behind the new
    // flow.
    if let (Some((dpid, in_port)), Some(b)) = (release, buffered) {
        let mut po = PacketOut::new(
            b.packet_in.data.clone(),
            vec![Action::output(OFPP_TABLE)],
        );
        po.in_port = in_port;
        hv.send_south(dpid, OfMessage::new(0, OfBody::PacketOut(po)));
    }
}

// Delete the physical flows standing for table entries that were removed.
fn delete_entries(
    hv: &Hypervisor,
    net: &mut OvxNetwork,
    vdpid: Dpid,
    removed: Vec<FlowMod>,
) {
    let mut deletes = Vec::new();
    for mut entry in removed {
        entry.command = FlowModCommand::DeleteStrict;
        match devirtualize(hv, net, vdpid, &entry) {
            Ok(d) => {
                deletes.extend(d.extra);
                deletes.extend(d.mods.into_iter().map(|m| (m.dpid, m.fm)));
            }
            Err(e) => {
                debug!(hv.log, "unable to translate deleted flow";
                    "vdpid" => format!("{vdpid:016x}"), "error" => %e);
            }
        }
    }
    for (_, fm) in deletes.iter_mut() {
        fm.command = FlowModCommand::DeleteStrict;
        fm.actions.clear();
        fm.flags &= !OFPFF_SEND_FLOW_REM;
    }
    hv.send_flow_mods(deletes);
}

pub fn handle(hv: &Hypervisor, vref: VSwitchRef, msg: &OfMessage) -> OvxResult<()> {
    let OfBody::FlowMod(fm) = &msg.body else {
        return Ok(());
    };
    if fm.ofmatch.dl_type() == Some(packet::ETHER_LLDP) {
        debug!(hv.log, "dropping LLDP flow mod"; "vswitch" => %vref);
        return Ok(());
    }

    let net = hv.network(vref.tenant)?;
    let mut net = net.lock();
    let sw = net.topo.get_switch_mut(vref.dpid)?;

    let buffered = match fm.buffer_id {
        OFP_NO_BUFFER => None,
        id => match sw.get_from_buffer_map(id) {
            Some(b) => Some(b),
            None => {
                hv.send_north(
                    vref,
                    msg.error_reply(OFPET_BAD_REQUEST, OFPBRC_BUFFER_UNKNOWN),
                );
                return Ok(());
            }
        },
    };

    let mut fm = fm.clone();
    match sw.flow_table.handle_flow_mod(&fm) {
        FlowModOutcome::Overlap => {
            hv.send_north(
                vref,
                msg.error_reply(OFPET_FLOW_MOD_FAILED, OFPFMFC_OVERLAP),
            );
            return Ok(());
        }
        FlowModOutcome::Ignore => return Ok(()),
        FlowModOutcome::Cleared => {
            let dpids = sw.physical_dpids().to_vec();
            let physical = hv.physical.lock();
            let cleanups: Vec<(Dpid, OfMessage)> = dpids
                .iter()
                .filter_map(|d| physical.topo.get_switch(*d).ok())
                .map(|psw| {
                    let port = openflow::port::OFPP_NONE;
                    (psw.dpid, psw.clean_up_tenant(vref.tenant, port))
                })
                .collect();
            drop(physical);
            for (dpid, msg) in cleanups {
                hv.send_south(dpid, msg);
            }
            return Ok(());
        }
        FlowModOutcome::Removed(entries) => {
            delete_entries(hv, &mut net, vref.dpid, entries);
            return Ok(());
        }
        FlowModOutcome::Apply(cookie) => fm.cookie = cookie,
    }

    match devirtualize(hv, &mut net, vref.dpid, &fm) {
        Ok(d) => {
            if let Some(denial) = d.denied {
                warn!(hv.log, "flow mod action denied";
                    "vswitch" => %vref, "reason" => denial.reason);
                hv.send_north(vref, msg.error_reply(OFPET_BAD_ACTION, denial.code));
            }
            hv.send_flow_mods(d.extra);
            send_mods(hv, vref, msg.xid, d.mods, buffered.as_ref());
            Ok(())
        }
        Err(OvxError::ActionVirtualizationDenied { reason, code }) => {
            warn!(hv.log, "flow mod denied";
                "vswitch" => %vref, "reason" => reason);
            if let Ok(sw) = net.topo.get_switch_mut(vref.dpid) {
                sw.flow_table.delete_flow_mod(fm.cookie);
            }
            hv.send_north(vref, msg.error_reply(OFPET_BAD_ACTION, code));
            Ok(())
        }
        Err(OvxError::DroppedMessage(reason)) => {
            debug!(hv.log, "flow mod dropped";
                "vswitch" => %vref, "reason" => reason);
            if let Ok(sw) = net.topo.get_switch_mut(vref.dpid) {
                sw.flow_table.delete_flow_mod(fm.cookie);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
