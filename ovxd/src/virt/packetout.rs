// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Packet-outs from tenant controllers.

use openflow::port::OFPP_NONE;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PacketOut;
use openflow::OFPBRC_BUFFER_UNKNOWN;
use openflow::OFPET_BAD_ACTION;
use openflow::OFPET_BAD_REQUEST;
use openflow::OFP_NO_BUFFER;
use slog::debug;
use slog::warn;

use crate::types::*;
use crate::Hypervisor;

pub fn handle(hv: &Hypervisor, vref: VSwitchRef, msg: &OfMessage) -> OvxResult<()> {
    let OfBody::PacketOut(po) = &msg.body else {
        return Ok(());
    };
    let net = hv.network(vref.tenant)?;
    let mut net = net.lock();

    if packet::lldp::is_lldp(&po.data) {
        net.handle_lldp(hv, po, vref.dpid);
        return Ok(());
    }

    let sw = net.topo.get_switch_mut(vref.dpid)?;
    let (data, held) = match po.buffer_id {
        OFP_NO_BUFFER => (po.data.clone(), None),
        id => match sw.get_from_buffer_map(id) {
            Some(b) => {
                let held = (b.packet_in.buffer_id != OFP_NO_BUFFER)
                    .then_some((b.dpid, b.packet_in.buffer_id));
                (b.packet_in.data, held)
            }
            None => {
                hv.send_north(
                    vref,
                    msg.error_reply(OFPET_BAD_REQUEST, OFPBRC_BUFFER_UNKNOWN),
                );
                return Ok(());
            }
        },
    };
    let inp = sw.ports.get(&po.in_port).cloned();

    let plan = {
        let mut v = net.virtualizer(hv, vref.dpid)?;
        v.virtualize_packet_out(po, &data, inp.as_ref())
    };
    let plan = match plan {
        Ok(plan) => plan,
        Err(OvxError::ActionVirtualizationDenied { reason, code }) => {
            warn!(hv.log, "packet-out denied";
                "vswitch" => %vref, "reason" => reason);
            hv.send_north(vref, msg.error_reply(OFPET_BAD_ACTION, code));
            return Ok(());
        }
        Err(OvxError::DroppedMessage(reason)) => {
            debug!(hv.log, "packet-out dropped";
                "vswitch" => %vref, "reason" => reason);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    drop(net);

    if let Some(denial) = plan.denied {
        warn!(hv.log, "packet-out action denied";
            "vswitch" => %vref, "reason" => denial.reason);
        hv.send_north(vref, msg.error_reply(OFPET_BAD_ACTION, denial.code));
    }
    for (dst, pi) in plan.north {
        hv.send_north(dst, pi);
    }
    for (dpid, remote) in plan.south {
        hv.send_south(dpid, remote);
    }
    if let Some((dpid, actions)) = plan.local {
        let mut out = PacketOut::new(data, actions);
        out.in_port = inp.map(|p| p.phys.port).unwrap_or(OFPP_NONE);
        if let Some((_, buffer_id)) = held.filter(|(d, _)| *d == dpid) {
            out.buffer_id = buffer_id;
            out.data.clear();
        }
        let pxid = {
            let mut physical = hv.physical.lock();
            physical.topo.get_switch_mut(dpid)?.translate_xid(msg.xid, vref)
        };
        hv.send_south(dpid, OfMessage::new(pxid, OfBody::PacketOut(out)));
    }
    Ok(())
}
