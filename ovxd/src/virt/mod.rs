// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Message virtualization: what happens to each message a physical switch
//! or a tenant controller sends once its channel is up.

pub mod error;
pub mod flowmod;
pub mod flowremoved;
pub mod packetin;
pub mod packetout;
pub mod portstatus;
pub mod stats;
pub mod switchcfg;

use openflow::OfBody;
use openflow::OfMessage;
use slog::debug;

use crate::types::*;
use crate::Hypervisor;

/// Handle a message from an active physical switch.
pub fn from_switch(hv: &Hypervisor, dpid: Dpid, msg: OfMessage) -> OvxResult<()> {
    let xid = msg.xid;
    match msg.body {
        OfBody::PortStatus(ps) => portstatus::handle(hv, dpid, ps),
        OfBody::PacketIn(pi) => packetin::handle(hv, dpid, pi),
        OfBody::FlowRemoved(fr) => flowremoved::handle(hv, dpid, fr),
        OfBody::StatsReply(reply) => stats::handle_reply(hv, dpid, xid, reply),
        OfBody::Error(err) => error::handle(hv, dpid, xid, err),
        OfBody::BarrierReply | OfBody::Vendor(_) => {
            debug!(hv.log, "ignoring message from switch";
                "dpid" => format!("{dpid:016x}"), "xid" => xid);
            Ok(())
        }
        other => Err(OvxError::SwitchState(format!(
            "{} from switch {dpid:016x}",
            OfMessage::new(xid, other).of_type()
        ))),
    }
}

/// Handle a message from the controller of an active virtual switch.
pub fn from_controller(
    hv: &Hypervisor,
    vref: VSwitchRef,
    msg: OfMessage,
) -> OvxResult<()> {
    match &msg.body {
        OfBody::FlowMod(_) => flowmod::handle(hv, vref, &msg),
        OfBody::PacketOut(_) => packetout::handle(hv, vref, &msg),
        OfBody::StatsRequest(_) => stats::handle_request(hv, vref, &msg),
        OfBody::GetConfigRequest
        | OfBody::SetConfig(_)
        | OfBody::PortMod(_)
        | OfBody::QueueGetConfigRequest { .. } => switchcfg::handle(hv, vref, &msg),
        OfBody::Error(err) => {
            debug!(hv.log, "error from controller";
                "vswitch" => %vref,
                "type" => err.err_type,
                "code" => err.code);
            Ok(())
        }
        _ => Err(OvxError::ControllerState(format!(
            "{} from controller of {vref}",
            msg.of_type()
        ))),
    }
}
