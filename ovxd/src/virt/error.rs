// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use openflow::ErrorMsg;
use openflow::OfBody;
use openflow::OfMessage;
use slog::debug;

use crate::types::*;
use crate::Hypervisor;

/// An error from a physical switch goes back to the controller whose
/// request caused it, under that request's xid.
pub fn handle(hv: &Hypervisor, dpid: Dpid, xid: u32, err: ErrorMsg) -> OvxResult<()> {
    let owner = hv
        .physical
        .lock()
        .topo
        .get_switch_mut(dpid)?
        .untranslate_xid(xid);
    match owner {
        Some((orig, vref)) => {
            hv.send_north(vref, OfMessage::new(orig, OfBody::Error(err)));
        }
        None => {
            debug!(hv.log, "error from switch";
                "dpid" => format!("{dpid:016x}"),
                "xid" => xid,
                "type" => err.err_type,
                "code" => err.code);
        }
    }
    Ok(())
}
