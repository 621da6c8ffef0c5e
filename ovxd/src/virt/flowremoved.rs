// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use openflow::FlowRemoved;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::OFPFF_SEND_FLOW_REM;
use slog::debug;

use crate::switch::physical::tenant_from_cookie;
use crate::types::*;
use crate::Hypervisor;

/// A physical flow expired or was deleted.  The virtual flow it stood for
/// leaves the tenant's table, and the controller hears about it if it
/// asked to.
pub fn handle(hv: &Hypervisor, dpid: Dpid, fr: FlowRemoved) -> OvxResult<()> {
    let tenant = tenant_from_cookie(fr.cookie);
    if tenant == 0 {
        // One of the hypervisor's own rules.
        return Ok(());
    }
    let vdpid = hv.map.lock().get_virtual_switch(dpid, tenant)?;
    let net = hv.network(tenant)?;
    let mut net = net.lock();
    let sw = net.topo.get_switch_mut(vdpid)?;
    let Some(entry) = sw.flow_table.delete_flow_mod(fr.cookie) else {
        debug!(hv.log, "flow removed for unknown cookie";
            "dpid" => format!("{dpid:016x}"),
            "cookie" => format!("{:#x}", fr.cookie));
        return Ok(());
    };
    if !entry.has_flag(OFPFF_SEND_FLOW_REM) || !sw.state.is_active() {
        return Ok(());
    }
    let vref = sw.vswitch_ref();
    drop(net);

    let vfr = FlowRemoved {
        ofmatch: entry.ofmatch,
        cookie: entry.cookie,
        priority: entry.priority,
        idle_timeout: entry.idle_timeout,
        ..fr
    };
    hv.send_north(vref, OfMessage::new(0, OfBody::FlowRemoved(vfr)));
    Ok(())
}
