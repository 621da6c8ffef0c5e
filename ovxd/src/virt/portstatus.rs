// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use openflow::PortReason;
use openflow::PortStatus;
use slog::info;

use crate::types::*;
use crate::Hypervisor;

pub fn handle(hv: &Hypervisor, dpid: Dpid, ps: PortStatus) -> OvxResult<()> {
    let pport = PortRef::new(dpid, ps.desc.port_no);
    let enabled = ps.desc.is_enabled();
    info!(hv.log, "port status";
        "port" => %pport, "reason" => %ps.reason, "enabled" => enabled);

    let (lost, bindings) = {
        let mut physical = hv.physical.lock();
        match ps.reason {
            PortReason::Add => {
                let probe = physical.update_port(dpid, ps.desc);
                drop(physical);
                if let Some(probe) = probe {
                    hv.send_south(dpid, probe);
                }
                return Ok(());
            }
            PortReason::Delete => {
                let bindings = physical
                    .get_port(pport)
                    .map(|p| p.ovx_ports())
                    .unwrap_or_default();
                (physical.remove_port(pport), bindings)
            }
            PortReason::Modify => {
                let probe = physical.update_port(dpid, ps.desc);
                let bindings = physical.get_port(pport)?.ovx_ports();
                let lost = if enabled {
                    Vec::new()
                } else {
                    let touching: Vec<LinkKey> = physical
                        .topo
                        .links
                        .keys()
                        .filter(|k| k.src == pport || k.dst == pport)
                        .copied()
                        .collect();
                    touching
                        .into_iter()
                        .filter_map(|k| physical.remove_link(k.src, k.dst))
                        .collect()
                };
                if let Some(probe) = probe {
                    hv.send_south(dpid, probe);
                }
                (lost, bindings)
            }
        }
    };

    for key in lost {
        hv.physical_link_down(key);
    }

    let up = ps.reason == PortReason::Modify && enabled;
    for (tenant, vport) in bindings {
        let Ok(net) = hv.network(tenant) else {
            continue;
        };
        let mut net = net.lock();
        // Link ports come back with the link, once discovery sees it.
        let is_edge = net
            .get_switch(vport.dpid)
            .and_then(|sw| sw.get_port(vport.port))
            .is_ok_and(|p| !p.is_link());
        if !up || is_edge {
            net.set_port_active(hv, vport, up);
        }
    }
    Ok(())
}
