// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

use openflow::port::*;
use openflow::PhyPort;
use openflow::PortReason;
use openflow::PortStatus;

use common::network::MacAddr;

use crate::types::Dpid;
use crate::types::PortNo;
use crate::types::PortRef;
use crate::types::TenantId;

/// A port of a physical switch, with the virtual ports bound to it.
#[derive(Clone, Debug)]
pub struct PhysicalPort {
    pub dpid: Dpid,
    pub desc: PhyPort,
    pub is_edge: bool,
    // tenant -> virtual link id (0 when the binding is not part of a virtual
    // link) -> virtual port
    ovx_ports: BTreeMap<TenantId, BTreeMap<u32, PortRef>>,
}

impl PhysicalPort {
    pub fn new(dpid: Dpid, desc: PhyPort) -> Self {
        PhysicalPort {
            dpid,
            desc,
            is_edge: true,
            ovx_ports: BTreeMap::new(),
        }
    }

    pub fn port_no(&self) -> PortNo {
        self.desc.port_no
    }

    pub fn port_ref(&self) -> PortRef {
        PortRef::new(self.dpid, self.desc.port_no)
    }

    pub fn is_enabled(&self) -> bool {
        self.desc.is_enabled()
    }

    pub fn set_ovx_port(&mut self, tenant: TenantId, link_id: u32, vport: PortRef) {
        self.ovx_ports
            .entry(tenant)
            .or_default()
            .insert(link_id, vport);
    }

    pub fn get_ovx_port(&self, tenant: TenantId, link_id: u32) -> Option<PortRef> {
        self.ovx_ports.get(&tenant)?.get(&link_id).copied()
    }

    pub fn remove_ovx_port(&mut self, tenant: TenantId, link_id: u32) {
        if let Some(ports) = self.ovx_ports.get_mut(&tenant) {
            ports.remove(&link_id);
            if ports.is_empty() {
                self.ovx_ports.remove(&tenant);
            }
        }
    }

    /// Every virtual port bound here, with its tenant.
    pub fn ovx_ports(&self) -> Vec<(TenantId, PortRef)> {
        self.ovx_ports
            .iter()
            .flat_map(|(t, ports)| ports.values().map(move |p| (*t, *p)))
            .collect()
    }

    pub fn has_ovx_ports(&self) -> bool {
        !self.ovx_ports.is_empty()
    }
}

/// A port of a virtual switch.  It always stands for exactly one physical
/// port, named by `phys`.
#[derive(Clone, Debug)]
pub struct OvxPort {
    pub tenant: TenantId,
    pub vdpid: Dpid,
    pub port_no: PortNo,
    pub phys: PortRef,
    pub is_edge: bool,
    pub active: bool,
    /// Set when the port is an endpoint of a virtual link.
    pub link_id: Option<u32>,
    pub desc: PhyPort,
}

impl OvxPort {
    pub fn new(
        tenant: TenantId,
        vdpid: Dpid,
        port_no: PortNo,
        phys: PortRef,
        hw_addr: MacAddr,
    ) -> Self {
        let mut desc = PhyPort::new(port_no, hw_addr, format!("vport-{port_no}"));
        desc.config = OFPPC_NO_STP;
        desc.state = OFPPS_LINK_DOWN;
        desc.curr = OFPPF_1GB_FD | OFPPF_COPPER;
        desc.advertised =
            OFPPF_10MB_FD | OFPPF_100MB_FD | OFPPF_1GB_FD | OFPPF_COPPER;
        desc.supported = OFPPF_10MB_HD
            | OFPPF_10MB_FD
            | OFPPF_100MB_HD
            | OFPPF_100MB_FD
            | OFPPF_1GB_HD
            | OFPPF_1GB_FD
            | OFPPF_COPPER;
        desc.peer = desc.supported
            | OFPPF_10GB_FD
            | OFPPF_FIBER
            | OFPPF_PAUSE
            | OFPPF_PAUSE_ASYM;
        OvxPort {
            tenant,
            vdpid,
            port_no,
            phys,
            is_edge: true,
            active: false,
            link_id: None,
            desc,
        }
    }

    pub fn port_ref(&self) -> PortRef {
        PortRef::new(self.vdpid, self.port_no)
    }

    pub fn is_link(&self) -> bool {
        self.link_id.is_some()
    }

    /// Returns false if the port was already up.
    pub fn boot(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        self.desc.state = OFPPS_STP_FORWARD;
        true
    }

    /// Returns false if the port was already down.
    pub fn tear_down(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.desc.state = OFPPS_LINK_DOWN;
        true
    }

    pub fn is_admin_down(&self) -> bool {
        self.desc.is_admin_down()
    }

    pub fn status(&self, reason: PortReason) -> PortStatus {
        PortStatus {
            reason,
            desc: self.desc.clone(),
        }
    }

    /// Take the operational bits of a changed physical port.
    pub fn apply_port_status(&mut self, phys: &PhyPort) {
        self.desc.config = phys.config;
        self.desc.state = phys.state;
        self.desc.peer = phys.peer;
    }
}
