// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use common::network::MacAddr;

/// Highest number of a real port.
pub const OFPP_MAX: u16 = 0xff00;
pub const OFPP_IN_PORT: u16 = 0xfff8;
pub const OFPP_TABLE: u16 = 0xfff9;
pub const OFPP_NORMAL: u16 = 0xfffa;
pub const OFPP_FLOOD: u16 = 0xfffb;
pub const OFPP_ALL: u16 = 0xfffc;
pub const OFPP_CONTROLLER: u16 = 0xfffd;
pub const OFPP_LOCAL: u16 = 0xfffe;
pub const OFPP_NONE: u16 = 0xffff;

pub const OFPPC_PORT_DOWN: u32 = 1 << 0;
pub const OFPPC_NO_STP: u32 = 1 << 1;
pub const OFPPC_NO_RECV: u32 = 1 << 2;
pub const OFPPC_NO_RECV_STP: u32 = 1 << 3;
pub const OFPPC_NO_FLOOD: u32 = 1 << 4;
pub const OFPPC_NO_FWD: u32 = 1 << 5;
pub const OFPPC_NO_PACKET_IN: u32 = 1 << 6;

pub const OFPPS_LINK_DOWN: u32 = 1 << 0;
pub const OFPPS_STP_FORWARD: u32 = 2 << 8;

pub const OFPPF_10MB_HD: u32 = 1 << 0;
pub const OFPPF_10MB_FD: u32 = 1 << 1;
pub const OFPPF_100MB_HD: u32 = 1 << 2;
pub const OFPPF_100MB_FD: u32 = 1 << 3;
pub const OFPPF_1GB_HD: u32 = 1 << 4;
pub const OFPPF_1GB_FD: u32 = 1 << 5;
pub const OFPPF_10GB_FD: u32 = 1 << 6;
pub const OFPPF_COPPER: u32 = 1 << 7;
pub const OFPPF_FIBER: u32 = 1 << 8;
pub const OFPPF_PAUSE: u32 = 1 << 10;
pub const OFPPF_PAUSE_ASYM: u32 = 1 << 11;

pub const OFP_MAX_PORT_NAME_LEN: usize = 16;
pub const OFP_PHY_PORT_LEN: usize = 48;

/// Description of a port, as carried in FEATURES_REPLY and PORT_STATUS.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhyPort {
    pub port_no: u16,
    pub hw_addr: MacAddr,
    pub name: String,
    pub config: u32,
    pub state: u32,
    pub curr: u32,
    pub advertised: u32,
    pub supported: u32,
    pub peer: u32,
}

impl PhyPort {
    pub fn new(port_no: u16, hw_addr: MacAddr, name: impl ToString) -> Self {
        PhyPort {
            port_no,
            hw_addr,
            name: name.to_string(),
            config: 0,
            state: 0,
            curr: 0,
            advertised: 0,
            supported: 0,
            peer: 0,
        }
    }

    pub fn is_link_down(&self) -> bool {
        self.state & OFPPS_LINK_DOWN != 0
    }

    pub fn set_link_down(&mut self, down: bool) {
        if down {
            self.state |= OFPPS_LINK_DOWN;
        } else {
            self.state &= !OFPPS_LINK_DOWN;
        }
    }

    pub fn is_admin_down(&self) -> bool {
        self.config & OFPPC_PORT_DOWN != 0
    }

    /// A port carries traffic if it is neither administratively down nor
    /// without link.
    pub fn is_enabled(&self) -> bool {
        !self.is_admin_down() && !self.is_link_down()
    }
}

/// True for the numbers of real ports, as opposed to the reserved ones.
pub fn is_physical(port_no: u16) -> bool {
    port_no > 0 && port_no < OFPP_MAX
}
