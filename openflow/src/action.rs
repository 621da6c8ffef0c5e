// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::net::Ipv4Addr;

use common::network::MacAddr;

pub const OFPAT_OUTPUT: u16 = 0;
pub const OFPAT_SET_VLAN_VID: u16 = 1;
pub const OFPAT_SET_VLAN_PCP: u16 = 2;
pub const OFPAT_STRIP_VLAN: u16 = 3;
pub const OFPAT_SET_DL_SRC: u16 = 4;
pub const OFPAT_SET_DL_DST: u16 = 5;
pub const OFPAT_SET_NW_SRC: u16 = 6;
pub const OFPAT_SET_NW_DST: u16 = 7;
pub const OFPAT_SET_NW_TOS: u16 = 8;
pub const OFPAT_SET_TP_SRC: u16 = 9;
pub const OFPAT_SET_TP_DST: u16 = 10;
pub const OFPAT_ENQUEUE: u16 = 11;
pub const OFPAT_VENDOR: u16 = 0xffff;

/// An OpenFlow 1.0 action.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    Output { port: u16, max_len: u16 },
    SetVlanVid(u16),
    SetVlanPcp(u8),
    StripVlan,
    SetDlSrc(MacAddr),
    SetDlDst(MacAddr),
    SetNwSrc(Ipv4Addr),
    SetNwDst(Ipv4Addr),
    SetNwTos(u8),
    SetTpSrc(u16),
    SetTpDst(u16),
    Enqueue { port: u16, queue_id: u32 },
    Vendor { vendor: u32, data: Vec<u8> },
}

impl Action {
    /// Output to `port`, sending whole packets if it is the controller.
    pub fn output(port: u16) -> Self {
        Action::Output {
            port,
            max_len: 0xffff,
        }
    }

    pub fn action_type(&self) -> u16 {
        match self {
            Action::Output { .. } => OFPAT_OUTPUT,
            Action::SetVlanVid(_) => OFPAT_SET_VLAN_VID,
            Action::SetVlanPcp(_) => OFPAT_SET_VLAN_PCP,
            Action::StripVlan => OFPAT_STRIP_VLAN,
            Action::SetDlSrc(_) => OFPAT_SET_DL_SRC,
            Action::SetDlDst(_) => OFPAT_SET_DL_DST,
            Action::SetNwSrc(_) => OFPAT_SET_NW_SRC,
            Action::SetNwDst(_) => OFPAT_SET_NW_DST,
            Action::SetNwTos(_) => OFPAT_SET_NW_TOS,
            Action::SetTpSrc(_) => OFPAT_SET_TP_SRC,
            Action::SetTpDst(_) => OFPAT_SET_TP_DST,
            Action::Enqueue { .. } => OFPAT_ENQUEUE,
            Action::Vendor { .. } => OFPAT_VENDOR,
        }
    }

    /// Encoded length in bytes, including the type/length header.
    pub fn wire_len(&self) -> usize {
        match self {
            Action::SetDlSrc(_) | Action::SetDlDst(_) => 16,
            Action::Enqueue { .. } => 16,
            Action::Vendor { data, .. } => (8 + data.len() + 7) & !7,
            _ => 8,
        }
    }

    /// The output port, if this action sends the packet somewhere.
    pub fn out_port(&self) -> Option<u16> {
        match self {
            Action::Output { port, .. } => Some(*port),
            Action::Enqueue { port, .. } => Some(*port),
            _ => None,
        }
    }
}

/// Total encoded length of an action list.
pub fn actions_len(actions: &[Action]) -> usize {
    actions.iter().map(Action::wire_len).sum()
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Output { port, .. } => write!(f, "output:{port}"),
            Action::SetVlanVid(v) => write!(f, "set_vlan_vid:{v}"),
            Action::SetVlanPcp(v) => write!(f, "set_vlan_pcp:{v}"),
            Action::StripVlan => write!(f, "strip_vlan"),
            Action::SetDlSrc(m) => write!(f, "set_dl_src:{m}"),
            Action::SetDlDst(m) => write!(f, "set_dl_dst:{m}"),
            Action::SetNwSrc(ip) => write!(f, "set_nw_src:{ip}"),
            Action::SetNwDst(ip) => write!(f, "set_nw_dst:{ip}"),
            Action::SetNwTos(t) => write!(f, "set_nw_tos:{t}"),
            Action::SetTpSrc(p) => write!(f, "set_tp_src:{p}"),
            Action::SetTpDst(p) => write!(f, "set_tp_dst:{p}"),
            Action::Enqueue { port, queue_id } => {
                write!(f, "enqueue:{port}:{queue_id}")
            }
            Action::Vendor { vendor, .. } => write!(f, "vendor:{vendor:#x}"),
        }
    }
}
