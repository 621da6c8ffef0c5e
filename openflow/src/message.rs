// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use common::network::MacAddr;

use crate::action::Action;
use crate::ofmatch::Match;
use crate::port::PhyPort;
use crate::port::OFPP_NONE;
use crate::OFP_NO_BUFFER;

pub const OFPET_HELLO_FAILED: u16 = 0;
pub const OFPET_BAD_REQUEST: u16 = 1;
pub const OFPET_BAD_ACTION: u16 = 2;
pub const OFPET_FLOW_MOD_FAILED: u16 = 3;
pub const OFPET_PORT_MOD_FAILED: u16 = 4;
pub const OFPET_QUEUE_OP_FAILED: u16 = 5;

pub const OFPBRC_BAD_VERSION: u16 = 0;
pub const OFPBRC_BAD_TYPE: u16 = 1;
pub const OFPBRC_BAD_STAT: u16 = 2;
pub const OFPBRC_BAD_VENDOR: u16 = 3;
pub const OFPBRC_EPERM: u16 = 5;
pub const OFPBRC_BUFFER_UNKNOWN: u16 = 8;

pub const OFPBAC_BAD_TYPE: u16 = 0;
pub const OFPBAC_BAD_OUT_PORT: u16 = 4;
pub const OFPBAC_BAD_ARGUMENT: u16 = 5;
pub const OFPBAC_EPERM: u16 = 6;

pub const OFPFMFC_ALL_TABLES_FULL: u16 = 0;
pub const OFPFMFC_OVERLAP: u16 = 1;
pub const OFPFMFC_EPERM: u16 = 2;
pub const OFPFMFC_BAD_COMMAND: u16 = 4;

pub const OFPPMFC_BAD_PORT: u16 = 0;

pub const OFPFF_SEND_FLOW_REM: u16 = 1 << 0;
pub const OFPFF_CHECK_OVERLAP: u16 = 1 << 1;
pub const OFPFF_EMERG: u16 = 1 << 2;

pub const OFPR_NO_MATCH: u8 = 0;
pub const OFPR_ACTION: u8 = 1;

pub const OFPRR_IDLE_TIMEOUT: u8 = 0;
pub const OFPRR_HARD_TIMEOUT: u8 = 1;
pub const OFPRR_DELETE: u8 = 2;

pub const OFPC_FLOW_STATS: u32 = 1 << 0;
pub const OFPC_TABLE_STATS: u32 = 1 << 1;
pub const OFPC_PORT_STATS: u32 = 1 << 2;
pub const OFPC_ARP_MATCH_IP: u32 = 1 << 7;

pub const OFPC_FRAG_NORMAL: u16 = 0;

/// Bitmap of every OpenFlow 1.0 action type except vendor actions.
pub const OFP_ALL_ACTIONS: u32 = (1 << 12) - 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorMsg {
    pub err_type: u16,
    pub code: u16,
    /// At least the first 64 bytes of the offending message.
    pub data: Vec<u8>,
}

impl ErrorMsg {
    pub fn new(err_type: u16, code: u16, data: Vec<u8>) -> Self {
        ErrorMsg {
            err_type,
            code,
            data,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Vendor {
    pub vendor: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FeaturesReply {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub capabilities: u32,
    pub actions: u32,
    pub ports: Vec<PhyPort>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwitchConfig {
    pub flags: u16,
    pub miss_send_len: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketIn {
    pub buffer_id: u32,
    pub total_len: u16,
    pub in_port: u16,
    pub reason: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: u16,
    pub actions: Vec<Action>,
    pub data: Vec<u8>,
}

impl PacketOut {
    /// An unbuffered packet-out carrying `data`.
    pub fn new(data: Vec<u8>, actions: Vec<Action>) -> Self {
        PacketOut {
            buffer_id: OFP_NO_BUFFER,
            in_port: OFPP_NONE,
            actions,
            data,
        }
    }
}

#[repr(u16)]
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, strum::FromRepr, strum::Display,
)]
pub enum FlowModCommand {
    Add = 0,
    Modify = 1,
    ModifyStrict = 2,
    Delete = 3,
    DeleteStrict = 4,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowMod {
    pub ofmatch: Match,
    pub cookie: u64,
    pub command: FlowModCommand,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: u16,
    pub flags: u16,
    pub actions: Vec<Action>,
}

impl FlowMod {
    pub fn new(command: FlowModCommand, ofmatch: Match) -> Self {
        FlowMod {
            ofmatch,
            cookie: 0,
            command,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: 0x8000,
            buffer_id: OFP_NO_BUFFER,
            out_port: OFPP_NONE,
            flags: 0,
            actions: Vec::new(),
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowRemoved {
    pub ofmatch: Match,
    pub cookie: u64,
    pub priority: u16,
    pub reason: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, strum::FromRepr, strum::Display,
)]
pub enum PortReason {
    Add = 0,
    Delete = 1,
    Modify = 2,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PhyPort,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortMod {
    pub port_no: u16,
    pub hw_addr: MacAddr,
    pub config: u32,
    pub mask: u32,
    pub advertise: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueGetConfigReply {
    pub port: u16,
    /// Queue descriptions, passed through undecoded.
    pub queues: Vec<u8>,
}
