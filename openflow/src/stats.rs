// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use crate::action::Action;
use crate::ofmatch::Match;

pub const OFPST_DESC: u16 = 0;
pub const OFPST_FLOW: u16 = 1;
pub const OFPST_AGGREGATE: u16 = 2;
pub const OFPST_TABLE: u16 = 3;
pub const OFPST_PORT: u16 = 4;
pub const OFPST_QUEUE: u16 = 5;
pub const OFPST_VENDOR: u16 = 0xffff;

pub const OFPSF_REPLY_MORE: u16 = 1;

pub const DESC_STR_LEN: usize = 256;
pub const SERIAL_NUM_LEN: usize = 32;
pub const OFP_MAX_TABLE_NAME_LEN: usize = 32;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowStatsRequest {
    pub ofmatch: Match,
    pub table_id: u8,
    pub out_port: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StatsRequestBody {
    Desc,
    Flow(FlowStatsRequest),
    Aggregate(FlowStatsRequest),
    Table,
    Port { port_no: u16 },
    Queue { port_no: u16, queue_id: u32 },
    Vendor { vendor: u32, data: Vec<u8> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatsRequest {
    pub flags: u16,
    pub body: StatsRequestBody,
}

impl StatsRequest {
    pub fn new(body: StatsRequestBody) -> Self {
        StatsRequest { flags: 0, body }
    }

    pub fn stats_type(&self) -> u16 {
        match self.body {
            StatsRequestBody::Desc => OFPST_DESC,
            StatsRequestBody::Flow(_) => OFPST_FLOW,
            StatsRequestBody::Aggregate(_) => OFPST_AGGREGATE,
            StatsRequestBody::Table => OFPST_TABLE,
            StatsRequestBody::Port { .. } => OFPST_PORT,
            StatsRequestBody::Queue { .. } => OFPST_QUEUE,
            StatsRequestBody::Vendor { .. } => OFPST_VENDOR,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescStats {
    pub mfr_desc: String,
    pub hw_desc: String,
    pub sw_desc: String,
    pub serial_num: String,
    pub dp_desc: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowStats {
    pub table_id: u8,
    pub ofmatch: Match,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub actions: Vec<Action>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AggregateStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub flow_count: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableStats {
    pub table_id: u8,
    pub name: String,
    pub wildcards: u32,
    pub max_entries: u32,
    pub active_count: u32,
    pub lookup_count: u64,
    pub matched_count: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PortStats {
    pub port_no: u16,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_frame_err: u64,
    pub rx_over_err: u64,
    pub rx_crc_err: u64,
    pub collisions: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueueStats {
    pub port_no: u16,
    pub queue_id: u32,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StatsReplyBody {
    Desc(DescStats),
    Flow(Vec<FlowStats>),
    Aggregate(AggregateStats),
    Table(Vec<TableStats>),
    Port(Vec<PortStats>),
    Queue(Vec<QueueStats>),
    Vendor { vendor: u32, data: Vec<u8> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatsReply {
    pub flags: u16,
    pub body: StatsReplyBody,
}

impl StatsReply {
    pub fn stats_type(&self) -> u16 {
        match self.body {
            StatsReplyBody::Desc(_) => OFPST_DESC,
            StatsReplyBody::Flow(_) => OFPST_FLOW,
            StatsReplyBody::Aggregate(_) => OFPST_AGGREGATE,
            StatsReplyBody::Table(_) => OFPST_TABLE,
            StatsReplyBody::Port(_) => OFPST_PORT,
            StatsReplyBody::Queue(_) => OFPST_QUEUE,
            StatsReplyBody::Vendor { .. } => OFPST_VENDOR,
        }
    }
}
