// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Typed OpenFlow 1.0 messages and their wire encoding.

pub mod action;
pub mod codec;
pub mod message;
pub mod ofmatch;
pub mod port;
pub mod stats;

pub use action::Action;
pub use codec::read_message;
pub use codec::write_message;
pub use message::*;
pub use ofmatch::Match;
pub use ofmatch::MatchRelation;
pub use port::PhyPort;
pub use stats::*;

pub const OFP_VERSION: u8 = 0x01;
pub const OFP_HEADER_LEN: usize = 8;
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;
pub const OFP_DEFAULT_MISS_SEND_LEN: u16 = 128;
/// Largest message we are willing to buffer.
pub const OFP_MAX_MSG_LEN: usize = 0xffff;

#[derive(Debug, thiserror::Error)]
pub enum OfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported OpenFlow version {0:#x}")]
    BadVersion(u8),
    #[error("unknown message type {0}")]
    BadType(u8),
    #[error("message truncated: {0}")]
    Truncated(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("connection closed by peer")]
    Closed,
}

pub type OfResult<T> = Result<T, OfError>;

#[repr(u8)]
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    strum::FromRepr,
    strum::Display,
)]
pub enum OfType {
    Hello = 0,
    Error = 1,
    EchoRequest = 2,
    EchoReply = 3,
    Vendor = 4,
    FeaturesRequest = 5,
    FeaturesReply = 6,
    GetConfigRequest = 7,
    GetConfigReply = 8,
    SetConfig = 9,
    PacketIn = 10,
    FlowRemoved = 11,
    PortStatus = 12,
    PacketOut = 13,
    FlowMod = 14,
    PortMod = 15,
    StatsRequest = 16,
    StatsReply = 17,
    BarrierRequest = 18,
    BarrierReply = 19,
    QueueGetConfigRequest = 20,
    QueueGetConfigReply = 21,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OfBody {
    Hello,
    Error(ErrorMsg),
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    Vendor(Vendor),
    FeaturesRequest,
    FeaturesReply(FeaturesReply),
    GetConfigRequest,
    GetConfigReply(SwitchConfig),
    SetConfig(SwitchConfig),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PortStatus(PortStatus),
    PacketOut(PacketOut),
    FlowMod(FlowMod),
    PortMod(PortMod),
    StatsRequest(StatsRequest),
    StatsReply(StatsReply),
    BarrierRequest,
    BarrierReply,
    QueueGetConfigRequest { port: u16 },
    QueueGetConfigReply(QueueGetConfigReply),
}

/// A message with its transaction id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OfMessage {
    pub xid: u32,
    pub body: OfBody,
}

impl OfMessage {
    pub fn new(xid: u32, body: OfBody) -> Self {
        OfMessage { xid, body }
    }

    pub fn of_type(&self) -> OfType {
        match &self.body {
            OfBody::Hello => OfType::Hello,
            OfBody::Error(_) => OfType::Error,
            OfBody::EchoRequest(_) => OfType::EchoRequest,
            OfBody::EchoReply(_) => OfType::EchoReply,
            OfBody::Vendor(_) => OfType::Vendor,
            OfBody::FeaturesRequest => OfType::FeaturesRequest,
            OfBody::FeaturesReply(_) => OfType::FeaturesReply,
            OfBody::GetConfigRequest => OfType::GetConfigRequest,
            OfBody::GetConfigReply(_) => OfType::GetConfigReply,
            OfBody::SetConfig(_) => OfType::SetConfig,
            OfBody::PacketIn(_) => OfType::PacketIn,
            OfBody::FlowRemoved(_) => OfType::FlowRemoved,
            OfBody::PortStatus(_) => OfType::PortStatus,
            OfBody::PacketOut(_) => OfType::PacketOut,
            OfBody::FlowMod(_) => OfType::FlowMod,
            OfBody::PortMod(_) => OfType::PortMod,
            OfBody::StatsRequest(_) => OfType::StatsRequest,
            OfBody::StatsReply(_) => OfType::StatsReply,
            OfBody::BarrierRequest => OfType::BarrierRequest,
            OfBody::BarrierReply => OfType::BarrierReply,
            OfBody::QueueGetConfigRequest { .. } => {
                OfType::QueueGetConfigRequest
            }
            OfBody::QueueGetConfigReply(_) => OfType::QueueGetConfigReply,
        }
    }

    /// Build an error reply to this message, quoting its first 64 bytes.
    pub fn error_reply(&self, err_type: u16, code: u16) -> OfMessage {
        let mut data = self.encode();
        data.truncate(64);
        OfMessage::new(
            self.xid,
            OfBody::Error(ErrorMsg::new(err_type, code, data)),
        )
    }
}
