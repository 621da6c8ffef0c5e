// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Just enough packet handling for the hypervisor's data-path carve-outs:
//! summarizing the headers of frames carried in PACKET_IN messages,
//! rewriting their MAC and IPv4 addresses, and building and recognizing LLDP
//! discovery probes.

pub use common::network::MacAddr;

pub mod eth;
pub mod lldp;
pub mod pbuf;
pub mod rewrite;

pub const ETHER_IPV4: u16 = 0x0800;
pub const ETHER_ARP: u16 = 0x0806;
pub const ETHER_VLAN: u16 = 0x8100;
pub const ETHER_LLDP: u16 = 0x88cc;
pub const ETHER_BDDP: u16 = 0x8942;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("parse error at byte {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("invalid packet: {0}")]
    Invalid(String),
}

pub type PacketResult<T> = Result<T, PacketError>;

pub fn parse_error(
    pb: &pbuf::ParseBuffer,
    message: impl ToString,
) -> PacketError {
    PacketError::Parse {
        offset: pb.offset(),
        message: message.to_string(),
    }
}
