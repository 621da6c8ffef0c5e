// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::net::Ipv4Addr;

use crate::parse_error;
use crate::pbuf::ParseBuffer;
use crate::MacAddr;
use crate::PacketError;
use crate::PacketResult;
use crate::{ETHER_ARP, ETHER_IPV4, ETHER_VLAN};
use crate::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};

/// VLAN id used by OpenFlow 1.0 to mean "no 802.1Q header".
pub const VLAN_NONE: u16 = 0xffff;

/// The header fields of a frame that an OpenFlow 1.0 match can describe.
/// Fields absent from the frame are left zeroed, as a switch would.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameSummary {
    pub dl_dst: MacAddr,
    pub dl_src: MacAddr,
    pub dl_vlan: u16,
    pub dl_vlan_pcp: u8,
    pub dl_type: u16,
    pub nw_tos: u8,
    pub nw_proto: u8,
    pub nw_src: Ipv4Addr,
    pub nw_dst: Ipv4Addr,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl Default for FrameSummary {
    fn default() -> Self {
        FrameSummary {
            dl_dst: MacAddr::ZERO,
            dl_src: MacAddr::ZERO,
            dl_vlan: VLAN_NONE,
            dl_vlan_pcp: 0,
            dl_type: 0,
            nw_tos: 0,
            nw_proto: 0,
            nw_src: Ipv4Addr::UNSPECIFIED,
            nw_dst: Ipv4Addr::UNSPECIFIED,
            tp_src: 0,
            tp_dst: 0,
        }
    }
}

impl FrameSummary {
    /// Summarize an Ethernet frame.  Only the Ethernet header must be
    /// present; a truncated L3 or L4 header leaves those fields zeroed.
    pub fn parse(data: &[u8]) -> PacketResult<FrameSummary> {
        let mut pb = ParseBuffer::new_from_slice(data);
        if pb.bytes_left() < 14 {
            return Err(parse_error(&pb, "frame shorter than ethernet header"));
        }
        let dl_dst = pb.get_mac()?;
        let dl_src = pb.get_mac()?;
        let mut dl_type = pb.get_u16()?;
        let mut dl_vlan = VLAN_NONE;
        let mut dl_vlan_pcp = 0;
        if dl_type == ETHER_VLAN {
            let tci = pb.get_u16()?;
            dl_vlan = tci & 0x0fff;
            dl_vlan_pcp = (tci >> 13) as u8;
            dl_type = pb.get_u16()?;
        }

        let mut s = FrameSummary {
            dl_dst,
            dl_src,
            dl_vlan,
            dl_vlan_pcp,
            dl_type,
            ..Default::default()
        };
        match dl_type {
            ETHER_IPV4 => {
                let _ = s.parse_ipv4(&mut pb);
            }
            ETHER_ARP => {
                let _ = s.parse_arp(&mut pb);
            }
            _ => {}
        }
        Ok(s)
    }

    fn parse_ipv4(&mut self, pb: &mut ParseBuffer) -> PacketResult<()> {
        let start = pb.offset();
        let ver_ihl = pb.get_u8()?;
        let ihl = (ver_ihl & 0x0f) as usize * 4;
        self.nw_tos = pb.get_u8()? >> 2;
        pb.advance_bytes(4)?;
        let frag = pb.get_u16()?;
        pb.seek(start + 9)?;
        self.nw_proto = pb.get_u8()?;
        pb.advance_bytes(2)?;
        self.nw_src = pb.get_ipv4()?;
        self.nw_dst = pb.get_ipv4()?;

        // Non-initial fragments have no L4 header.
        if frag & 0x1fff != 0 {
            return Ok(());
        }
        pb.seek(start + ihl)?;
        match self.nw_proto {
            IPPROTO_TCP | IPPROTO_UDP => {
                self.tp_src = pb.get_u16()?;
                self.tp_dst = pb.get_u16()?;
            }
            IPPROTO_ICMP => {
                self.tp_src = pb.get_u8()? as u16;
                self.tp_dst = pb.get_u8()? as u16;
            }
            _ => {}
        }
        Ok(())
    }

    fn parse_arp(&mut self, pb: &mut ParseBuffer) -> PacketResult<()> {
        pb.advance_bytes(6)?;
        self.nw_proto = (pb.get_u16()? & 0xff) as u8;
        pb.advance_bytes(6)?;
        self.nw_src = pb.get_ipv4()?;
        pb.advance_bytes(6)?;
        self.nw_dst = pb.get_ipv4()?;
        Ok(())
    }
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} type {:#06x} {} -> {}",
            self.dl_src, self.dl_dst, self.dl_type, self.nw_src, self.nw_dst
        )
    }
}

/// Overwrite the Ethernet source and destination addresses of a frame.
pub fn set_macs(
    data: &mut [u8],
    src: MacAddr,
    dst: MacAddr,
) -> PacketResult<()> {
    if data.len() < 12 {
        return Err(PacketError::Invalid(
            "frame shorter than ethernet addresses".to_string(),
        ));
    }
    data[0..6].copy_from_slice(&dst.octets());
    data[6..12].copy_from_slice(&src.octets());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use pretty_assertions::assert_eq;

    // dst 00:00:00:00:00:02, src 00:00:00:00:00:01, IPv4/UDP
    // 10.0.0.1:1234 -> 10.0.0.2:53
    const UDP_FRAME: [u8; 42] = hex!(
        "
        0000 0000 0002 0000 0000 0001 0800 4500
        001c 0000 4000 4011 0000 0a00 0001 0a00
        0002 04d2 0035 0008 0000
    "
    );

    #[test]
    fn test_parse_udp() {
        let s = FrameSummary::parse(&UDP_FRAME).unwrap();
        assert_eq!(s.dl_src, MacAddr::new(0, 0, 0, 0, 0, 1));
        assert_eq!(s.dl_dst, MacAddr::new(0, 0, 0, 0, 0, 2));
        assert_eq!(s.dl_vlan, VLAN_NONE);
        assert_eq!(s.dl_type, ETHER_IPV4);
        assert_eq!(s.nw_proto, IPPROTO_UDP);
        assert_eq!(s.nw_src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(s.nw_dst, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(s.tp_src, 1234);
        assert_eq!(s.tp_dst, 53);
    }

    #[test]
    fn test_parse_vlan_arp() {
        let frame = hex!(
            "
            ffff ffff ffff 0000 0000 0001 8100 2005
            0806 0001 0800 0604 0001 0000 0000 0001
            0a00 0001 0000 0000 0000 0a00 0002
        "
        );
        let s = FrameSummary::parse(&frame).unwrap();
        assert_eq!(s.dl_vlan, 5);
        assert_eq!(s.dl_vlan_pcp, 1);
        assert_eq!(s.dl_type, ETHER_ARP);
        assert_eq!(s.nw_proto, 1);
        assert_eq!(s.nw_src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(s.nw_dst, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_truncated() {
        assert!(FrameSummary::parse(&UDP_FRAME[..10]).is_err());
        // A short L3 header leaves the L3 fields unset.
        let s = FrameSummary::parse(&UDP_FRAME[..20]).unwrap();
        assert_eq!(s.nw_src, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_set_macs() {
        let mut frame = UDP_FRAME;
        let src = MacAddr::new(0xa4, 0x23, 0x05, 1, 0, 0);
        let dst = MacAddr::new(0xa4, 0x23, 0x05, 0, 1, 1);
        set_macs(&mut frame, src, dst).unwrap();
        let s = FrameSummary::parse(&frame).unwrap();
        assert_eq!(s.dl_src, src);
        assert_eq!(s.dl_dst, dst);
        assert!(set_macs(&mut [0u8; 4], src, dst).is_err());
    }
}
