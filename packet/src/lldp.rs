// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! LLDP TLVs, and the discovery probes the hypervisor sends out of every
//! physical port.
//!
//! A probe is a 128-byte LLDP frame whose system description TLV carries
//! the DPID of the switch it was sent from.  The chassis and port TLVs are
//! filled in the way most controllers expect (MAC-address chassis subtype,
//! port-component port subtype), and an OUI TLV tags it as ours.  When the
//! probe arrives in a PACKET_IN on a neighbouring switch, the fixed offsets
//! of the port number and DPID let us recover the sending end of the link
//! without a full LLDP parse.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::parse_error;
use crate::pbuf::ParseBuffer;
use crate::MacAddr;
use crate::PacketResult;
use crate::{ETHER_LLDP, ETHER_VLAN};

/// Destination address of every probe.
pub const LLDP_MULTICAST: MacAddr = MacAddr::new(0x01, 0x23, 0x20, 0, 0, 1);

pub const PROBE_LEN: usize = 128;
const PROBE_PAD: u32 = 0xcafebabe;
const PROBE_NAME: &str = "OpenVirteX";
const PROBE_PORT_OFFSET: usize = 26;
const PROBE_DPID_OFFSET: usize = 34;

pub const TLV_END: u8 = 0;
pub const TLV_CHASSIS_ID: u8 = 1;
pub const TLV_PORT_ID: u8 = 2;
pub const TLV_TTL: u8 = 3;
pub const TLV_SYSTEM_DESC: u8 = 6;
pub const TLV_ORG_SPECIFIC: u8 = 127;

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct LldpTlv {
    pub lldp_tlv_type: u8,  // 7 bits
    pub lldp_tlv_size: u16, // 9 bits
    pub lldp_tlv_octets: Vec<u8>,
}

impl LldpTlv {
    pub fn new(lldp_tlv_type: u8, lldp_tlv_octets: Vec<u8>) -> Self {
        LldpTlv {
            lldp_tlv_type,
            lldp_tlv_size: lldp_tlv_octets.len() as u16,
            lldp_tlv_octets,
        }
    }

    fn deparse_into(&self, v: &mut BytesMut) {
        v.put_u16(((self.lldp_tlv_type as u16) << 9) | self.lldp_tlv_size);
        v.put_slice(&self.lldp_tlv_octets);
    }

    fn parse(pb: &mut ParseBuffer) -> PacketResult<LldpTlv> {
        if pb.bytes_left() < 2 {
            return Err(parse_error(pb, "lldp tlv prefix too short"));
        }

        let ts = pb.get_u16()?;
        let lldp_tlv_type = (ts >> 9) as u8;
        let lldp_tlv_size = ts & 0x1ff;

        if lldp_tlv_size as usize > pb.bytes_left() {
            return Err(parse_error(pb, "lldp tlv too short"));
        }
        let lldp_tlv_octets = pb.get_bytes(lldp_tlv_size as usize)?;

        Ok(LldpTlv {
            lldp_tlv_type,
            lldp_tlv_size,
            lldp_tlv_octets,
        })
    }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct LldpHdr {
    pub lldp_data: Vec<LldpTlv>,
}

impl LldpHdr {
    pub fn size(&self) -> usize {
        self.lldp_data
            .iter()
            .map(|tlv| 2 + tlv.lldp_tlv_size as usize)
            .sum()
    }

    /// Parse the TLVs of an LLDPDU, stopping at the end TLV.
    pub fn parse(pb: &mut ParseBuffer) -> PacketResult<LldpHdr> {
        let mut lldp_data = Vec::new();

        let mut done = false;
        while !done && pb.bytes_left() > 0 {
            let tlv = LldpTlv::parse(pb)?;
            done = tlv.lldp_tlv_size == 0 || tlv.lldp_tlv_type == TLV_END;
            lldp_data.push(tlv);
        }

        if lldp_data.is_empty() {
            Err(parse_error(pb, "lldp packet has no data"))
        } else {
            Ok(LldpHdr { lldp_data })
        }
    }

    pub fn deparse_into(&self, v: &mut BytesMut) {
        for tlv in &self.lldp_data {
            tlv.deparse_into(v);
        }
    }
}

impl fmt::Display for LldpHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LLDP packet")?;
        for tlv in &self.lldp_data {
            write!(
                f,
                "  tlv ({}), size {}: {:?}",
                tlv.lldp_tlv_type, tlv.lldp_tlv_size, tlv.lldp_tlv_octets
            )?;
        }
        Ok(())
    }
}

/// The sending end of a link, as recovered from a received probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProbeOrigin {
    pub dpid: u64,
    pub port: u16,
}

/// Return true if `data` is an LLDP frame, possibly behind one 802.1Q tag.
pub fn is_lldp(data: &[u8]) -> bool {
    let mut pb = ParseBuffer::new_from_slice(data);
    if pb.seek(12).is_err() {
        return false;
    }
    let mut ether_type = match pb.get_u16() {
        Ok(t) => t,
        Err(_) => return false,
    };
    if ether_type == ETHER_VLAN {
        ether_type = match pb.advance_bytes(2).and_then(|_| pb.get_u16()) {
            Ok(t) => t,
            Err(_) => return false,
        };
    }
    ether_type == ETHER_LLDP
}

/// Build the probe sent out of port `port` of switch `dpid`, whose hardware
/// address is `hw_addr`.
pub fn make_probe(hw_addr: MacAddr, port: u16, dpid: u64) -> Vec<u8> {
    let mut chassis = vec![4u8];
    chassis.extend_from_slice(&hw_addr.octets());
    let mut port_id = vec![2u8];
    port_id.extend_from_slice(&port.to_be_bytes());

    let mut oui = common::OVX_OUI.to_be_bytes()[1..].to_vec();
    oui.push(1);
    oui.extend_from_slice(PROBE_NAME.as_bytes());
    oui.push(PROBE_NAME.len() as u8);

    let hdr = LldpHdr {
        lldp_data: vec![
            LldpTlv::new(TLV_CHASSIS_ID, chassis),
            LldpTlv::new(TLV_PORT_ID, port_id),
            LldpTlv::new(TLV_TTL, 120u16.to_be_bytes().to_vec()),
            LldpTlv::new(TLV_SYSTEM_DESC, dpid.to_be_bytes().to_vec()),
            LldpTlv::new(TLV_ORG_SPECIFIC, oui),
            LldpTlv::new(TLV_END, Vec::new()),
        ],
    };

    let mut v = BytesMut::with_capacity(PROBE_LEN);
    v.put_slice(&LLDP_MULTICAST.octets());
    v.put_slice(&hw_addr.octets());
    v.put_u16(ETHER_LLDP);
    hdr.deparse_into(&mut v);
    while v.len() + 4 <= PROBE_LEN {
        v.put_u32(PROBE_PAD);
    }
    v.resize(PROBE_LEN, 0);
    v.to_vec()
}

/// Recover the origin of a probe built by [`make_probe`].  Returns `None`
/// for any other frame.
pub fn parse_probe(data: &[u8]) -> Option<ProbeOrigin> {
    let mut pb = ParseBuffer::new_from_slice(data);
    if pb.get_mac().ok()? != LLDP_MULTICAST {
        return None;
    }
    pb.seek(12).ok()?;
    let mut vlan_offset = 0;
    let mut ether_type = pb.get_u16().ok()?;
    while ether_type == ETHER_VLAN {
        vlan_offset += 4;
        pb.advance_bytes(2).ok()?;
        ether_type = pb.get_u16().ok()?;
    }
    if ether_type != ETHER_LLDP {
        return None;
    }
    pb.seek(PROBE_PORT_OFFSET + vlan_offset).ok()?;
    let port = pb.get_u16().ok()?;
    pb.seek(PROBE_DPID_OFFSET + vlan_offset).ok()?;
    let dpid = pb.get_u64().ok()?;
    Some(ProbeOrigin { dpid, port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lldp_parse() {
        let bytes = hex!(
            "
            0207 0400 0743 6cf0 d704 0703 0007 436c
            f0d7 0602 0078 fe19 0080 c209 8000 0100
            0032 3200 0000 0000 0002 0202 0202 0202
            02fe 0600 80c2 0b88 08fe 0500 80c2 0c00
            0000
        "
        );

        let mut pb = ParseBuffer::new_from_slice(&bytes);
        let hdr = LldpHdr::parse(&mut pb).unwrap();
        assert_eq!(hdr.lldp_data.len(), 7);
        assert_eq!(hdr.size(), bytes.len());

        let expected = [
            (1, 7),    // chassis ID
            (2, 7),    // port ID ID
            (3, 2),    // ttl
            (127, 25), // ETS config
            (127, 6),  // flow control
            (127, 5),  // application protocl
            (0, 0),    // end of LLDPU
        ];

        for (idx, case) in expected.iter().enumerate() {
            assert_eq!(hdr.lldp_data[idx].lldp_tlv_type, case.0);
            assert_eq!(hdr.lldp_data[idx].lldp_tlv_size, case.1);
        }
    }

    #[test]
    fn test_probe_layout() {
        let mac = MacAddr::new(0, 0, 0, 0, 0, 0x11);
        let probe = make_probe(mac, 3, 0x0102);
        assert_eq!(probe.len(), PROBE_LEN);
        assert_eq!(&probe[14..17], &[0x02, 0x07, 0x04]);
        assert_eq!(&probe[23..26], &[0x04, 0x03, 0x02]);
        assert_eq!(&probe[28..32], &[0x06, 0x02, 0x00, 0x78]);
        assert_eq!(&probe[32..34], &[0x0c, 0x08]);
        // OUI TLV: type 127, length 4 + "OpenVirteX" + name length
        assert_eq!(&probe[42..48], &[0xfe, 0x0f, 0xa4, 0x23, 0x05, 0x01]);
        assert_eq!(probe[58], 10);
        assert_eq!(&probe[59..61], &[0, 0]);
        assert_eq!(&probe[61..65], &[0xca, 0xfe, 0xba, 0xbe]);
        assert!(is_lldp(&probe));
    }

    #[test]
    fn test_probe_origin() {
        let probe = make_probe(MacAddr::new(0, 0, 0, 0, 0, 1), 7, u64::MAX);
        assert_eq!(
            parse_probe(&probe),
            Some(ProbeOrigin {
                dpid: u64::MAX,
                port: 7
            })
        );

        // Same probe behind an 802.1Q tag.
        let mut tagged = probe[..12].to_vec();
        tagged.extend_from_slice(&[0x81, 0x00, 0x00, 0x05]);
        tagged.extend_from_slice(&probe[12..]);
        assert!(is_lldp(&tagged));
        assert_eq!(parse_probe(&tagged).map(|o| o.port), Some(7));
    }

    #[test]
    fn test_not_a_probe() {
        let mut probe = make_probe(MacAddr::new(0, 0, 0, 0, 0, 1), 7, 9);
        probe[12] = 0x08;
        probe[13] = 0x00;
        assert!(!is_lldp(&probe));
        assert_eq!(parse_probe(&probe), None);
        assert!(!is_lldp(&[0u8; 8]));

        let mut other = make_probe(MacAddr::new(0, 0, 0, 0, 0, 1), 7, 9);
        other[0] = 0x02;
        assert!(is_lldp(&other));
        assert_eq!(parse_probe(&other), None);
    }
}
