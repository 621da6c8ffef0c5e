// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! In-place rewriting of the network addresses carried by a frame.

use std::net::Ipv4Addr;

use crate::PacketError;
use crate::PacketResult;
use crate::{ETHER_ARP, ETHER_IPV4, ETHER_VLAN};
use crate::{IPPROTO_TCP, IPPROTO_UDP};

fn l3_offset(data: &[u8]) -> PacketResult<(u16, usize)> {
    if data.len() < 14 {
        return Err(PacketError::Invalid(
            "frame shorter than ethernet header".to_string(),
        ));
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    if ethertype != ETHER_VLAN {
        return Ok((ethertype, 14));
    }
    if data.len() < 18 {
        return Err(PacketError::Invalid("truncated 802.1Q tag".to_string()));
    }
    Ok((u16::from_be_bytes([data[16], data[17]]), 18))
}

fn ipv4_at(data: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[off], data[off + 1], data[off + 2], data[off + 3])
}

/// Replace the source and/or destination protocol address of an IPv4 or
/// ARP frame.  IPv4 header checksums, and TCP or UDP checksums when the
/// segment is complete, are recomputed.  Other ethertypes are left alone.
/// Returns whether anything was rewritten.
pub fn set_ipv4_addrs(
    data: &mut [u8],
    src: Option<Ipv4Addr>,
    dst: Option<Ipv4Addr>,
) -> PacketResult<bool> {
    let (ethertype, l3) = l3_offset(data)?;
    match ethertype {
        ETHER_IPV4 => set_ip_addrs(data, l3, src, dst),
        ETHER_ARP => set_arp_addrs(data, l3, src, dst),
        _ => Ok(false),
    }
}

/// The sender and target protocol addresses of an ARP frame, or the
/// source and destination of an IPv4 one.
pub fn ipv4_addrs(data: &[u8]) -> PacketResult<Option<(Ipv4Addr, Ipv4Addr)>> {
    let (ethertype, l3) = l3_offset(data)?;
    let (s, d) = match ethertype {
        ETHER_IPV4 => (l3 + 12, l3 + 16),
        ETHER_ARP => (l3 + 14, l3 + 24),
        _ => return Ok(None),
    };
    if data.len() < d + 4 {
        return Err(PacketError::Invalid("truncated L3 header".to_string()));
    }
    Ok(Some((ipv4_at(data, s), ipv4_at(data, d))))
}

fn set_arp_addrs(
    data: &mut [u8],
    l3: usize,
    src: Option<Ipv4Addr>,
    dst: Option<Ipv4Addr>,
) -> PacketResult<bool> {
    if data.len() < l3 + 28 {
        return Err(PacketError::Invalid("truncated ARP header".to_string()));
    }
    if let Some(spa) = src {
        data[l3 + 14..l3 + 18].copy_from_slice(&spa.octets());
    }
    if let Some(tpa) = dst {
        data[l3 + 24..l3 + 28].copy_from_slice(&tpa.octets());
    }
    Ok(src.is_some() || dst.is_some())
}

fn set_ip_addrs(
    data: &mut [u8],
    l3: usize,
    src: Option<Ipv4Addr>,
    dst: Option<Ipv4Addr>,
) -> PacketResult<bool> {
    if data.len() < l3 + 20 {
        return Err(PacketError::Invalid("truncated IPv4 header".to_string()));
    }
    let ihl = (data[l3] & 0x0f) as usize * 4;
    if ihl < 20 || data.len() < l3 + ihl {
        return Err(PacketError::Invalid("bad IPv4 header length".to_string()));
    }
    if src.is_none() && dst.is_none() {
        return Ok(false);
    }
    if let Some(s) = src {
        data[l3 + 12..l3 + 16].copy_from_slice(&s.octets());
    }
    if let Some(d) = dst {
        data[l3 + 16..l3 + 20].copy_from_slice(&d.octets());
    }

    data[l3 + 10] = 0;
    data[l3 + 11] = 0;
    let sum = internet_checksum::checksum(&data[l3..l3 + ihl]);
    data[l3 + 10] = sum[0];
    data[l3 + 11] = sum[1];

    let total = u16::from_be_bytes([data[l3 + 2], data[l3 + 3]]) as usize;
    let frag = u16::from_be_bytes([data[l3 + 6], data[l3 + 7]]);
    let proto = data[l3 + 9];
    let l4 = l3 + ihl;
    // Only a whole, unfragmented segment can be re-checksummed.
    if frag & 0x3fff != 0 || total < ihl || data.len() < l3 + total {
        return Ok(true);
    }
    let ck_off = match proto {
        IPPROTO_TCP => 16,
        IPPROTO_UDP => 6,
        _ => return Ok(true),
    };
    let seg_len = total - ihl;
    if seg_len < ck_off + 2 {
        return Ok(true);
    }
    // A zero UDP checksum means the sender did not compute one.
    if proto == IPPROTO_UDP && data[l4 + 6] == 0 && data[l4 + 7] == 0 {
        return Ok(true);
    }

    data[l4 + ck_off] = 0;
    data[l4 + ck_off + 1] = 0;
    let mut ck = internet_checksum::Checksum::new();
    ck.add_bytes(&data[l3 + 12..l3 + 20]);
    ck.add_bytes(&[0, proto]);
    ck.add_bytes(&(seg_len as u16).to_be_bytes());
    ck.add_bytes(&data[l4..l4 + seg_len]);
    let mut sum = ck.checksum();
    if proto == IPPROTO_UDP && sum == [0, 0] {
        sum = [0xff, 0xff];
    }
    data[l4 + ck_off] = sum[0];
    data[l4 + ck_off + 1] = sum[1];
    Ok(true)
}
