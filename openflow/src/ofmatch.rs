// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The OpenFlow 1.0 `ofp_match` structure.

use std::fmt;
use std::net::Ipv4Addr;

use common::network::MacAddr;
use packet::eth::FrameSummary;

pub const OFPFW_IN_PORT: u32 = 1 << 0;
pub const OFPFW_DL_VLAN: u32 = 1 << 1;
pub const OFPFW_DL_SRC: u32 = 1 << 2;
pub const OFPFW_DL_DST: u32 = 1 << 3;
pub const OFPFW_DL_TYPE: u32 = 1 << 4;
pub const OFPFW_NW_PROTO: u32 = 1 << 5;
pub const OFPFW_TP_SRC: u32 = 1 << 6;
pub const OFPFW_TP_DST: u32 = 1 << 7;
pub const OFPFW_NW_SRC_SHIFT: u32 = 8;
pub const OFPFW_NW_SRC_MASK: u32 = 0x3f << OFPFW_NW_SRC_SHIFT;
pub const OFPFW_NW_SRC_ALL: u32 = 32 << OFPFW_NW_SRC_SHIFT;
pub const OFPFW_NW_DST_SHIFT: u32 = 14;
pub const OFPFW_NW_DST_MASK: u32 = 0x3f << OFPFW_NW_DST_SHIFT;
pub const OFPFW_NW_DST_ALL: u32 = 32 << OFPFW_NW_DST_SHIFT;
pub const OFPFW_DL_VLAN_PCP: u32 = 1 << 20;
pub const OFPFW_NW_TOS: u32 = 1 << 21;
pub const OFPFW_ALL: u32 = (1 << 22) - 1;

pub const OFP_MATCH_LEN: usize = 40;

/// How one match relates to another when the flow table looks for
/// duplicates, overlaps or delete candidates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MatchRelation {
    Equal,
    Superset,
    Subset,
    Disjoint,
}

/// A flow match.  Fields covered by a wildcard bit are meaningless; the
/// accessors return `None` for them and equality ignores them.
#[derive(Clone, Copy, Debug)]
pub struct Match {
    pub wildcards: u32,
    pub in_port: u16,
    pub dl_src: MacAddr,
    pub dl_dst: MacAddr,
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

impl Default for Match {
    fn default() -> Self {
        Match::all()
    }
}

// One entry per matchable field, used to compare two matches field by
// field.
#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldValue {
    Absent,
    Scalar(u64),
    Prefix(u32, u32),
}

impl Match {
    /// A match with every field wildcarded.
    pub fn all() -> Self {
        Match {
            wildcards: OFPFW_ALL,
            in_port: 0,
            dl_src: MacAddr::ZERO,
            dl_dst: MacAddr::ZERO,
            dl_vlan: 0,
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

    /// An exact match on every header field of `frame`, arriving on
    /// `in_port`.
    pub fn from_frame(frame: &FrameSummary, in_port: u16) -> Self {
        Match {
            wildcards: 0,
            in_port,
            dl_src: frame.dl_src,
            dl_dst: frame.dl_dst,
            dl_vlan: frame.dl_vlan,
            dl_vlan_pcp: frame.dl_vlan_pcp,
            dl_type: frame.dl_type,
            nw_tos: frame.nw_tos,
            nw_proto: frame.nw_proto,
            nw_src: frame.nw_src,
            nw_dst: frame.nw_dst,
            tp_src: frame.tp_src,
            tp_dst: frame.tp_dst,
        }
    }

    fn has(&self, bit: u32) -> bool {
        self.wildcards & bit == 0
    }

    pub fn in_port(&self) -> Option<u16> {
        self.has(OFPFW_IN_PORT).then_some(self.in_port)
    }
    pub fn dl_src(&self) -> Option<MacAddr> {
        self.has(OFPFW_DL_SRC).then_some(self.dl_src)
    }
    pub fn dl_dst(&self) -> Option<MacAddr> {
        self.has(OFPFW_DL_DST).then_some(self.dl_dst)
    }
    pub fn dl_vlan(&self) -> Option<u16> {
        self.has(OFPFW_DL_VLAN).then_some(self.dl_vlan)
    }
    pub fn dl_vlan_pcp(&self) -> Option<u8> {
        self.has(OFPFW_DL_VLAN_PCP).then_some(self.dl_vlan_pcp)
    }
    pub fn dl_type(&self) -> Option<u16> {
        self.has(OFPFW_DL_TYPE).then_some(self.dl_type)
    }
    pub fn nw_tos(&self) -> Option<u8> {
        self.has(OFPFW_NW_TOS).then_some(self.nw_tos)
    }
    pub fn nw_proto(&self) -> Option<u8> {
        self.has(OFPFW_NW_PROTO).then_some(self.nw_proto)
    }
    pub fn tp_src(&self) -> Option<u16> {
        self.has(OFPFW_TP_SRC).then_some(self.tp_src)
    }
    pub fn tp_dst(&self) -> Option<u16> {
        self.has(OFPFW_TP_DST).then_some(self.tp_dst)
    }

    /// Number of significant leading bits of the source address match.
    pub fn nw_src_prefix_len(&self) -> u32 {
        let wild = (self.wildcards & OFPFW_NW_SRC_MASK) >> OFPFW_NW_SRC_SHIFT;
        32u32.saturating_sub(wild)
    }

    pub fn nw_dst_prefix_len(&self) -> u32 {
        let wild = (self.wildcards & OFPFW_NW_DST_MASK) >> OFPFW_NW_DST_SHIFT;
        32u32.saturating_sub(wild)
    }

    pub fn nw_src(&self) -> Option<Ipv4Addr> {
        (self.nw_src_prefix_len() > 0).then_some(self.nw_src)
    }

    pub fn nw_dst(&self) -> Option<Ipv4Addr> {
        (self.nw_dst_prefix_len() > 0).then_some(self.nw_dst)
    }

    pub fn set_in_port(&mut self, port: u16) -> &mut Self {
        self.in_port = port;
        self.wildcards &= !OFPFW_IN_PORT;
        self
    }
    pub fn set_dl_src(&mut self, mac: MacAddr) -> &mut Self {
        self.dl_src = mac;
        self.wildcards &= !OFPFW_DL_SRC;
        self
    }
    pub fn set_dl_dst(&mut self, mac: MacAddr) -> &mut Self {
        self.dl_dst = mac;
        self.wildcards &= !OFPFW_DL_DST;
        self
    }
    pub fn set_dl_vlan(&mut self, vlan: u16) -> &mut Self {
        self.dl_vlan = vlan;
        self.wildcards &= !OFPFW_DL_VLAN;
        self
    }
    pub fn set_dl_type(&mut self, dl_type: u16) -> &mut Self {
        self.dl_type = dl_type;
        self.wildcards &= !OFPFW_DL_TYPE;
        self
    }
    pub fn set_nw_proto(&mut self, proto: u8) -> &mut Self {
        self.nw_proto = proto;
        self.wildcards &= !OFPFW_NW_PROTO;
        self
    }

    /// Match the source address on its leading `prefix_len` bits.
    pub fn set_nw_src(&mut self, ip: Ipv4Addr, prefix_len: u32) -> &mut Self {
        let wild = 32 - prefix_len.min(32);
        self.nw_src = ip;
        self.wildcards = (self.wildcards & !OFPFW_NW_SRC_MASK)
            | (wild << OFPFW_NW_SRC_SHIFT);
        self
    }

    pub fn set_nw_dst(&mut self, ip: Ipv4Addr, prefix_len: u32) -> &mut Self {
        let wild = 32 - prefix_len.min(32);
        self.nw_dst = ip;
        self.wildcards = (self.wildcards & !OFPFW_NW_DST_MASK)
            | (wild << OFPFW_NW_DST_SHIFT);
        self
    }

    /// Wildcard the input port.
    pub fn clear_in_port(&mut self) -> &mut Self {
        self.in_port = 0;
        self.wildcards |= OFPFW_IN_PORT;
        self
    }

    /// True if no field is matched at all.
    pub fn is_wildcard_all(&self) -> bool {
        self.fields().iter().all(|f| *f == FieldValue::Absent)
    }

    fn fields(&self) -> [FieldValue; 12] {
        fn s<T: Into<u64>>(v: Option<T>) -> FieldValue {
            match v {
                Some(v) => FieldValue::Scalar(v.into()),
                None => FieldValue::Absent,
            }
        }
        fn mac(v: Option<MacAddr>) -> FieldValue {
            s(v.map(u64::from))
        }
        fn prefix(ip: Ipv4Addr, len: u32) -> FieldValue {
            if len == 0 {
                return FieldValue::Absent;
            }
            let mask = if len >= 32 { u32::MAX } else { !(u32::MAX >> len) };
            FieldValue::Prefix(u32::from(ip) & mask, len)
        }
        [
            s(self.in_port()),
            mac(self.dl_dst()),
            mac(self.dl_src()),
            s(self.dl_type()),
            s(self.dl_vlan()),
            s(self.dl_vlan_pcp()),
            s(self.nw_proto()),
            s(self.nw_tos()),
            prefix(self.nw_dst, self.nw_dst_prefix_len()),
            prefix(self.nw_src, self.nw_src_prefix_len()),
            s(self.tp_dst()),
            s(self.tp_src()),
        ]
    }

    /// Classify `other` against `self`.  Any field set in both with
    /// different values makes the two disjoint.  Otherwise, if `self`
    /// constrains more fields than `other` the result is `Subset` when
    /// `strict` and `Equal` when not; if not, `Superset`.
    pub fn compare(&self, other: &Match, strict: bool) -> MatchRelation {
        let mut sub = 0;
        let mut sup = 0;
        for (t, o) in self.fields().iter().zip(other.fields().iter()) {
            match (t, o) {
                (FieldValue::Absent, FieldValue::Absent) => {}
                (FieldValue::Absent, _) => sup += 1,
                (_, FieldValue::Absent) => sub += 1,
                (t, o) if t == o => {
                    sub += 1;
                    sup += 1;
                }
                _ => return MatchRelation::Disjoint,
            }
        }
        if self == other {
            MatchRelation::Equal
        } else if sub > sup {
            if strict {
                MatchRelation::Subset
            } else {
                MatchRelation::Equal
            }
        } else {
            MatchRelation::Superset
        }
    }
}

impl PartialEq for Match {
    fn eq(&self, other: &Self) -> bool {
        self.fields() == other.fields()
    }
}

impl Eq for Match {}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(p) = self.in_port() {
            parts.push(format!("in_port={p}"));
        }
        if let Some(m) = self.dl_src() {
            parts.push(format!("dl_src={m}"));
        }
        if let Some(m) = self.dl_dst() {
            parts.push(format!("dl_dst={m}"));
        }
        if let Some(v) = self.dl_vlan() {
            parts.push(format!("dl_vlan={v}"));
        }
        if let Some(t) = self.dl_type() {
            parts.push(format!("dl_type={t:#06x}"));
        }
        if let Some(p) = self.nw_proto() {
            parts.push(format!("nw_proto={p}"));
        }
        if let Some(ip) = self.nw_src() {
            parts.push(format!("nw_src={ip}/{}", self.nw_src_prefix_len()));
        }
        if let Some(ip) = self.nw_dst() {
            parts.push(format!("nw_dst={ip}/{}", self.nw_dst_prefix_len()));
        }
        if let Some(p) = self.tp_src() {
            parts.push(format!("tp_src={p}"));
        }
        if let Some(p) = self.tp_dst() {
            parts.push(format!("tp_dst={p}"));
        }
        if parts.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ipv4_from(port: u16, src: [u8; 4]) -> Match {
        let mut m = Match::all();
        m.set_in_port(port)
            .set_dl_type(0x0800)
            .set_nw_src(Ipv4Addr::from(src), 32);
        m
    }

    #[test]
    fn test_wildcarded_fields_are_ignored() {
        let mut a = Match::all();
        let mut b = Match::all();
        a.tp_src = 80;
        b.tp_src = 443;
        assert_eq!(a, b);
        assert!(a.is_wildcard_all());
        b.set_dl_type(0x0806);
        assert!(a != b);
    }

    #[test]
    fn test_prefix() {
        let mut m = Match::all();
        m.set_nw_dst(Ipv4Addr::new(10, 1, 2, 3), 8);
        assert_eq!(m.nw_dst_prefix_len(), 8);
        assert_eq!(m.nw_src_prefix_len(), 0);
        assert_eq!(m.nw_src(), None);

        let mut n = Match::all();
        n.set_nw_dst(Ipv4Addr::new(10, 9, 9, 9), 8);
        assert_eq!(m, n);
    }

    #[test]
    fn test_compare() {
        let a = ipv4_from(1, [10, 0, 0, 1]);
        assert_eq!(a.compare(&a, true), MatchRelation::Equal);

        let b = ipv4_from(2, [10, 0, 0, 1]);
        assert_eq!(a.compare(&b, false), MatchRelation::Disjoint);

        let mut general = Match::all();
        general.set_dl_type(0x0800);
        assert_eq!(general.compare(&a, true), MatchRelation::Superset);
        assert_eq!(a.compare(&general, true), MatchRelation::Subset);
        assert_eq!(a.compare(&general, false), MatchRelation::Equal);
    }

    #[test]
    fn test_from_frame() {
        let frame = FrameSummary {
            dl_type: 0x0800,
            nw_src: Ipv4Addr::new(1, 2, 3, 4),
            ..Default::default()
        };
        let m = Match::from_frame(&frame, 3);
        assert_eq!(m.in_port(), Some(3));
        assert_eq!(m.nw_src(), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(m.nw_src_prefix_len(), 32);
    }
}
