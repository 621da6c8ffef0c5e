// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Encoding of (tenant, virtual link, flow) triples into the header fields
//! carried by packets while they cross a physical link that is part of a
//! virtual link or a big-switch route.
//!
//! In MAC mode the 48-bit value
//!
//! ```text
//! tenant << (48 - v) | link << ((48 - v) / 2) | flow
//! ```
//!
//! is split across the low 24 bits of the source and destination addresses,
//! both of which carry the OpenVirteX OUI in their high 24 bits.  In VLAN
//! mode the same layout is squeezed into the 12-bit VLAN id.

use openflow::Action;
use openflow::Match;
use serde::Deserialize;
use serde::Serialize;
use slog::warn;

use common::network::MacAddr;

use crate::flowmgr::FlowManager;
use crate::types::TenantId;

/// Which header fields carry the virtual link encoding.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    strum::EnumString,
)]
pub enum LinkField {
    #[default]
    #[serde(rename = "mac")]
    #[strum(serialize = "mac")]
    MacAddress,
    #[serde(rename = "vlan")]
    #[strum(serialize = "vlan")]
    Vlan,
}

/// Encoder/decoder, parameterized by the number of tenant bits.
#[derive(Clone, Copy, Debug)]
pub struct LinkFields {
    tenant_bits: u32,
    field: LinkField,
}

/// A decoded or freshly encoded set of link fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkTag {
    pub field: LinkField,
    pub tenant: TenantId,
    pub link: u32,
    pub flow: u32,
    pub src: Option<MacAddr>,
    pub dst: Option<MacAddr>,
    pub vlan: u16,
}

const OUI_PREFIX: u64 = (common::OVX_OUI as u64) << 24;

impl LinkFields {
    pub fn new(tenant_bits: u32, field: LinkField) -> Self {
        LinkFields { tenant_bits, field }
    }

    pub fn field(&self) -> LinkField {
        self.field
    }

    fn mac_split(&self) -> u32 {
        (48 - self.tenant_bits) / 2
    }

    fn vlan_split(&self) -> u32 {
        12u32.saturating_sub(self.tenant_bits) / 2
    }

    pub fn encode(&self, tenant: TenantId, link: u32, flow: u32) -> LinkTag {
        let split = self.mac_split();
        let mac = (tenant as u64) << (48 - self.tenant_bits)
            | (link as u64) << split
            | flow as u64;
        let src = MacAddr::from(OUI_PREFIX | (mac >> 24) & 0xff_ffff);
        let dst = MacAddr::from(OUI_PREFIX | mac & 0xff_ffff);

        let vlan = match self.field {
            LinkField::MacAddress => 0,
            LinkField::Vlan => {
                let vsplit = self.vlan_split();
                let shift = 12u32.saturating_sub(self.tenant_bits);
                ((tenant << shift) | (link << vsplit) | flow) as u16 & 0x0fff
            }
        };
        LinkTag {
            field: self.field,
            tenant,
            link,
            flow,
            src: Some(src),
            dst: Some(dst),
            vlan,
        }
    }

    /// Recover the triple from the addresses of a frame that crossed a
    /// virtual link.
    pub fn decode(&self, src: MacAddr, dst: MacAddr) -> LinkTag {
        let mac = (u64::from(src) & 0xff_ffff) << 24 | u64::from(dst) & 0xff_ffff;
        let split = self.mac_split();
        let mask = (1u64 << split) - 1;
        LinkTag {
            field: self.field,
            tenant: (mac >> (48 - self.tenant_bits)) as TenantId,
            link: ((mac >> split) & mask) as u32,
            flow: (mac & mask) as u32,
            src: Some(src),
            dst: Some(dst),
            vlan: 0,
        }
    }

    pub fn decode_vlan(&self, vlan: u16) -> LinkTag {
        let split = self.vlan_split();
        let shift = 12u32.saturating_sub(self.tenant_bits);
        let mask = (1u32 << split) - 1;
        let v = vlan as u32 & 0x0fff;
        LinkTag {
            field: self.field,
            tenant: v >> shift,
            link: (v >> split) & mask,
            flow: v & mask,
            src: None,
            dst: None,
            vlan,
        }
    }
}

impl LinkTag {
    pub fn is_valid(&self) -> bool {
        self.tenant != 0
            && self.link != 0
            && self.flow != 0
            && (self.vlan != 0 || (self.src.is_some() && self.dst.is_some()))
    }

    /// Make `m` match the encoded fields.
    pub fn rewrite_match(&self, m: &mut Match) {
        match self.field {
            LinkField::MacAddress => {
                if let (Some(src), Some(dst)) = (self.src, self.dst) {
                    m.set_dl_src(src).set_dl_dst(dst);
                }
            }
            LinkField::Vlan => {
                m.set_dl_vlan(self.vlan);
            }
        }
    }

    /// Actions that stamp the encoded fields onto a packet.
    pub fn set_link_fields(&self) -> Vec<Action> {
        match self.field {
            LinkField::MacAddress => match (self.src, self.dst) {
                (Some(src), Some(dst)) => {
                    vec![Action::SetDlSrc(src), Action::SetDlDst(dst)]
                }
                _ => Vec::new(),
            },
            LinkField::Vlan => vec![Action::SetVlanVid(self.vlan)],
        }
    }

    /// Actions that restore the addresses the packet carried before it
    /// entered the virtual link.  Fields the caller already rewrites are
    /// skipped.
    pub fn unset_link_fields(
        &self,
        log: &slog::Logger,
        skip_src: bool,
        skip_dst: bool,
        flows: &FlowManager,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.field {
            LinkField::MacAddress => match flows.get_flow_values(self.flow) {
                Some((src, dst)) => {
                    if !skip_src {
                        actions.push(Action::SetDlSrc(src));
                    }
                    if !skip_dst {
                        actions.push(Action::SetDlDst(dst));
                    }
                }
                None => warn!(
                    log,
                    "unable to restore addresses";
                    "tenant" => self.tenant,
                    "flow" => self.flow,
                ),
            },
            LinkField::Vlan => {
                warn!(log, "unable to restore actions, VLANs not supported")
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mac_layout() {
        let codec = LinkFields::new(8, LinkField::MacAddress);
        let tag = codec.encode(1, 1, 1);
        assert_eq!(tag.src, Some("a4:23:05:01:00:00".parse().unwrap()));
        assert_eq!(tag.dst, Some("a4:23:05:10:00:01".parse().unwrap()));
        assert!(tag.is_valid());

        let back = codec.decode(tag.src.unwrap(), tag.dst.unwrap());
        assert_eq!((back.tenant, back.link, back.flow), (1, 1, 1));
    }

    #[test]
    fn test_wide_fields() {
        let codec = LinkFields::new(8, LinkField::MacAddress);
        let link = (1 << 20) - 1;
        let tag = codec.encode(255, link, 77);
        let back = codec.decode(tag.src.unwrap(), tag.dst.unwrap());
        assert_eq!((back.tenant, back.link, back.flow), (255, link, 77));
    }

    #[test]
    fn test_invalid_without_flow() {
        let codec = LinkFields::new(8, LinkField::MacAddress);
        let plain = codec.decode(
            "00:00:00:00:00:01".parse().unwrap(),
            "00:00:00:00:00:02".parse().unwrap(),
        );
        assert!(!plain.is_valid());
    }

    #[test]
    fn test_vlan_mode() {
        let codec = LinkFields::new(2, LinkField::Vlan);
        let tag = codec.encode(3, 7, 5);
        assert_eq!(tag.vlan, 3 << 10 | 7 << 5 | 5);
        assert_eq!(tag.set_link_fields(), vec![Action::SetVlanVid(tag.vlan)]);
        let back = codec.decode_vlan(tag.vlan);
        assert_eq!((back.tenant, back.link, back.flow), (3, 7, 5));

        let mut m = Match::all();
        tag.rewrite_match(&mut m);
        assert_eq!(m.dl_vlan(), Some(tag.vlan));
    }

    #[test]
    fn test_unset_restores_original_macs() {
        let log = test_log();
        let codec = LinkFields::new(8, LinkField::MacAddress);
        let mut flows = FlowManager::new(&log, 1, 1 << 20);
        let a: MacAddr = "00:00:00:00:00:0a".parse().unwrap();
        let b: MacAddr = "00:00:00:00:00:0b".parse().unwrap();
        let flow = flows.store_flow_values(a, b).unwrap();
        let tag = codec.encode(1, 4, flow);

        assert_eq!(
            tag.unset_link_fields(&log, false, false, &flows),
            vec![Action::SetDlSrc(a), Action::SetDlDst(b)]
        );
        assert_eq!(
            tag.unset_link_fields(&log, true, false, &flows),
            vec![Action::SetDlDst(b)]
        );

        let vlan = LinkFields::new(2, LinkField::Vlan).encode(1, 1, flow);
        assert!(vlan.unset_link_fields(&log, false, false, &flows).is_empty());
    }

    #[test]
    fn test_parse_field() {
        assert_eq!("mac".parse::<LinkField>().unwrap(), LinkField::MacAddress);
        assert_eq!("vlan".parse::<LinkField>().unwrap(), LinkField::Vlan);
        assert!("mpls".parse::<LinkField>().is_err());
    }
}
