// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// An Ethernet address.  Ordered and hashed by its octets, so it can key
/// the hypervisor's maps directly.
#[derive(
    Copy, Clone, Default, Deserialize, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct MacAddr {
    a: [u8; 6],
}

impl MacAddr {
    /// OpenVirteX's Organizationally Unique Identifier.
    pub const OVX_OUI: [u8; 3] = [0xa4, 0x23, 0x05];
    pub const ZERO: Self = MacAddr { a: [0; 6] };
    pub const BROADCAST: Self = MacAddr { a: [0xff; 6] };

    pub const fn new(
        o0: u8,
        o1: u8,
        o2: u8,
        o3: u8,
        o4: u8,
        o5: u8,
    ) -> MacAddr {
        MacAddr {
            a: [o0, o1, o2, o3, o4, o5],
        }
    }

    /// Build an address from the first six octets of `s`.  Callers hand in
    /// slices already cut to length by their parsers.
    pub fn from_slice(s: &[u8]) -> MacAddr {
        let mut a = [0u8; 6];
        let n = s.len().min(6);
        a[..n].copy_from_slice(&s[..n]);
        MacAddr { a }
    }

    /// An address in the OpenVirteX OUI, with the low 24 bits of `suffix`
    /// below it.
    pub fn ovx(suffix: u32) -> MacAddr {
        let [_, b, c, d] = suffix.to_be_bytes();
        let [o0, o1, o2] = Self::OVX_OUI;
        MacAddr::new(o0, o1, o2, b, c, d)
    }

    pub fn octets(self) -> [u8; 6] {
        self.a
    }

    pub fn is_null(self) -> bool {
        self == Self::ZERO
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// The group bit.
    pub fn is_multicast(self) -> bool {
        self.a[0] & 0x01 != 0
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(a: [u8; 6]) -> Self {
        MacAddr { a }
    }
}

/// The low 48 bits.
impl From<u64> for MacAddr {
    fn from(x: u64) -> Self {
        let b = x.to_be_bytes();
        MacAddr::from_slice(&b[2..])
    }
}

impl From<MacAddr> for u64 {
    fn from(mac: MacAddr) -> u64 {
        let mut b = [0u8; 8];
        b[2..].copy_from_slice(&mac.a);
        u64::from_be_bytes(b)
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("invalid MAC address {0:?}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    /// Six colon-separated hex octets.
    fn from_str(s: &str) -> Result<Self, MacParseError> {
        let err = || MacParseError(s.to_string());
        let mut a = [0u8; 6];
        let mut octets = s.split(':');
        for slot in a.iter_mut() {
            let o = octets.next().ok_or_else(err)?;
            if o.is_empty() || o.len() > 2 {
                return Err(err());
            }
            *slot = u8::from_str_radix(o, 16).map_err(|_| err())?;
        }
        if octets.next().is_some() {
            return Err(err());
        }
        Ok(MacAddr { a })
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.a;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::MacAddr;

    #[test]
    fn test_u64_conversion() {
        let a = MacAddr::new(0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc);
        assert_eq!(u64::from(a), 0x1234_5678_9abc);
        assert_eq!(MacAddr::from(0xffff_1234_5678_9abc), a);
    }

    #[test]
    fn test_parse() {
        let a = MacAddr::new(0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc);
        assert_eq!("12:34:56:78:9a:bc".parse::<MacAddr>().unwrap(), a);
        assert_eq!("0:0:0:0:0:1".parse::<MacAddr>().unwrap(), MacAddr::new(0, 0, 0, 0, 0, 1));
        for bad in ["12:34:56:78:9a", "12:34:56:78:9a:bc:de", "12:34:56:78:9a:zz", "12::56:78:9a:bc", "123:4:5:6:7:8"] {
            assert!(bad.parse::<MacAddr>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_display() {
        let a = MacAddr::new(0x12, 0x34, 0x56, 0x78, 0x9a, 0x0c);
        assert_eq!(a.to_string(), "12:34:56:78:9a:0c");
        assert_eq!(format!("{a:?}"), "12:34:56:78:9a:0c");
    }

    #[test]
    fn test_ovx_prefix() {
        let a = MacAddr::ovx(0x01_00_00_2a);
        assert_eq!(a, MacAddr::new(0xa4, 0x23, 0x05, 0x00, 0x00, 0x2a));
        assert!(!a.is_multicast());
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::BROADCAST.is_multicast());
        assert!(MacAddr::ZERO.is_null());
    }
}
