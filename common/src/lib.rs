// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

pub mod logging;
pub mod network;

/// Well-known OpenFlow port on which the hypervisor accepts switches.
pub const DEFAULT_OF_PORT: u16 = 6633;

/// OpenVirteX OUI, used in virtual DPIDs, link-field MACs and LLDP probes.
pub const OVX_OUI: u32 = 0xa42305;

/// Return the number of bits needed to represent `n`.
pub fn bits_needed(n: u32) -> u32 {
    u32::BITS - n.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::bits_needed;

    #[test]
    fn test_bits_needed() {
        assert_eq!(bits_needed(0), 0);
        assert_eq!(bits_needed(1), 1);
        assert_eq!(bits_needed(255), 8);
        assert_eq!(bits_needed(256), 9);
    }
}
