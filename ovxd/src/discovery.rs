// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Link discovery for one physical switch.
//!
//! A port starts out "slow": it is probed only when its turn comes in a
//! round-robin over all slow ports.  Once a probe sent from it is seen
//! arriving elsewhere, the port becomes "fast" and is probed on every tick.
//! A fast port with too many probes outstanding has lost its link; it goes
//! back to the slow set and the link is reported as expired.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound;

use openflow::Action;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PacketOut;

use common::network::MacAddr;

use crate::types::Dpid;
use crate::types::PortNo;

/// Unacknowledged probes a fast port may have outstanding.
pub const MAX_PROBE: u32 = 3;

pub struct DiscoveryManager {
    dpid: Dpid,
    slow: BTreeSet<PortNo>,
    fast: BTreeMap<PortNo, u32>,
    cursor: Option<PortNo>,
    hw_addrs: BTreeMap<PortNo, MacAddr>,
}

/// What a discovery round wants done.
#[derive(Debug, Default)]
pub struct Tick {
    pub probes: Vec<OfMessage>,
    /// Fast ports whose link stopped answering.
    pub expired: Vec<PortNo>,
}

impl DiscoveryManager {
    pub fn new(dpid: Dpid) -> Self {
        DiscoveryManager {
            dpid,
            slow: BTreeSet::new(),
            fast: BTreeMap::new(),
            cursor: None,
            hw_addrs: BTreeMap::new(),
        }
    }

    /// The packet-out sending a discovery probe out of `port`.
    pub fn probe(&self, port: PortNo) -> Option<OfMessage> {
        let hw = self.hw_addrs.get(&port)?;
        let data = packet::lldp::make_probe(*hw, port, self.dpid);
        Some(OfMessage::new(
            0,
            OfBody::PacketOut(PacketOut::new(data, vec![Action::output(port)])),
        ))
    }

    /// Start discovering over a new port.  Returns the initial probe.
    pub fn add_port(&mut self, port: PortNo, hw_addr: MacAddr) -> Option<OfMessage> {
        self.hw_addrs.insert(port, hw_addr);
        self.fast.remove(&port);
        self.slow.insert(port);
        self.probe(port)
    }

    pub fn remove_port(&mut self, port: PortNo) {
        self.hw_addrs.remove(&port);
        self.slow.remove(&port);
        self.fast.remove(&port);
    }

    /// A probe sent from `port` has been received.
    pub fn ack_probe(&mut self, port: PortNo) {
        if self.slow.remove(&port) {
            self.fast.insert(port, 0);
        } else if let Some(count) = self.fast.get_mut(&port) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn is_fast(&self, port: PortNo) -> bool {
        self.fast.contains_key(&port)
    }

    pub fn tick(&mut self) -> Tick {
        let mut out = Tick::default();

        let fast: Vec<PortNo> = self.fast.keys().copied().collect();
        for port in fast {
            let count = self.fast.get(&port).copied().unwrap_or_default();
            if count >= MAX_PROBE {
                self.fast.remove(&port);
                self.slow.insert(port);
                out.expired.push(port);
                continue;
            }
            self.fast.insert(port, count + 1);
            out.probes.extend(self.probe(port));
        }

        let next = match self.cursor {
            Some(c) => self
                .slow
                .range((Bound::Excluded(c), Bound::Unbounded))
                .next()
                .or_else(|| self.slow.first())
                .copied(),
            None => self.slow.first().copied(),
        };
        if let Some(port) = next {
            self.cursor = Some(port);
            out.probes.extend(self.probe(port));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_port(msg: &OfMessage) -> PortNo {
        match &msg.body {
            OfBody::PacketOut(po) => {
                packet::lldp::parse_probe(&po.data).unwrap().port
            }
            _ => panic!("not a packet out"),
        }
    }

    #[test]
    fn test_initial_probe() {
        let mut dm = DiscoveryManager::new(7);
        let msg = dm.add_port(3, MacAddr::new(0, 0, 0, 0, 0, 3)).unwrap();
        match &msg.body {
            OfBody::PacketOut(po) => {
                let origin = packet::lldp::parse_probe(&po.data).unwrap();
                assert_eq!((origin.dpid, origin.port), (7, 3));
                assert_eq!(po.actions, vec![Action::output(3)]);
            }
            _ => panic!("not a packet out"),
        }
    }

    #[test]
    fn test_slow_ports_round_robin() {
        let mut dm = DiscoveryManager::new(1);
        for p in 1..=3 {
            dm.add_port(p, MacAddr::ZERO);
        }
        let order: Vec<PortNo> = (0..4)
            .map(|_| {
                let t = dm.tick();
                assert_eq!(t.probes.len(), 1);
                probe_port(&t.probes[0])
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3, 1]);
    }

    #[test]
    fn test_fast_port_expires() {
        let mut dm = DiscoveryManager::new(1);
        dm.add_port(1, MacAddr::ZERO);
        dm.ack_probe(1);
        assert!(dm.is_fast(1));

        for _ in 0..MAX_PROBE {
            let t = dm.tick();
            assert!(t.expired.is_empty());
        }
        // An answer keeps the port alive for one more round.
        dm.ack_probe(1);
        assert!(dm.tick().expired.is_empty());

        let t = dm.tick();
        assert_eq!(t.expired, vec![1]);
        assert!(!dm.is_fast(1));
    }
}
