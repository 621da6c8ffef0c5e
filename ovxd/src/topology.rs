// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A directed graph of switches and links, shared by the physical network
//! and every tenant network.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::types::Dpid;
use crate::types::LinkKey;
use crate::types::OvxError;
use crate::types::OvxResult;
use crate::types::PortNo;
use crate::types::PortRef;

/// A switch as seen by the graph.
pub trait Node {
    fn dpid(&self) -> Dpid;
    /// Mark a port as facing a host (true) or another switch (false).
    fn set_port_edge(&mut self, port: PortNo, edge: bool);
}

/// A link as seen by the graph.
pub trait Edge {
    fn key(&self) -> LinkKey;
}

pub struct Network<S, L> {
    pub switches: BTreeMap<Dpid, S>,
    pub links: BTreeMap<LinkKey, L>,
    neighbor_ports: BTreeMap<PortRef, PortRef>,
    neighbors: BTreeMap<Dpid, BTreeSet<Dpid>>,
}

impl<S, L> Default for Network<S, L> {
    fn default() -> Self {
        Network {
            switches: BTreeMap::new(),
            links: BTreeMap::new(),
            neighbor_ports: BTreeMap::new(),
            neighbors: BTreeMap::new(),
        }
    }
}

impl<S: Node, L: Edge> Network<S, L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a switch with the same dpid is already present.
    pub fn add_switch(&mut self, sw: S) -> bool {
        let dpid = sw.dpid();
        if self.switches.contains_key(&dpid) {
            return false;
        }
        self.switches.insert(dpid, sw);
        true
    }

    /// Remove a switch together with every link touching it.
    pub fn remove_switch(&mut self, dpid: Dpid) -> Option<S> {
        let touching: Vec<LinkKey> = self
            .links
            .keys()
            .filter(|k| k.src.dpid == dpid || k.dst.dpid == dpid)
            .copied()
            .collect();
        for key in touching {
            self.remove_link(key);
        }
        self.neighbors.remove(&dpid);
        self.switches.remove(&dpid)
    }

    /// Returns false if the link is already present.
    pub fn add_link(&mut self, link: L) -> bool {
        let key = link.key();
        if self.links.contains_key(&key) {
            return false;
        }
        if let Some(sw) = self.switches.get_mut(&key.src.dpid) {
            sw.set_port_edge(key.src.port, false);
        }
        if let Some(sw) = self.switches.get_mut(&key.dst.dpid) {
            sw.set_port_edge(key.dst.port, false);
        }
        self.neighbor_ports.insert(key.src, key.dst);
        self.neighbors
            .entry(key.src.dpid)
            .or_default()
            .insert(key.dst.dpid);
        self.links.insert(key, link);
        true
    }

    pub fn remove_link(&mut self, key: LinkKey) -> Option<L> {
        let link = self.links.remove(&key)?;
        if let Some(sw) = self.switches.get_mut(&key.src.dpid) {
            sw.set_port_edge(key.src.port, true);
        }
        if let Some(sw) = self.switches.get_mut(&key.dst.dpid) {
            sw.set_port_edge(key.dst.port, true);
        }
        self.neighbor_ports.remove(&key.src);
        let still_joined = self
            .links
            .keys()
            .any(|k| k.src.dpid == key.src.dpid && k.dst.dpid == key.dst.dpid);
        if !still_joined {
            if let Some(n) = self.neighbors.get_mut(&key.src.dpid) {
                n.remove(&key.dst.dpid);
                if n.is_empty() {
                    self.neighbors.remove(&key.src.dpid);
                }
            }
        }
        Some(link)
    }

    pub fn get_neighbors(&self, dpid: Dpid) -> BTreeSet<Dpid> {
        self.neighbors.get(&dpid).cloned().unwrap_or_default()
    }

    /// The port at the far end of the link leaving `port`.
    pub fn get_neighbor_port(&self, port: PortRef) -> Option<PortRef> {
        self.neighbor_ports.get(&port).copied()
    }

    pub fn get_switch(&self, dpid: Dpid) -> OvxResult<&S> {
        self.switches.get(&dpid).ok_or(OvxError::InvalidDpid(dpid))
    }

    pub fn get_switch_mut(&mut self, dpid: Dpid) -> OvxResult<&mut S> {
        self.switches.get_mut(&dpid).ok_or(OvxError::InvalidDpid(dpid))
    }

    pub fn get_switches(&self) -> impl Iterator<Item = &S> {
        self.switches.values()
    }

    pub fn get_link(&self, src: PortRef, dst: PortRef) -> Option<&L> {
        self.links.get(&LinkKey::new(src, dst))
    }

    pub fn get_link_mut(&mut self, src: PortRef, dst: PortRef) -> Option<&mut L> {
        self.links.get_mut(&LinkKey::new(src, dst))
    }

    /// The link leaving `port`, if any.
    pub fn link_from(&self, port: PortRef) -> Option<&L> {
        let dst = self.get_neighbor_port(port)?;
        self.get_link(port, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct Sw {
        dpid: Dpid,
        edges: BTreeMap<PortNo, bool>,
    }

    impl Node for Sw {
        fn dpid(&self) -> Dpid {
            self.dpid
        }
        fn set_port_edge(&mut self, port: PortNo, edge: bool) {
            self.edges.insert(port, edge);
        }
    }

    struct Ln(LinkKey);

    impl Edge for Ln {
        fn key(&self) -> LinkKey {
            self.0
        }
    }

    fn sw(dpid: Dpid) -> Sw {
        Sw {
            dpid,
            edges: BTreeMap::new(),
        }
    }

    fn ln(a: Dpid, ap: PortNo, b: Dpid, bp: PortNo) -> Ln {
        Ln(LinkKey::new(PortRef::new(a, ap), PortRef::new(b, bp)))
    }

    #[test]
    fn test_links_set_neighbors() {
        let mut net: Network<Sw, Ln> = Network::new();
        assert!(net.add_switch(sw(1)));
        assert!(!net.add_switch(sw(1)));
        net.add_switch(sw(2));

        assert!(net.add_link(ln(1, 1, 2, 1)));
        assert!(net.add_link(ln(1, 2, 2, 2)));
        assert!(!net.add_link(ln(1, 1, 2, 1)));
        assert_eq!(net.get_neighbors(1), BTreeSet::from([2]));
        assert_eq!(
            net.get_neighbor_port(PortRef::new(1, 2)),
            Some(PortRef::new(2, 2))
        );
        assert_eq!(net.get_switch(1).unwrap().edges.get(&1), Some(&false));

        // One of two parallel links goes; the switches are still neighbors.
        net.remove_link(ln(1, 1, 2, 1).0);
        assert_eq!(net.get_neighbors(1), BTreeSet::from([2]));
        assert_eq!(net.get_switch(1).unwrap().edges.get(&1), Some(&true));
        net.remove_link(ln(1, 2, 2, 2).0);
        assert!(net.get_neighbors(1).is_empty());
    }

    #[test]
    fn test_remove_switch_drops_links() {
        let mut net: Network<Sw, Ln> = Network::new();
        net.add_switch(sw(1));
        net.add_switch(sw(2));
        net.add_link(ln(1, 1, 2, 1));
        net.add_link(ln(2, 1, 1, 1));
        assert!(net.remove_switch(2).is_some());
        assert!(net.links.is_empty());
        assert!(net.get_neighbors(1).is_empty());
        assert!(matches!(net.get_switch(2), Err(OvxError::InvalidDpid(2))));
        assert!(net.link_from(PortRef::new(1, 1)).is_none());
    }
}
