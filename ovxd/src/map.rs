// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The mapping store: every cross-reference between virtual and physical
//! elements.  Each relation is kept in both directions, and both are updated
//! by the same call so a caller holding the lock never observes one side
//! without the other.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;
use slog::debug;

use common::network::MacAddr;

use crate::types::*;
use crate::virtnet::OvxNetwork;

pub struct OvxMap {
    log: slog::Logger,
    networks: BTreeMap<TenantId, Arc<Mutex<OvxNetwork>>>,
    // physical dpid -> tenant -> virtual dpid
    phys_switches: BTreeMap<Dpid, BTreeMap<TenantId, Dpid>>,
    virt_switches: BTreeMap<VSwitchRef, Vec<Dpid>>,
    // physical link -> tenant -> virtual links crossing it
    phys_links: BTreeMap<LinkKey, BTreeMap<TenantId, BTreeSet<LinkKey>>>,
    virt_links: BTreeMap<VLinkKey, Vec<LinkKey>>,
    phys_routes: BTreeMap<LinkKey, BTreeMap<TenantId, BTreeSet<RouteKey>>>,
    routes: BTreeMap<RouteKey, Vec<LinkKey>>,
    phys_ips: BTreeMap<Ipv4Addr, (TenantId, Ipv4Addr)>,
    virt_ips: BTreeMap<(TenantId, Ipv4Addr), Ipv4Addr>,
    macs: BTreeMap<MacAddr, TenantId>,
}

impl OvxMap {
    pub fn new(log: &slog::Logger) -> Self {
        OvxMap {
            log: log.new(slog::o!("unit" => "map")),
            networks: BTreeMap::new(),
            phys_switches: BTreeMap::new(),
            virt_switches: BTreeMap::new(),
            phys_links: BTreeMap::new(),
            virt_links: BTreeMap::new(),
            phys_routes: BTreeMap::new(),
            routes: BTreeMap::new(),
            phys_ips: BTreeMap::new(),
            virt_ips: BTreeMap::new(),
            macs: BTreeMap::new(),
        }
    }

    pub fn reset(&mut self) {
        debug!(self.log, "reset mapping store");
        self.networks.clear();
        self.phys_switches.clear();
        self.virt_switches.clear();
        self.phys_links.clear();
        self.virt_links.clear();
        self.phys_routes.clear();
        self.routes.clear();
        self.phys_ips.clear();
        self.virt_ips.clear();
        self.macs.clear();
    }

    // Networks

    pub fn add_network(&mut self, tenant: TenantId, net: Arc<Mutex<OvxNetwork>>) {
        self.networks.insert(tenant, net);
    }

    pub fn get_virtual_network(
        &self,
        tenant: TenantId,
    ) -> OvxResult<Arc<Mutex<OvxNetwork>>> {
        self.networks.get(&tenant).cloned().ok_or_else(|| {
            OvxError::NetworkMapping(format!("no virtual network {tenant}"))
        })
    }

    pub fn list_virtual_networks(&self) -> Vec<TenantId> {
        self.networks.keys().copied().collect()
    }

    pub fn remove_network(&mut self, tenant: TenantId) {
        self.networks.remove(&tenant);
    }

    // Switches

    pub fn add_switches(&mut self, physical: &[Dpid], virt: VSwitchRef) {
        for dpid in physical {
            self.phys_switches
                .entry(*dpid)
                .or_default()
                .insert(virt.tenant, virt.dpid);
        }
        self.virt_switches.insert(virt, physical.to_vec());
    }

    pub fn get_physical_switches(&self, virt: VSwitchRef) -> OvxResult<Vec<Dpid>> {
        self.virt_switches.get(&virt).cloned().ok_or_else(|| {
            OvxError::SwitchMapping(format!("no physical switches for {virt}"))
        })
    }

    pub fn get_virtual_switch(
        &self,
        physical: Dpid,
        tenant: TenantId,
    ) -> OvxResult<Dpid> {
        self.phys_switches
            .get(&physical)
            .and_then(|t| t.get(&tenant))
            .copied()
            .ok_or_else(|| {
                OvxError::SwitchMapping(format!(
                    "no virtual switch for {physical:016x} in tenant {tenant}"
                ))
            })
    }

    /// Every tenant's virtual switch on a physical switch.
    pub fn get_virtual_switches(&self, physical: Dpid) -> Vec<VSwitchRef> {
        self.phys_switches
            .get(&physical)
            .map(|t| {
                t.iter().map(|(tid, v)| VSwitchRef::new(*tid, *v)).collect()
            })
            .unwrap_or_default()
    }

    pub fn has_virtual_switch(&self, physical: Dpid, tenant: TenantId) -> bool {
        self.phys_switches
            .get(&physical)
            .is_some_and(|t| t.contains_key(&tenant))
    }

    pub fn remove_virtual_switch(&mut self, virt: VSwitchRef) {
        let Some(physical) = self.virt_switches.remove(&virt) else {
            return;
        };
        for dpid in physical {
            if let Some(tenants) = self.phys_switches.get_mut(&dpid) {
                if tenants.get(&virt.tenant) == Some(&virt.dpid) {
                    tenants.remove(&virt.tenant);
                }
                if tenants.is_empty() {
                    self.phys_switches.remove(&dpid);
                }
            }
        }
    }

    pub fn remove_physical_switch(&mut self, physical: Dpid) {
        let Some(tenants) = self.phys_switches.remove(&physical) else {
            return;
        };
        for (tenant, vdpid) in tenants {
            let key = VSwitchRef::new(tenant, vdpid);
            if let Some(list) = self.virt_switches.get_mut(&key) {
                list.retain(|d| *d != physical);
                if list.is_empty() {
                    self.virt_switches.remove(&key);
                }
            }
        }
    }

    // Virtual links

    /// Bind a virtual link to a physical path, replacing any previous path.
    pub fn add_links(&mut self, path: &[LinkKey], virt: VLinkKey) {
        self.remove_virtual_link(virt);
        for link in path {
            self.phys_links
                .entry(*link)
                .or_default()
                .entry(virt.tenant)
                .or_default()
                .insert(virt.ends);
        }
        self.virt_links.insert(virt, path.to_vec());
    }

    pub fn get_physical_links(&self, virt: VLinkKey) -> OvxResult<Vec<LinkKey>> {
        self.virt_links.get(&virt).cloned().ok_or_else(|| {
            OvxError::LinkMapping(format!(
                "no physical path for {} in tenant {}",
                virt.ends, virt.tenant
            ))
        })
    }

    pub fn get_virtual_links(
        &self,
        physical: LinkKey,
        tenant: TenantId,
    ) -> OvxResult<Vec<LinkKey>> {
        self.phys_links
            .get(&physical)
            .and_then(|t| t.get(&tenant))
            .map(|s| s.iter().copied().collect())
            .ok_or_else(|| {
                OvxError::LinkMapping(format!(
                    "no virtual links over {physical} in tenant {tenant}"
                ))
            })
    }

    /// All virtual links, of every tenant, crossing a physical link.
    pub fn virtual_links_over(&self, physical: LinkKey) -> Vec<VLinkKey> {
        self.phys_links
            .get(&physical)
            .map(|t| {
                t.iter()
                    .flat_map(|(tid, s)| {
                        s.iter().map(move |ends| VLinkKey::new(*tid, *ends))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_ovx_links(&self, physical: LinkKey, tenant: TenantId) -> bool {
        self.phys_links
            .get(&physical)
            .is_some_and(|t| t.contains_key(&tenant))
    }

    pub fn remove_virtual_link(&mut self, virt: VLinkKey) {
        let Some(path) = self.virt_links.remove(&virt) else {
            return;
        };
        for link in path {
            let Some(tenants) = self.phys_links.get_mut(&link) else {
                continue;
            };
            if let Some(set) = tenants.get_mut(&virt.tenant) {
                set.remove(&virt.ends);
                if set.is_empty() {
                    tenants.remove(&virt.tenant);
                }
            }
            if tenants.is_empty() {
                self.phys_links.remove(&link);
            }
        }
    }

    /// Forget a physical link that has gone away.  Virtual links and
    /// routes crossing it stop listing it in their paths.
    pub fn remove_physical_link(&mut self, physical: LinkKey) {
        if let Some(tenants) = self.phys_links.remove(&physical) {
            for (tenant, ends) in tenants {
                for e in ends {
                    let virt = VLinkKey::new(tenant, e);
                    if let Some(path) = self.virt_links.get_mut(&virt) {
                        path.retain(|l| *l != physical);
                    }
                }
            }
        }
        if let Some(tenants) = self.phys_routes.remove(&physical) {
            for route in tenants.into_values().flatten() {
                if let Some(path) = self.routes.get_mut(&route) {
                    path.retain(|l| *l != physical);
                }
            }
        }
        debug!(self.log, "removed physical link"; "link" => %physical);
    }

    // Big switch routes

    pub fn add_route(&mut self, route: RouteKey, path: &[LinkKey]) {
        self.remove_route(route);
        for link in path {
            self.phys_routes
                .entry(*link)
                .or_default()
                .entry(route.tenant)
                .or_default()
                .insert(route);
        }
        self.routes.insert(route, path.to_vec());
    }

    pub fn get_route(&self, route: RouteKey) -> OvxResult<Vec<LinkKey>> {
        self.routes.get(&route).cloned().ok_or_else(|| {
            OvxError::LinkMapping(format!("no path for route {route:?}"))
        })
    }

    pub fn get_switch_routes(
        &self,
        physical: LinkKey,
        tenant: TenantId,
    ) -> OvxResult<Vec<RouteKey>> {
        self.phys_routes
            .get(&physical)
            .and_then(|t| t.get(&tenant))
            .map(|s| s.iter().copied().collect())
            .ok_or_else(|| {
                OvxError::LinkMapping(format!(
                    "no routes over {physical} in tenant {tenant}"
                ))
            })
    }

    /// All routes, of every tenant, crossing a physical link.
    pub fn routes_over(&self, physical: LinkKey) -> Vec<RouteKey> {
        self.phys_routes
            .get(&physical)
            .map(|t| t.values().flat_map(|s| s.iter().copied()).collect())
            .unwrap_or_default()
    }

    pub fn has_switch_routes(&self, physical: LinkKey, tenant: TenantId) -> bool {
        self.phys_routes
            .get(&physical)
            .is_some_and(|t| t.contains_key(&tenant))
    }

    pub fn remove_route(&mut self, route: RouteKey) {
        let Some(path) = self.routes.remove(&route) else {
            return;
        };
        for link in path {
            let Some(tenants) = self.phys_routes.get_mut(&link) else {
                continue;
            };
            if let Some(set) = tenants.get_mut(&route.tenant) {
                set.remove(&route);
                if set.is_empty() {
                    tenants.remove(&route.tenant);
                }
            }
            if tenants.is_empty() {
                self.phys_routes.remove(&link);
            }
        }
    }

    // Addresses

    pub fn add_ip(&mut self, tenant: TenantId, physical: Ipv4Addr, virt: Ipv4Addr) {
        self.phys_ips.insert(physical, (tenant, virt));
        self.virt_ips.insert((tenant, virt), physical);
    }

    pub fn get_physical_ip(
        &self,
        tenant: TenantId,
        virt: Ipv4Addr,
    ) -> OvxResult<Ipv4Addr> {
        self.virt_ips.get(&(tenant, virt)).copied().ok_or_else(|| {
            OvxError::AddressMapping(format!(
                "no physical address for {virt} in tenant {tenant}"
            ))
        })
    }

    pub fn get_virtual_ip(
        &self,
        physical: Ipv4Addr,
    ) -> OvxResult<(TenantId, Ipv4Addr)> {
        self.phys_ips.get(&physical).copied().ok_or_else(|| {
            OvxError::AddressMapping(format!("no virtual address for {physical}"))
        })
    }

    pub fn has_physical_ip(&self, tenant: TenantId, virt: Ipv4Addr) -> bool {
        self.virt_ips.contains_key(&(tenant, virt))
    }

    pub fn has_virtual_ip(&self, physical: Ipv4Addr) -> bool {
        self.phys_ips.contains_key(&physical)
    }

    pub fn remove_virtual_ips(&mut self, tenant: TenantId) {
        self.virt_ips.retain(|(tid, _), _| *tid != tenant);
        self.phys_ips.retain(|_, (tid, _)| *tid != tenant);
    }

    /// Record the owner of a host address.  An address belongs to at most
    /// one tenant.
    pub fn add_mac(&mut self, mac: MacAddr, tenant: TenantId) -> OvxResult<()> {
        match self.macs.get(&mac) {
            Some(owner) if *owner != tenant => Err(OvxError::DuplicateMac(mac)),
            _ => {
                self.macs.insert(mac, tenant);
                Ok(())
            }
        }
    }

    pub fn get_mac(&self, mac: MacAddr) -> OvxResult<TenantId> {
        self.macs.get(&mac).copied().ok_or_else(|| {
            OvxError::AddressMapping(format!("{mac} is not provisioned"))
        })
    }

    pub fn has_mac(&self, mac: MacAddr) -> bool {
        self.macs.contains_key(&mac)
    }

    pub fn remove_mac(&mut self, mac: MacAddr) {
        self.macs.remove(&mac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use pretty_assertions::assert_eq;

    fn link(a: Dpid, ap: PortNo, b: Dpid, bp: PortNo) -> LinkKey {
        LinkKey::new(PortRef::new(a, ap), PortRef::new(b, bp))
    }

    #[test]
    fn test_switch_mapping_is_bidirectional() {
        let mut map = OvxMap::new(&test_log());
        let v = VSwitchRef::new(1, 0xa4_2305_0000_0001);
        map.add_switches(&[1, 2], v);

        assert_eq!(map.get_physical_switches(v).unwrap(), vec![1, 2]);
        assert_eq!(map.get_virtual_switch(1, 1).unwrap(), v.dpid);
        assert_eq!(map.get_virtual_switch(2, 1).unwrap(), v.dpid);
        assert!(map.get_virtual_switch(1, 2).is_err());

        map.remove_virtual_switch(v);
        assert!(matches!(
            map.get_physical_switches(v),
            Err(OvxError::SwitchMapping(_))
        ));
        assert!(!map.has_virtual_switch(1, 1));
        assert!(!map.has_virtual_switch(2, 1));
        assert!(map.get_virtual_switches(1).is_empty());
    }

    #[test]
    fn test_two_tenants_share_a_physical_switch() {
        let mut map = OvxMap::new(&test_log());
        map.add_switches(&[1], VSwitchRef::new(1, 10));
        map.add_switches(&[1], VSwitchRef::new(2, 20));
        assert_eq!(
            map.get_virtual_switches(1),
            vec![VSwitchRef::new(1, 10), VSwitchRef::new(2, 20)]
        );
        map.remove_physical_switch(1);
        assert!(map.get_virtual_switches(1).is_empty());
        assert!(matches!(
            map.get_physical_switches(VSwitchRef::new(1, 10)),
            Err(OvxError::SwitchMapping(_))
        ));
        assert!(map.get_physical_switches(VSwitchRef::new(2, 20)).is_err());
    }

    #[test]
    fn test_big_switch_outlives_one_physical_switch() {
        let mut map = OvxMap::new(&test_log());
        let v = VSwitchRef::new(1, 10);
        map.add_switches(&[1, 2], v);
        map.remove_physical_switch(1);
        assert_eq!(map.get_physical_switches(v).unwrap(), vec![2]);
        assert_eq!(map.get_virtual_switch(2, 1).unwrap(), 10);
        map.remove_physical_switch(2);
        assert!(map.get_physical_switches(v).is_err());
    }

    #[test]
    fn test_links_are_replaced_wholesale() {
        let mut map = OvxMap::new(&test_log());
        let ends = link(10, 1, 11, 1);
        let v = VLinkKey::new(1, ends);
        let a = link(1, 1, 2, 1);
        let b = link(1, 2, 3, 1);
        let c = link(3, 2, 2, 2);

        map.add_links(&[a], v);
        assert_eq!(map.get_virtual_links(a, 1).unwrap(), vec![ends]);

        map.add_links(&[b, c], v);
        assert_eq!(map.get_physical_links(v).unwrap(), vec![b, c]);
        assert!(!map.has_ovx_links(a, 1));
        assert_eq!(map.virtual_links_over(c), vec![v]);

        map.remove_virtual_link(v);
        assert!(map.get_physical_links(v).is_err());
        assert!(!map.has_ovx_links(b, 1));
        assert!(!map.has_ovx_links(c, 1));
    }

    #[test]
    fn test_routes() {
        let mut map = OvxMap::new(&test_log());
        let r = RouteKey::new(1, 99, 1);
        let a = link(1, 3, 2, 3);
        map.add_route(r, &[a]);
        assert_eq!(map.get_route(r).unwrap(), vec![a]);
        assert_eq!(map.get_switch_routes(a, 1).unwrap(), vec![r]);
        assert_eq!(map.routes_over(a), vec![r]);
        map.remove_route(r);
        assert!(map.get_route(r).is_err());
        assert!(!map.has_switch_routes(a, 1));
    }

    #[test]
    fn test_physical_link_removed_both_ways() {
        let mut map = OvxMap::new(&test_log());
        let v = VLinkKey::new(1, link(10, 1, 11, 1));
        let r = RouteKey::new(1, 99, 1);
        let a = link(1, 1, 2, 1);
        let b = link(2, 2, 3, 1);
        map.add_links(&[a, b], v);
        map.add_route(r, &[b, a]);

        map.remove_physical_link(a);
        assert!(!map.has_ovx_links(a, 1));
        assert!(!map.has_switch_routes(a, 1));
        assert_eq!(map.get_physical_links(v).unwrap(), vec![b]);
        assert_eq!(map.get_route(r).unwrap(), vec![b]);
        assert_eq!(map.virtual_links_over(b), vec![v]);

        // Re-binding after recovery restores both sides.
        map.add_links(&[a, b], v);
        assert_eq!(map.virtual_links_over(a), vec![v]);
        assert_eq!(map.get_physical_links(v).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_addresses() {
        let mut map = OvxMap::new(&test_log());
        let vip = Ipv4Addr::new(10, 0, 0, 1);
        let pip = Ipv4Addr::new(1, 0, 0, 1);
        map.add_ip(1, pip, vip);
        assert_eq!(map.get_physical_ip(1, vip).unwrap(), pip);
        assert_eq!(map.get_virtual_ip(pip).unwrap(), (1, vip));
        assert!(map.get_physical_ip(2, vip).is_err());
        map.remove_virtual_ips(1);
        assert!(!map.has_physical_ip(1, vip));
        assert!(!map.has_virtual_ip(pip));

        let mac = MacAddr::new(0, 0, 0, 0, 0, 1);
        map.add_mac(mac, 1).unwrap();
        map.add_mac(mac, 1).unwrap();
        assert!(matches!(map.add_mac(mac, 2), Err(OvxError::DuplicateMac(_))));
        assert_eq!(map.get_mac(mac).unwrap(), 1);
        map.remove_mac(mac);
        assert!(matches!(
            map.get_mac(mac),
            Err(OvxError::AddressMapping(_))
        ));
    }
}
