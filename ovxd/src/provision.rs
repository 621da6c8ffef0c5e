// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Tenant networks described in a TOML file, built once the physical
//! switches they use have connected.
//!
//! ```toml
//! [[network]]
//! controllers = ["tcp:127.0.0.1:6633"]
//! network = "10.0.0.0"
//! mask = 16
//!
//! [[network.switch]]
//! name = "s1"
//! physical = [1, 2]
//! alg = "spf"
//!
//! [[network.port]]
//! name = "h1"
//! dpid = 1
//! port = 1
//!
//! [[network.host]]
//! port = "h1"
//! mac = "00:00:00:00:00:01"
//! ```
//!
//! Elements refer to each other by name.  Links between virtual ports are
//! routed by the hypervisor unless they carry an explicit `path`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use slog::error;
use slog::info;

use common::network::MacAddr;

use crate::pathset::Path;
use crate::routing::RoutingAlgorithm;
use crate::types::*;
use crate::Hypervisor;

const READY_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantFile {
    #[serde(default)]
    pub network: Vec<NetworkDesc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDesc {
    pub controllers: Vec<String>,
    pub network: Ipv4Addr,
    pub mask: u8,
    #[serde(default)]
    pub switch: Vec<SwitchDesc>,
    #[serde(default)]
    pub port: Vec<PortDesc>,
    #[serde(default)]
    pub link: Vec<LinkDesc>,
    #[serde(default)]
    pub route: Vec<RouteDesc>,
    #[serde(default)]
    pub host: Vec<HostDesc>,
    #[serde(default = "default_boot")]
    pub boot: bool,
}

fn default_boot() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchDesc {
    pub name: String,
    pub physical: Vec<Dpid>,
    #[serde(default)]
    pub alg: RoutingAlgorithm,
    #[serde(default)]
    pub backups: u8,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortDesc {
    pub name: String,
    pub dpid: Dpid,
    pub port: PortNo,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkDesc {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub alg: RoutingAlgorithm,
    #[serde(default)]
    pub backups: u8,
    /// Explicit physical path, for `manual` links.
    #[serde(default)]
    pub path: Path,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteDesc {
    pub switch: String,
    pub ingress: String,
    pub egress: String,
    pub path: Path,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostDesc {
    pub port: String,
    pub mac: String,
}

impl TenantFile {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&contents)?)
    }

    /// Every physical switch the file refers to.
    pub fn physical_dpids(&self) -> BTreeSet<Dpid> {
        let mut dpids = BTreeSet::new();
        for net in &self.network {
            dpids.extend(net.switch.iter().flat_map(|s| s.physical.iter().copied()));
            dpids.extend(net.port.iter().map(|p| p.dpid));
        }
        dpids
    }
}

fn lookup<T: Copy>(names: &BTreeMap<&str, T>, kind: &str, name: &str) -> OvxResult<T> {
    names
        .get(name)
        .copied()
        .ok_or_else(|| OvxError::Mapping(format!("no {kind} named {name:?}")))
}

/// Build one tenant network.  A network that fails part way is left
/// registered but down.
pub fn apply_network(hv: &Arc<Hypervisor>, desc: &NetworkDesc) -> OvxResult<TenantId> {
    let tenant = hv.create_network(desc.controllers.clone(), desc.network, desc.mask)?;
    {
        let net = hv.network(tenant)?;
        let mut net = net.lock();

        let mut switches = BTreeMap::new();
        for s in &desc.switch {
            let vdpid = net.create_switch(hv, &s.physical, s.alg, s.backups)?;
            switches.insert(s.name.as_str(), vdpid);
        }
        let mut ports = BTreeMap::new();
        for p in &desc.port {
            let vport = net.create_port(hv, p.dpid, p.port)?;
            ports.insert(p.name.as_str(), vport);
        }
        for l in &desc.link {
            let src = lookup(&ports, "port", &l.src)?;
            let dst = lookup(&ports, "port", &l.dst)?;
            if l.path.is_empty() {
                net.create_link(hv, src, dst, l.alg, l.backups)?;
            } else {
                net.create_link_with_path(hv, src, dst, l.path.clone(), l.priority)?;
            }
        }
        for r in &desc.route {
            let vdpid = lookup(&switches, "switch", &r.switch)?;
            let ingress = lookup(&ports, "port", &r.ingress)?;
            let egress = lookup(&ports, "port", &r.egress)?;
            net.create_route(hv, vdpid, ingress.port, egress.port, r.path.clone(), r.priority)?;
        }
        for h in &desc.host {
            let port = lookup(&ports, "port", &h.port)?;
            let mac: MacAddr = h
                .mac
                .parse()
                .map_err(|e| OvxError::InvalidHost(format!("{}: {e}", h.mac)))?;
            net.create_host(hv, port, mac)?;
        }
    }
    if desc.boot && !hv.boot_network(tenant)? {
        return Err(OvxError::NetworkMapping(format!(
            "tenant {tenant} did not boot"
        )));
    }
    Ok(tenant)
}

/// Build every network in the file, returning the tenants created.
/// Failures are logged and do not stop the remaining networks.
pub fn apply(hv: &Arc<Hypervisor>, file: &TenantFile) -> Vec<TenantId> {
    let mut tenants = Vec::new();
    for (idx, desc) in file.network.iter().enumerate() {
        match apply_network(hv, desc) {
            Ok(tenant) => {
                info!(hv.log, "provisioned network"; "tenant" => tenant, "network" => %desc.network);
                tenants.push(tenant);
            }
            Err(e) => {
                error!(hv.log, "failed to provision network"; "index" => idx, "error" => %e);
            }
        }
    }
    tenants
}

/// Wait for the physical switches named in `file`, then build its
/// networks.
pub async fn apply_when_ready(hv: Arc<Hypervisor>, file: TenantFile) {
    let wanted = file.physical_dpids();
    loop {
        let missing: Vec<Dpid> = {
            let physical = hv.physical.lock();
            wanted
                .iter()
                .filter(|d| !physical.topo.switches.contains_key(d))
                .copied()
                .collect()
        };
        if missing.is_empty() {
            break;
        }
        slog::debug!(hv.log, "waiting for switches";
            "missing" => missing.len());
        tokio::time::sleep(READY_POLL).await;
    }
    apply(&hv, &file);
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
        [[network]]
        controllers = ["tcp:127.0.0.1:6633"]
        network = "10.0.0.0"
        mask = 16

        [[network.switch]]
        name = "s1"
        physical = [1]

        [[network.switch]]
        name = "s2"
        physical = [2]

        [[network.port]]
        name = "h1"
        dpid = 1
        port = 1

        [[network.port]]
        name = "s1-up"
        dpid = 1
        port = 2

        [[network.port]]
        name = "s2-up"
        dpid = 2
        port = 2

        [[network.link]]
        src = "s1-up"
        dst = "s2-up"
        alg = "manual"
        path = [{ src = { dpid = 1, port = 2 }, dst = { dpid = 2, port = 2 } }]

        [[network.host]]
        port = "h1"
        mac = "00:00:00:00:00:01"
    "#;

    #[test]
    fn test_parse_tenant_file() {
        let file: TenantFile = toml::from_str(FILE).unwrap();
        assert_eq!(file.network.len(), 1);
        let net = &file.network[0];
        assert!(net.boot);
        assert_eq!(net.switch[0].alg, RoutingAlgorithm::Manual);
        assert_eq!(net.link[0].path.len(), 1);
        assert_eq!(net.link[0].path[0].dst, PortRef::new(2, 2));
        assert_eq!(file.physical_dpids().into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let res: Result<TenantFile, _> = toml::from_str(
            r#"
            [[network]]
            controllers = []
            network = "10.0.0.0"
            mask = 16
            colour = "blue"
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_lookup_reports_missing_names() {
        let mut names = BTreeMap::new();
        names.insert("a", 1u32);
        assert_eq!(lookup(&names, "port", "a").unwrap(), 1);
        assert!(matches!(lookup(&names, "port", "b"), Err(OvxError::Mapping(_))));
    }
}
