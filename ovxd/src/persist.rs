// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Hooks recording the provisioned virtual topology.
//!
//! Each virtual element is saved when it is created and removed when it is
//! destroyed.  The daemon ships a backend that writes each record to the
//! log; a database backend plugs in behind the same trait.

use std::net::Ipv4Addr;

use serde::Serialize;
use slog::debug;

use common::network::MacAddr;

use crate::pathset::Path;
use crate::routing::RoutingAlgorithm;
use crate::types::*;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Network {
        tenant: TenantId,
        controllers: Vec<String>,
        network: Ipv4Addr,
        mask: u8,
    },
    Switch {
        tenant: TenantId,
        dpid: Dpid,
        physical: Vec<Dpid>,
        alg: RoutingAlgorithm,
        backups: u8,
    },
    Port {
        tenant: TenantId,
        dpid: Dpid,
        port: PortNo,
        physical: PortRef,
    },
    Link {
        tenant: TenantId,
        link_id: u32,
        src: PortRef,
        dst: PortRef,
        alg: RoutingAlgorithm,
        paths: Vec<(Path, u8)>,
    },
    Host {
        tenant: TenantId,
        host_id: u32,
        mac: MacAddr,
        port: PortRef,
    },
    Route {
        tenant: TenantId,
        dpid: Dpid,
        route_id: u32,
        ingress: PortNo,
        egress: PortNo,
        path: Path,
        priority: u8,
    },
}

impl Record {
    pub fn tenant(&self) -> TenantId {
        match self {
            Record::Network { tenant, .. }
            | Record::Switch { tenant, .. }
            | Record::Port { tenant, .. }
            | Record::Link { tenant, .. }
            | Record::Host { tenant, .. }
            | Record::Route { tenant, .. } => *tenant,
        }
    }

    /// The key identifying the element within its tenant's document.
    pub fn index(&self) -> String {
        match self {
            Record::Network { tenant, .. } => format!("network/{tenant}"),
            Record::Switch { dpid, .. } => format!("switch/{dpid:016x}"),
            Record::Port { dpid, port, .. } => {
                format!("port/{dpid:016x}/{port}")
            }
            Record::Link { link_id, .. } => format!("link/{link_id}"),
            Record::Host { host_id, .. } => format!("host/{host_id}"),
            Record::Route { dpid, route_id, .. } => {
                format!("route/{dpid:016x}/{route_id}")
            }
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait Persistence: Send + Sync {
    fn save(&self, record: &Record);
    fn remove(&self, record: &Record);
}

/// Writes each record to the log as JSON.
pub struct LogPersistence {
    log: slog::Logger,
}

impl LogPersistence {
    pub fn new(log: &slog::Logger) -> Self {
        LogPersistence {
            log: log.new(slog::o!("unit" => "persistence")),
        }
    }
}

impl Persistence for LogPersistence {
    fn save(&self, record: &Record) {
        let doc = serde_json::to_string(record)
            .unwrap_or_else(|e| format!("<unserializable: {e}>"));
        debug!(self.log, "save";
            "tenant" => record.tenant(),
            "index" => record.index(),
            "record" => doc);
    }

    fn remove(&self, record: &Record) {
        debug!(self.log, "remove";
            "tenant" => record.tenant(),
            "index" => record.index());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_json() {
        let r = Record::Host {
            tenant: 3,
            host_id: 1,
            mac: MacAddr::new(0, 0, 0, 0, 0, 9),
            port: PortRef::new(0xa42305_0000_0001, 2),
        };
        let v: serde_json::Value = serde_json::to_value(&r).unwrap();
        assert_eq!(v["kind"], "host");
        assert_eq!(v["tenant"], 3);
        assert_eq!(r.index(), "host/1");
    }

    #[test]
    fn test_index_is_per_element() {
        let sw = Record::Switch {
            tenant: 1,
            dpid: 0xa42305_0000_0001,
            physical: vec![1],
            alg: RoutingAlgorithm::Manual,
            backups: 0,
        };
        assert_eq!(sw.index(), "switch/00a4230500000001");
        let port = Record::Port {
            tenant: 1,
            dpid: 0xa42305_0000_0001,
            port: 4,
            physical: PortRef::new(1, 4),
        };
        assert_eq!(port.index(), "port/00a4230500000001/4");
    }
}
