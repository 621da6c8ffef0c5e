// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Main application entry point for `ovxd`, the OpenFlow network
//! virtualization hypervisor.
//!
//! Physical switches connect to the daemon.  Each tenant gets a virtual
//! network of virtual switches built over them, and the daemon connects each
//! virtual switch to the tenant's controllers, translating messages in both
//! directions.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::os::raw::c_int;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::stream::StreamExt;
use openflow::port::OFPP_NONE;
use openflow::FlowMod;
use openflow::FlowStatsRequest;
use openflow::Match;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PacketIn;
use openflow::StatsRequest;
use openflow::StatsRequestBody;
use parking_lot::Mutex;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address::IpMapper;
use crate::channel::ChannelRegistry;
use crate::index::BitSetIndex;
use crate::index::IndexType;
use crate::linkfield::LinkField;
use crate::linkfield::LinkFields;
use crate::map::OvxMap;
use crate::persist::LogPersistence;
use crate::persist::Persistence;
use crate::physical::PhysicalNetwork;
use crate::pool::WorkerPool;
use crate::state::Transition;
use crate::switch::PhysicalSwitch;
use crate::types::*;
use crate::virtnet::OvxNetwork;

mod actions;
mod address;
mod channel;
mod config;
mod discovery;
mod flowmgr;
mod flowtable;
mod index;
mod io;
mod link;
mod linkfield;
mod linkmgr;
mod map;
mod pathset;
mod persist;
mod physical;
mod pool;
mod port;
mod provision;
mod route;
mod routing;
mod state;
mod switch;
mod topology;
mod types;
mod virt;
mod virtnet;

/// Interval between polls of the physical switches' flow and port counters.
const STATS_POLL: Duration = Duration::from_secs(15);

#[derive(Debug, Default, StructOpt)]
#[structopt(name = "ovxd", about = "OpenFlow network virtualization hypervisor")]
pub(crate) struct Opt {
    #[structopt(long, about = "TOML file with the daemon's settings")]
    config: Option<String>,

    #[structopt(
        long,
        about = "send log data to the named file rather than stdout"
    )]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: Option<common::logging::LogFormat>,

    #[structopt(long, help = "address on which to accept physical switches")]
    of_host: Option<std::net::IpAddr>,

    #[structopt(long, help = "port on which to accept physical switches")]
    of_port: Option<u16>,

    #[structopt(long, help = "largest number of virtual networks to host")]
    max_virtual_nets: Option<u32>,

    #[structopt(
        long,
        help = "how virtual links are tagged: 'mac' or 'vlan'"
    )]
    link_field: Option<LinkField>,

    #[structopt(long, help = "number of message processing workers")]
    worker_threads: Option<usize>,

    #[structopt(long, help = "capacity of the message queue")]
    queue_depth: Option<usize>,

    #[structopt(
        long,
        help = "file describing tenant networks to build at startup"
    )]
    tenants: Option<String>,
}

/// The main context object for running all of `ovxd`.
pub struct Hypervisor {
    // Time this object was created.
    start_time: chrono::DateTime<chrono::Utc>,
    pub config: config::Config,
    pub log: slog::Logger,
    pub link_fields: LinkFields,
    pub tenant_bits: u32,
    pub physical: Mutex<physical::PhysicalNetwork>,
    pub map: Mutex<OvxMap>,
    pub channels: ChannelRegistry,
    pub persistence: Box<dyn Persistence>,
    pub pool: WorkerPool,

    tenant_ids: Mutex<BitSetIndex>,

    // Virtual switches wanting a controller connection.
    connect_tx: mpsc::UnboundedSender<VSwitchRef>,
    connect_rx: Mutex<Option<mpsc::UnboundedReceiver<VSwitchRef>>>,
}

impl Hypervisor {
    fn new(
        log: slog::Logger,
        config: config::Config,
        persistence: Box<dyn Persistence>,
    ) -> Self {
        let start_time = chrono::Utc::now();
        let tenant_bits = config.tenant_bits();

        let mut physical = PhysicalNetwork::new(&log);
        physical.transition(Transition::Register);
        physical.transition(Transition::Boot);

        let tenant_ids = BitSetIndex::new(
            IndexType::TenantId,
            IndexType::TenantId.capacity(tenant_bits, config.link_field),
        );
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        Hypervisor {
            start_time,
            link_fields: LinkFields::new(tenant_bits, config.link_field),
            tenant_bits,
            physical: Mutex::new(physical),
            map: Mutex::new(OvxMap::new(&log)),
            channels: ChannelRegistry::new(&log),
            persistence,
            pool: WorkerPool::new(&log, config.worker_threads, config.queue_depth),
            tenant_ids: Mutex::new(tenant_ids),
            connect_tx,
            connect_rx: Mutex::new(Some(connect_rx)),
            config,
            log,
        }
    }

    pub fn network(&self, tenant: TenantId) -> OvxResult<Arc<Mutex<OvxNetwork>>> {
        self.map.lock().get_virtual_network(tenant)
    }

    /// Queue a message for a physical switch.
    pub fn send_south(&self, dpid: Dpid, msg: OfMessage) {
        self.channels.send_switch(dpid, msg);
    }

    /// Queue a message for the controller of a virtual switch.
    pub fn send_north(&self, vref: VSwitchRef, msg: OfMessage) {
        self.channels.send_controller(vref, msg);
    }

    pub fn send_flow_mods(&self, mods: Vec<(Dpid, FlowMod)>) {
        for (dpid, fm) in mods {
            self.send_south(dpid, OfMessage::new(0, OfBody::FlowMod(fm)));
        }
    }

    /// Ask for `vref` to be connected to its tenant's controllers.  Returns
    /// false if nothing is serving connection requests.
    pub fn request_connect(&self, vref: VSwitchRef) -> bool {
        match self.connect_tx.send(vref) {
            Ok(()) => true,
            Err(_) => {
                debug!(self.log, "no controller connector"; "vswitch" => %vref);
                false
            }
        }
    }

    pub fn ip_mapper<'a>(
        &'a self,
        tenant: TenantId,
        counter: &'a mut BitSetIndex,
    ) -> IpMapper<'a> {
        IpMapper {
            log: &self.log,
            map: &self.map,
            tenant,
            tenant_bits: self.tenant_bits,
            counter,
        }
    }

    // Tenant networks

    /// Register a new, empty virtual network.  Returns its tenant id.
    pub fn create_network(
        &self,
        controllers: Vec<String>,
        network: Ipv4Addr,
        mask: u8,
    ) -> OvxResult<TenantId> {
        for url in &controllers {
            io::controller::parse_controller_url(url)?;
        }
        let tenant = self.tenant_ids.lock().get_new_index()?;
        let net = OvxNetwork::new(
            &self.log,
            tenant,
            controllers,
            network,
            mask,
            self.tenant_bits,
            self.config.link_field,
        );
        self.persistence.save(&net.record());
        self.map.lock().add_network(tenant, Arc::new(Mutex::new(net)));
        info!(self.log, "created virtual network";
            "tenant" => tenant, "network" => format!("{network}/{mask}"));
        Ok(tenant)
    }

    /// Bring a network up and start refreshing its keepalive flows.
    /// Returns false if the network could not boot.
    pub fn boot_network(self: &Arc<Self>, tenant: TenantId) -> OvxResult<bool> {
        let net = self.network(tenant)?;
        let (booted, active, alive) = {
            let mut n = net.lock();
            let booted = n.boot(self);
            (booted, n.is_active(), n.alive())
        };
        if active && alive.load(Ordering::SeqCst) {
            tokio::spawn(refresh_links(self.clone(), net, alive));
        }
        Ok(booted)
    }

    pub fn stop_network(&self, tenant: TenantId) -> OvxResult<bool> {
        Ok(self.network(tenant)?.lock().stop(self))
    }

    /// Tear a network down and forget it.
    pub fn remove_network(&self, tenant: TenantId) -> OvxResult<()> {
        let net = self.network(tenant)?;
        let record = {
            let mut n = net.lock();
            if !n.unregister(self) {
                return Err(OvxError::NetworkMapping(format!(
                    "tenant {tenant} cannot be removed in its current state"
                )));
            }
            n.record()
        };
        self.map.lock().remove_network(tenant);
        self.tenant_ids.lock().release_index(tenant);
        self.persistence.remove(&record);
        info!(self.log, "removed virtual network"; "tenant" => tenant);
        Ok(())
    }

    // Physical network events

    /// A switch has completed its handshake.  Returns false if it was
    /// refused, which happens when a switch with its dpid is already up.
    pub fn switch_connected(&self, sw: PhysicalSwitch) -> bool {
        let dpid = sw.dpid;
        let msgs = self.physical.lock().add_switch(sw);
        if msgs.is_empty() {
            return false;
        }
        for msg in msgs {
            self.send_south(dpid, msg);
        }
        true
    }

    /// A switch's channel has closed.  Virtual switches built on it alone
    /// go away; big switches lose the ports it carried.
    pub fn switch_disconnected(&self, dpid: Dpid) {
        let vswitches = self.map.lock().get_virtual_switches(dpid);
        for vref in vswitches {
            let Ok(net) = self.network(vref.tenant) else {
                continue;
            };
            let mut net = net.lock();
            let Ok(sw) = net.get_switch(vref.dpid) else {
                continue;
            };
            if !sw.is_big() {
                if let Err(e) = net.remove_switch(self, vref.dpid) {
                    warn!(self.log, "failed to remove virtual switch";
                        "vswitch" => %vref, "error" => %e);
                }
                continue;
            }
            let ports: Vec<PortNo> = sw
                .ports
                .values()
                .filter(|p| p.phys.dpid == dpid)
                .map(|p| p.port_no)
                .collect();
            for port in ports {
                if let Err(e) = net.remove_port(self, vref.dpid, port) {
                    warn!(self.log, "failed to remove virtual port";
                        "vswitch" => %vref, "port" => port, "error" => %e);
                }
            }
            net.drop_physical_switch(self, vref.dpid, dpid);
        }

        let lost = self.physical.lock().remove_switch(dpid);
        for key in lost.map(|(_, links)| links).unwrap_or_default() {
            self.physical_link_down(key);
        }
    }

    /// A discovery probe came back.
    pub fn handle_lldp(&self, dpid: Dpid, pi: &PacketIn) {
        let found = self.physical.lock().handle_lldp(dpid, pi);
        if let Some(key) = found {
            self.physical_link_up(key);
        }
    }

    pub fn physical_link_down(&self, key: LinkKey) {
        let tenants = self.map.lock().list_virtual_networks();
        for tenant in tenants {
            if let Ok(net) = self.network(tenant) {
                net.lock().physical_link_down(self, key);
            }
        }
        self.map.lock().remove_physical_link(key);
    }

    pub fn physical_link_up(&self, key: LinkKey) {
        let tenants = self.map.lock().list_virtual_networks();
        for tenant in tenants {
            if let Ok(net) = self.network(tenant) {
                net.lock().physical_link_up(self, key);
            }
        }
    }
}

// Resend a network's keepalive flows until it stops.
async fn refresh_links(
    hv: Arc<Hypervisor>,
    net: Arc<Mutex<OvxNetwork>>,
    alive: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(hv.config.link_refresh());
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !alive.load(Ordering::SeqCst) {
            break;
        }
        let flows = net.lock().link_mgr.snapshot();
        hv.send_flow_mods(flows);
    }
}

async fn discovery(hv: Arc<Hypervisor>) {
    let mut ticker = tokio::time::interval(hv.config.probe_interval());
    loop {
        ticker.tick().await;
        let (probes, lost) = hv.physical.lock().tick();
        for (dpid, probe) in probes {
            hv.send_south(dpid, probe);
        }
        for key in lost {
            info!(hv.log, "link timed out"; "link" => %key);
            hv.physical_link_down(key);
        }
    }
}

async fn poll_stats(hv: Arc<Hypervisor>) {
    let mut ticker = tokio::time::interval(STATS_POLL);
    loop {
        ticker.tick().await;
        let dpids: Vec<Dpid> = hv.physical.lock().topo.switches.keys().copied().collect();
        for dpid in dpids {
            let flows = StatsRequest::new(StatsRequestBody::Flow(FlowStatsRequest {
                ofmatch: Match::all(),
                table_id: 0xff,
                out_port: OFPP_NONE,
            }));
            let ports = StatsRequest::new(StatsRequestBody::Port { port_no: OFPP_NONE });
            hv.send_south(
                dpid,
                OfMessage::new(virt::stats::FLOW_POLL_XID, OfBody::StatsRequest(flows)),
            );
            hv.send_south(
                dpid,
                OfMessage::new(virt::stats::PORT_POLL_XID, OfBody::StatsRequest(ports)),
            );
        }
    }
}

async fn accept_switches(hv: Arc<Hypervisor>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(hv.log, "switch connected"; "peer" => %peer);
                tokio::spawn(io::switch::run(hv.clone(), stream, peer));
            }
            Err(e) => {
                error!(hv.log, "failed to accept connection"; "error" => %e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

// One connector per virtual switch at a time.
async fn connect_controllers(
    hv: Arc<Hypervisor>,
    mut rx: mpsc::UnboundedReceiver<VSwitchRef>,
) {
    let mut sessions: BTreeMap<VSwitchRef, JoinHandle<()>> = BTreeMap::new();
    while let Some(vref) = rx.recv().await {
        if sessions.get(&vref).is_some_and(|h| !h.is_finished()) {
            continue;
        }
        let task = tokio::spawn(io::controller::run(hv.clone(), vref));
        sessions.insert(vref, task);
    }
}

async fn handle_signals(hv: &Hypervisor, mut signals: Signals) {
    let log = hv.log.new(slog::o!("unit" => "signal_handler"));
    let handle = signals.handle();

    while let Some(signal) = signals.next().await {
        match signal {
            SIGTERM | SIGQUIT | SIGINT | SIGHUP => {
                info!(log, "received signal"; "sig" => signal);
                handle.close();
                return;
            }
            _ => unreachable!(),
        }
    }
}

async fn run_ovxd(opt: Opt) -> anyhow::Result<()> {
    let config = config::build_config(&opt)?;

    let log =
        common::logging::init("ovxd", &config.log_file, config.log_format)?;
    info!(log, "ovxd config: {config:#?}");

    let tenants = match &config.tenants {
        Some(file) => {
            debug!(log, "reading tenant networks"; "file" => file);
            Some(provision::TenantFile::load(file).await?)
        }
        None => None,
    };

    let persistence = Box::new(LogPersistence::new(&log));
    let hv = Arc::new(Hypervisor::new(log, config, persistence));
    hv.pool.start();

    let addr = SocketAddr::new(hv.config.of_host, hv.config.of_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(hv.log, "accepting switches"; "address" => %addr);

    if let Some(rx) = hv.connect_rx.lock().take() {
        tokio::spawn(connect_controllers(hv.clone(), rx));
    }
    tokio::spawn(accept_switches(hv.clone(), listener));
    tokio::spawn(discovery(hv.clone()));
    tokio::spawn(poll_stats(hv.clone()));
    if let Some(file) = tenants {
        tokio::spawn(provision::apply_when_ready(hv.clone(), file));
    }

    const SIGNALS: &[c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGHUP];
    let signals = Signals::new(SIGNALS).context("installing signal handlers")?;
    handle_signals(&hv, signals).await;

    let uptime = chrono::Utc::now() - hv.start_time;
    info!(hv.log, "shutting down";
        "uptime_secs" => uptime.num_seconds(),
        "networks" => hv.map.lock().list_virtual_networks().len());
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    run_ovxd(Opt::from_args()).await
}

#[cfg(test)]
fn test_log() -> slog::Logger {
    common::logging::test_logger()
}
