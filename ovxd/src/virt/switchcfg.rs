// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Switch and port configuration requests.  These never reach the physical
//! network: the virtual switch answers them itself.

use openflow::port::OFPPC_PORT_DOWN;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::QueueGetConfigReply;
use openflow::SwitchConfig;
use openflow::OFPET_PORT_MOD_FAILED;
use openflow::OFPPMFC_BAD_PORT;
use slog::debug;

use crate::types::*;
use crate::Hypervisor;

pub fn handle(hv: &Hypervisor, vref: VSwitchRef, msg: &OfMessage) -> OvxResult<()> {
    let net = hv.network(vref.tenant)?;
    let mut net = net.lock();

    let reply = match &msg.body {
        OfBody::GetConfigRequest => {
            let sw = net.get_switch(vref.dpid)?;
            Some(OfBody::GetConfigReply(SwitchConfig {
                flags: sw.config_flags,
                miss_send_len: sw.miss_send_len,
            }))
        }
        OfBody::SetConfig(cfg) => {
            let sw = net.topo.get_switch_mut(vref.dpid)?;
            sw.config_flags = cfg.flags;
            sw.miss_send_len = cfg.miss_send_len;
            debug!(hv.log, "switch config set";
                "vswitch" => %vref, "miss_send_len" => cfg.miss_send_len);
            None
        }
        OfBody::PortMod(pm) => {
            let sw = net.topo.get_switch_mut(vref.dpid)?;
            let Ok(port) = sw.get_port_mut(pm.port_no) else {
                drop(net);
                hv.send_north(
                    vref,
                    msg.error_reply(OFPET_PORT_MOD_FAILED, OFPPMFC_BAD_PORT),
                );
                return Ok(());
            };
            port.desc.config = (port.desc.config & !pm.mask) | (pm.config & pm.mask);
            let phys = port.phys;
            let admin_down = port.is_admin_down();
            if pm.mask & OFPPC_PORT_DOWN != 0 {
                let up = !admin_down && hv.physical.lock().is_port_enabled(phys);
                net.set_port_active(hv, PortRef::new(vref.dpid, pm.port_no), up);
            }
            None
        }
        OfBody::QueueGetConfigRequest { port } => {
            Some(OfBody::QueueGetConfigReply(QueueGetConfigReply {
                port: *port,
                queues: Vec::new(),
            }))
        }
        _ => None,
    };
    drop(net);

    if let Some(body) = reply {
        hv.send_north(vref, OfMessage::new(msg.xid, body));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingAlgorithm;
    use crate::tests::connect;
    use crate::tests::hypervisor;
    use openflow::PortMod;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    // A booted tenant with one switch over dpid 1 and ports on 1 and 2.
    // Returns what the tenant's controller and the physical switch receive.
    fn setup() -> (
        std::sync::Arc<Hypervisor>,
        VSwitchRef,
        mpsc::UnboundedReceiver<OfMessage>,
        mpsc::UnboundedReceiver<OfMessage>,
    ) {
        let hv = hypervisor();
        let south = connect(&hv, 1, &[1, 2]);
        let tenant = hv
            .create_network(Vec::new(), Ipv4Addr::new(10, 0, 0, 0), 16)
            .unwrap();
        let vdpid = {
            let net = hv.network(tenant).unwrap();
            let mut net = net.lock();
            let vdpid = net.create_switch(&hv, &[1], RoutingAlgorithm::Manual, 0).unwrap();
            net.create_port(&hv, 1, 1).unwrap();
            net.create_port(&hv, 1, 2).unwrap();
            vdpid
        };
        assert!(hv.boot_network(tenant).unwrap());
        let vref = VSwitchRef::new(tenant, vdpid);
        let (tx, north) = mpsc::unbounded_channel();
        let _ = hv.channels.add_controller(vref, tx);
        (hv, vref, north, south)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OfMessage>) -> Vec<OfMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_set_then_get_config() {
        let (hv, vref, mut north, _south) = setup();
        let cfg = SwitchConfig {
            flags: 0,
            miss_send_len: 256,
        };
        handle(&hv, vref, &OfMessage::new(3, OfBody::SetConfig(cfg))).unwrap();
        assert!(drain(&mut north).is_empty());

        handle(&hv, vref, &OfMessage::new(4, OfBody::GetConfigRequest)).unwrap();
        assert_eq!(
            drain(&mut north),
            vec![OfMessage::new(4, OfBody::GetConfigReply(cfg))]
        );
    }

    #[tokio::test]
    async fn test_queue_config_answered_locally() {
        let (hv, vref, mut north, mut south) = setup();
        drain(&mut south);
        let msg = OfMessage::new(8, OfBody::QueueGetConfigRequest { port: 1 });
        handle(&hv, vref, &msg).unwrap();
        assert_eq!(
            drain(&mut north),
            vec![OfMessage::new(
                8,
                OfBody::QueueGetConfigReply(QueueGetConfigReply {
                    port: 1,
                    queues: Vec::new(),
                })
            )]
        );
        assert!(drain(&mut south).is_empty());
    }

    #[tokio::test]
    async fn test_port_mod_stays_virtual() {
        let (hv, vref, mut north, mut south) = setup();
        drain(&mut south);
        let pm = PortMod {
            port_no: 1,
            hw_addr: common::network::MacAddr::ZERO,
            config: OFPPC_PORT_DOWN,
            mask: OFPPC_PORT_DOWN,
            advertise: 0,
        };
        handle(&hv, vref, &OfMessage::new(5, OfBody::PortMod(pm.clone()))).unwrap();
        {
            let net = hv.network(vref.tenant).unwrap();
            let net = net.lock();
            let port = net.get_switch(vref.dpid).unwrap().get_port(1).unwrap();
            assert!(port.is_admin_down());
            assert!(!port.active);
        }
        assert!(drain(&mut south).is_empty());
        drain(&mut north);

        let bad = PortMod { port_no: 9, ..pm };
        let msg = OfMessage::new(6, OfBody::PortMod(bad));
        handle(&hv, vref, &msg).unwrap();
        let replies = drain(&mut north);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0], msg.error_reply(OFPET_PORT_MOD_FAILED, OFPPMFC_BAD_PORT));
    }
}
