// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Outbound queues for every live OpenFlow connection.
//!
//! Each connection task owns the writing half of its socket and drains an
//! unbounded queue registered here.  Everything else in the daemon sends by
//! pushing onto the queue for the destination.

use std::collections::BTreeMap;

use openflow::OfMessage;
use parking_lot::Mutex;
use slog::debug;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::types::*;

pub type Outbound = mpsc::UnboundedSender<OfMessage>;

pub struct ChannelRegistry {
    log: slog::Logger,
    switches: Mutex<BTreeMap<Dpid, Outbound>>,
    controllers: Mutex<BTreeMap<VSwitchRef, ControllerEntry>>,
}

struct ControllerEntry {
    tx: Outbound,
    // Dropped with the entry, which tells the session to hang up.
    _closer: oneshot::Sender<()>,
}

impl ChannelRegistry {
    pub fn new(log: &slog::Logger) -> Self {
        ChannelRegistry {
            log: log.new(slog::o!("unit" => "channels")),
            switches: Mutex::new(BTreeMap::new()),
            controllers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_switch(&self, dpid: Dpid, tx: Outbound) {
        self.switches.lock().insert(dpid, tx);
    }

    pub fn remove_switch(&self, dpid: Dpid) {
        self.switches.lock().remove(&dpid);
    }

    /// Returns false if the switch has no live connection.
    pub fn send_switch(&self, dpid: Dpid, msg: OfMessage) -> bool {
        let switches = self.switches.lock();
        match switches.get(&dpid) {
            Some(tx) => tx.send(msg).is_ok(),
            None => {
                debug!(self.log, "no channel to switch";
                    "dpid" => format!("{dpid:016x}"), "type" => %msg.of_type());
                false
            }
        }
    }

    /// Register a controller connection.  The returned receiver completes
    /// once the registration is removed.
    pub fn add_controller(
        &self,
        vswitch: VSwitchRef,
        tx: Outbound,
    ) -> oneshot::Receiver<()> {
        let (closer, closed) = oneshot::channel();
        self.controllers.lock().insert(
            vswitch,
            ControllerEntry {
                tx,
                _closer: closer,
            },
        );
        closed
    }

    pub fn remove_controller(&self, vswitch: VSwitchRef) {
        self.controllers.lock().remove(&vswitch);
    }

    pub fn is_controller_connected(&self, vswitch: VSwitchRef) -> bool {
        self.controllers
            .lock()
            .get(&vswitch)
            .is_some_and(|c| !c.tx.is_closed())
    }

    pub fn send_controller(&self, vswitch: VSwitchRef, msg: OfMessage) -> bool {
        let controllers = self.controllers.lock();
        match controllers.get(&vswitch) {
            Some(c) => c.tx.send(msg).is_ok(),
            None => {
                debug!(self.log, "no controller channel";
                    "vswitch" => %vswitch, "type" => %msg.of_type());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use openflow::OfBody;

    #[test]
    fn test_send_reaches_registered_channel() {
        let reg = ChannelRegistry::new(&test_log());
        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.add_switch(7, tx);

        assert!(reg.send_switch(7, OfMessage::new(3, OfBody::BarrierRequest)));
        assert!(!reg.send_switch(8, OfMessage::new(3, OfBody::BarrierRequest)));
        assert_eq!(rx.try_recv().unwrap().xid, 3);

        reg.remove_switch(7);
        assert!(!reg.send_switch(7, OfMessage::new(4, OfBody::BarrierRequest)));
    }

    #[test]
    fn test_controller_connected_tracks_receiver() {
        let reg = ChannelRegistry::new(&test_log());
        let vref = VSwitchRef::new(1, 0xa42305_0000_0001);
        let (tx, rx) = mpsc::unbounded_channel();
        let _closed = reg.add_controller(vref, tx);
        assert!(reg.is_controller_connected(vref));
        drop(rx);
        assert!(!reg.is_controller_connected(vref));
    }

    #[tokio::test]
    async fn test_removal_signals_session() {
        let reg = ChannelRegistry::new(&test_log());
        let vref = VSwitchRef::new(2, 0xa42305_0000_0002);
        let (tx, _rx) = mpsc::unbounded_channel();
        let closed = reg.add_controller(vref, tx);
        reg.remove_controller(vref);
        assert!(closed.await.is_err());
        assert!(!reg.send_controller(vref, OfMessage::new(1, OfBody::Hello)));
    }
}
