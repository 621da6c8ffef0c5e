// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Sessions with physical switches, which connect to the hypervisor.

use std::net::SocketAddr;
use std::sync::Arc;

use openflow::DescStats;
use openflow::FeaturesReply;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::PacketIn;
use openflow::PortStatus;
use openflow::StatsReplyBody;
use openflow::StatsRequest;
use openflow::StatsRequestBody;
use openflow::SwitchConfig;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::io::Channel;
use crate::switch::PhysicalSwitch;
use crate::types::*;
use crate::virt;
use crate::Hypervisor;

/// The miss_send_len the hypervisor asks every switch for: whole packets.
pub const FULL_MISS_SEND_LEN: u16 = 0xffff;

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum SwitchChannelState {
    Init,
    WaitHello,
    WaitFeaturesReply,
    WaitConfigReply,
    WaitDescriptionStatReply,
    Active,
}

/// What the handshake has learned so far.
#[derive(Debug, Default)]
pub struct PendingHandshake {
    features: Option<FeaturesReply>,
    port_status: Vec<PortStatus>,
}

impl PendingHandshake {
    /// Build the switch once its description has arrived.  Port status
    /// messages received meanwhile are returned for processing once it
    /// is up.
    pub fn into_switch(
        self,
        log: &slog::Logger,
        desc: DescStats,
    ) -> OvxResult<(PhysicalSwitch, Vec<PortStatus>)> {
        let features = self.features.ok_or_else(|| {
            OvxError::SwitchState("description before features".to_string())
        })?;
        Ok((PhysicalSwitch::new(log, features, desc), self.port_status))
    }
}

/// What the session should do in response to a message.
pub enum SwitchAction {
    Send(OfMessage),
    /// The handshake is complete.
    Connected(PhysicalSwitch, Vec<PortStatus>),
    /// Established traffic for the virtualization layer.
    Dispatch(OfMessage),
    /// A discovery probe came back.
    Lldp(PacketIn),
}

impl std::fmt::Debug for SwitchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchAction::Send(m) => write!(f, "Send({})", m.of_type()),
            SwitchAction::Connected(sw, ps) => {
                write!(f, "Connected({:016x}, {} port status)", sw.dpid, ps.len())
            }
            SwitchAction::Dispatch(m) => write!(f, "Dispatch({})", m.of_type()),
            SwitchAction::Lldp(pi) => write!(f, "Lldp(port {})", pi.in_port),
        }
    }
}

pub struct SwitchChannel {
    log: slog::Logger,
    pub state: SwitchChannelState,
    pending: PendingHandshake,
    dpid: Option<Dpid>,
}

impl SwitchChannel {
    pub fn new(log: &slog::Logger) -> Self {
        SwitchChannel {
            log: log.clone(),
            state: SwitchChannelState::Init,
            pending: PendingHandshake::default(),
            dpid: None,
        }
    }

    pub fn dpid(&self) -> Option<Dpid> {
        self.dpid
    }

    pub fn is_active(&self) -> bool {
        self.state == SwitchChannelState::Active
    }

    fn set_state(&mut self, next: SwitchChannelState) {
        debug!(self.log, "switch channel transition";
            "from" => %self.state, "to" => %next);
        self.state = next;
    }

    /// The connection is up: say hello.
    pub fn connect(&mut self) -> Vec<SwitchAction> {
        self.set_state(SwitchChannelState::WaitHello);
        vec![SwitchAction::Send(OfMessage::new(0, OfBody::Hello))]
    }

    fn illegal(&self, msg: &OfMessage) -> OvxError {
        OvxError::SwitchState(format!("{} in state {}", msg.of_type(), self.state))
    }

    pub fn handle(&mut self, msg: OfMessage) -> OvxResult<Vec<SwitchAction>> {
        use SwitchChannelState::*;

        let xid = msg.xid;
        match (self.state, msg.body) {
            (_, OfBody::EchoRequest(data)) => Ok(vec![SwitchAction::Send(
                OfMessage::new(xid, OfBody::EchoReply(data)),
            )]),
            (_, OfBody::EchoReply(_)) => Ok(Vec::new()),

            (WaitHello, OfBody::Hello) => {
                self.set_state(WaitFeaturesReply);
                Ok(vec![SwitchAction::Send(OfMessage::new(
                    xid,
                    OfBody::FeaturesRequest,
                ))])
            }
            (WaitFeaturesReply, OfBody::FeaturesReply(features)) => {
                self.dpid = Some(features.datapath_id);
                self.log = self.log.new(slog::o!(
                    "dpid" => format!("{:016x}", features.datapath_id)
                ));
                self.pending.features = Some(features);
                self.set_state(WaitConfigReply);
                let cfg = SwitchConfig {
                    flags: 0,
                    miss_send_len: FULL_MISS_SEND_LEN,
                };
                Ok(vec![
                    SwitchAction::Send(OfMessage::new(xid, OfBody::SetConfig(cfg))),
                    SwitchAction::Send(OfMessage::new(xid, OfBody::BarrierRequest)),
                    SwitchAction::Send(OfMessage::new(xid, OfBody::GetConfigRequest)),
                ])
            }
            (WaitConfigReply, OfBody::BarrierReply) => Ok(Vec::new()),
            (WaitConfigReply, OfBody::GetConfigReply(cfg)) => {
                if cfg.miss_send_len != FULL_MISS_SEND_LEN {
                    warn!(self.log, "switch did not take miss_send_len";
                        "miss_send_len" => cfg.miss_send_len);
                }
                self.set_state(WaitDescriptionStatReply);
                let req = StatsRequest::new(StatsRequestBody::Desc);
                Ok(vec![SwitchAction::Send(OfMessage::new(
                    xid,
                    OfBody::StatsRequest(req),
                ))])
            }
            (WaitDescriptionStatReply, OfBody::StatsReply(reply)) => {
                let StatsReplyBody::Desc(desc) = reply.body else {
                    return Ok(Vec::new());
                };
                let pending = std::mem::take(&mut self.pending);
                let (sw, statuses) = pending.into_switch(&self.log, desc)?;
                self.set_state(Active);
                Ok(vec![SwitchAction::Connected(sw, statuses)])
            }
            (WaitFeaturesReply | WaitConfigReply | WaitDescriptionStatReply, OfBody::PortStatus(ps)) => {
                self.pending.port_status.push(ps);
                Ok(Vec::new())
            }
            (state, OfBody::Error(err)) if state != Active => Err(OvxError::SwitchState(
                format!("error {}/{} during handshake", err.err_type, err.code),
            )),

            (Active, OfBody::PacketIn(pi)) if packet::lldp::is_lldp(&pi.data) => {
                Ok(vec![SwitchAction::Lldp(pi)])
            }
            (Active, body @ (OfBody::PortStatus(_)
                | OfBody::PacketIn(_)
                | OfBody::FlowRemoved(_)
                | OfBody::StatsReply(_)
                | OfBody::Error(_)
                | OfBody::BarrierReply
                | OfBody::Vendor(_))) => {
                Ok(vec![SwitchAction::Dispatch(OfMessage::new(xid, body))])
            }
            (_, body) => Err(self.illegal(&OfMessage::new(xid, body))),
        }
    }
}

/// Run a session with a switch that has just connected.
pub async fn run(hv: Arc<Hypervisor>, stream: TcpStream, peer: SocketAddr) {
    let log = hv.log.new(slog::o!("unit" => "switch_channel", "peer" => peer.to_string()));
    if let Err(e) = stream.set_nodelay(true) {
        debug!(log, "unable to set TCP_NODELAY"; "error" => %e);
    }
    let (r, w) = stream.into_split();
    let mut ch = Channel::new(&log, r, w, hv.config.idle_timeout(), hv.config.read_timeout());
    let mut fsm = SwitchChannel::new(&log);
    let mut registered = None;

    let res = session(&hv, &mut ch, &mut fsm, &mut registered).await;
    match &res {
        Err(e) if e.closes_channel() => {
            error!(log, "closing switch channel"; "error" => %e, "state" => %fsm.state)
        }
        _ => info!(log, "switch channel closed"),
    }
    if let Some(dpid) = registered {
        hv.channels.remove_switch(dpid);
        hv.switch_disconnected(dpid);
    }
}

async fn session(
    hv: &Arc<Hypervisor>,
    ch: &mut Channel,
    fsm: &mut SwitchChannel,
    registered: &mut Option<Dpid>,
) -> OvxResult<()> {
    let deadline = Instant::now() + hv.config.handshake_timeout();
    perform(hv, ch, fsm.connect(), registered)?;
    loop {
        let wait = (!fsm.is_active()).then_some(deadline);
        let msg = ch.next(wait).await?;
        let actions = fsm.handle(msg)?;
        perform(hv, ch, actions, registered)?;
    }
}

fn perform(
    hv: &Arc<Hypervisor>,
    ch: &Channel,
    actions: Vec<SwitchAction>,
    registered: &mut Option<Dpid>,
) -> OvxResult<()> {
    for action in actions {
        match action {
            SwitchAction::Send(msg) => ch.send(msg),
            SwitchAction::Connected(sw, statuses) => {
                let dpid = sw.dpid;
                hv.channels.add_switch(dpid, ch.sender());
                if !hv.switch_connected(sw) {
                    return Err(OvxError::SwitchState(format!(
                        "switch {dpid:016x} is already connected"
                    )));
                }
                *registered = Some(dpid);
                for ps in statuses {
                    submit(hv, dpid, OfMessage::new(0, OfBody::PortStatus(ps)));
                }
            }
            SwitchAction::Lldp(pi) => {
                if let Some(dpid) = *registered {
                    hv.handle_lldp(dpid, &pi);
                }
            }
            SwitchAction::Dispatch(msg) => {
                if let Some(dpid) = *registered {
                    submit(hv, dpid, msg);
                }
            }
        }
    }
    Ok(())
}

// Queue a message for the workers.  A full queue costs the message, not the
// channel.
fn submit(hv: &Arc<Hypervisor>, dpid: Dpid, msg: OfMessage) {
    let worker_hv = hv.clone();
    let of_type = msg.of_type();
    let job = Box::new(move || {
        if let Err(e) = virt::from_switch(&worker_hv, dpid, msg) {
            match e {
                OvxError::DroppedMessage(_) => {
                    debug!(worker_hv.log, "message from switch dropped";
                        "dpid" => format!("{dpid:016x}"), "error" => %e)
                }
                e => warn!(worker_hv.log, "failed to handle message from switch";
                    "dpid" => format!("{dpid:016x}"), "error" => %e),
            }
        }
    });
    if let Err(e) = hv.pool.submit(dpid, job) {
        error!(hv.log, "unable to queue message from switch";
            "dpid" => format!("{dpid:016x}"), "type" => %of_type, "error" => %e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use openflow::ErrorMsg;
    use openflow::PhyPort;
    use openflow::PortReason;
    use openflow::StatsReply;
    use common::network::MacAddr;

    fn features(dpid: Dpid) -> FeaturesReply {
        FeaturesReply {
            datapath_id: dpid,
            n_buffers: 256,
            n_tables: 1,
            capabilities: 0,
            actions: 0,
            ports: vec![PhyPort::new(1, MacAddr::ovx(1), "eth1")],
        }
    }

    fn sent(actions: &[SwitchAction]) -> Vec<openflow::OfType> {
        actions
            .iter()
            .filter_map(|a| match a {
                SwitchAction::Send(m) => Some(m.of_type()),
                _ => None,
            })
            .collect()
    }

    fn msg(body: OfBody) -> OfMessage {
        OfMessage::new(5, body)
    }

    fn handshake(ch: &mut SwitchChannel) -> Vec<SwitchAction> {
        ch.connect();
        ch.handle(msg(OfBody::Hello)).unwrap();
        ch.handle(msg(OfBody::FeaturesReply(features(7)))).unwrap();
        let cfg = SwitchConfig {
            flags: 0,
            miss_send_len: FULL_MISS_SEND_LEN,
        };
        ch.handle(msg(OfBody::GetConfigReply(cfg))).unwrap();
        let reply = StatsReply {
            flags: 0,
            body: StatsReplyBody::Desc(DescStats::default()),
        };
        ch.handle(msg(OfBody::StatsReply(reply))).unwrap()
    }

    #[test]
    fn test_handshake_sequence() {
        use openflow::OfType;

        let mut ch = SwitchChannel::new(&test_log());
        assert_eq!(sent(&ch.connect()), vec![OfType::Hello]);
        assert_eq!(ch.state, SwitchChannelState::WaitHello);

        let a = ch.handle(msg(OfBody::Hello)).unwrap();
        assert_eq!(sent(&a), vec![OfType::FeaturesRequest]);

        let a = ch.handle(msg(OfBody::FeaturesReply(features(7)))).unwrap();
        assert_eq!(
            sent(&a),
            vec![OfType::SetConfig, OfType::BarrierRequest, OfType::GetConfigRequest]
        );
        assert_eq!(ch.dpid(), Some(7));

        let ps = PortStatus {
            reason: PortReason::Add,
            desc: PhyPort::new(2, MacAddr::ovx(2), "eth2"),
        };
        assert!(ch.handle(msg(OfBody::PortStatus(ps))).unwrap().is_empty());
        assert!(ch.handle(msg(OfBody::BarrierReply)).unwrap().is_empty());

        // A switch refusing the miss_send_len is tolerated.
        let cfg = SwitchConfig {
            flags: 0,
            miss_send_len: 128,
        };
        let a = ch.handle(msg(OfBody::GetConfigReply(cfg))).unwrap();
        assert_eq!(sent(&a), vec![OfType::StatsRequest]);
        assert_eq!(ch.state, SwitchChannelState::WaitDescriptionStatReply);

        let reply = StatsReply {
            flags: 0,
            body: StatsReplyBody::Desc(DescStats::default()),
        };
        let a = ch.handle(msg(OfBody::StatsReply(reply))).unwrap();
        match a.as_slice() {
            [SwitchAction::Connected(sw, statuses)] => {
                assert_eq!(sw.dpid, 7);
                assert_eq!(statuses.len(), 1);
            }
            other => panic!("unexpected actions {other:?}"),
        }
        assert!(ch.is_active());
    }

    #[test]
    fn test_echo_answered_in_any_state() {
        let mut ch = SwitchChannel::new(&test_log());
        ch.connect();
        let a = ch.handle(OfMessage::new(42, OfBody::EchoRequest(vec![1, 2]))).unwrap();
        match a.as_slice() {
            [SwitchAction::Send(m)] => {
                assert_eq!(m, &OfMessage::new(42, OfBody::EchoReply(vec![1, 2])))
            }
            other => panic!("unexpected actions {other:?}"),
        }
        assert_eq!(ch.state, SwitchChannelState::WaitHello);
    }

    #[test]
    fn test_error_during_handshake_closes() {
        let mut ch = SwitchChannel::new(&test_log());
        ch.connect();
        ch.handle(msg(OfBody::Hello)).unwrap();
        let err = ErrorMsg::new(1, 1, Vec::new());
        let res = ch.handle(msg(OfBody::Error(err)));
        assert!(matches!(res, Err(OvxError::SwitchState(_))));
    }

    #[test]
    fn test_active_dispatch() {
        let mut ch = SwitchChannel::new(&test_log());
        handshake(&mut ch);

        let lldp = PacketIn {
            buffer_id: openflow::OFP_NO_BUFFER,
            total_len: 0,
            in_port: 1,
            reason: 0,
            data: packet::lldp::make_probe(MacAddr::ovx(1), 1, 9),
        };
        let a = ch.handle(msg(OfBody::PacketIn(lldp))).unwrap();
        assert!(matches!(a.as_slice(), [SwitchAction::Lldp(_)]));

        let a = ch.handle(msg(OfBody::BarrierReply)).unwrap();
        assert!(matches!(a.as_slice(), [SwitchAction::Dispatch(_)]));

        // Controller-to-switch messages have no business here.
        let res = ch.handle(msg(OfBody::FeaturesRequest));
        assert!(matches!(res, Err(OvxError::SwitchState(_))));
    }
}
