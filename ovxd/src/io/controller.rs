// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Sessions with tenant controllers.  The hypervisor connects out to the
//! controllers of each active virtual switch, and keeps reconnecting with
//! exponential backoff for as long as the switch stays up.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use openflow::FeaturesReply;
use openflow::OfBody;
use openflow::OfMessage;
use openflow::OFPBRC_BAD_VENDOR;
use openflow::OFPET_BAD_REQUEST;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::io::pool_key;
use crate::io::Channel;
use crate::types::*;
use crate::virt;
use crate::Hypervisor;

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum ControllerChannelState {
    Init,
    WaitHello,
    WaitFeaturesRequest,
    Active,
}

#[derive(Debug)]
pub enum ControllerAction {
    Send(OfMessage),
    /// Answer a features request with the given xid.
    SendFeatures(u32),
    Dispatch(OfMessage),
}

pub struct ControllerChannel {
    log: slog::Logger,
    pub state: ControllerChannelState,
}

impl ControllerChannel {
    pub fn new(log: &slog::Logger) -> Self {
        ControllerChannel {
            log: log.clone(),
            state: ControllerChannelState::Init,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ControllerChannelState::Active
    }

    fn set_state(&mut self, next: ControllerChannelState) {
        debug!(self.log, "controller channel transition";
            "from" => %self.state, "to" => %next);
        self.state = next;
    }

    pub fn connect(&mut self) -> Vec<ControllerAction> {
        self.set_state(ControllerChannelState::WaitHello);
        vec![ControllerAction::Send(OfMessage::new(0, OfBody::Hello))]
    }

    pub fn handle(&mut self, msg: OfMessage) -> OvxResult<Vec<ControllerAction>> {
        use ControllerChannelState::*;

        let xid = msg.xid;
        let of_type = msg.of_type();
        let reply = |body: OfBody| -> OvxResult<Vec<ControllerAction>> {
            Ok(vec![ControllerAction::Send(OfMessage::new(xid, body))])
        };

        match (self.state, &msg.body) {
            (_, OfBody::EchoRequest(data)) => reply(OfBody::EchoReply(data.clone())),
            (_, OfBody::EchoReply(_)) => Ok(Vec::new()),

            (WaitHello, OfBody::Hello) => {
                self.set_state(WaitFeaturesRequest);
                Ok(Vec::new())
            }
            (WaitFeaturesRequest | Active, OfBody::FeaturesRequest) => {
                self.set_state(Active);
                Ok(vec![ControllerAction::SendFeatures(xid)])
            }
            (Active, OfBody::BarrierRequest) => reply(OfBody::BarrierReply),
            (Active, OfBody::Vendor(_)) => Ok(vec![ControllerAction::Send(
                msg.error_reply(OFPET_BAD_REQUEST, OFPBRC_BAD_VENDOR),
            )]),
            (
                Active,
                OfBody::FlowMod(_)
                | OfBody::PacketOut(_)
                | OfBody::StatsRequest(_)
                | OfBody::GetConfigRequest
                | OfBody::SetConfig(_)
                | OfBody::PortMod(_)
                | OfBody::QueueGetConfigRequest { .. }
                | OfBody::Error(_),
            ) => Ok(vec![ControllerAction::Dispatch(msg)]),
            (
                Active,
                OfBody::Hello
                | OfBody::FeaturesReply(_)
                | OfBody::GetConfigReply(_)
                | OfBody::PacketIn(_)
                | OfBody::FlowRemoved(_)
                | OfBody::PortStatus(_)
                | OfBody::StatsReply(_)
                | OfBody::BarrierReply
                | OfBody::QueueGetConfigReply(_),
            ) => Err(OvxError::ControllerState(format!("{of_type} is for switches"))),
            (state, _) => Err(OvxError::ControllerState(format!(
                "{of_type} in state {state}"
            ))),
        }
    }
}

/// Split a controller address of the form `tcp:host:port`.
pub fn parse_controller_url(url: &str) -> OvxResult<(String, u16)> {
    let bad = || OvxError::Other(format!("invalid controller address: {url}"));
    let rest = url.strip_prefix("tcp:").ok_or_else(bad)?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() {
        return Err(bad());
    }
    let port = port.parse::<u16>().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}

// The controller to try next, or None once the switch is gone or down.
fn controller_url(hv: &Hypervisor, vref: VSwitchRef, attempt: usize) -> Option<String> {
    let net = hv.network(vref.tenant).ok()?;
    let net = net.lock();
    let sw = net.get_switch(vref.dpid).ok()?;
    if !sw.state.is_active() || net.controllers.is_empty() {
        return None;
    }
    Some(net.controllers[attempt % net.controllers.len()].clone())
}

fn with_switch<T>(
    hv: &Hypervisor,
    vref: VSwitchRef,
    f: impl FnOnce(&mut crate::switch::OvxSwitch) -> T,
) -> OvxResult<T> {
    let net = hv.network(vref.tenant)?;
    let mut net = net.lock();
    Ok(f(net.topo.get_switch_mut(vref.dpid)?))
}

fn next_backoff(hv: &Hypervisor, vref: VSwitchRef) -> Option<Duration> {
    let exp = with_switch(hv, vref, |sw| sw.increment_backoff()).ok()?;
    let secs = 1u64 << exp.clamp(0, 32);
    Some(Duration::from_secs(secs.min(hv.config.max_backoff_secs)))
}

fn features(hv: &Hypervisor, vref: VSwitchRef) -> OvxResult<FeaturesReply> {
    with_switch(hv, vref, |sw| {
        sw.connected = true;
        sw.features_reply()
    })
}

/// Keep virtual switch `vref` connected to its controllers.
pub async fn run(hv: Arc<Hypervisor>, vref: VSwitchRef) {
    let log = hv.log.new(slog::o!("unit" => "controller_channel", "vswitch" => vref.to_string()));
    let mut attempt = 0;
    while let Some(url) = controller_url(&hv, vref, attempt) {
        attempt += 1;
        match connect(&hv, vref, &url, &log).await {
            Ok(()) => {}
            Err(OvxError::Io(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                debug!(log, "controller refused connection"; "url" => &url);
            }
            Err(e) => {
                error!(log, "giving up on controller"; "url" => &url, "error" => %e);
                return;
            }
        }
        let Some(delay) = next_backoff(&hv, vref) else {
            break;
        };
        debug!(log, "reconnecting"; "delay" => ?delay);
        tokio::time::sleep(delay).await;
    }
    info!(log, "controller connector exiting");
}

async fn connect(
    hv: &Arc<Hypervisor>,
    vref: VSwitchRef,
    url: &str,
    log: &slog::Logger,
) -> OvxResult<()> {
    let (host, port) = parse_controller_url(url)?;
    let stream = tokio::time::timeout(
        hv.config.handshake_timeout(),
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    .map_err(|_| std::io::Error::from(ErrorKind::ConnectionRefused))??;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(log, "unable to set TCP_NODELAY"; "error" => %e);
    }
    info!(log, "connected to controller"; "url" => url);
    if let Err(e) = with_switch(hv, vref, |sw| sw.reset_backoff()) {
        debug!(log, "unable to reset backoff"; "error" => %e);
    }

    let (r, w) = stream.into_split();
    let log = log.new(slog::o!("url" => url.to_string()));
    let mut ch = Channel::new(&log, r, w, hv.config.idle_timeout(), hv.config.read_timeout());
    let mut fsm = ControllerChannel::new(&log);
    let mut closed = None;

    let res = session(hv, vref, &mut ch, &mut fsm, &mut closed).await;
    if closed.is_some() {
        hv.channels.remove_controller(vref);
    }
    if let Err(e) = with_switch(hv, vref, |sw| sw.connected = false) {
        debug!(log, "virtual switch gone before disconnect"; "error" => %e);
    }
    match res {
        // The other end going away is a reason to reconnect.
        Err(OvxError::Codec(_) | OvxError::Io(_) | OvxError::ReadTimeout) | Ok(()) => {
            info!(log, "controller channel closed");
            Ok(())
        }
        Err(e) => {
            warn!(log, "closing controller channel"; "error" => %e, "state" => %fsm.state);
            Ok(())
        }
    }
}

async fn session(
    hv: &Arc<Hypervisor>,
    vref: VSwitchRef,
    ch: &mut Channel,
    fsm: &mut ControllerChannel,
    closed: &mut Option<oneshot::Receiver<()>>,
) -> OvxResult<()> {
    let deadline = Instant::now() + hv.config.handshake_timeout();
    let mut actions = fsm.connect();
    loop {
        for action in actions {
            match action {
                ControllerAction::Send(msg) => ch.send(msg),
                ControllerAction::SendFeatures(xid) => {
                    let fr = features(hv, vref)?;
                    ch.send(OfMessage::new(xid, OfBody::FeaturesReply(fr)));
                    if closed.is_none() {
                        *closed = Some(hv.channels.add_controller(vref, ch.sender()));
                    }
                }
                ControllerAction::Dispatch(msg) => submit(hv, vref, msg),
            }
        }

        let wait = (!fsm.is_active()).then_some(deadline);
        let msg = match closed.as_mut() {
            Some(rx) => tokio::select! {
                msg = ch.next(wait) => msg?,
                _ = rx => return Ok(()),
            },
            None => ch.next(wait).await?,
        };
        actions = fsm.handle(msg)?;
    }
}

fn submit(hv: &Arc<Hypervisor>, vref: VSwitchRef, msg: OfMessage) {
    let worker_hv = hv.clone();
    let of_type = msg.of_type();
    let job = Box::new(move || {
        if let Err(e) = virt::from_controller(&worker_hv, vref, msg) {
            warn!(worker_hv.log, "failed to handle message from controller";
                "vswitch" => %vref, "error" => %e);
        }
    });
    if let Err(e) = hv.pool.submit(pool_key(vref), job) {
        error!(hv.log, "unable to queue message from controller";
            "vswitch" => %vref, "type" => %of_type, "error" => %e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use openflow::FlowMod;
    use openflow::FlowModCommand;
    use openflow::Match;
    use openflow::OfType;
    use pretty_assertions::assert_eq;

    fn active() -> ControllerChannel {
        let mut ch = ControllerChannel::new(&test_log());
        ch.connect();
        ch.handle(OfMessage::new(1, OfBody::Hello)).unwrap();
        ch.handle(OfMessage::new(2, OfBody::FeaturesRequest)).unwrap();
        ch
    }

    #[test]
    fn test_handshake() {
        let mut ch = ControllerChannel::new(&test_log());
        match ch.connect().as_slice() {
            [ControllerAction::Send(m)] => assert_eq!(m.of_type(), OfType::Hello),
            other => panic!("unexpected actions {other:?}"),
        }
        assert!(ch.handle(OfMessage::new(1, OfBody::Hello)).unwrap().is_empty());
        assert_eq!(ch.state, ControllerChannelState::WaitFeaturesRequest);

        let a = ch.handle(OfMessage::new(9, OfBody::FeaturesRequest)).unwrap();
        assert!(matches!(a.as_slice(), [ControllerAction::SendFeatures(9)]));
        assert!(ch.is_active());
    }

    #[test]
    fn test_flow_mod_before_hello_is_illegal() {
        let mut ch = ControllerChannel::new(&test_log());
        ch.connect();
        let fm = FlowMod::new(FlowModCommand::Add, Match::default());
        let res = ch.handle(OfMessage::new(1, OfBody::FlowMod(fm)));
        assert!(matches!(res, Err(OvxError::ControllerState(_))));
    }

    #[test]
    fn test_active_messages() {
        let mut ch = active();

        let a = ch.handle(OfMessage::new(3, OfBody::BarrierRequest)).unwrap();
        match a.as_slice() {
            [ControllerAction::Send(m)] => {
                assert_eq!(m, &OfMessage::new(3, OfBody::BarrierReply))
            }
            other => panic!("unexpected actions {other:?}"),
        }

        let fm = FlowMod::new(FlowModCommand::Add, Match::default());
        let a = ch.handle(OfMessage::new(4, OfBody::FlowMod(fm))).unwrap();
        assert!(matches!(a.as_slice(), [ControllerAction::Dispatch(_)]));

        let vendor = openflow::Vendor {
            vendor: 0x2320,
            data: Vec::new(),
        };
        let a = ch.handle(OfMessage::new(5, OfBody::Vendor(vendor))).unwrap();
        match a.as_slice() {
            [ControllerAction::Send(m)] => assert_eq!(m.of_type(), OfType::Error),
            other => panic!("unexpected actions {other:?}"),
        }

        let res = ch.handle(OfMessage::new(6, OfBody::BarrierReply));
        assert!(matches!(res, Err(OvxError::ControllerState(_))));
    }

    #[test]
    fn test_switch_messages_refused_when_active() {
        let mut ch = active();
        for body in [
            OfBody::Hello,
            OfBody::GetConfigReply(openflow::SwitchConfig {
                flags: 0,
                miss_send_len: 128,
            }),
            OfBody::BarrierReply,
        ] {
            let res = ch.handle(OfMessage::new(7, body));
            assert!(matches!(res, Err(OvxError::ControllerState(_))));
        }
        let err = openflow::ErrorMsg::new(1, 1, Vec::new());
        for body in [OfBody::GetConfigRequest, OfBody::Error(err)] {
            let a = ch.handle(OfMessage::new(8, body)).unwrap();
            assert!(matches!(a.as_slice(), [ControllerAction::Dispatch(_)]));
        }
        assert!(ch.is_active());
    }

    #[test]
    fn test_unknown_switch_is_reported() {
        let hv = crate::tests::hypervisor();
        let res = with_switch(&hv, VSwitchRef::new(3, 1), |sw| sw.reset_backoff());
        assert!(matches!(res, Err(OvxError::NetworkMapping(_))));
    }

    #[test]
    fn test_parse_controller_url() {
        assert_eq!(
            parse_controller_url("tcp:10.0.0.1:6633").unwrap(),
            ("10.0.0.1".to_string(), 6633)
        );
        assert_eq!(
            parse_controller_url("tcp:ctl.example.com:6653").unwrap(),
            ("ctl.example.com".to_string(), 6653)
        );
        assert!(parse_controller_url("10.0.0.1:6633").is_err());
        assert!(parse_controller_url("tcp:10.0.0.1").is_err());
        assert!(parse_controller_url("tcp::6633").is_err());
        assert!(parse_controller_url("tcp:10.0.0.1:99999").is_err());
    }
}
