// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! OpenFlow connections.
//!
//! A connection is split into a reader task, which decodes messages off the
//! socket and queues them, and a writer task, which drains the connection's
//! outbound queue.  The session task in between runs the handshake state
//! machine and hands established traffic to the worker pool.

pub mod controller;
pub mod switch;

use std::time::Duration;

use openflow::OfBody;
use openflow::OfError;
use openflow::OfMessage;
use openflow::OfResult;
use slog::debug;
use slog::trace;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::Outbound;
use crate::types::*;

/// Xid of the echo requests sent on idle channels.
const KEEPALIVE_XID: u32 = 0;

/// One end of an OpenFlow connection.
pub struct Channel {
    log: slog::Logger,
    rx: mpsc::UnboundedReceiver<OfResult<OfMessage>>,
    tx: Outbound,
    reader: JoinHandle<()>,
    idle: Duration,
    read_timeout: Duration,
    last_read: Instant,
}

impl Channel {
    /// Start the reader and writer tasks for a connection.
    pub fn new<R, W>(
        log: &slog::Logger,
        mut r: R,
        mut w: W,
        idle: Duration,
        read_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (in_tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            loop {
                let msg = openflow::read_message(&mut r).await;
                let done = msg.is_err();
                if in_tx.send(msg).is_err() || done {
                    break;
                }
            }
        });

        let (tx, mut out_rx) = mpsc::unbounded_channel::<OfMessage>();
        let wlog = log.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                trace!(wlog, "send"; "type" => %msg.of_type(), "xid" => msg.xid);
                if let Err(e) = openflow::write_message(&mut w, &msg).await {
                    debug!(wlog, "write failed"; "error" => %e);
                    break;
                }
            }
        });

        Channel {
            log: log.clone(),
            rx,
            tx,
            reader,
            idle,
            read_timeout,
            last_read: Instant::now(),
        }
    }

    /// The queue feeding this connection's writer.
    pub fn sender(&self) -> Outbound {
        self.tx.clone()
    }

    pub fn send(&self, msg: OfMessage) {
        if let Err(e) = self.tx.send(msg) {
            debug!(self.log, "writer gone"; "type" => %e.0.of_type());
        }
    }

    /// Wait for the next message.  Silence for the idle interval sends an
    /// echo request; silence for the read timeout, or reaching `deadline`,
    /// fails.
    pub async fn next(&mut self, deadline: Option<Instant>) -> OvxResult<OfMessage> {
        loop {
            let mut wait = self.idle;
            if let Some(d) = deadline {
                wait = wait.min(d.saturating_duration_since(Instant::now()));
            }
            match tokio::time::timeout(wait, self.rx.recv()).await {
                Ok(Some(Ok(msg))) => {
                    self.last_read = Instant::now();
                    trace!(self.log, "recv"; "type" => %msg.of_type(), "xid" => msg.xid);
                    return Ok(msg);
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Err(OfError::Closed.into()),
                Err(_) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(OvxError::HandshakeTimeout);
                    }
                    if self.last_read.elapsed() >= self.read_timeout {
                        return Err(OvxError::ReadTimeout);
                    }
                    debug!(self.log, "channel idle, sending echo request");
                    self.send(OfMessage::new(
                        KEEPALIVE_XID,
                        OfBody::EchoRequest(Vec::new()),
                    ));
                }
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Key for the worker pool, so one peer's messages stay in order.
pub fn pool_key(vref: VSwitchRef) -> u64 {
    vref.dpid.wrapping_add((vref.tenant as u64) << 40)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_log;
    use tokio::io::DuplexStream;
    use tokio::io::ReadHalf;
    use tokio::io::WriteHalf;

    /// A channel whose far end is returned for the test to drive.
    pub(crate) fn channel_pair(
        idle: Duration,
        read_timeout: Duration,
    ) -> (Channel, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (nr, nw) = tokio::io::split(near);
        let (fr, fw) = tokio::io::split(far);
        (Channel::new(&test_log(), nr, nw, idle, read_timeout), fr, fw)
    }

    #[tokio::test]
    async fn test_messages_pass_both_ways() {
        let (mut ch, mut fr, mut fw) =
            channel_pair(Duration::from_secs(20), Duration::from_secs(30));
        openflow::write_message(&mut fw, &OfMessage::new(9, OfBody::Hello))
            .await
            .unwrap();
        assert_eq!(ch.next(None).await.unwrap().xid, 9);

        ch.send(OfMessage::new(10, OfBody::BarrierRequest));
        let got = openflow::read_message(&mut fr).await.unwrap();
        assert_eq!(got, OfMessage::new(10, OfBody::BarrierRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_channel_is_probed_then_closed() {
        let (mut ch, mut fr, _fw) =
            channel_pair(Duration::from_secs(20), Duration::from_secs(30));
        let res = ch.next(None).await;
        assert!(matches!(res, Err(OvxError::ReadTimeout)), "{res:?}");

        let echo = openflow::read_message(&mut fr).await.unwrap();
        assert_eq!(echo.body, OfBody::EchoRequest(Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_deadline() {
        let (mut ch, _fr, _fw) =
            channel_pair(Duration::from_secs(20), Duration::from_secs(30));
        let deadline = Instant::now() + Duration::from_secs(15);
        let res = ch.next(Some(deadline)).await;
        assert!(matches!(res, Err(OvxError::HandshakeTimeout)), "{res:?}");
    }

    #[tokio::test]
    async fn test_peer_close_ends_channel() {
        let (mut ch, fr, fw) =
            channel_pair(Duration::from_secs(20), Duration::from_secs(30));
        drop(fr);
        drop(fw);
        assert!(ch.next(None).await.is_err());
    }
}
