// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Wire encoding.  Every message is an 8-byte header (version, type,
//! length, xid) followed by a type-specific body; multi-byte fields are
//! big-endian.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use common::network::MacAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::action::*;
use crate::message::*;
use crate::ofmatch::Match;
use crate::ofmatch::OFP_MATCH_LEN;
use crate::port::PhyPort;
use crate::port::OFP_MAX_PORT_NAME_LEN;
use crate::port::OFP_PHY_PORT_LEN;
use crate::stats::*;
use crate::{OfBody, OfError, OfMessage, OfResult, OfType};
use crate::{OFP_HEADER_LEN, OFP_MAX_MSG_LEN, OFP_VERSION};

/// A bounds-checked big-endian cursor over a received message.
struct Reader<'a> {
    data: &'a [u8],
    off: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Reader { data, off: 0, what }
    }

    fn left(&self) -> usize {
        self.data.len() - self.off
    }

    fn take(&mut self, n: usize) -> OfResult<&'a [u8]> {
        if self.left() < n {
            return Err(OfError::Truncated(format!(
                "{}: need {n} bytes at offset {}, have {}",
                self.what,
                self.off,
                self.left()
            )));
        }
        let s = &self.data[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> OfResult<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> OfResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> OfResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> OfResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> OfResult<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    fn mac(&mut self) -> OfResult<MacAddr> {
        Ok(MacAddr::from_slice(self.take(6)?))
    }

    fn ipv4(&mut self) -> OfResult<Ipv4Addr> {
        Ok(Ipv4Addr::from(self.u32()?))
    }

    /// A NUL-padded fixed-width string.
    fn string(&mut self, width: usize) -> OfResult<String> {
        let b = self.take(width)?;
        let end = b.iter().position(|c| *c == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&b[..end]).into_owned())
    }

    fn rest(&mut self) -> Vec<u8> {
        let v = self.data[self.off..].to_vec();
        self.off = self.data.len();
        v
    }

    fn sub(&mut self, n: usize, what: &'static str) -> OfResult<Reader<'a>> {
        Ok(Reader::new(self.take(n)?, what))
    }
}

fn put_string(v: &mut BytesMut, s: &str, width: usize) {
    let b = s.as_bytes();
    // Always leave room for the terminating NUL.
    let n = b.len().min(width - 1);
    v.put_slice(&b[..n]);
    v.put_bytes(0, width - n);
}

fn put_match(v: &mut BytesMut, m: &Match) {
    v.put_u32(m.wildcards);
    v.put_u16(m.in_port);
    v.put_slice(&m.dl_src.octets());
    v.put_slice(&m.dl_dst.octets());
    v.put_u16(m.dl_vlan);
    v.put_u8(m.dl_vlan_pcp);
    v.put_u8(0);
    v.put_u16(m.dl_type);
    v.put_u8(m.nw_tos);
    v.put_u8(m.nw_proto);
    v.put_u16(0);
    v.put_u32(u32::from(m.nw_src));
    v.put_u32(u32::from(m.nw_dst));
    v.put_u16(m.tp_src);
    v.put_u16(m.tp_dst);
}

fn get_match(r: &mut Reader) -> OfResult<Match> {
    let mut r = r.sub(OFP_MATCH_LEN, "match")?;
    let wildcards = r.u32()?;
    let in_port = r.u16()?;
    let dl_src = r.mac()?;
    let dl_dst = r.mac()?;
    let dl_vlan = r.u16()?;
    let dl_vlan_pcp = r.u8()?;
    r.skip(1)?;
    let dl_type = r.u16()?;
    let nw_tos = r.u8()?;
    let nw_proto = r.u8()?;
    r.skip(2)?;
    Ok(Match {
        wildcards,
        in_port,
        dl_src,
        dl_dst,
        dl_vlan,
        dl_vlan_pcp,
        dl_type,
        nw_tos,
        nw_proto,
        nw_src: r.ipv4()?,
        nw_dst: r.ipv4()?,
        tp_src: r.u16()?,
        tp_dst: r.u16()?,
    })
}

fn put_phy_port(v: &mut BytesMut, p: &PhyPort) {
    v.put_u16(p.port_no);
    v.put_slice(&p.hw_addr.octets());
    put_string(v, &p.name, OFP_MAX_PORT_NAME_LEN);
    v.put_u32(p.config);
    v.put_u32(p.state);
    v.put_u32(p.curr);
    v.put_u32(p.advertised);
    v.put_u32(p.supported);
    v.put_u32(p.peer);
}

fn get_phy_port(r: &mut Reader) -> OfResult<PhyPort> {
    let mut r = r.sub(OFP_PHY_PORT_LEN, "phy_port")?;
    Ok(PhyPort {
        port_no: r.u16()?,
        hw_addr: r.mac()?,
        name: r.string(OFP_MAX_PORT_NAME_LEN)?,
        config: r.u32()?,
        state: r.u32()?,
        curr: r.u32()?,
        advertised: r.u32()?,
        supported: r.u32()?,
        peer: r.u32()?,
    })
}

fn put_action(v: &mut BytesMut, a: &Action) {
    v.put_u16(a.action_type());
    v.put_u16(a.wire_len() as u16);
    match a {
        Action::Output { port, max_len } => {
            v.put_u16(*port);
            v.put_u16(*max_len);
        }
        Action::SetVlanVid(vid) => {
            v.put_u16(*vid);
            v.put_u16(0);
        }
        Action::SetVlanPcp(pcp) => {
            v.put_u8(*pcp);
            v.put_bytes(0, 3);
        }
        Action::StripVlan => v.put_u32(0),
        Action::SetDlSrc(mac) | Action::SetDlDst(mac) => {
            v.put_slice(&mac.octets());
            v.put_bytes(0, 6);
        }
        Action::SetNwSrc(ip) | Action::SetNwDst(ip) => {
            v.put_u32(u32::from(*ip));
        }
        Action::SetNwTos(tos) => {
            v.put_u8(*tos);
            v.put_bytes(0, 3);
        }
        Action::SetTpSrc(p) | Action::SetTpDst(p) => {
            v.put_u16(*p);
            v.put_u16(0);
        }
        Action::Enqueue { port, queue_id } => {
            v.put_u16(*port);
            v.put_bytes(0, 6);
            v.put_u32(*queue_id);
        }
        Action::Vendor { vendor, data } => {
            v.put_u32(*vendor);
            v.put_slice(data);
            v.put_bytes(0, a.wire_len() - 8 - data.len());
        }
    }
}

fn put_actions(v: &mut BytesMut, actions: &[Action]) {
    for a in actions {
        put_action(v, a);
    }
}

fn get_action(r: &mut Reader) -> OfResult<Action> {
    let atype = r.u16()?;
    let len = r.u16()? as usize;
    if len < 8 || len % 8 != 0 {
        return Err(OfError::Malformed(format!(
            "action {atype} has bad length {len}"
        )));
    }
    let mut b = r.sub(len - 4, "action")?;
    let a = match atype {
        OFPAT_OUTPUT => Action::Output {
            port: b.u16()?,
            max_len: b.u16()?,
        },
        OFPAT_SET_VLAN_VID => Action::SetVlanVid(b.u16()?),
        OFPAT_SET_VLAN_PCP => Action::SetVlanPcp(b.u8()?),
        OFPAT_STRIP_VLAN => Action::StripVlan,
        OFPAT_SET_DL_SRC => Action::SetDlSrc(b.mac()?),
        OFPAT_SET_DL_DST => Action::SetDlDst(b.mac()?),
        OFPAT_SET_NW_SRC => Action::SetNwSrc(b.ipv4()?),
        OFPAT_SET_NW_DST => Action::SetNwDst(b.ipv4()?),
        OFPAT_SET_NW_TOS => Action::SetNwTos(b.u8()?),
        OFPAT_SET_TP_SRC => Action::SetTpSrc(b.u16()?),
        OFPAT_SET_TP_DST => Action::SetTpDst(b.u16()?),
        OFPAT_ENQUEUE => {
            let port = b.u16()?;
            b.skip(6)?;
            Action::Enqueue {
                port,
                queue_id: b.u32()?,
            }
        }
        OFPAT_VENDOR => Action::Vendor {
            vendor: b.u32()?,
            data: b.rest(),
        },
        x => {
            return Err(OfError::Malformed(format!("unknown action type {x}")))
        }
    };
    Ok(a)
}

fn get_actions(r: &mut Reader, len: usize) -> OfResult<Vec<Action>> {
    let mut r = r.sub(len, "actions")?;
    let mut actions = Vec::new();
    while r.left() > 0 {
        actions.push(get_action(&mut r)?);
    }
    Ok(actions)
}

fn put_flow_stats_request(v: &mut BytesMut, f: &FlowStatsRequest) {
    put_match(v, &f.ofmatch);
    v.put_u8(f.table_id);
    v.put_u8(0);
    v.put_u16(f.out_port);
}

fn get_flow_stats_request(r: &mut Reader) -> OfResult<FlowStatsRequest> {
    let ofmatch = get_match(r)?;
    let table_id = r.u8()?;
    r.skip(1)?;
    Ok(FlowStatsRequest {
        ofmatch,
        table_id,
        out_port: r.u16()?,
    })
}

fn put_stats_request(v: &mut BytesMut, s: &StatsRequest) {
    v.put_u16(s.stats_type());
    v.put_u16(s.flags);
    match &s.body {
        StatsRequestBody::Desc | StatsRequestBody::Table => {}
        StatsRequestBody::Flow(f) | StatsRequestBody::Aggregate(f) => {
            put_flow_stats_request(v, f)
        }
        StatsRequestBody::Port { port_no } => {
            v.put_u16(*port_no);
            v.put_bytes(0, 6);
        }
        StatsRequestBody::Queue { port_no, queue_id } => {
            v.put_u16(*port_no);
            v.put_u16(0);
            v.put_u32(*queue_id);
        }
        StatsRequestBody::Vendor { vendor, data } => {
            v.put_u32(*vendor);
            v.put_slice(data);
        }
    }
}

fn get_stats_request(r: &mut Reader) -> OfResult<StatsRequest> {
    let stype = r.u16()?;
    let flags = r.u16()?;
    let body = match stype {
        OFPST_DESC => StatsRequestBody::Desc,
        OFPST_FLOW => StatsRequestBody::Flow(get_flow_stats_request(r)?),
        OFPST_AGGREGATE => {
            StatsRequestBody::Aggregate(get_flow_stats_request(r)?)
        }
        OFPST_TABLE => StatsRequestBody::Table,
        OFPST_PORT => {
            let port_no = r.u16()?;
            r.skip(6)?;
            StatsRequestBody::Port { port_no }
        }
        OFPST_QUEUE => {
            let port_no = r.u16()?;
            r.skip(2)?;
            StatsRequestBody::Queue {
                port_no,
                queue_id: r.u32()?,
            }
        }
        OFPST_VENDOR => StatsRequestBody::Vendor {
            vendor: r.u32()?,
            data: r.rest(),
        },
        x => {
            return Err(OfError::Malformed(format!("unknown stats type {x}")))
        }
    };
    Ok(StatsRequest { flags, body })
}

fn put_stats_reply(v: &mut BytesMut, s: &StatsReply) {
    v.put_u16(s.stats_type());
    v.put_u16(s.flags);
    match &s.body {
        StatsReplyBody::Desc(d) => {
            put_string(v, &d.mfr_desc, DESC_STR_LEN);
            put_string(v, &d.hw_desc, DESC_STR_LEN);
            put_string(v, &d.sw_desc, DESC_STR_LEN);
            put_string(v, &d.serial_num, SERIAL_NUM_LEN);
            put_string(v, &d.dp_desc, DESC_STR_LEN);
        }
        StatsReplyBody::Flow(flows) => {
            for f in flows {
                v.put_u16((88 + actions_len(&f.actions)) as u16);
                v.put_u8(f.table_id);
                v.put_u8(0);
                put_match(v, &f.ofmatch);
                v.put_u32(f.duration_sec);
                v.put_u32(f.duration_nsec);
                v.put_u16(f.priority);
                v.put_u16(f.idle_timeout);
                v.put_u16(f.hard_timeout);
                v.put_bytes(0, 6);
                v.put_u64(f.cookie);
                v.put_u64(f.packet_count);
                v.put_u64(f.byte_count);
                put_actions(v, &f.actions);
            }
        }
        StatsReplyBody::Aggregate(a) => {
            v.put_u64(a.packet_count);
            v.put_u64(a.byte_count);
            v.put_u32(a.flow_count);
            v.put_u32(0);
        }
        StatsReplyBody::Table(tables) => {
            for t in tables {
                v.put_u8(t.table_id);
                v.put_bytes(0, 3);
                put_string(v, &t.name, OFP_MAX_TABLE_NAME_LEN);
                v.put_u32(t.wildcards);
                v.put_u32(t.max_entries);
                v.put_u32(t.active_count);
                v.put_u64(t.lookup_count);
                v.put_u64(t.matched_count);
            }
        }
        StatsReplyBody::Port(ports) => {
            for p in ports {
                v.put_u16(p.port_no);
                v.put_bytes(0, 6);
                for c in [
                    p.rx_packets,
                    p.tx_packets,
                    p.rx_bytes,
                    p.tx_bytes,
                    p.rx_dropped,
                    p.tx_dropped,
                    p.rx_errors,
                    p.tx_errors,
                    p.rx_frame_err,
                    p.rx_over_err,
                    p.rx_crc_err,
                    p.collisions,
                ] {
                    v.put_u64(c);
                }
            }
        }
        StatsReplyBody::Queue(queues) => {
            for q in queues {
                v.put_u16(q.port_no);
                v.put_u16(0);
                v.put_u32(q.queue_id);
                v.put_u64(q.tx_bytes);
                v.put_u64(q.tx_packets);
                v.put_u64(q.tx_errors);
            }
        }
        StatsReplyBody::Vendor { vendor, data } => {
            v.put_u32(*vendor);
            v.put_slice(data);
        }
    }
}

fn get_stats_reply(r: &mut Reader) -> OfResult<StatsReply> {
    let stype = r.u16()?;
    let flags = r.u16()?;
    let body = match stype {
        OFPST_DESC => StatsReplyBody::Desc(DescStats {
            mfr_desc: r.string(DESC_STR_LEN)?,
            hw_desc: r.string(DESC_STR_LEN)?,
            sw_desc: r.string(DESC_STR_LEN)?,
            serial_num: r.string(SERIAL_NUM_LEN)?,
            dp_desc: r.string(DESC_STR_LEN)?,
        }),
        OFPST_FLOW => {
            let mut flows = Vec::new();
            while r.left() > 0 {
                let len = r.u16()? as usize;
                if len < 88 {
                    return Err(OfError::Malformed(format!(
                        "flow stats entry has bad length {len}"
                    )));
                }
                let mut e = r.sub(len - 2, "flow_stats")?;
                let table_id = e.u8()?;
                e.skip(1)?;
                let ofmatch = get_match(&mut e)?;
                let duration_sec = e.u32()?;
                let duration_nsec = e.u32()?;
                let priority = e.u16()?;
                let idle_timeout = e.u16()?;
                let hard_timeout = e.u16()?;
                e.skip(6)?;
                let cookie = e.u64()?;
                let packet_count = e.u64()?;
                let byte_count = e.u64()?;
                let actions = get_actions(&mut e, len - 88)?;
                flows.push(FlowStats {
                    table_id,
                    ofmatch,
                    duration_sec,
                    duration_nsec,
                    priority,
                    idle_timeout,
                    hard_timeout,
                    cookie,
                    packet_count,
                    byte_count,
                    actions,
                });
            }
            StatsReplyBody::Flow(flows)
        }
        OFPST_AGGREGATE => {
            let a = AggregateStats {
                packet_count: r.u64()?,
                byte_count: r.u64()?,
                flow_count: r.u32()?,
            };
            r.skip(4)?;
            StatsReplyBody::Aggregate(a)
        }
        OFPST_TABLE => {
            let mut tables = Vec::new();
            while r.left() > 0 {
                let table_id = r.u8()?;
                r.skip(3)?;
                tables.push(TableStats {
                    table_id,
                    name: r.string(OFP_MAX_TABLE_NAME_LEN)?,
                    wildcards: r.u32()?,
                    max_entries: r.u32()?,
                    active_count: r.u32()?,
                    lookup_count: r.u64()?,
                    matched_count: r.u64()?,
                });
            }
            StatsReplyBody::Table(tables)
        }
        OFPST_PORT => {
            let mut ports = Vec::new();
            while r.left() > 0 {
                let port_no = r.u16()?;
                r.skip(6)?;
                ports.push(PortStats {
                    port_no,
                    rx_packets: r.u64()?,
                    tx_packets: r.u64()?,
                    rx_bytes: r.u64()?,
                    tx_bytes: r.u64()?,
                    rx_dropped: r.u64()?,
                    tx_dropped: r.u64()?,
                    rx_errors: r.u64()?,
                    tx_errors: r.u64()?,
                    rx_frame_err: r.u64()?,
                    rx_over_err: r.u64()?,
                    rx_crc_err: r.u64()?,
                    collisions: r.u64()?,
                });
            }
            StatsReplyBody::Port(ports)
        }
        OFPST_QUEUE => {
            let mut queues = Vec::new();
            while r.left() > 0 {
                let port_no = r.u16()?;
                r.skip(2)?;
                queues.push(QueueStats {
                    port_no,
                    queue_id: r.u32()?,
                    tx_bytes: r.u64()?,
                    tx_packets: r.u64()?,
                    tx_errors: r.u64()?,
                });
            }
            StatsReplyBody::Queue(queues)
        }
        OFPST_VENDOR => StatsReplyBody::Vendor {
            vendor: r.u32()?,
            data: r.rest(),
        },
        x => {
            return Err(OfError::Malformed(format!("unknown stats type {x}")))
        }
    };
    Ok(StatsReply { flags, body })
}

fn put_body(v: &mut BytesMut, body: &OfBody) {
    match body {
        OfBody::Hello
        | OfBody::FeaturesRequest
        | OfBody::GetConfigRequest
        | OfBody::BarrierRequest
        | OfBody::BarrierReply => {}
        OfBody::Error(e) => {
            v.put_u16(e.err_type);
            v.put_u16(e.code);
            v.put_slice(&e.data);
        }
        OfBody::EchoRequest(d) | OfBody::EchoReply(d) => v.put_slice(d),
        OfBody::Vendor(ven) => {
            v.put_u32(ven.vendor);
            v.put_slice(&ven.data);
        }
        OfBody::FeaturesReply(f) => {
            v.put_u64(f.datapath_id);
            v.put_u32(f.n_buffers);
            v.put_u8(f.n_tables);
            v.put_bytes(0, 3);
            v.put_u32(f.capabilities);
            v.put_u32(f.actions);
            for p in &f.ports {
                put_phy_port(v, p);
            }
        }
        OfBody::GetConfigReply(c) | OfBody::SetConfig(c) => {
            v.put_u16(c.flags);
            v.put_u16(c.miss_send_len);
        }
        OfBody::PacketIn(pi) => {
            v.put_u32(pi.buffer_id);
            v.put_u16(pi.total_len);
            v.put_u16(pi.in_port);
            v.put_u8(pi.reason);
            v.put_u8(0);
            v.put_slice(&pi.data);
        }
        OfBody::FlowRemoved(fr) => {
            put_match(v, &fr.ofmatch);
            v.put_u64(fr.cookie);
            v.put_u16(fr.priority);
            v.put_u8(fr.reason);
            v.put_u8(0);
            v.put_u32(fr.duration_sec);
            v.put_u32(fr.duration_nsec);
            v.put_u16(fr.idle_timeout);
            v.put_u16(0);
            v.put_u64(fr.packet_count);
            v.put_u64(fr.byte_count);
        }
        OfBody::PortStatus(ps) => {
            v.put_u8(ps.reason as u8);
            v.put_bytes(0, 7);
            put_phy_port(v, &ps.desc);
        }
        OfBody::PacketOut(po) => {
            v.put_u32(po.buffer_id);
            v.put_u16(po.in_port);
            v.put_u16(actions_len(&po.actions) as u16);
            put_actions(v, &po.actions);
            v.put_slice(&po.data);
        }
        OfBody::FlowMod(fm) => {
            put_match(v, &fm.ofmatch);
            v.put_u64(fm.cookie);
            v.put_u16(fm.command as u16);
            v.put_u16(fm.idle_timeout);
            v.put_u16(fm.hard_timeout);
            v.put_u16(fm.priority);
            v.put_u32(fm.buffer_id);
            v.put_u16(fm.out_port);
            v.put_u16(fm.flags);
            put_actions(v, &fm.actions);
        }
        OfBody::PortMod(pm) => {
            v.put_u16(pm.port_no);
            v.put_slice(&pm.hw_addr.octets());
            v.put_u32(pm.config);
            v.put_u32(pm.mask);
            v.put_u32(pm.advertise);
            v.put_u32(0);
        }
        OfBody::StatsRequest(s) => put_stats_request(v, s),
        OfBody::StatsReply(s) => put_stats_reply(v, s),
        OfBody::QueueGetConfigRequest { port } => {
            v.put_u16(*port);
            v.put_u16(0);
        }
        OfBody::QueueGetConfigReply(q) => {
            v.put_u16(q.port);
            v.put_bytes(0, 6);
            v.put_slice(&q.queues);
        }
    }
}

fn get_body(t: OfType, r: &mut Reader) -> OfResult<OfBody> {
    let body = match t {
        OfType::Hello => {
            // Version negotiation elements are ignored.
            r.rest();
            OfBody::Hello
        }
        OfType::Error => OfBody::Error(ErrorMsg {
            err_type: r.u16()?,
            code: r.u16()?,
            data: r.rest(),
        }),
        OfType::EchoRequest => OfBody::EchoRequest(r.rest()),
        OfType::EchoReply => OfBody::EchoReply(r.rest()),
        OfType::Vendor => OfBody::Vendor(Vendor {
            vendor: r.u32()?,
            data: r.rest(),
        }),
        OfType::FeaturesRequest => OfBody::FeaturesRequest,
        OfType::FeaturesReply => {
            let datapath_id = r.u64()?;
            let n_buffers = r.u32()?;
            let n_tables = r.u8()?;
            r.skip(3)?;
            let capabilities = r.u32()?;
            let actions = r.u32()?;
            let mut ports = Vec::new();
            while r.left() >= OFP_PHY_PORT_LEN {
                ports.push(get_phy_port(r)?);
            }
            OfBody::FeaturesReply(FeaturesReply {
                datapath_id,
                n_buffers,
                n_tables,
                capabilities,
                actions,
                ports,
            })
        }
        OfType::GetConfigRequest => OfBody::GetConfigRequest,
        OfType::GetConfigReply | OfType::SetConfig => {
            let c = SwitchConfig {
                flags: r.u16()?,
                miss_send_len: r.u16()?,
            };
            if t == OfType::SetConfig {
                OfBody::SetConfig(c)
            } else {
                OfBody::GetConfigReply(c)
            }
        }
        OfType::PacketIn => {
            let buffer_id = r.u32()?;
            let total_len = r.u16()?;
            let in_port = r.u16()?;
            let reason = r.u8()?;
            r.skip(1)?;
            OfBody::PacketIn(PacketIn {
                buffer_id,
                total_len,
                in_port,
                reason,
                data: r.rest(),
            })
        }
        OfType::FlowRemoved => {
            let ofmatch = get_match(r)?;
            let cookie = r.u64()?;
            let priority = r.u16()?;
            let reason = r.u8()?;
            r.skip(1)?;
            let duration_sec = r.u32()?;
            let duration_nsec = r.u32()?;
            let idle_timeout = r.u16()?;
            r.skip(2)?;
            OfBody::FlowRemoved(FlowRemoved {
                ofmatch,
                cookie,
                priority,
                reason,
                duration_sec,
                duration_nsec,
                idle_timeout,
                packet_count: r.u64()?,
                byte_count: r.u64()?,
            })
        }
        OfType::PortStatus => {
            let reason = r.u8()?;
            let reason = PortReason::from_repr(reason).ok_or_else(|| {
                OfError::Malformed(format!("bad port status reason {reason}"))
            })?;
            r.skip(7)?;
            OfBody::PortStatus(PortStatus {
                reason,
                desc: get_phy_port(r)?,
            })
        }
        OfType::PacketOut => {
            let buffer_id = r.u32()?;
            let in_port = r.u16()?;
            let alen = r.u16()? as usize;
            let actions = get_actions(r, alen)?;
            OfBody::PacketOut(PacketOut {
                buffer_id,
                in_port,
                actions,
                data: r.rest(),
            })
        }
        OfType::FlowMod => {
            let ofmatch = get_match(r)?;
            let cookie = r.u64()?;
            let cmd = r.u16()?;
            let command = FlowModCommand::from_repr(cmd).ok_or_else(|| {
                OfError::Malformed(format!("bad flow mod command {cmd}"))
            })?;
            let idle_timeout = r.u16()?;
            let hard_timeout = r.u16()?;
            let priority = r.u16()?;
            let buffer_id = r.u32()?;
            let out_port = r.u16()?;
            let flags = r.u16()?;
            let alen = r.left();
            OfBody::FlowMod(FlowMod {
                ofmatch,
                cookie,
                command,
                idle_timeout,
                hard_timeout,
                priority,
                buffer_id,
                out_port,
                flags,
                actions: get_actions(r, alen)?,
            })
        }
        OfType::PortMod => {
            let pm = PortMod {
                port_no: r.u16()?,
                hw_addr: r.mac()?,
                config: r.u32()?,
                mask: r.u32()?,
                advertise: r.u32()?,
            };
            r.skip(4)?;
            OfBody::PortMod(pm)
        }
        OfType::StatsRequest => OfBody::StatsRequest(get_stats_request(r)?),
        OfType::StatsReply => OfBody::StatsReply(get_stats_reply(r)?),
        OfType::BarrierRequest => OfBody::BarrierRequest,
        OfType::BarrierReply => OfBody::BarrierReply,
        OfType::QueueGetConfigRequest => {
            let port = r.u16()?;
            r.skip(2)?;
            OfBody::QueueGetConfigRequest { port }
        }
        OfType::QueueGetConfigReply => {
            let port = r.u16()?;
            r.skip(6)?;
            OfBody::QueueGetConfigReply(QueueGetConfigReply {
                port,
                queues: r.rest(),
            })
        }
    };
    Ok(body)
}

impl OfMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = BytesMut::with_capacity(64);
        v.put_u8(OFP_VERSION);
        v.put_u8(self.of_type() as u8);
        v.put_u16(0);
        v.put_u32(self.xid);
        put_body(&mut v, &self.body);
        let len = v.len() as u16;
        v[2..4].copy_from_slice(&len.to_be_bytes());
        v.to_vec()
    }

    /// Decode one complete message, header included.
    pub fn decode(buf: &[u8]) -> OfResult<OfMessage> {
        let mut r = Reader::new(buf, "header");
        let version = r.u8()?;
        if version != OFP_VERSION {
            return Err(OfError::BadVersion(version));
        }
        let t = r.u8()?;
        let t = OfType::from_repr(t).ok_or(OfError::BadType(t))?;
        let len = r.u16()? as usize;
        let xid = r.u32()?;
        if len < OFP_HEADER_LEN || len > buf.len() {
            return Err(OfError::Truncated(format!(
                "header claims {len} bytes, have {}",
                buf.len()
            )));
        }
        let mut body = Reader::new(&buf[OFP_HEADER_LEN..len], "body");
        Ok(OfMessage::new(xid, get_body(t, &mut body)?))
    }
}

/// Read the next message from a stream.  A clean end of stream before a
/// header arrives is reported as `OfError::Closed`.
pub async fn read_message<R>(r: &mut R) -> OfResult<OfMessage>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; OFP_HEADER_LEN];
    match r.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(OfError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u16::from_be_bytes([hdr[2], hdr[3]]) as usize;
    if !(OFP_HEADER_LEN..=OFP_MAX_MSG_LEN).contains(&len) {
        return Err(OfError::Malformed(format!("bad message length {len}")));
    }
    let mut buf = vec![0u8; len];
    buf[..OFP_HEADER_LEN].copy_from_slice(&hdr);
    r.read_exact(&mut buf[OFP_HEADER_LEN..]).await?;
    OfMessage::decode(&buf)
}

pub async fn write_message<W>(w: &mut W, msg: &OfMessage) -> OfResult<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&msg.encode()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{OFPP_CONTROLLER, OFPP_FLOOD};
    use pretty_assertions::assert_eq;

    fn roundtrip(msg: OfMessage) -> anyhow::Result<()> {
        let bytes = msg.encode();
        assert_eq!(
            u16::from_be_bytes([bytes[2], bytes[3]]) as usize,
            bytes.len()
        );
        assert_eq!(OfMessage::decode(&bytes)?, msg);
        Ok(())
    }

    #[test]
    fn test_fixed_lengths() {
        let hello = OfMessage::new(1, OfBody::Hello).encode();
        assert_eq!(hello, vec![1, 0, 0, 8, 0, 0, 0, 1]);

        let mut fm = FlowMod::new(FlowModCommand::Add, Match::all());
        assert_eq!(OfMessage::new(0, OfBody::FlowMod(fm.clone())).encode().len(), 72);
        fm.actions.push(Action::output(1));
        fm.actions.push(Action::SetDlSrc(MacAddr::new(1, 2, 3, 4, 5, 6)));
        assert_eq!(OfMessage::new(0, OfBody::FlowMod(fm)).encode().len(), 96);

        let ps = PortStatus {
            reason: PortReason::Modify,
            desc: PhyPort::new(1, MacAddr::ZERO, "eth1"),
        };
        assert_eq!(OfMessage::new(0, OfBody::PortStatus(ps)).encode().len(), 64);
    }

    #[test]
    fn test_flow_mod() -> anyhow::Result<()> {
        let mut m = Match::all();
        m.set_in_port(3)
            .set_dl_type(0x0800)
            .set_nw_dst(Ipv4Addr::new(10, 0, 0, 0), 8);
        let mut fm = FlowMod::new(FlowModCommand::ModifyStrict, m);
        fm.cookie = 0x0000_0001_0000_0002;
        fm.flags = OFPFF_SEND_FLOW_REM;
        fm.actions = vec![
            Action::SetNwDst(Ipv4Addr::new(1, 0, 0, 2)),
            Action::SetVlanVid(12),
            Action::Enqueue {
                port: 2,
                queue_id: 7,
            },
            Action::output(OFPP_FLOOD),
        ];
        roundtrip(OfMessage::new(42, OfBody::FlowMod(fm)))
    }

    #[test]
    fn test_features_and_packets() -> anyhow::Result<()> {
        let mut p = PhyPort::new(1, MacAddr::new(0, 0, 0, 0, 0, 1), "s1-eth1");
        p.set_link_down(true);
        roundtrip(OfMessage::new(
            5,
            OfBody::FeaturesReply(FeaturesReply {
                datapath_id: 0xa42305_00000001,
                n_buffers: 256,
                n_tables: 1,
                capabilities: OFPC_FLOW_STATS,
                actions: OFP_ALL_ACTIONS,
                ports: vec![p],
            }),
        ))?;
        roundtrip(OfMessage::new(
            6,
            OfBody::PacketIn(PacketIn {
                buffer_id: crate::OFP_NO_BUFFER,
                total_len: 4,
                in_port: 2,
                reason: OFPR_NO_MATCH,
                data: vec![1, 2, 3, 4],
            }),
        ))?;
        roundtrip(OfMessage::new(
            7,
            OfBody::PacketOut(PacketOut::new(
                vec![9; 60],
                vec![Action::output(OFPP_CONTROLLER)],
            )),
        ))
    }

    #[test]
    fn test_stats() -> anyhow::Result<()> {
        roundtrip(OfMessage::new(
            1,
            OfBody::StatsReply(StatsReply {
                flags: 0,
                body: StatsReplyBody::Desc(DescStats {
                    mfr_desc: "Nicira".to_string(),
                    dp_desc: "s1".to_string(),
                    ..Default::default()
                }),
            }),
        ))?;
        roundtrip(OfMessage::new(
            2,
            OfBody::StatsReply(StatsReply {
                flags: OFPSF_REPLY_MORE,
                body: StatsReplyBody::Flow(vec![FlowStats {
                    table_id: 0,
                    ofmatch: Match::all(),
                    duration_sec: 1,
                    duration_nsec: 2,
                    priority: 3,
                    idle_timeout: 4,
                    hard_timeout: 5,
                    cookie: 6,
                    packet_count: 7,
                    byte_count: 8,
                    actions: vec![Action::output(1)],
                }]),
            }),
        ))?;
        roundtrip(OfMessage::new(
            3,
            OfBody::StatsRequest(StatsRequest::new(StatsRequestBody::Port {
                port_no: 0xffff,
            })),
        ))
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            OfMessage::decode(&[4, 0, 0, 8, 0, 0, 0, 0]),
            Err(OfError::BadVersion(4))
        ));
        assert!(matches!(
            OfMessage::decode(&[1, 99, 0, 8, 0, 0, 0, 0]),
            Err(OfError::BadType(99))
        ));
        assert!(matches!(
            OfMessage::decode(&[1, 0, 0, 16, 0, 0, 0, 0]),
            Err(OfError::Truncated(_))
        ));
    }

    #[test]
    fn test_error_reply_quotes_request() {
        let req = OfMessage::new(9, OfBody::BarrierRequest);
        let err = req.error_reply(OFPET_BAD_REQUEST, OFPBRC_BAD_TYPE);
        assert_eq!(err.xid, 9);
        match err.body {
            OfBody::Error(e) => assert_eq!(e.data, req.encode()),
            _ => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn test_stream_framing() -> anyhow::Result<()> {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msgs = vec![
            OfMessage::new(1, OfBody::Hello),
            OfMessage::new(2, OfBody::EchoRequest(vec![1, 2, 3])),
        ];
        for m in &msgs {
            write_message(&mut a, m).await?;
        }
        drop(a);
        for m in &msgs {
            assert_eq!(&read_message(&mut b).await?, m);
        }
        assert!(matches!(read_message(&mut b).await, Err(OfError::Closed)));
        Ok(())
    }
}
