// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the hypervisor.

use std::convert;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::index::IndexType;

pub type TenantId = u32;
pub type Dpid = u64;
pub type PortNo = u16;

/// A port on a switch.  For physical ports `dpid` is the physical
/// datapath id, for virtual ports the tenant-scoped virtual one.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct PortRef {
    pub dpid: Dpid,
    pub port: PortNo,
}

impl PortRef {
    pub const fn new(dpid: Dpid, port: PortNo) -> Self {
        PortRef { dpid, port }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}/{}", self.dpid, self.port)
    }
}

/// A directed link, identified by its endpoints.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct LinkKey {
    pub src: PortRef,
    pub dst: PortRef,
}

impl LinkKey {
    pub const fn new(src: PortRef, dst: PortRef) -> Self {
        LinkKey { src, dst }
    }

    /// The same link traversed in the other direction.
    pub fn reversed(&self) -> Self {
        LinkKey {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// Reverse a physical path: reversed order, each hop with its endpoints
/// swapped.
pub fn reverse_path(path: &[LinkKey]) -> Vec<LinkKey> {
    path.iter().rev().map(LinkKey::reversed).collect()
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct VSwitchRef {
    pub tenant: TenantId,
    pub dpid: Dpid,
}

impl VSwitchRef {
    pub const fn new(tenant: TenantId, dpid: Dpid) -> Self {
        VSwitchRef { tenant, dpid }
    }
}

impl fmt::Display for VSwitchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.tenant, self.dpid)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct VLinkKey {
    pub tenant: TenantId,
    pub ends: LinkKey,
}

impl VLinkKey {
    pub const fn new(tenant: TenantId, ends: LinkKey) -> Self {
        VLinkKey { tenant, ends }
    }
}

/// One direction of a route inside a big switch.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct RouteKey {
    pub tenant: TenantId,
    pub dpid: Dpid,
    pub route_id: u32,
}

impl RouteKey {
    pub const fn new(tenant: TenantId, dpid: Dpid, route_id: u32) -> Self {
        RouteKey {
            tenant,
            dpid,
            route_id,
        }
    }
}

pub type OvxResult<T> = Result<T, OvxError>;

#[derive(Debug, thiserror::Error)]
pub enum OvxError {
    #[error("switch mapping: {0}")]
    SwitchMapping(String),
    #[error("link mapping: {0}")]
    LinkMapping(String),
    #[error("network mapping: {0}")]
    NetworkMapping(String),
    #[error("address mapping: {0}")]
    AddressMapping(String),
    #[error("port mapping: {0}")]
    PortMapping(String),
    #[error("mapping: {0}")]
    Mapping(String),
    #[error("no such switch: {0:016x}")]
    InvalidDpid(Dpid),
    #[error("no such port: {0}")]
    InvalidPort(PortRef),
    #[error("invalid link: {0}")]
    InvalidLink(String),
    #[error("invalid tenant: {0}")]
    InvalidTenantId(TenantId),
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("MAC address {0} is already in use")]
    DuplicateMac(common::network::MacAddr),
    #[error("no {0:?} index available")]
    IndexOutOfBound(IndexType),
    #[error("{0:?} index {1} is already in use")]
    DuplicateIndex(IndexType, u32),
    #[error("action denied: {reason}")]
    ActionVirtualizationDenied { reason: String, code: u16 },
    #[error("message dropped: {0}")]
    DroppedMessage(String),
    #[error("illegal message from switch: {0}")]
    SwitchState(String),
    #[error("illegal message from controller: {0}")]
    ControllerState(String),
    #[error("handshake did not complete in time")]
    HandshakeTimeout,
    #[error("no message received in time")]
    ReadTimeout,
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("codec error: {0}")]
    Codec(openflow::OfError),
    #[error("work queue is full")]
    QueueFull,
    #[error("Error: {0}")]
    Other(String),
}

impl OvxError {
    /// True for errors that should close the channel they occurred on.
    pub fn closes_channel(&self) -> bool {
        !matches!(self, OvxError::QueueFull)
    }
}

impl convert::From<std::io::Error> for OvxError {
    fn from(err: std::io::Error) -> Self {
        OvxError::Io(err)
    }
}

impl convert::From<openflow::OfError> for OvxError {
    fn from(err: openflow::OfError) -> Self {
        match err {
            openflow::OfError::Io(e) => OvxError::Io(e),
            e => OvxError::Codec(e),
        }
    }
}

impl convert::From<String> for OvxError {
    fn from(err: String) -> Self {
        OvxError::Other(err)
    }
}

impl convert::From<&str> for OvxError {
    fn from(err: &str) -> Self {
        OvxError::Other(err.to_string())
    }
}
