// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::net::Ipv4Addr;

use crate::parse_error;
use crate::MacAddr;
use crate::PacketResult;

/// A cursor over a received frame.  All reads are big-endian and fail
/// rather than panic when the frame is too short.
pub struct ParseBuffer<'a> {
    data: &'a [u8],
    byte: usize,
}

impl ParseBuffer<'_> {
    pub fn new_from_slice(d: &[u8]) -> ParseBuffer {
        ParseBuffer { data: d, byte: 0 }
    }

    pub fn offset(&self) -> usize {
        self.byte
    }

    /// Move the cursor to an absolute offset.
    pub fn seek(&mut self, offset: usize) -> PacketResult<()> {
        if offset > self.data.len() {
            Err(parse_error(self, "seek past end of buffer"))
        } else {
            self.byte = offset;
            Ok(())
        }
    }

    pub fn advance_bytes(&mut self, bytes: usize) -> PacketResult<()> {
        self.seek(self.byte + bytes)
    }

    pub fn bytes_left(&self) -> usize {
        self.data.len().saturating_sub(self.byte)
    }

    fn take(&mut self, bytes: usize) -> PacketResult<&[u8]> {
        if self.bytes_left() < bytes {
            return Err(parse_error(self, "buffer overrun"));
        }
        let start = self.byte;
        self.byte += bytes;
        Ok(&self.data[start..start + bytes])
    }

    pub fn get_bytes(&mut self, bytes: usize) -> PacketResult<Vec<u8>> {
        Ok(self.take(bytes)?.to_vec())
    }

    fn take_array<const N: usize>(&mut self) -> PacketResult<[u8; N]> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.take(N)?);
        Ok(a)
    }

    pub fn get_u64(&mut self) -> PacketResult<u64> {
        self.take_array().map(u64::from_be_bytes)
    }

    pub fn get_u16(&mut self) -> PacketResult<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn get_u8(&mut self) -> PacketResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_mac(&mut self) -> PacketResult<MacAddr> {
        Ok(MacAddr::from_slice(self.take(6)?))
    }

    pub fn get_ipv4(&mut self) -> PacketResult<Ipv4Addr> {
        self.take_array::<4>().map(Ipv4Addr::from)
    }
}
