// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::num::NonZeroUsize;

use lru::LruCache;
use openflow::PacketIn;
use openflow::OFP_NO_BUFFER;

use crate::types::Dpid;

pub const BUFFER_CAPACITY: usize = 4096;

/// A packet held on behalf of a tenant controller: the physical PACKET_IN
/// it arrived in and the switch it arrived on.
#[derive(Clone, Debug)]
pub struct Buffered {
    pub dpid: Dpid,
    pub packet_in: PacketIn,
}

/// Buffer ids a virtual switch hands its controller, each standing for a
/// packet still buffered on (or copied from) a physical switch.
pub struct BufferMap {
    next: u32,
    buffers: LruCache<u32, Buffered>,
}

impl Default for BufferMap {
    fn default() -> Self {
        BufferMap {
            next: 1,
            buffers: LruCache::new(
                NonZeroUsize::new(BUFFER_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }
}

impl BufferMap {
    pub fn add(&mut self, dpid: Dpid, packet_in: PacketIn) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == OFP_NO_BUFFER || self.next == 0 {
            self.next = 1;
        }
        self.buffers.put(id, Buffered { dpid, packet_in });
        id
    }

    pub fn get(&mut self, id: u32) -> Option<&Buffered> {
        self.buffers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pi(buffer_id: u32) -> PacketIn {
        PacketIn {
            buffer_id,
            total_len: 0,
            in_port: 1,
            reason: 0,
            data: Vec::new(),
        }
    }

    #[test]
    fn test_add_and_get() {
        let mut map = BufferMap::default();
        let a = map.add(5, pi(100));
        let b = map.add(6, pi(200));
        assert_ne!(a, b);
        assert_eq!(map.get(a).unwrap().packet_in.buffer_id, 100);
        assert_eq!(map.get(b).unwrap().dpid, 6);
        assert!(map.get(9999).is_none());
    }

    #[test]
    fn test_capacity() {
        let mut map = BufferMap::default();
        let first = map.add(1, pi(1));
        for i in 0..BUFFER_CAPACITY as u32 {
            map.add(1, pi(i));
        }
        assert_eq!(map.len(), BUFFER_CAPACITY);
        assert!(map.get(first).is_none());
    }
}
