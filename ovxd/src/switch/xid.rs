// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Transaction ids on a physical switch are shared by every tenant with a
//! virtual switch on it.  Each request sent south gets a fresh id, and the
//! reply is mapped back to the tenant's original id and virtual switch.

use std::num::NonZeroUsize;

use lru::LruCache;

const MIN_XID: u32 = 256;
const CAPACITY: usize = 1 << 14;

pub struct XidTranslator<T> {
    next: u32,
    pending: LruCache<u32, (u32, T)>,
}

impl<T: Copy> Default for XidTranslator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> XidTranslator<T> {
    pub fn new() -> Self {
        XidTranslator {
            next: MIN_XID,
            pending: LruCache::new(
                NonZeroUsize::new(CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    /// Issue a physical xid standing for `xid` as sent by `owner`.
    pub fn translate(&mut self, xid: u32, owner: T) -> u32 {
        let out = self.next;
        self.next = match self.next.checked_add(1) {
            Some(n) => n,
            None => MIN_XID,
        };
        self.pending.put(out, (xid, owner));
        out
    }

    /// The original xid and owner of a physical xid, if still remembered.
    pub fn untranslate(&mut self, xid: u32) -> Option<(u32, T)> {
        self.pending.get(&xid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut xids = XidTranslator::new();
        let a = xids.translate(7, 'a');
        let b = xids.translate(7, 'b');
        assert_eq!(a, MIN_XID);
        assert_ne!(a, b);
        assert_eq!(xids.untranslate(a), Some((7, 'a')));
        assert_eq!(xids.untranslate(b), Some((7, 'b')));
        assert_eq!(xids.untranslate(3), None);
    }

    #[test]
    fn test_oldest_are_forgotten() {
        let mut xids = XidTranslator::new();
        let first = xids.translate(1, 0u8);
        for i in 0..CAPACITY as u32 {
            xids.translate(i, 1);
        }
        assert_eq!(xids.untranslate(first), None);
    }

    #[test]
    fn test_wraps_above_reserved_range() {
        let mut xids = XidTranslator::new();
        xids.next = u32::MAX;
        assert_eq!(xids.translate(1, ()), u32::MAX);
        assert_eq!(xids.translate(2, ()), MIN_XID);
    }
}
