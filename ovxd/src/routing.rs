// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Path computation over the physical topology.  Paths are shortest by hop
//! count, found breadth first with ordered maps so the same topology always
//! yields the same paths.  Backup paths are link-disjoint from the paths
//! found before them.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::pathset::Path;
use crate::types::Dpid;
use crate::types::LinkKey;
use crate::types::PortRef;

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RoutingAlgorithm {
    /// Paths are supplied by the operator.
    #[default]
    Manual,
    /// Shortest paths are computed by the hypervisor.
    Spf,
}

/// Priority of the `i`th of `n` paths: the first path found wins, and a
/// lone path gets priority 0.
pub fn priority_of(i: usize, n: usize) -> u8 {
    n.saturating_sub(1 + i).min(u8::MAX as usize) as u8
}

fn shortest_path(links: &BTreeSet<LinkKey>, from: Dpid, to: Dpid) -> Option<Path> {
    if from == to {
        return Some(Vec::new());
    }
    let mut adjacent: BTreeMap<Dpid, Vec<LinkKey>> = BTreeMap::new();
    for link in links {
        adjacent.entry(link.src.dpid).or_default().push(*link);
    }

    let mut pred: BTreeMap<Dpid, LinkKey> = BTreeMap::new();
    let mut queue = VecDeque::from([from]);
    while let Some(dpid) = queue.pop_front() {
        for link in adjacent.get(&dpid).into_iter().flatten() {
            let next = link.dst.dpid;
            if next == from || pred.contains_key(&next) {
                continue;
            }
            pred.insert(next, *link);
            if next == to {
                let mut path = Vec::new();
                let mut at = to;
                while at != from {
                    let hop = pred[&at];
                    path.push(hop);
                    at = hop.src.dpid;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(next);
        }
    }
    None
}

fn remove_both_ways(links: &mut BTreeSet<LinkKey>, path: &[LinkKey]) {
    for link in path {
        links.remove(link);
        links.remove(&link.reversed());
    }
}

/// Up to `count` link-disjoint paths between two switches, shortest first.
/// Two ports on the same switch are joined by a single empty path.
pub fn switch_paths(
    links: &BTreeSet<LinkKey>,
    from: Dpid,
    to: Dpid,
    count: usize,
) -> Vec<Path> {
    if from == to {
        return vec![Vec::new()];
    }
    let mut remaining = links.clone();
    let mut paths = Vec::new();
    while paths.len() < count {
        let Some(path) = shortest_path(&remaining, from, to) else {
            break;
        };
        remove_both_ways(&mut remaining, &path);
        paths.push(path);
    }
    paths
}

/// Up to `count` paths for a virtual link between two physical ports.  Every
/// path leaves through the link attached to `src` and arrives through the
/// link attached to `dst`, with disjoint hops in between.
pub fn port_paths(
    links: &BTreeSet<LinkKey>,
    src: PortRef,
    dst: PortRef,
    count: usize,
) -> Vec<Path> {
    let Some(first) = links.iter().find(|l| l.src == src).copied() else {
        return Vec::new();
    };
    let Some(last) = links.iter().find(|l| l.dst == dst).copied() else {
        return Vec::new();
    };
    if first == last {
        return vec![vec![first]];
    }

    let mut middle = links.clone();
    remove_both_ways(&mut middle, &[first, last]);
    switch_paths(&middle, first.dst.dpid, last.src.dpid, count)
        .into_iter()
        .map(|m| {
            let mut path = Vec::with_capacity(m.len() + 2);
            path.push(first);
            path.extend(m);
            path.push(last);
            path
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn both(a: (Dpid, u16), b: (Dpid, u16)) -> [LinkKey; 2] {
        let k = LinkKey::new(PortRef::new(a.0, a.1), PortRef::new(b.0, b.1));
        [k, k.reversed()]
    }

    // 1 --- 2 --- 4
    //  \         /
    //   --- 3 ---
    fn square() -> BTreeSet<LinkKey> {
        [
            both((1, 1), (2, 1)),
            both((2, 2), (4, 1)),
            both((1, 2), (3, 1)),
            both((3, 2), (4, 2)),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    #[test]
    fn test_shortest_is_deterministic() {
        let links = square();
        let paths = switch_paths(&links, 1, 4, 1);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0], vec![both((1, 1), (2, 1))[0], both((2, 2), (4, 1))[0]]);
        assert_eq!(paths, switch_paths(&links, 1, 4, 1));
    }

    #[test]
    fn test_disjoint_backups() {
        let paths = switch_paths(&square(), 1, 4, 3);
        assert_eq!(paths.len(), 2);
        assert!(paths[0].iter().all(|l| !paths[1].contains(l)));
        assert_eq!(paths[1][0].dst.dpid, 3);
        assert_eq!(priority_of(0, 2), 1);
        assert_eq!(priority_of(1, 2), 0);
        assert_eq!(priority_of(0, 1), 0);
    }

    #[test]
    fn test_port_paths_pin_endpoints() {
        let links = square();
        // Leave switch 1 through port 2, toward 3, and arrive at 4 port 1.
        let paths = port_paths(
            &links,
            PortRef::new(1, 2),
            PortRef::new(4, 1),
            2,
        );
        assert_eq!(paths.len(), 0);

        let mut links = links;
        links.extend(both((3, 3), (2, 3)));
        let paths = port_paths(&links, PortRef::new(1, 2), PortRef::new(4, 1), 2);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].first().unwrap().src, PortRef::new(1, 2));
        assert_eq!(paths[0].last().unwrap().dst, PortRef::new(4, 1));
        assert_eq!(paths[0].len(), 3);
    }

    #[test]
    fn test_unreachable() {
        let links: BTreeSet<LinkKey> = both((1, 1), (2, 1)).into_iter().collect();
        assert!(switch_paths(&links, 1, 9, 2).is_empty());
        assert_eq!(switch_paths(&links, 1, 1, 2), vec![Vec::<LinkKey>::new()]);
    }
}
