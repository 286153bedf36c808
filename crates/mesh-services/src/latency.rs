//! Per-neighbour link latency estimates.
//!
//! Probe round trips are halved and folded into an exponentially weighted
//! moving average (α = 1/4). A link's latency is the mean over the
//! neighbours currently heard on it; a link nobody has measured yet counts
//! as zero.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mesh_core::VirtualAddr;

use crate::originator::LinkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborLatency {
    pub link: LinkId,
    /// Smoothed one-way latency. `None` until the first probe reply.
    pub latency_ms: Option<u32>,
    pub samples: u32,
    pub last_seen: Instant,
}

#[derive(Clone, Default)]
pub struct LinkLatency {
    neighbors: Arc<DashMap<VirtualAddr, NeighborLatency>>,
}

impl LinkLatency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `neighbor` was heard directly on `link`.
    pub fn observe(&self, neighbor: VirtualAddr, link: LinkId, now: Instant) {
        self.neighbors
            .entry(neighbor)
            .and_modify(|n| {
                n.link = link;
                n.last_seen = now;
            })
            .or_insert(NeighborLatency {
                link,
                latency_ms: None,
                samples: 0,
                last_seen: now,
            });
    }

    /// Fold one probe round trip into the estimate for `neighbor`.
    pub fn record_rtt(&self, neighbor: VirtualAddr, link: LinkId, rtt: Duration, now: Instant) {
        let one_way = u32::try_from(rtt.as_millis() / 2).unwrap_or(u32::MAX);
        let mut entry = self.neighbors.entry(neighbor).or_insert(NeighborLatency {
            link,
            latency_ms: None,
            samples: 0,
            last_seen: now,
        });
        entry.link = link;
        entry.last_seen = now;
        entry.samples = entry.samples.saturating_add(1);
        entry.latency_ms = Some(match entry.latency_ms {
            None => one_way,
            Some(prev) => ((prev as u64 * 3 + one_way as u64) / 4) as u32,
        });
    }

    /// Estimated latency for crossing `link`, in milliseconds.
    pub fn link_latency(&self, link: LinkId) -> u32 {
        let (sum, count) = self
            .neighbors
            .iter()
            .filter(|n| n.link == link)
            .filter_map(|n| n.latency_ms)
            .fold((0u64, 0u64), |(s, c), l| (s + l as u64, c + 1));
        if count == 0 {
            0
        } else {
            (sum / count) as u32
        }
    }

    /// Forget neighbours not heard from within `threshold`.
    pub fn expire(&self, now: Instant, threshold: Duration) -> usize {
        let before = self.neighbors.len();
        self.neighbors
            .retain(|_, n| now.saturating_duration_since(n.last_seen) <= threshold);
        before - self.neighbors.len()
    }

    pub fn get(&self, neighbor: VirtualAddr) -> Option<NeighborLatency> {
        self.neighbors.get(&neighbor).map(|n| *n)
    }

    /// All neighbours, sorted by address.
    pub fn neighbors(&self) -> Vec<(VirtualAddr, NeighborLatency)> {
        let mut out: Vec<_> = self.neighbors.iter().map(|e| (*e.key(), *e.value())).collect();
        out.sort_by_key(|(addr, _)| *addr);
        out
    }
}
