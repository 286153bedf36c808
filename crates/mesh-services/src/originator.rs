//! Originator protocol: flooding advertisements that build the route table.
//!
//! Every node periodically advertises itself on each link. A node that
//! accepts an advertisement stores it and re-emits it on its other links
//! with one more hop and the latency of the link being crossed added on.
//! Copies that are not an improvement are dropped, which is what stops the
//! flood from amplifying.
//!
//! Loop freedom does not depend on topology: self-originated messages,
//! echoes of our own forwards, and anything past the hop ceiling are dropped
//! before the table is consulted, and per-origin sequence numbers only ever
//! move forward.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mesh_core::config::ProtocolConfig;
use mesh_core::wire::{OriginatorFrame, Probe, ProbeFrame};
use mesh_core::{AddressSpace, Frame, OriginatorMessage, VirtualAddr, WireError};
use serde::Serialize;
use zerocopy::AsBytes;

use crate::latency::LinkLatency;
use crate::state::{Effect, LastOriginatorMessage, Mutation, NodeStateStore};

/// A physical link (interface) the node sends and receives frames on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkId(pub u32);

/// Why an originator message was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Our own advertisement, or our own forward, came back.
    Loop,
    /// Hop count 0 never appears on the wire.
    ZeroHop,
    /// Past the hop ceiling.
    TtlExceeded,
    /// Older than what is stored.
    Stale,
    /// Same sequence as stored and no better path.
    Duplicate,
}

/// Outcome of offering a message to the route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Judgement {
    Accepted { new_origin: bool },
    Dropped(DropReason),
}

/// What the caller should do after an originator message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stored; re-emit on every other link.
    Forward(OriginatorMessage),
    /// Stored, but already at the hop ceiling.
    Accepted,
    Dropped(DropReason),
}

/// What the caller should do after any datagram was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    Forward(OriginatorMessage),
    /// Send these bytes back on the arrival link.
    Reply(Vec<u8>),
    Nothing,
}

// ── Ordering ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SerialOrder {
    Newer,
    Older,
    Equal,
    /// Exactly half the sequence space apart; direction undefined.
    Ambiguous,
}

/// Serial number comparison over the wrapping 32-bit sequence space.
fn serial_order(incoming: u32, stored: u32) -> SerialOrder {
    const HALF: u32 = 1 << 31;
    match incoming.wrapping_sub(stored) {
        0 => SerialOrder::Equal,
        HALF => SerialOrder::Ambiguous,
        d if d < HALF => SerialOrder::Newer,
        _ => SerialOrder::Older,
    }
}

/// Should `incoming`, received at `received_at`, replace `stored`?
///
/// A newer sequence always wins. On an equal sequence, fewer hops win, then
/// lower latency. When the sequences are too far apart to order, the more
/// recent arrival wins.
pub fn supersedes(
    stored: &LastOriginatorMessage,
    incoming: &OriginatorMessage,
    received_at: Instant,
) -> Result<(), DropReason> {
    match serial_order(incoming.sequence, stored.sequence) {
        SerialOrder::Newer => Ok(()),
        SerialOrder::Older => Err(DropReason::Stale),
        SerialOrder::Ambiguous if received_at > stored.time_received => Ok(()),
        SerialOrder::Ambiguous => Err(DropReason::Stale),
        SerialOrder::Equal => {
            let path = (incoming.hop_count, incoming.latency_ms);
            match path.cmp(&(stored.hop_count, stored.latency_ms)) {
                CmpOrdering::Less => Ok(()),
                _ => Err(DropReason::Duplicate),
            }
        }
    }
}

// ── Protocol ──────────────────────────────────────────────────────────────────

pub struct OriginatorProtocol {
    local: VirtualAddr,
    store: NodeStateStore,
    addresses: AddressSpace,
    latency: LinkLatency,
    sequence: AtomicU32,
    max_hops: u8,
    stale_threshold: Duration,
    /// Reference point for probe timestamps.
    epoch: Instant,
    /// Probes we sent that may still be answered, by nonce.
    outstanding: DashMap<u32, Outstanding>,
}

/// A probe in flight. One multicast probe can draw a reply from every
/// neighbour on the link, but each neighbour is counted once.
struct Outstanding {
    sent_at_us: u64,
    answered: Vec<VirtualAddr>,
}

impl OriginatorProtocol {
    pub fn new(store: NodeStateStore, addresses: AddressSpace, config: &ProtocolConfig) -> Self {
        Self {
            local: store.snapshot().local_addr(),
            store,
            addresses,
            latency: LinkLatency::new(),
            sequence: AtomicU32::new(0),
            max_hops: config.effective_max_hops(),
            stale_threshold: config.stale_threshold(),
            epoch: Instant::now(),
            outstanding: DashMap::new(),
        }
    }

    pub fn local(&self) -> VirtualAddr {
        self.local
    }

    pub fn latency(&self) -> &LinkLatency {
        &self.latency
    }

    pub fn max_hops(&self) -> u8 {
        self.max_hops
    }

    /// Our own advertisement for this round, before any link is crossed.
    /// Each call takes the next sequence number.
    pub fn next_advertisement(&self) -> OriginatorMessage {
        OriginatorMessage {
            origin: self.local,
            hop_count: 0,
            latency_ms: 0,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
        }
    }

    /// The message as it leaves on `link`, ready to send.
    pub fn outgoing(&self, message: OriginatorMessage, link: LinkId) -> Vec<u8> {
        let message = message.forwarded(self.latency.link_latency(link));
        OriginatorFrame::new(&message, self.local).as_bytes().to_vec()
    }

    /// Offer a received originator message to the route table.
    pub fn handle_originator(
        &self,
        message: OriginatorMessage,
        last_hop: VirtualAddr,
        link: LinkId,
        now: Instant,
    ) -> Disposition {
        if let Some(reason) = self.precheck(&message, last_hop) {
            tracing::trace!(origin = %message.origin, ?reason, "originator dropped");
            return Disposition::Dropped(reason);
        }
        self.latency.observe(last_hop, link, now);

        let applied = self.store.apply(Mutation::OriginatorReceived {
            message,
            last_hop,
            link,
            received_at: now,
        });
        match applied.effect {
            Effect::Originator(Judgement::Accepted { new_origin }) => {
                self.addresses.mark_known(message.origin);
                if new_origin {
                    tracing::debug!(
                        origin = %message.origin,
                        hops = message.hop_count,
                        via = %last_hop,
                        "node reachable"
                    );
                }
                if message.hop_count < self.max_hops {
                    Disposition::Forward(message)
                } else {
                    Disposition::Accepted
                }
            }
            Effect::Originator(Judgement::Dropped(reason)) => {
                tracing::trace!(origin = %message.origin, seq = message.sequence, ?reason, "originator dropped");
                Disposition::Dropped(reason)
            }
            _ => Disposition::Dropped(DropReason::Duplicate),
        }
    }

    fn precheck(&self, message: &OriginatorMessage, last_hop: VirtualAddr) -> Option<DropReason> {
        if message.origin == self.local || last_hop == self.local {
            Some(DropReason::Loop)
        } else if message.hop_count == 0 {
            Some(DropReason::ZeroHop)
        } else if message.hop_count > self.max_hops {
            Some(DropReason::TtlExceeded)
        } else {
            None
        }
    }

    /// Evict every route not refreshed within the staleness threshold.
    pub fn sweep(&self, now: Instant) -> Vec<VirtualAddr> {
        let applied = self.store.apply(Mutation::SweepStale {
            now,
            threshold: self.stale_threshold,
        });
        self.latency.expire(now, self.stale_threshold);
        self.expire_outstanding(now);
        let Effect::Evicted(evicted) = applied.effect else {
            return Vec::new();
        };
        for addr in &evicted {
            self.addresses.forget(*addr);
            tracing::info!(%addr, "route expired");
        }
        evicted
    }

    // ── Probes ────────────────────────────────────────────────────────────

    fn micros_since_epoch(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_micros()).unwrap_or(u64::MAX)
    }

    /// A latency probe stamped with `now`. Only replies to probes made here
    /// are folded into the link estimate.
    pub fn make_probe(&self, now: Instant) -> Vec<u8> {
        let sent_at_us = self.micros_since_epoch(now);
        let nonce = loop {
            let nonce: u32 = rand::random();
            if !self.outstanding.contains_key(&nonce) {
                break nonce;
            }
        };
        self.outstanding.insert(
            nonce,
            Outstanding {
                sent_at_us,
                answered: Vec::new(),
            },
        );
        ProbeFrame::probe(self.local, nonce, sent_at_us)
            .as_bytes()
            .to_vec()
    }

    /// Number of probes still waiting on replies.
    pub fn outstanding_probes(&self) -> usize {
        self.outstanding.len()
    }

    fn expire_outstanding(&self, now: Instant) {
        let horizon = u64::try_from(self.stale_threshold.as_micros()).unwrap_or(u64::MAX);
        let now_us = self.micros_since_epoch(now);
        self.outstanding
            .retain(|_, p| now_us.saturating_sub(p.sent_at_us) <= horizon);
    }

    /// Answer a neighbour's probe.
    pub fn handle_probe(&self, probe: &Probe, link: LinkId, now: Instant) -> Option<Vec<u8>> {
        if probe.sender == self.local {
            return None;
        }
        self.latency.observe(probe.sender, link, now);
        Some(ProbeFrame::reply(probe, self.local).as_bytes().to_vec())
    }

    /// Fold the reply to one of our probes into the link estimate.
    /// Returns the measured round trip.
    pub fn handle_probe_reply(&self, reply: &Probe, link: LinkId, now: Instant) -> Option<Duration> {
        if reply.sender != self.local {
            return None;
        }
        let responder = reply.responder.filter(|r| *r != self.local)?;
        {
            let mut pending = self.outstanding.get_mut(&reply.nonce)?;
            if pending.sent_at_us != reply.sent_at_us || pending.answered.contains(&responder) {
                tracing::trace!(%responder, nonce = reply.nonce, "unexpected probe reply");
                return None;
            }
            pending.answered.push(responder);
        }
        let rtt_us = self.micros_since_epoch(now).checked_sub(reply.sent_at_us)?;
        let rtt = Duration::from_micros(rtt_us);
        self.latency.record_rtt(responder, link, rtt, now);
        tracing::trace!(%responder, ?rtt, "probe reply");
        Some(rtt)
    }

    /// Decode and handle one datagram received on `link`.
    pub fn handle_datagram(
        &self,
        buf: &[u8],
        link: LinkId,
        now: Instant,
    ) -> Result<Reaction, WireError> {
        Ok(match Frame::decode(buf)? {
            Frame::Originator { message, last_hop } => {
                match self.handle_originator(message, last_hop, link, now) {
                    Disposition::Forward(message) => Reaction::Forward(message),
                    _ => Reaction::Nothing,
                }
            }
            Frame::Probe(probe) => self
                .handle_probe(&probe, link, now)
                .map_or(Reaction::Nothing, Reaction::Reply),
            Frame::ProbeReply(reply) => {
                self.handle_probe_reply(&reply, link, now);
                Reaction::Nothing
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeIdentity;

    fn addr(d: u8) -> VirtualAddr {
        VirtualAddr::from_octets(10, 0, 0, d)
    }

    fn protocol(local: u8) -> OriginatorProtocol {
        let store = NodeStateStore::new(NodeIdentity {
            addr: addr(local),
            display_name: format!("node-{local}"),
        });
        OriginatorProtocol::new(store, AddressSpace::new(), &ProtocolConfig::default())
    }

    fn msg(origin: u8, hops: u8, latency: u32, seq: u32) -> OriginatorMessage {
        OriginatorMessage {
            origin: addr(origin),
            hop_count: hops,
            latency_ms: latency,
            sequence: seq,
        }
    }

    fn stored(seq: u32, hops: u8, latency: u32, at: Instant) -> LastOriginatorMessage {
        LastOriginatorMessage {
            origin: addr(9),
            hop_count: hops,
            latency_ms: latency,
            sequence: seq,
            time_received: at,
            last_hop: addr(2),
            link: LinkId(0),
        }
    }

    #[test]
    fn serial_order_wraps() {
        assert_eq!(serial_order(5, 4), SerialOrder::Newer);
        assert_eq!(serial_order(4, 5), SerialOrder::Older);
        assert_eq!(serial_order(0, u32::MAX), SerialOrder::Newer);
        assert_eq!(serial_order(u32::MAX, 0), SerialOrder::Older);
        assert_eq!(serial_order(7, 7), SerialOrder::Equal);
        assert_eq!(serial_order(1 << 31, 0), SerialOrder::Ambiguous);
    }

    #[test]
    fn equal_sequence_prefers_shorter_then_faster_path() {
        let now = Instant::now();
        let s = stored(5, 2, 40, now);
        assert_eq!(supersedes(&s, &msg(9, 1, 90, 5), now), Ok(()));
        assert_eq!(supersedes(&s, &msg(9, 2, 30, 5), now), Ok(()));
        assert_eq!(supersedes(&s, &msg(9, 2, 40, 5), now), Err(DropReason::Duplicate));
        assert_eq!(supersedes(&s, &msg(9, 3, 10, 5), now), Err(DropReason::Duplicate));
        assert_eq!(supersedes(&s, &msg(9, 9, 900, 6), now), Ok(()));
        assert_eq!(supersedes(&s, &msg(9, 1, 0, 4), now), Err(DropReason::Stale));
    }

    #[test]
    fn ambiguous_sequence_falls_back_to_arrival_time() {
        let then = Instant::now();
        let later = then + Duration::from_millis(1);
        let s = stored(0, 1, 0, then);
        assert_eq!(supersedes(&s, &msg(9, 1, 0, 1 << 31), later), Ok(()));
        assert_eq!(supersedes(&s, &msg(9, 1, 0, 1 << 31), then), Err(DropReason::Stale));
    }

    #[test]
    fn forwarded_once_then_duplicate_dropped() {
        let node = protocol(1);
        let now = Instant::now();
        node.latency()
            .record_rtt(addr(3), LinkId(1), Duration::from_millis(30), now);

        let incoming = msg(9, 1, 20, 5);
        let forward = match node.handle_originator(incoming, addr(9), LinkId(0), now) {
            Disposition::Forward(m) => m,
            other => panic!("expected forward, got {other:?}"),
        };
        let bytes = node.outgoing(forward, LinkId(1));
        match Frame::decode(&bytes).unwrap() {
            Frame::Originator { message, last_hop } => {
                assert_eq!(message, msg(9, 2, 20 + 15, 5));
                assert_eq!(last_hop, addr(1));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        assert_eq!(
            node.handle_originator(incoming, addr(9), LinkId(0), now),
            Disposition::Dropped(DropReason::Duplicate)
        );
    }

    #[test]
    fn stored_entry_never_regresses() {
        let node = protocol(1);
        let now = Instant::now();
        for seq in [3, 7, 5, 6, 2] {
            node.handle_originator(msg(9, 2, 10, seq), addr(2), LinkId(0), now);
        }
        let state = node.store.snapshot();
        assert_eq!(state.originators[&addr(9)].sequence, 7);
    }

    #[test]
    fn loops_and_ttl_are_rejected() {
        let node = protocol(1);
        let now = Instant::now();
        assert_eq!(
            node.handle_originator(msg(1, 3, 0, 1), addr(2), LinkId(0), now),
            Disposition::Dropped(DropReason::Loop)
        );
        assert_eq!(
            node.handle_originator(msg(9, 3, 0, 1), addr(1), LinkId(0), now),
            Disposition::Dropped(DropReason::Loop)
        );
        assert_eq!(
            node.handle_originator(msg(9, 0, 0, 1), addr(2), LinkId(0), now),
            Disposition::Dropped(DropReason::ZeroHop)
        );
        assert_eq!(
            node.handle_originator(msg(9, 33, 0, 1), addr(2), LinkId(0), now),
            Disposition::Dropped(DropReason::TtlExceeded)
        );
        assert!(node.store.snapshot().originators.is_empty());
    }

    #[test]
    fn message_at_hop_ceiling_is_stored_not_forwarded() {
        let node = protocol(1);
        assert_eq!(
            node.handle_originator(msg(9, 32, 0, 1), addr(2), LinkId(0), Instant::now()),
            Disposition::Accepted
        );
        assert!(node.store.snapshot().is_reachable(addr(9)));
    }

    #[test]
    fn own_advertisement_leaves_with_one_hop() {
        let node = protocol(1);
        let first = node.next_advertisement();
        let second = node.next_advertisement();
        assert_eq!(second.sequence, first.sequence.wrapping_add(1));

        match Frame::decode(&node.outgoing(first, LinkId(0))).unwrap() {
            Frame::Originator { message, last_hop } => {
                assert_eq!(message.origin, addr(1));
                assert_eq!(message.hop_count, 1);
                assert_eq!(last_hop, addr(1));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn sweep_forgets_addresses() {
        let node = protocol(1);
        let start = Instant::now();
        node.handle_originator(msg(9, 1, 0, 1), addr(9), LinkId(0), start);
        assert!(node.addresses.is_known(addr(9)));

        assert!(node.sweep(start + Duration::from_secs(1)).is_empty());
        let evicted = node.sweep(start + Duration::from_secs(16));
        assert_eq!(evicted, vec![addr(9)]);
        assert!(!node.addresses.is_known(addr(9)));
        assert!(node.latency().get(addr(9)).is_none());
    }

    #[test]
    fn probe_round_trip_sets_link_latency() {
        let a = protocol(1);
        let b = protocol(2);
        let sent = a.epoch + Duration::from_millis(100);

        let probe = a.make_probe(sent);
        let reply = match b.handle_datagram(&probe, LinkId(0), Instant::now()).unwrap() {
            Reaction::Reply(bytes) => bytes,
            other => panic!("expected reply, got {other:?}"),
        };
        assert_eq!(
            a.handle_datagram(&reply, LinkId(4), sent + Duration::from_millis(40))
                .unwrap(),
            Reaction::Nothing
        );
        assert_eq!(a.latency().link_latency(LinkId(4)), 20);
        assert_eq!(b.latency().link_latency(LinkId(4)), 0);
    }

    #[test]
    fn own_probe_echo_is_ignored() {
        let a = protocol(1);
        let probe = a.make_probe(Instant::now());
        assert_eq!(
            a.handle_datagram(&probe, LinkId(0), Instant::now()).unwrap(),
            Reaction::Nothing
        );
    }

    fn reply_from(responder: &OriginatorProtocol, request: &[u8]) -> Vec<u8> {
        match responder.handle_datagram(request, LinkId(0), Instant::now()).unwrap() {
            Reaction::Reply(bytes) => bytes,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn forged_reply_leaves_latency_alone() {
        let a = protocol(1);
        let sent = a.epoch + Duration::from_millis(100);
        let _ = a.make_probe(sent);

        // Well-formed, addressed to us, but never requested.
        let forged = Probe {
            sender: addr(1),
            responder: None,
            nonce: 0xdead_beef,
            sent_at_us: 0,
        };
        let bytes = ProbeFrame::reply(&forged, addr(2)).as_bytes().to_vec();
        a.handle_datagram(&bytes, LinkId(0), sent + Duration::from_millis(40))
            .unwrap();

        assert!(a.latency().get(addr(2)).is_none());
        assert_eq!(a.latency().link_latency(LinkId(0)), 0);
    }

    #[test]
    fn rewritten_stamp_is_rejected() {
        let a = protocol(1);
        let b = protocol(2);
        let sent = a.epoch + Duration::from_millis(500);
        let reply = reply_from(&b, &a.make_probe(sent));

        let Frame::ProbeReply(mut tampered) = Frame::decode(&reply).unwrap() else {
            panic!("expected a reply frame");
        };
        tampered.sent_at_us = 0;
        let now = sent + Duration::from_millis(10);
        assert_eq!(a.handle_probe_reply(&tampered, LinkId(0), now), None);
        assert!(a.latency().get(addr(2)).is_none());
    }

    #[test]
    fn replayed_reply_counts_once() {
        let a = protocol(1);
        let b = protocol(2);
        let sent = a.epoch + Duration::from_millis(100);
        let reply = reply_from(&b, &a.make_probe(sent));

        let Frame::ProbeReply(decoded) = Frame::decode(&reply).unwrap() else {
            panic!("expected a reply frame");
        };
        let first = a.handle_probe_reply(&decoded, LinkId(0), sent + Duration::from_millis(40));
        assert_eq!(first, Some(Duration::from_millis(40)));
        let replay = a.handle_probe_reply(&decoded, LinkId(0), sent + Duration::from_millis(400));
        assert_eq!(replay, None);
        assert_eq!(a.latency().link_latency(LinkId(0)), 20);
    }

    #[test]
    fn every_neighbour_on_a_link_may_answer() {
        let a = protocol(1);
        let b = protocol(2);
        let c = protocol(3);
        let sent = a.epoch + Duration::from_millis(100);
        let request = a.make_probe(sent);

        let now = sent + Duration::from_millis(20);
        for neighbour in [&b, &c] {
            let Frame::ProbeReply(decoded) = Frame::decode(&reply_from(neighbour, &request)).unwrap()
            else {
                panic!("expected a reply frame");
            };
            assert!(a.handle_probe_reply(&decoded, LinkId(0), now).is_some());
        }
        assert!(a.latency().get(addr(2)).is_some());
        assert!(a.latency().get(addr(3)).is_some());
    }

    #[test]
    fn unanswered_requests_expire_on_sweep() {
        let a = protocol(1);
        let b = protocol(2);
        let sent = a.epoch + Duration::from_millis(100);
        let request = a.make_probe(sent);
        assert_eq!(a.outstanding_probes(), 1);

        a.sweep(sent + Duration::from_secs(1));
        assert_eq!(a.outstanding_probes(), 1);
        let late = sent + Duration::from_secs(16);
        a.sweep(late);
        assert_eq!(a.outstanding_probes(), 0);

        let Frame::ProbeReply(decoded) = Frame::decode(&reply_from(&b, &request)).unwrap() else {
            panic!("expected a reply frame");
        };
        assert_eq!(a.handle_probe_reply(&decoded, LinkId(0), late), None);
    }

    #[test]
    fn garbage_is_a_wire_error() {
        let a = protocol(1);
        assert!(a.handle_datagram(b"hello", LinkId(0), Instant::now()).is_err());
    }
}
