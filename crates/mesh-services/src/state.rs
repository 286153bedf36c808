//! Node state: the one aggregate every consumer observes.
//!
//! `NodeStateStore` is the single serialization point for everything the
//! node knows: the routing table, both WiFi roles, and the concurrency
//! capability. Components describe what changed as a [`Mutation`]; the store
//! applies it to a private copy, swaps the copy in, and publishes the new
//! immutable snapshot to every subscriber.
//!
//! Readers only ever hold `Arc<NodeState>`. Nothing outside this module can
//! lock, borrow mutably, or partially update the state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mesh_core::{HotspotConfig, OriginatorMessage, VirtualAddr};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::originator::{self, DropReason, Judgement, LinkId};

// ── Value types ───────────────────────────────────────────────────────────────

/// Who this node is. Fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeIdentity {
    pub addr: VirtualAddr,
    pub display_name: String,
}

/// Whether the AP and STA roles may run at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencySupport {
    /// Not probed yet. Treated as unsupported by the capability gate.
    #[default]
    Unknown,
    Supported,
    Unsupported,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StationStatus {
    #[default]
    Inactive,
    Connecting,
    Connected,
    Failed,
}

/// Published view of the station role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WifiStationState {
    pub status: StationStatus,
    /// Hotspot being joined or joined. `None` when inactive.
    pub config: Option<HotspotConfig>,
    /// Why the last attempt failed, when `status` is `Failed`.
    pub failure: Option<String>,
}

impl WifiStationState {
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn connecting(config: HotspotConfig) -> Self {
        Self {
            status: StationStatus::Connecting,
            config: Some(config),
            failure: None,
        }
    }

    pub fn connected(config: HotspotConfig) -> Self {
        Self {
            status: StationStatus::Connected,
            config: Some(config),
            failure: None,
        }
    }

    pub fn failed(config: Option<HotspotConfig>, reason: impl Into<String>) -> Self {
        Self {
            status: StationStatus::Failed,
            config,
            failure: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApStatus {
    #[default]
    Off,
    Starting,
    On,
    Stopping,
}

/// Published view of the hotspot role. `config` is only ever `Some` while
/// the hotspot is `On`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HotspotState {
    pub status: ApStatus,
    pub config: Option<HotspotConfig>,
}

impl HotspotState {
    pub fn with_status(status: ApStatus) -> Self {
        Self {
            status,
            config: None,
        }
    }

    pub fn on(config: HotspotConfig) -> Self {
        Self {
            status: ApStatus::On,
            config: Some(config),
        }
    }
}

/// Best known advertisement for one remote origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastOriginatorMessage {
    pub origin: VirtualAddr,
    /// Hops from here to the origin, ≥ 1.
    pub hop_count: u8,
    /// Accumulated path latency ("ping time sum"), milliseconds.
    pub latency_ms: u32,
    pub sequence: u32,
    /// Monotonic arrival time.
    pub time_received: Instant,
    /// Neighbour that delivered it, the next hop towards `origin`.
    pub last_hop: VirtualAddr,
    /// Link it arrived on.
    pub link: LinkId,
}

impl LastOriginatorMessage {
    pub fn message(&self) -> OriginatorMessage {
        OriginatorMessage {
            origin: self.origin,
            hop_count: self.hop_count,
            latency_ms: self.latency_ms,
            sequence: self.sequence,
        }
    }
}

// ── NodeState ─────────────────────────────────────────────────────────────────

/// Immutable snapshot of everything the node knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub identity: NodeIdentity,
    /// Remote virtual address → best known advertisement.
    pub originators: HashMap<VirtualAddr, LastOriginatorMessage>,
    pub station: WifiStationState,
    pub hotspot: HotspotState,
    pub concurrency: ConcurrencySupport,
    /// Bumped on every published change. Subscribers see it strictly increase.
    pub version: u64,
}

impl NodeState {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            originators: HashMap::new(),
            station: WifiStationState::inactive(),
            hotspot: HotspotState::default(),
            concurrency: ConcurrencySupport::Unknown,
            version: 0,
        }
    }

    pub fn local_addr(&self) -> VirtualAddr {
        self.identity.addr
    }

    pub fn hotspot_enabled(&self) -> bool {
        self.hotspot.status == ApStatus::On
    }

    pub fn is_reachable(&self, addr: VirtualAddr) -> bool {
        self.originators.contains_key(&addr)
    }

    /// Neighbour to hand traffic for `dest` to.
    pub fn next_hop(&self, dest: VirtualAddr) -> Option<VirtualAddr> {
        self.originators.get(&dest).map(|m| m.last_hop)
    }

    /// Every reachable remote address, sorted.
    pub fn nodes_on_mesh(&self) -> Vec<VirtualAddr> {
        let mut nodes: Vec<VirtualAddr> = self.originators.keys().copied().collect();
        nodes.sort();
        nodes
    }

    fn apply(&mut self, mutation: Mutation) -> Effect {
        match mutation {
            Mutation::OriginatorReceived {
                message,
                last_hop,
                link,
                received_at,
            } => {
                if message.origin == self.identity.addr {
                    return Effect::Originator(Judgement::Dropped(DropReason::Loop));
                }
                let existing = self.originators.get(&message.origin);
                if let Some(existing) = existing {
                    if let Err(reason) = originator::supersedes(existing, &message, received_at) {
                        return Effect::Originator(Judgement::Dropped(reason));
                    }
                }
                let new_origin = existing.is_none();
                self.originators.insert(
                    message.origin,
                    LastOriginatorMessage {
                        origin: message.origin,
                        hop_count: message.hop_count,
                        latency_ms: message.latency_ms,
                        sequence: message.sequence,
                        time_received: received_at,
                        last_hop,
                        link,
                    },
                );
                Effect::Originator(Judgement::Accepted { new_origin })
            }
            Mutation::SweepStale { now, threshold } => {
                let mut evicted: Vec<VirtualAddr> = self
                    .originators
                    .values()
                    .filter(|m| now.saturating_duration_since(m.time_received) > threshold)
                    .map(|m| m.origin)
                    .collect();
                for addr in &evicted {
                    self.originators.remove(addr);
                }
                evicted.sort();
                Effect::Evicted(evicted)
            }
            Mutation::Hotspot(hotspot) => replace(&mut self.hotspot, hotspot),
            Mutation::Station(station) => replace(&mut self.station, station),
            Mutation::Concurrency(support) => replace(&mut self.concurrency, support),
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> Effect {
    if *slot == value {
        Effect::Unchanged
    } else {
        *slot = value;
        Effect::Updated
    }
}

// ── Mutations ─────────────────────────────────────────────────────────────────

/// A description of one change to node state.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// An originator message arrived. Applied only if it supersedes the
    /// stored record for its origin.
    OriginatorReceived {
        message: OriginatorMessage,
        last_hop: VirtualAddr,
        link: LinkId,
        received_at: Instant,
    },
    /// Drop every record older than `threshold` as of `now`.
    SweepStale { now: Instant, threshold: Duration },
    Hotspot(HotspotState),
    Station(WifiStationState),
    Concurrency(ConcurrencySupport),
}

/// What a mutation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Unchanged,
    Updated,
    Originator(Judgement),
    /// Addresses removed by a sweep, sorted. Empty if nothing was stale.
    Evicted(Vec<VirtualAddr>),
}

impl Effect {
    pub fn changed(&self) -> bool {
        match self {
            Effect::Unchanged => false,
            Effect::Updated => true,
            Effect::Originator(j) => matches!(j, Judgement::Accepted { .. }),
            Effect::Evicted(addrs) => !addrs.is_empty(),
        }
    }
}

/// The outcome of [`NodeStateStore::apply`]: the state after the mutation
/// and what the mutation did.
#[derive(Debug, Clone)]
pub struct Applied {
    pub state: Arc<NodeState>,
    pub effect: Effect,
}

// ── Store ─────────────────────────────────────────────────────────────────────

struct StoreInner {
    current: Arc<NodeState>,
    subscribers: Vec<mpsc::UnboundedSender<Arc<NodeState>>>,
}

/// Single-writer, many-reader owner of [`NodeState`].
///
/// Cheap to clone; all clones share one state. `apply` is atomic with
/// respect to every other `apply`, `snapshot` and `subscribe`.
#[derive(Clone)]
pub struct NodeStateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl NodeStateStore {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                current: Arc::new(NodeState::new(identity)),
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic mid-apply cannot leave a torn state: `current` is only
        // ever replaced wholesale.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The latest published state.
    pub fn snapshot(&self) -> Arc<NodeState> {
        self.lock().current.clone()
    }

    /// Apply one mutation and, if anything changed, publish the result.
    pub fn apply(&self, mutation: Mutation) -> Applied {
        let mut inner = self.lock();
        let mut next = NodeState::clone(&inner.current);
        let effect = next.apply(mutation);
        if !effect.changed() {
            return Applied {
                state: inner.current.clone(),
                effect,
            };
        }

        next.version += 1;
        let next = Arc::new(next);
        inner.current = next.clone();
        inner
            .subscribers
            .retain(|tx| tx.send(next.clone()).is_ok());
        tracing::trace!(version = next.version, ?effect, "node state published");
        Applied { state: next, effect }
    }

    /// Subscribe to state changes. The stream yields the current snapshot
    /// first, then every later change in publish order.
    pub fn subscribe(&self) -> StateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // Sent under the lock so no publish can slip in ahead of it.
        let _ = tx.send(inner.current.clone());
        inner.subscribers.push(tx);
        StateStream { rx }
    }

    /// Live subscribers. Dropped streams are pruned on the next publish.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// One subscriber's view of the published state sequence.
pub struct StateStream {
    rx: mpsc::UnboundedReceiver<Arc<NodeState>>,
}

impl StateStream {
    /// Next snapshot, waiting if none is pending. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Arc<NodeState>> {
        self.rx.recv().await
    }

    /// Next snapshot if one is already pending.
    pub fn try_next(&mut self) -> Option<Arc<NodeState>> {
        self.rx.try_recv().ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
