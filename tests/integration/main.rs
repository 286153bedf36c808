//! Mesh integration test harness.
//!
//! Most tests wire several in-process nodes together through [`Mesh`],
//! which carries encoded datagrams between them exactly as the daemon's
//! listener would, with a simulated radio underneath.
//!
//! The tests in `netns` run real `meshd` processes in network namespaces.
//! They need root, the namespace pair and a built daemon, and skip
//! otherwise:
//!
//!   sudo ./scripts/netns-up.sh
//!   cargo build -p meshd
//!   sudo cargo test --test integration
//!
//! Each test is responsible for any processes it spawns.

mod netns;
mod routing;
mod wifi;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_core::config::MeshConfig;
use mesh_services::{LinkId, Reaction, SimulatedPlatform, VirtualNode};

// ── Harness ───────────────────────────────────────────────────────────────────

/// One end of a point-to-point link between two nodes.
#[derive(Debug, Clone, Copy)]
struct Port {
    node: usize,
    link: LinkId,
}

/// A set of in-process nodes joined by point-to-point links.
pub struct Mesh {
    pub nodes: Vec<VirtualNode>,
    pub platforms: Vec<Arc<SimulatedPlatform>>,
    wires: Vec<(Port, Port)>,
}

impl Mesh {
    pub fn new(count: usize) -> Self {
        Self::with_config(count, &MeshConfig::default())
    }

    pub fn with_config(count: usize, config: &MeshConfig) -> Self {
        let mut nodes = Vec::with_capacity(count);
        let mut platforms = Vec::with_capacity(count);
        for i in 0..count {
            let platform = Arc::new(SimulatedPlatform::new());
            let mut config = config.clone();
            config.node.display_name = format!("node-{i}");
            nodes.push(VirtualNode::new(&config, platform.clone()).expect("node"));
            platforms.push(platform);
        }
        Self {
            nodes,
            platforms,
            wires: Vec::new(),
        }
    }

    /// A line: 0 - 1 - 2 - ... - (count - 1).
    pub fn line(count: usize) -> Self {
        let mut mesh = Self::new(count);
        for i in 1..count {
            mesh.wire(i - 1, i);
        }
        mesh
    }

    /// Connect two nodes with a new link. Link ids are per node, in order
    /// of wiring.
    pub fn wire(&mut self, a: usize, b: usize) {
        let a_port = Port {
            node: a,
            link: LinkId(self.links_of(a) as u32),
        };
        let b_port = Port {
            node: b,
            link: LinkId(self.links_of(b) as u32),
        };
        self.wires.push((a_port, b_port));
    }

    fn links_of(&self, node: usize) -> usize {
        self.wires
            .iter()
            .filter(|(a, b)| a.node == node || b.node == node)
            .count()
    }

    /// (our port, their port) for every link `node` is on.
    fn neighbors(&self, node: usize) -> Vec<(Port, Port)> {
        self.wires
            .iter()
            .filter_map(|&(a, b)| {
                if a.node == node {
                    Some((a, b))
                } else if b.node == node {
                    Some((b, a))
                } else {
                    None
                }
            })
            .collect()
    }

    /// The far end of `node`'s `link`.
    fn peer(&self, node: usize, link: LinkId) -> Option<Port> {
        self.neighbors(node)
            .into_iter()
            .find(|(ours, _)| ours.link == link)
            .map(|(_, theirs)| theirs)
    }

    /// Every node advertises once; forwarding runs until the mesh is quiet.
    pub fn round(&self, now: Instant) {
        let mut queue = VecDeque::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let message = node.protocol().next_advertisement();
            for (ours, theirs) in self.neighbors(i) {
                queue.push_back((theirs, node.protocol().outgoing(message, ours.link)));
            }
        }
        self.drain(queue, now);
    }

    /// Deliver queued datagrams, and everything they cause, at `now`.
    fn drain(&self, mut queue: VecDeque<(Port, Vec<u8>)>, now: Instant) {
        while let Some((to, bytes)) = queue.pop_front() {
            let protocol = self.nodes[to.node].protocol();
            match protocol.handle_datagram(&bytes, to.link, now) {
                Ok(Reaction::Forward(message)) => {
                    for (ours, theirs) in self.neighbors(to.node) {
                        if ours.link != to.link {
                            queue.push_back((theirs, protocol.outgoing(message, ours.link)));
                        }
                    }
                }
                Ok(Reaction::Reply(reply)) => {
                    if let Some(back) = self.peer(to.node, to.link) {
                        queue.push_back((back, reply));
                    }
                }
                Ok(Reaction::Nothing) => {}
                Err(e) => panic!("undecodable datagram in harness: {e}"),
            }
        }
    }

    /// `node` probes the neighbour on its `link`; the reply comes back
    /// after `rtt`.
    pub fn probe(&self, node: usize, link: LinkId, sent: Instant, rtt: Duration) {
        let peer = self.peer(node, link).expect("no neighbour on link");
        let probe = self.nodes[node].protocol().make_probe(sent);
        let reply = match self.nodes[peer.node]
            .protocol()
            .handle_datagram(&probe, peer.link, sent)
        {
            Ok(Reaction::Reply(reply)) => reply,
            other => panic!("expected a probe reply, got {:?}", other.map(|_| ())),
        };
        self.nodes[node]
            .protocol()
            .handle_datagram(&reply, link, sent + rtt)
            .expect("reply decodes");
    }
}
