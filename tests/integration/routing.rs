use std::time::{Duration, Instant};

use mesh_core::config::MeshConfig;
use mesh_services::LinkId;

use crate::*;

/// Four nodes in a line learn about each other in one round.
#[test]
fn test_line_converges() {
    let mesh = Mesh::line(4);
    mesh.round(Instant::now());

    let a = mesh.nodes[0].addr();
    let c = mesh.nodes[2].addr();
    let d = &mesh.nodes[3];

    let state = d.state();
    assert_eq!(state.nodes_on_mesh().len(), 3);
    assert_eq!(state.originators[&a].hop_count, 3);
    assert_eq!(state.next_hop(a), Some(c));
    assert!(d.addresses().is_known(a));

    for node in &mesh.nodes {
        let state = node.state();
        assert_eq!(state.originators.len(), 3, "{} is missing routes", node.addr());
        assert!(!state.originators.contains_key(&node.addr()));
    }
}

/// A reaches C through B: hop count 2, latency is the sum of the two
/// measured links.
#[test]
fn test_latency_accumulates_along_path() {
    let mesh = Mesh::line(3);
    let t0 = Instant::now();

    mesh.probe(0, LinkId(0), t0, Duration::from_millis(40));
    mesh.probe(1, LinkId(1), t0, Duration::from_millis(30));
    assert_eq!(mesh.nodes[0].protocol().latency().link_latency(LinkId(0)), 20);
    assert_eq!(mesh.nodes[1].protocol().latency().link_latency(LinkId(1)), 15);

    mesh.round(t0 + Duration::from_millis(50));

    let a = mesh.nodes[0].addr();
    let entry = mesh.nodes[2].state().originators[&a].clone();
    assert_eq!(entry.hop_count, 2);
    assert_eq!(entry.latency_ms, 35);
    assert_eq!(entry.last_hop, mesh.nodes[1].addr());
}

/// In a triangle the direct path wins and the longer copy is dropped.
#[test]
fn test_triangle_keeps_shortest_path() {
    let mut mesh = Mesh::new(3);
    mesh.wire(0, 1);
    mesh.wire(1, 2);
    mesh.wire(2, 0);
    mesh.round(Instant::now());

    for (i, node) in mesh.nodes.iter().enumerate() {
        let state = node.state();
        for (j, other) in mesh.nodes.iter().enumerate() {
            if i == j {
                continue;
            }
            let entry = &state.originators[&other.addr()];
            assert_eq!(entry.hop_count, 1);
            assert_eq!(entry.last_hop, other.addr());
        }
    }
}

/// Sequence numbers move forward each round and routes stay stable.
#[test]
fn test_rounds_advance_sequence() {
    let mesh = Mesh::line(3);
    let t0 = Instant::now();
    mesh.round(t0);
    let a = mesh.nodes[0].addr();
    let first = mesh.nodes[2].state().originators[&a].sequence;

    mesh.round(t0 + Duration::from_secs(3));
    let entry = mesh.nodes[2].state().originators[&a].clone();
    assert_eq!(entry.sequence, first.wrapping_add(1));
    assert_eq!(entry.hop_count, 2);
}

/// Routes that stop being refreshed are swept; refreshed ones survive.
#[test]
fn test_stale_routes_evicted() {
    let config = MeshConfig::default();
    let threshold = config.protocol.stale_threshold();
    let mesh = Mesh::line(3);
    let t0 = Instant::now();
    mesh.round(t0);

    let c = &mesh.nodes[2];
    let a = mesh.nodes[0].addr();

    // Still fresh at exactly the threshold.
    assert!(c.protocol().sweep(t0 + threshold).is_empty());

    let refreshed = t0 + threshold / 2;
    mesh.round(refreshed);
    assert!(c.protocol().sweep(t0 + threshold + Duration::from_millis(1)).is_empty());

    let evicted = c
        .protocol()
        .sweep(refreshed + threshold + Duration::from_millis(1));
    assert_eq!(evicted.len(), 2);
    assert!(evicted.contains(&a));
    assert!(c.state().nodes_on_mesh().is_empty());
    assert!(!c.addresses().is_known(a));
}

/// Advertisements stop spreading at the hop ceiling.
#[test]
fn test_hop_ceiling_limits_reach() {
    let mut config = MeshConfig::default();
    config.protocol.max_hops = 3;
    let mut mesh = Mesh::with_config(6, &config);
    for i in 1..6 {
        mesh.wire(i - 1, i);
    }
    mesh.round(Instant::now());

    let a = mesh.nodes[0].addr();
    assert_eq!(mesh.nodes[3].state().originators[&a].hop_count, 3);
    assert!(!mesh.nodes[4].state().is_reachable(a));
    assert!(!mesh.nodes[5].state().is_reachable(a));
}

/// Subscribers see each route change once, in order.
#[tokio::test]
async fn test_subscriber_sees_routes_in_order() {
    let mesh = Mesh::line(3);
    let mut stream = mesh.nodes[2].subscribe();

    let initial = stream.next().await.expect("initial snapshot");
    assert!(initial.originators.is_empty());

    mesh.round(Instant::now());

    let mut last = initial.version;
    let mut latest = initial;
    while let Some(snapshot) = stream.try_next() {
        assert!(snapshot.version > last);
        last = snapshot.version;
        latest = snapshot;
    }
    assert_eq!(latest.nodes_on_mesh().len(), 2);
    assert_eq!(latest.version, mesh.nodes[2].state().version);
}

/// Garbage on the wire is rejected without touching state.
#[test]
fn test_garbage_datagram_ignored() {
    let mesh = Mesh::line(2);
    let node = &mesh.nodes[1];
    let version = node.state().version;
    for junk in [&b""[..], &b"\x00"[..], &[0xffu8; 64][..]] {
        assert!(node
            .protocol()
            .handle_datagram(junk, LinkId(0), Instant::now())
            .is_err());
    }
    assert_eq!(node.state().version, version);
}
