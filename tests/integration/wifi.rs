use std::sync::Arc;
use std::time::Instant;

use mesh_core::config::MeshConfig;
use mesh_services::{
    ApStatus, ConcurrencySupport, MeshError, SimulatedPlatform, StationStatus, VirtualNode,
};

use crate::*;

fn pair() -> (VirtualNode, VirtualNode, Arc<SimulatedPlatform>) {
    let config = MeshConfig::default();
    let a = VirtualNode::new(&config, Arc::new(SimulatedPlatform::new())).expect("a");
    let b_platform = Arc::new(SimulatedPlatform::new());
    let b = VirtualNode::new(&config, b_platform.clone()).expect("b");
    (a, b, b_platform)
}

/// A's hotspot link lets B join it.
#[tokio::test]
async fn test_connect_link_round_trip() {
    let (a, b, _) = pair();
    a.set_hotspot_enabled(true).await.unwrap();
    let link = a.current_link().expect("link while hotspot is on");

    b.connect_by_link(link.uri()).await.unwrap();

    let station = b.state().station.clone();
    assert_eq!(station.status, StationStatus::Connected);
    let target = station.config.expect("connected config");
    assert_eq!(target.addr, a.addr());
    assert_eq!(&target, link.config());
}

/// Concurrent connects to one target share a single platform call.
#[tokio::test]
async fn test_concurrent_connects_coalesce() {
    let (a, b, platform) = pair();
    a.set_hotspot_enabled(true).await.unwrap();
    let uri = a.current_link().unwrap().uri().to_string();

    let results = futures::future::join_all((0..4).map(|_| b.connect_by_link(&uri))).await;
    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert_eq!(platform.connect_calls(), 1);

    let err = b.connect_by_link(&uri).await.unwrap_err();
    assert_eq!(err, MeshError::AlreadyConnected(a.addr()));
}

/// Joining a node the route table already reaches is refused.
#[tokio::test]
async fn test_connect_to_mesh_member_refused() {
    let mesh = Mesh::line(2);
    mesh.round(Instant::now());

    let a = &mesh.nodes[0];
    a.set_hotspot_enabled(true).await.unwrap();
    let uri = a.current_link().unwrap().uri().to_string();

    let err = mesh.nodes[1].connect_by_link(&uri).await.unwrap_err();
    assert_eq!(err.kind(), "AlreadyConnected");
    assert_eq!(mesh.platforms[1].connect_calls(), 0);
}

/// Double enable starts the hotspot once; disable clears the link.
#[tokio::test]
async fn test_hotspot_double_enable() {
    let platform = Arc::new(SimulatedPlatform::new());
    let node = VirtualNode::new(&MeshConfig::default(), platform.clone()).unwrap();

    let (r1, r2) = tokio::join!(
        node.set_hotspot_enabled(true),
        node.set_hotspot_enabled(true)
    );
    r1.unwrap();
    r2.unwrap();
    assert_eq!(platform.start_calls(), 1);
    assert_eq!(node.state().hotspot.status, ApStatus::On);

    node.set_hotspot_enabled(false).await.unwrap();
    node.set_hotspot_enabled(false).await.unwrap();
    assert_eq!(platform.stop_calls(), 1);
    assert!(node.current_link().is_none());
}

/// Without concurrency support one role blocks the other, until a probe
/// says both can run.
#[tokio::test]
async fn test_capability_gate() {
    let (a, b, platform) = pair();
    a.set_hotspot_enabled(true).await.unwrap();
    let uri = a.current_link().unwrap().uri().to_string();

    b.set_hotspot_enabled(true).await.unwrap();
    let version = b.state().version;
    let err = b.connect_by_link(&uri).await.unwrap_err();
    assert_eq!(err.kind(), "ConcurrencyUnsupported");
    assert_eq!(b.state().version, version);
    assert_eq!(b.state().station.status, StationStatus::Inactive);

    platform.update(|behavior| behavior.concurrency = Some(true));
    assert_eq!(b.probe_concurrency().await, ConcurrencySupport::Supported);

    b.connect_by_link(&uri).await.unwrap();
    let state = b.state();
    assert_eq!(state.hotspot.status, ApStatus::On);
    assert_eq!(state.station.status, StationStatus::Connected);
}

/// A failed association is visible in state and cleared by disconnect.
#[tokio::test]
async fn test_connect_failure_then_disconnect() {
    let (a, b, platform) = pair();
    a.set_hotspot_enabled(true).await.unwrap();
    let uri = a.current_link().unwrap().uri().to_string();

    platform.update(|behavior| behavior.fail_connect = true);
    let err = b.connect_by_link(&uri).await.unwrap_err();
    assert_eq!(err.kind(), "StationConnectFailed");
    let station = b.state().station.clone();
    assert_eq!(station.status, StationStatus::Failed);
    assert!(station.failure.is_some());

    b.disconnect_station().await.unwrap();
    assert_eq!(b.state().station.status, StationStatus::Inactive);
}
