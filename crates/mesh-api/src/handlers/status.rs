//! /state, /nodes, /link, /daemon/shutdown handlers.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use mesh_core::HotspotConfig;
use mesh_services::{ApStatus, ConcurrencySupport, NodeState, WifiStationState};

use super::ApiState;

// ── /state ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StateResponse {
    pub addr: String,
    pub display_name: String,
    pub version: u64,
    pub hotspot: HotspotInfo,
    pub station: WifiStationState,
    pub concurrency: ConcurrencySupport,
    pub nodes: NodeTable,
}

#[derive(Serialize)]
pub struct HotspotInfo {
    pub enabled: bool,
    pub status: ApStatus,
    pub config: Option<HotspotConfig>,
}

/// Reachable nodes keyed by dotted-quad address.
pub type NodeTable = BTreeMap<String, NodeInfo>;

#[derive(Serialize)]
pub struct NodeInfo {
    pub hop_count: u8,
    pub latency_ms: u32,
    pub sequence: u32,
    pub last_hop: String,
    pub link: u32,
    pub age_ms: u64,
}

fn node_table(state: &NodeState) -> NodeTable {
    state
        .originators
        .values()
        .map(|m| {
            let info = NodeInfo {
                hop_count: m.hop_count,
                latency_ms: m.latency_ms,
                sequence: m.sequence,
                last_hop: m.last_hop.to_string(),
                link: m.link.0,
                age_ms: m.time_received.elapsed().as_millis() as u64,
            };
            (m.origin.to_string(), info)
        })
        .collect()
}

pub async fn handle_state(State(state): State<ApiState>) -> Json<StateResponse> {
    let snapshot = state.node.state();

    Json(StateResponse {
        addr: snapshot.identity.addr.to_string(),
        display_name: snapshot.identity.display_name.clone(),
        version: snapshot.version,
        hotspot: HotspotInfo {
            enabled: snapshot.hotspot_enabled(),
            status: snapshot.hotspot.status,
            config: snapshot.hotspot.config.clone(),
        },
        station: snapshot.station.clone(),
        concurrency: snapshot.concurrency,
        nodes: node_table(&snapshot),
    })
}

// ── /nodes ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct NodesResponse {
    pub nodes: NodeTable,
}

pub async fn handle_nodes(State(state): State<ApiState>) -> Json<NodesResponse> {
    Json(NodesResponse {
        nodes: node_table(&state.node.state()),
    })
}

// ── /link ─────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct LinkResponse {
    /// `None` while the hotspot is off.
    pub link: Option<String>,
}

pub async fn handle_link(State(state): State<ApiState>) -> Json<LinkResponse> {
    Json(LinkResponse {
        link: state.node.current_link().map(|l| l.uri().to_string()),
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        message: "shutting down".to_string(),
    })
}
