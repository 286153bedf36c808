//! Node state, route table, connect link and shutdown commands.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StateResponse {
    addr: String,
    display_name: String,
    version: u64,
    hotspot: HotspotInfo,
    station: StationInfo,
    concurrency: String,
    nodes: BTreeMap<String, NodeInfo>,
}

#[derive(Deserialize)]
struct HotspotInfo {
    enabled: bool,
    status: String,
    config: Option<HotspotConfig>,
}

#[derive(Deserialize)]
struct HotspotConfig {
    ssid: String,
    bssid: String,
    port: u16,
    band: String,
}

#[derive(Deserialize)]
struct StationInfo {
    status: String,
    config: Option<StationTarget>,
    failure: Option<String>,
}

#[derive(Deserialize)]
struct StationTarget {
    ssid: String,
    addr: String,
}

#[derive(Deserialize)]
struct NodesResponse {
    nodes: BTreeMap<String, NodeInfo>,
}

#[derive(Deserialize)]
struct NodeInfo {
    hop_count: u8,
    latency_ms: u32,
    sequence: u32,
    last_hop: String,
    link: u32,
    age_ms: u64,
}

#[derive(Deserialize)]
struct LinkResponse {
    link: Option<String>,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StateResponse = get_json(&format!("{}/state", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Mesh Node {}", resp.display_name);
    println!("═══════════════════════════════════════");
    println!("  Address      : {}", resp.addr);
    println!("  Version      : {}", resp.version);
    println!("  Concurrency  : {}", resp.concurrency);

    let icon = if resp.hotspot.enabled { "✓" } else { "○" };
    println!("  Hotspot      : {} {}", icon, resp.hotspot.status);
    if let Some(cfg) = &resp.hotspot.config {
        println!("  │  ssid  : {}", cfg.ssid);
        println!("  │  bssid : {}", cfg.bssid);
        println!("  └─ port  : {} ({})", cfg.port, cfg.band);
    }

    println!("  Station      : {}", resp.station.status);
    if let Some(target) = &resp.station.config {
        println!("  │  target : {} ({})", target.addr, target.ssid);
    }
    if let Some(reason) = &resp.station.failure {
        println!("  └─ failure: {}", reason);
    }

    println!("  Nodes on mesh: {}", resp.nodes.len());
    print_nodes(&resp.nodes);

    Ok(())
}

pub async fn cmd_nodes(port: u16) -> Result<()> {
    let resp: NodesResponse = get_json(&format!("{}/nodes", base_url(port))).await?;

    if resp.nodes.is_empty() {
        println!("No other nodes on the mesh yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Nodes on mesh ({})", resp.nodes.len());
    println!("═══════════════════════════════════════");
    print_nodes(&resp.nodes);

    Ok(())
}

fn print_nodes(nodes: &BTreeMap<String, NodeInfo>) {
    for (addr, n) in nodes {
        println!("  ┌─ {}", addr);
        println!("  │  hops     : {}", n.hop_count);
        println!("  │  latency  : {} ms", n.latency_ms);
        println!("  │  via      : {} (link {})", n.last_hop, n.link);
        println!("  │  sequence : {}", n.sequence);
        println!("  └─ age      : {:.1}s", n.age_ms as f64 / 1000.0);
    }
}

pub async fn cmd_link(port: u16) -> Result<()> {
    let resp: LinkResponse = get_json(&format!("{}/link", base_url(port))).await?;
    match resp.link {
        Some(link) => println!("{}", link),
        None => println!("Hotspot is off; no connect link available."),
    }
    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse =
        post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
