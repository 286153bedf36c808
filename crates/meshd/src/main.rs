//! meshd: virtual mesh node daemon.
//!
//! Usage: `meshd [interface...]`. Interfaces given on the command line
//! replace `network.interfaces` from config; with neither, the configured
//! AP and STA interfaces are used.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use mesh_core::config::MeshConfig;
use mesh_services::VirtualNode;

mod originator;
mod platform;

use originator::{broadcast, listener, Links};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshConfig::default()
    });

    let mut interfaces: Vec<String> = std::env::args().skip(1).collect();
    if interfaces.is_empty() {
        interfaces = config.network.interfaces.clone();
    }
    if interfaces.is_empty() {
        interfaces = vec![
            config.wifi.ap_interface.clone(),
            config.wifi.sta_interface.clone(),
        ];
        interfaces.dedup();
    }
    tracing::info!(?interfaces, platform = ?config.wifi.platform, "meshd starting");

    // Node
    let platform = platform::from_config(&config.wifi);
    let node = VirtualNode::new(&config, platform).context("failed to set up virtual node")?;
    let protocol = node.protocol().clone();

    // Links and socket
    let links = Arc::new(Links::resolve(&interfaces, config.network.mesh_port)?);
    let socket = Arc::new(
        links
            .bind()
            .context("failed to bind mesh socket")?,
    );
    tracing::info!(
        addr = %node.addr(),
        port = config.network.mesh_port,
        "mesh socket ready"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let broadcast_task = tokio::spawn(broadcast::broadcast_loop(
        protocol.clone(),
        socket.clone(),
        links.clone(),
        config.protocol.originator_interval(),
    ));

    let listener_task = tokio::spawn(listener::listener_loop(
        protocol.clone(),
        socket.clone(),
        links.clone(),
    ));

    let sweep_task = tokio::spawn(listener::sweep_loop(
        protocol.clone(),
        config.protocol.sweep_interval(),
    ));

    let probe_task = tokio::spawn(broadcast::probe_loop(
        protocol.clone(),
        socket,
        links,
        config.protocol.probe_interval(),
    ));

    let _events_task = tokio::spawn(node.wifi().clone().run_platform_events());

    // Capability probe up front so the gate is not stuck on "unknown".
    {
        let node = node.clone();
        tokio::spawn(async move {
            let support = node.probe_concurrency().await;
            tracing::info!(?support, "initial concurrency probe");
        });
    }

    let state_printer = {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let state = node.state();
                tracing::info!(
                    nodes = state.originators.len(),
                    hotspot = ?state.hotspot.status,
                    station = ?state.station.status,
                    version = state.version,
                    "node state snapshot"
                );
                for addr in state.nodes_on_mesh() {
                    if let Some(entry) = state.originators.get(&addr) {
                        tracing::debug!(
                            %addr,
                            hops = entry.hop_count,
                            latency_ms = entry.latency_ms,
                            via = %entry.last_hop,
                            "  route"
                        );
                    }
                }
            }
        })
    };

    // HTTP API
    let api_port = config.network.api_port;
    let _api_server = {
        let state = mesh_api::ApiState {
            node: node.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = mesh_api::serve(state, api_port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = broadcast_task      => tracing::error!("broadcast task exited: {:?}", r),
        r = listener_task       => tracing::error!("listener task exited: {:?}", r),
        r = sweep_task          => tracing::error!("sweep task exited: {:?}", r),
        r = probe_task          => tracing::error!("probe task exited: {:?}", r),
        r = state_printer       => tracing::error!("state printer exited: {:?}", r),
    }

    // Leave the radio the way we found it.
    if let Err(e) = node.disconnect_station().await {
        tracing::warn!(error = %e, "station teardown failed");
    }
    if let Err(e) = node.set_hotspot_enabled(false).await {
        tracing::warn!(error = %e, "hotspot teardown failed");
    }

    Ok(())
}
