//! /hotspot, /connect, /station/disconnect, /concurrency/probe handlers.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use mesh_core::HotspotConfig;
use mesh_services::{ConcurrencySupport, MeshError, StationStatus};

use super::{api_error, ApiError, ApiState};

// ── /hotspot (POST) ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct HotspotRequest {
    pub enabled: bool,
}

#[derive(Serialize)]
pub struct HotspotResponse {
    pub enabled: bool,
    pub link: Option<String>,
}

pub async fn handle_hotspot(
    State(state): State<ApiState>,
    Json(req): Json<HotspotRequest>,
) -> Result<Json<HotspotResponse>, ApiError> {
    state
        .node
        .set_hotspot_enabled(req.enabled)
        .await
        .map_err(api_error)?;

    Ok(Json(HotspotResponse {
        enabled: state.node.state().hotspot_enabled(),
        link: state.node.current_link().map(|l| l.uri().to_string()),
    }))
}

// ── /connect (POST) ───────────────────────────────────────────────────────────

/// Either a connect link or an already-decoded config.
#[derive(Deserialize)]
pub struct ConnectRequest {
    pub link: Option<String>,
    pub config: Option<HotspotConfig>,
}

#[derive(Serialize)]
pub struct ConnectResponse {
    pub connected: String,
    pub ssid: String,
}

pub async fn handle_connect(
    State(state): State<ApiState>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let config = match (req.link, req.config) {
        (Some(link), _) => mesh_core::ConnectLink::parse(&link)
            .map_err(|e| api_error(e.into()))?
            .into_config(),
        (None, Some(config)) => {
            config.validate().map_err(|e| api_error(e.into()))?;
            config
        }
        (None, None) => {
            return Err(api_error(MeshError::MalformedLink(
                "expected \"link\" or \"config\"".into(),
            )))
        }
    };

    let target = config.addr;
    let ssid = config.ssid.clone();
    tracing::info!(%target, %ssid, "connect requested via API");
    state.node.connect(config).await.map_err(api_error)?;

    Ok(Json(ConnectResponse {
        connected: target.to_string(),
        ssid,
    }))
}

// ── /station/disconnect (POST) ────────────────────────────────────────────────

#[derive(Serialize)]
pub struct DisconnectResponse {
    pub status: StationStatus,
}

pub async fn handle_disconnect(
    State(state): State<ApiState>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    state.node.disconnect_station().await.map_err(api_error)?;
    Ok(Json(DisconnectResponse {
        status: state.node.state().station.status,
    }))
}

// ── /concurrency/probe (POST) ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ProbeResponse {
    pub concurrency: ConcurrencySupport,
}

pub async fn handle_probe(State(state): State<ApiState>) -> Json<ProbeResponse> {
    Json(ProbeResponse {
        concurrency: state.node.probe_concurrency().await,
    })
}
