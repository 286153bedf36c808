//! HTTP API handlers. Exposes node state as JSON and accepts node commands.

pub mod status;
pub mod wifi;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use mesh_services::{MeshError, VirtualNode};

#[derive(Clone)]
pub struct ApiState {
    pub node: VirtualNode,
    /// Signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

fn status_for(e: &MeshError) -> StatusCode {
    match e {
        MeshError::InvalidAddress(_)
        | MeshError::MalformedLink(_)
        | MeshError::LinkDecodeTargetMissing => StatusCode::BAD_REQUEST,
        MeshError::AlreadyConnected(_) | MeshError::ConcurrencyUnsupported(_) => {
            StatusCode::CONFLICT
        }
        MeshError::HotspotStartFailed(_)
        | MeshError::HotspotStopFailed(_)
        | MeshError::StationConnectFailed(_) => StatusCode::BAD_GATEWAY,
    }
}

fn api_error(e: MeshError) -> ApiError {
    (
        status_for(&e),
        Json(ErrorBody {
            error: e.to_string(),
            kind: e.kind(),
        }),
    )
}

// Re-export handler functions for use in router setup.
pub use status::{handle_link, handle_nodes, handle_shutdown, handle_state};
pub use wifi::{handle_connect, handle_disconnect, handle_hotspot, handle_probe};
