//! Errors surfaced by node operations.
//!
//! Decode and address errors come back synchronously and never touch node
//! state. Role-transition failures come back through the same future that
//! would have carried success, after the state machine has landed in a
//! stable state. Protocol anomalies are not errors at all: they are dropped
//! and logged at trace level.

use mesh_core::{AddressError, LinkError, VirtualAddr};

/// Errors that can occur in node operations.
///
/// `Clone` so a single transition outcome can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    #[error("invalid virtual address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("malformed connect link: {0}")]
    MalformedLink(String),

    #[error("connect link has no usable hotspot configuration")]
    LinkDecodeTargetMissing,

    #[error("{0} is already connected")]
    AlreadyConnected(VirtualAddr),

    /// The capability gate refused a role transition.
    #[error("STA/AP concurrency not available: {0}")]
    ConcurrencyUnsupported(&'static str),

    #[error("hotspot start failed: {0}")]
    HotspotStartFailed(String),

    #[error("hotspot stop failed: {0}")]
    HotspotStopFailed(String),

    #[error("station connect failed: {0}")]
    StationConnectFailed(String),
}

impl From<LinkError> for MeshError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Malformed(reason) => MeshError::MalformedLink(reason),
            LinkError::TargetMissing => MeshError::LinkDecodeTargetMissing,
        }
    }
}

impl MeshError {
    /// Stable machine-readable name, used by the HTTP API.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::InvalidAddress(_) => "InvalidAddress",
            MeshError::MalformedLink(_) => "MalformedLink",
            MeshError::LinkDecodeTargetMissing => "LinkDecodeTargetMissing",
            MeshError::AlreadyConnected(_) => "AlreadyConnected",
            MeshError::ConcurrencyUnsupported(_) => "ConcurrencyUnsupported",
            MeshError::HotspotStartFailed(_) => "HotspotStartFailed",
            MeshError::HotspotStopFailed(_) => "HotspotStopFailed",
            MeshError::StationConnectFailed(_) => "StationConnectFailed",
        }
    }
}

/// Result type for node operations.
pub type MeshResult<T> = Result<T, MeshError>;
