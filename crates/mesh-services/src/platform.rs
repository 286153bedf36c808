//! The WiFi platform seam.
//!
//! The role controller never touches a radio directly. Everything it needs
//! from the operating system goes through [`WifiPlatform`]: bring a hotspot
//! up or down, join or leave someone else's, and say whether both can run
//! at once. Implementations live with the binary (NetworkManager) or in
//! [`crate::simulated`] for tests and radio-less runs.

use futures::future::BoxFuture;
use mesh_core::config::HotspotType;
use mesh_core::{ConnectBand, HotspotConfig};
use tokio::sync::mpsc;

/// What the controller asks for when starting a hotspot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotspotRequest {
    pub band: ConnectBand,
    pub hotspot_type: HotspotType,
}

/// What the platform hands back once a hotspot is up. The controller adds
/// the mesh port and local virtual address to form a [`HotspotConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotspotCredentials {
    pub ssid: String,
    pub passphrase: String,
    pub bssid: String,
    pub band: ConnectBand,
}

/// Spontaneous changes reported by the platform, outside any command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// The station association dropped.
    StationLost { reason: String },
    /// The hotspot went down without being asked to.
    HotspotLost { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("platform refused: {0}")]
    Refused(String),
    #[error("platform command failed: {0}")]
    CommandFailed(String),
    #[error("not supported by this platform: {0}")]
    Unsupported(&'static str),
}

/// Platform primitives for the AP and STA roles.
///
/// Calls may take as long as the hardware needs; the controller bounds them
/// with its own timeouts and never issues two overlapping calls for the same
/// role.
pub trait WifiPlatform: Send + Sync {
    fn start_hotspot(
        &self,
        request: HotspotRequest,
    ) -> BoxFuture<'_, Result<HotspotCredentials, PlatformError>>;

    fn stop_hotspot(&self) -> BoxFuture<'_, Result<(), PlatformError>>;

    fn connect_station(&self, config: HotspotConfig) -> BoxFuture<'_, Result<(), PlatformError>>;

    fn disconnect_station(&self) -> BoxFuture<'_, Result<(), PlatformError>>;

    /// Can the AP and STA roles run simultaneously on this device?
    fn supports_sta_ap_concurrency(&self) -> BoxFuture<'_, Result<bool, PlatformError>>;

    /// Take the receiver for spontaneous platform events. Returns `None` if
    /// the platform has none or the receiver was already taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PlatformEvent>> {
        None
    }
}
