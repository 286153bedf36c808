//! Platform adapters that drive a real radio.

pub mod nmcli;

use std::sync::Arc;

use mesh_core::config::{PlatformKind, WifiConfig};
use mesh_services::{SimulatedPlatform, WifiPlatform};

/// Build the adapter selected in config.
pub fn from_config(config: &WifiConfig) -> Arc<dyn WifiPlatform> {
    match config.platform {
        PlatformKind::Nmcli => Arc::new(nmcli::NmcliPlatform::new(config)),
        PlatformKind::Simulated => {
            tracing::warn!("using simulated WiFi platform, no radio will be touched");
            Arc::new(SimulatedPlatform::new())
        }
    }
}
