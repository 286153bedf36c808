//! Configuration system for the mesh node.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mesh/config.toml
//!   3. ~/.config/mesh/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::link::ConnectBand;
use crate::wire::{DEFAULT_MESH_PORT, MAX_HOPS};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub wifi: WifiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable name shown to other users. Empty = host name.
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interfaces the mesh runs over. Each one is a physical link.
    pub interfaces: Vec<String>,
    /// UDP port for mesh frames; also advertised in connect links.
    pub mesh_port: u16,
    /// Localhost port for the HTTP API.
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How often this node advertises itself.
    pub originator_interval_ms: u64,
    /// Table entries not refreshed within this window are evicted.
    pub stale_threshold_ms: u64,
    /// How often the eviction sweep runs.
    pub sweep_interval_ms: u64,
    /// Hop count ceiling; at most [`MAX_HOPS`].
    pub max_hops: u8,
    /// How often neighbours are probed for link latency.
    pub probe_interval_ms: u64,
}

/// Which platform adapter drives the radio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// NetworkManager via the `nmcli` command.
    #[default]
    Nmcli,
    /// In-process simulation, no radio involved.
    Simulated,
}

/// How the hotspot is brought up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotspotType {
    /// Let the platform pick.
    #[default]
    Auto,
    /// Local-only access point with platform-generated credentials.
    LocalOnly,
    /// WiFi Direct group owner.
    WifiDirect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub platform: PlatformKind,
    pub hotspot_start_timeout_ms: u64,
    pub station_connect_timeout_ms: u64,
    pub band: ConnectBand,
    pub hotspot_type: HotspotType,
    /// Interface that hosts the access point.
    pub ap_interface: String,
    /// Interface used to join other nodes' hotspots.
    pub sta_interface: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            mesh_port: DEFAULT_MESH_PORT,
            api_port: 9101,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            originator_interval_ms: 3_000,
            stale_threshold_ms: 15_000,
            sweep_interval_ms: 1_000,
            max_hops: MAX_HOPS,
            probe_interval_ms: 5_000,
        }
    }
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            platform: PlatformKind::default(),
            hotspot_start_timeout_ms: 15_000,
            station_connect_timeout_ms: 30_000,
            band: ConnectBand::default(),
            hotspot_type: HotspotType::default(),
            ap_interface: "wlan0".to_string(),
            sta_interface: "wlan1".to_string(),
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

/// Zero would make `tokio::time::interval` panic; the floor is 1 ms.
fn millis_at_least_one(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

impl ProtocolConfig {
    pub fn originator_interval(&self) -> Duration {
        millis_at_least_one(self.originator_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        millis_at_least_one(self.stale_threshold_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        millis_at_least_one(self.sweep_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        millis_at_least_one(self.probe_interval_ms)
    }

    /// Configured ceiling, clamped to what the wire format allows.
    pub fn effective_max_hops(&self) -> u8 {
        self.max_hops.clamp(1, MAX_HOPS)
    }
}

impl WifiConfig {
    pub fn hotspot_start_timeout(&self) -> Duration {
        millis_at_least_one(self.hotspot_start_timeout_ms)
    }

    pub fn station_connect_timeout(&self) -> Duration {
        millis_at_least_one(self.station_connect_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("mesh")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MESH_NODE__DISPLAY_NAME") {
            self.node.display_name = v;
        }
        if let Ok(v) = std::env::var("MESH_NETWORK__MESH_PORT") {
            if let Ok(p) = v.parse() {
                self.network.mesh_port = p;
            }
        }
        if let Ok(v) = std::env::var("MESH_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
        if let Ok(v) = std::env::var("MESH_NETWORK__INTERFACES") {
            self.network.interfaces = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("MESH_WIFI__PLATFORM") {
            match v.to_ascii_lowercase().as_str() {
                "nmcli" => self.wifi.platform = PlatformKind::Nmcli,
                "simulated" => self.wifi.platform = PlatformKind::Simulated,
                _ => {}
            }
        }
    }
}
