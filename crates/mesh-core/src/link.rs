//! Connect links: shareable descriptors for joining a node's hotspot.
//!
//! A connect link is a URI short enough for a QR code or a pasted message:
//!
//!   meshrabiya://connect/?ssid=MeshNet&passphrase=abc123&bssid=AA:BB:CC:DD:EE:FF&port=8080&addr=10.0.0.5&band=2ghz
//!
//! Links are always derived from a [`HotspotConfig`] and never stored.
//! Decoding is pure: it validates the link and returns the config, it does
//! not attempt to join anything.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::address::{self, VirtualAddr};

/// URI scheme every connect link carries.
pub const LINK_SCHEME: &str = "meshrabiya";

/// Host component written by [`encode`]. Ignored when decoding.
const LINK_HOST: &str = "connect";

// ── HotspotConfig ─────────────────────────────────────────────────────────────

/// Radio band a hotspot operates on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectBand {
    #[default]
    #[serde(rename = "2ghz")]
    Band2Ghz,
    #[serde(rename = "5ghz")]
    Band5Ghz,
}

impl ConnectBand {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectBand::Band2Ghz => "2ghz",
            ConnectBand::Band5Ghz => "5ghz",
        }
    }
}

impl FromStr for ConnectBand {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "2ghz" => Ok(ConnectBand::Band2Ghz),
            "5ghz" => Ok(ConnectBand::Band5Ghz),
            other => Err(LinkError::Malformed(format!("unknown band {other:?}"))),
        }
    }
}

/// Everything a station needs to join a hotspot and reach the node behind it.
///
/// Created when the local node's AP role comes up; invalid as soon as the
/// AP goes down or the node restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HotspotConfig {
    pub ssid: String,
    pub passphrase: String,
    /// Access point MAC, six colon-separated hex octets.
    pub bssid: String,
    /// UDP port the advertising node's mesh traffic runs on.
    pub port: u16,
    /// Virtual address of the advertising node.
    pub addr: VirtualAddr,
    #[serde(default)]
    pub band: ConnectBand,
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encode a hotspot config as a connect-link URI. All values are
/// percent-escaped by the query serializer.
pub fn encode(config: &HotspotConfig) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("ssid", &config.ssid)
        .append_pair("passphrase", &config.passphrase)
        .append_pair("bssid", &config.bssid)
        .append_pair("port", &config.port.to_string())
        .append_pair("addr", &config.addr.to_string())
        .append_pair("band", config.band.as_str())
        .finish();
    format!("{LINK_SCHEME}://{LINK_HOST}/?{query}")
}

/// Decode a connect-link URI.
///
/// Fails with [`LinkError::Malformed`] on a wrong scheme, a missing required
/// parameter, a bad port, a bad BSSID, or an invalid virtual address.
/// A link that parses but names no network (empty SSID) fails with
/// [`LinkError::TargetMissing`].
pub fn decode(uri: &str) -> Result<HotspotConfig, LinkError> {
    let url = Url::parse(uri.trim()).map_err(|e| LinkError::Malformed(e.to_string()))?;
    if url.scheme() != LINK_SCHEME {
        return Err(LinkError::Malformed(format!(
            "expected scheme {LINK_SCHEME:?}, got {:?}",
            url.scheme()
        )));
    }

    // First occurrence of a key wins.
    let mut params: HashMap<String, String> = HashMap::new();
    for (key, value) in url.query_pairs() {
        params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    let mut take = |key: &str| {
        params
            .remove(key)
            .ok_or_else(|| LinkError::Malformed(format!("missing parameter {key:?}")))
    };

    let ssid = take("ssid")?;
    let passphrase = take("passphrase")?;
    let bssid = take("bssid")?;
    let port_text = take("port")?;
    let addr_text = take("addr")?;
    let band = match params.remove("band") {
        Some(b) => b.parse()?,
        None => ConnectBand::default(),
    };

    let port = text_port(&port_text)?;
    let addr = address::parse(&addr_text)
        .map_err(|e| LinkError::Malformed(format!("invalid addr: {e}")))?;

    let config = HotspotConfig {
        ssid,
        passphrase,
        bssid,
        port,
        addr,
        band,
    };
    config.validate()?;
    Ok(config)
}

fn text_port(text: &str) -> Result<u16, LinkError> {
    text.parse::<u16>().map_err(|_| {
        LinkError::Malformed(format!("port must be a number in 1-65535, got {text:?}"))
    })
}

impl HotspotConfig {
    /// Check the fields a link decode would check. Configs built by hand
    /// (API, tests) go through this before reaching a radio.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.port == 0 {
            return Err(LinkError::Malformed(
                "port must be a number in 1-65535, got 0".into(),
            ));
        }
        if !is_valid_bssid(&self.bssid) {
            return Err(LinkError::Malformed(format!("invalid bssid {:?}", self.bssid)));
        }
        address::validate(self.addr)
            .map_err(|e| LinkError::Malformed(format!("invalid addr: {e}")))?;
        if self.ssid.is_empty() {
            return Err(LinkError::TargetMissing);
        }
        Ok(())
    }
}

fn is_valid_bssid(bssid: &str) -> bool {
    let octets: Vec<&str> = bssid.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

// ── ConnectLink ───────────────────────────────────────────────────────────────

/// A hotspot config together with its encoded URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectLink {
    uri: String,
    config: HotspotConfig,
}

impl ConnectLink {
    pub fn from_config(config: HotspotConfig) -> Self {
        Self {
            uri: encode(&config),
            config,
        }
    }

    pub fn parse(uri: &str) -> Result<Self, LinkError> {
        let config = decode(uri)?;
        Ok(Self {
            uri: uri.trim().to_string(),
            config,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn config(&self) -> &HotspotConfig {
        &self.config
    }

    pub fn into_config(self) -> HotspotConfig {
        self.config
    }
}

impl fmt::Display for ConnectLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("malformed connect link: {0}")]
    Malformed(String),
    #[error("connect link carries no usable hotspot configuration")]
    TargetMissing,
}
