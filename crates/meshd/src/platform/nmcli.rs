//! NetworkManager adapter.
//!
//! Hotspot and station roles are driven through `nmcli`; STA/AP concurrency
//! is read from the interface combinations `iw list` reports. Link loss is
//! picked up from `nmcli device monitor`.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use mesh_core::config::{HotspotType, WifiConfig};
use mesh_core::{ConnectBand, HotspotConfig};
use mesh_services::{
    HotspotCredentials, HotspotRequest, PlatformError, PlatformEvent, WifiPlatform,
};

const HOTSPOT_CONNECTION: &str = "mesh-hotspot";
const STATION_CONNECTION: &str = "mesh-station";

pub struct NmcliPlatform {
    ap_interface: String,
    sta_interface: String,
    events_taken: AtomicBool,
}

impl NmcliPlatform {
    pub fn new(config: &WifiConfig) -> Self {
        Self {
            ap_interface: config.ap_interface.clone(),
            sta_interface: config.sta_interface.clone(),
            events_taken: AtomicBool::new(false),
        }
    }
}

/// Run a command and return its stdout. `what` names it in logs and errors
/// so secrets in the arguments never get printed.
async fn run(program: &str, args: &[&str], what: &str) -> Result<String, PlatformError> {
    tracing::debug!(program, what, "running platform command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| PlatformError::CommandFailed(format!("{program}: {e}")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PlatformError::Refused(format!("{what}: {}", stderr.trim())))
    }
}

fn nmcli_band(band: ConnectBand) -> &'static str {
    match band {
        ConnectBand::Band2Ghz => "bg",
        ConnectBand::Band5Ghz => "a",
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `nmcli -g` escapes the colons in a MAC address.
fn parse_hwaddr(output: &str) -> Option<String> {
    let mac = output.trim().replace('\\', "").to_ascii_lowercase();
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    valid.then_some(mac)
}

/// Interface combinations from `iw list`, one string each. A combination
/// may wrap onto continuation lines.
fn combinations(iw_list: &str) -> Vec<String> {
    let mut combos: Vec<String> = Vec::new();
    let mut in_section = false;
    for line in iw_list.lines().map(str::trim) {
        if line.starts_with("valid interface combinations") {
            in_section = true;
        } else if !in_section {
            continue;
        } else if let Some(rest) = line.strip_prefix('*') {
            combos.push(rest.trim().to_string());
        } else if line.contains("<=") {
            if let Some(last) = combos.last_mut() {
                last.push(' ');
                last.push_str(line);
            }
        } else {
            in_section = false;
        }
    }
    combos
}

/// Does any valid interface combination allow a managed (station) and an
/// AP interface at the same time?
fn combinations_allow_sta_ap(iw_list: &str) -> bool {
    combinations(iw_list).iter().any(|combo| {
        let tokens: Vec<&str> = combo
            .split(|c: char| c.is_whitespace() || ",{}#<=".contains(c))
            .filter(|t| !t.is_empty())
            .collect();
        let total = combo
            .split("total <=")
            .nth(1)
            .and_then(|rest| rest.trim().split(|c: char| !c.is_ascii_digit()).next())
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0);
        tokens.contains(&"managed") && tokens.contains(&"AP") && total >= 2
    })
}

/// Map one `nmcli device monitor` line to an event.
fn monitor_event(line: &str, ap_interface: &str, sta_interface: &str) -> Option<PlatformEvent> {
    let (device, state) = line.split_once(':')?;
    let state = state.trim();
    if !(state.starts_with("disconnected") || state.starts_with("unavailable")) {
        return None;
    }
    let reason = format!("{} {}", device.trim(), state);
    match device.trim() {
        d if d == sta_interface => Some(PlatformEvent::StationLost { reason }),
        d if d == ap_interface => Some(PlatformEvent::HotspotLost { reason }),
        _ => None,
    }
}

impl WifiPlatform for NmcliPlatform {
    fn start_hotspot(
        &self,
        request: HotspotRequest,
    ) -> BoxFuture<'_, Result<HotspotCredentials, PlatformError>> {
        Box::pin(async move {
            if request.hotspot_type == HotspotType::WifiDirect {
                return Err(PlatformError::Unsupported(
                    "WiFi Direct group owner is not available through nmcli",
                ));
            }
            let ssid = format!("DIRECT-{}-mesh", random_token(4));
            let passphrase = random_token(16);
            run(
                "nmcli",
                &[
                    "device",
                    "wifi",
                    "hotspot",
                    "ifname",
                    self.ap_interface.as_str(),
                    "con-name",
                    HOTSPOT_CONNECTION,
                    "ssid",
                    ssid.as_str(),
                    "band",
                    nmcli_band(request.band),
                    "password",
                    passphrase.as_str(),
                ],
                "nmcli device wifi hotspot",
            )
            .await?;

            let hwaddr = run(
                "nmcli",
                &["-g", "GENERAL.HWADDR", "device", "show", self.ap_interface.as_str()],
                "nmcli device show",
            )
            .await?;
            let bssid = parse_hwaddr(&hwaddr).ok_or_else(|| {
                PlatformError::CommandFailed(format!("unreadable hardware address {hwaddr:?}"))
            })?;

            Ok(HotspotCredentials {
                ssid,
                passphrase,
                bssid,
                band: request.band,
            })
        })
    }

    fn stop_hotspot(&self) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            run(
                "nmcli",
                &["connection", "down", HOTSPOT_CONNECTION],
                "nmcli connection down",
            )
            .await
            .map(|_| ())
        })
    }

    fn connect_station(&self, config: HotspotConfig) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            run(
                "nmcli",
                &[
                    "device",
                    "wifi",
                    "connect",
                    config.ssid.as_str(),
                    "password",
                    config.passphrase.as_str(),
                    "bssid",
                    config.bssid.as_str(),
                    "ifname",
                    self.sta_interface.as_str(),
                    "name",
                    STATION_CONNECTION,
                ],
                "nmcli device wifi connect",
            )
            .await
            .map(|_| ())
        })
    }

    fn disconnect_station(&self) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            run(
                "nmcli",
                &["device", "disconnect", self.sta_interface.as_str()],
                "nmcli device disconnect",
            )
            .await
            .map(|_| ())
        })
    }

    fn supports_sta_ap_concurrency(&self) -> BoxFuture<'_, Result<bool, PlatformError>> {
        Box::pin(async move {
            let text = run("iw", &["list"], "iw list").await?;
            Ok(combinations_allow_sta_ap(&text))
        })
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PlatformEvent>> {
        if self.events_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let mut child = Command::new("nmcli")
            .args(["device", "monitor", self.ap_interface.as_str(), self.sta_interface.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| tracing::warn!(error = %e, "nmcli monitor unavailable"))
            .ok()?;
        let stdout = child.stdout.take()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let ap = self.ap_interface.clone();
        let sta = self.sta_interface.clone();
        runtime.spawn(async move {
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = monitor_event(&line, &ap, &sta) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            tracing::debug!("nmcli monitor ended");
        });
        Some(rx)
    }
}
