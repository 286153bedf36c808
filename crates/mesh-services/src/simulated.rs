//! In-process WiFi platform with no radio behind it.
//!
//! Used by tests and by `meshd` when `wifi.platform = "simulated"`. Delays
//! and failures are configurable at runtime; every call is counted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use mesh_core::HotspotConfig;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;

use crate::platform::{
    HotspotCredentials, HotspotRequest, PlatformError, PlatformEvent, WifiPlatform,
};

/// How the simulated radio behaves. Change it with [`SimulatedPlatform::update`].
#[derive(Debug, Clone)]
pub struct SimulatedBehavior {
    pub start_delay: Duration,
    pub stop_delay: Duration,
    pub connect_delay: Duration,
    pub disconnect_delay: Duration,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub fail_connect: bool,
    /// Probe answer. `None` makes the probe itself fail.
    pub concurrency: Option<bool>,
}

impl Default for SimulatedBehavior {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(5),
            stop_delay: Duration::from_millis(1),
            connect_delay: Duration::from_millis(5),
            disconnect_delay: Duration::ZERO,
            fail_start: false,
            fail_stop: false,
            fail_connect: false,
            concurrency: Some(false),
        }
    }
}

#[derive(Default)]
struct Calls {
    start: AtomicUsize,
    stop: AtomicUsize,
    connect: AtomicUsize,
    disconnect: AtomicUsize,
    probe: AtomicUsize,
}

pub struct SimulatedPlatform {
    behavior: Mutex<SimulatedBehavior>,
    calls: Calls,
    /// Successful radio operations, in the order they completed.
    history: Mutex<Vec<&'static str>>,
    events_tx: mpsc::UnboundedSender<PlatformEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PlatformEvent>>>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::with_behavior(SimulatedBehavior::default())
    }

    pub fn with_behavior(behavior: SimulatedBehavior) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            behavior: Mutex::new(behavior),
            calls: Calls::default(),
            history: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut SimulatedBehavior)) {
        f(&mut self.behavior.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn behavior(&self) -> SimulatedBehavior {
        self.behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Inject a spontaneous platform event.
    pub fn emit(&self, event: PlatformEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn start_calls(&self) -> usize {
        self.calls.start.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.calls.stop.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.calls.connect.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.calls.disconnect.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.calls.probe.load(Ordering::SeqCst)
    }

    /// Completed operations: `start`, `stop`, `connect`, `disconnect`.
    pub fn history(&self) -> Vec<&'static str> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn completed(&self, op: &'static str) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }
}

fn random_credentials(request: HotspotRequest) -> HotspotCredentials {
    let mut rng = rand::thread_rng();
    let tag: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    let passphrase: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let mut mac: [u8; 6] = rng.gen();
    // Locally administered, unicast.
    mac[0] = (mac[0] & 0xfc) | 0x02;
    let bssid = mac
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":");
    HotspotCredentials {
        ssid: format!("DIRECT-{tag}-mesh"),
        passphrase,
        bssid,
        band: request.band,
    }
}

impl WifiPlatform for SimulatedPlatform {
    fn start_hotspot(
        &self,
        request: HotspotRequest,
    ) -> BoxFuture<'_, Result<HotspotCredentials, PlatformError>> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior();
        Box::pin(async move {
            tokio::time::sleep(behavior.start_delay).await;
            if behavior.fail_start {
                return Err(PlatformError::Refused("simulated start failure".into()));
            }
            self.completed("start");
            Ok(random_credentials(request))
        })
    }

    fn stop_hotspot(&self) -> BoxFuture<'_, Result<(), PlatformError>> {
        self.calls.stop.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior();
        Box::pin(async move {
            tokio::time::sleep(behavior.stop_delay).await;
            if behavior.fail_stop {
                return Err(PlatformError::CommandFailed("simulated stop failure".into()));
            }
            self.completed("stop");
            Ok(())
        })
    }

    fn connect_station(&self, config: HotspotConfig) -> BoxFuture<'_, Result<(), PlatformError>> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior();
        Box::pin(async move {
            tokio::time::sleep(behavior.connect_delay).await;
            if behavior.fail_connect {
                return Err(PlatformError::Refused(format!(
                    "simulated association failure with {}",
                    config.ssid
                )));
            }
            self.completed("connect");
            Ok(())
        })
    }

    fn disconnect_station(&self) -> BoxFuture<'_, Result<(), PlatformError>> {
        self.calls.disconnect.fetch_add(1, Ordering::SeqCst);
        let delay = self.behavior().disconnect_delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.completed("disconnect");
            Ok(())
        })
    }

    fn supports_sta_ap_concurrency(&self) -> BoxFuture<'_, Result<bool, PlatformError>> {
        self.calls.probe.fetch_add(1, Ordering::SeqCst);
        let answer = self.behavior().concurrency;
        Box::pin(async move {
            answer.ok_or(PlatformError::Unsupported("simulated probe failure"))
        })
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PlatformEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
