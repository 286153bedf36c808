//! WiFi role controller.
//!
//! Two state machines, one per radio role:
//!
//! ```text
//! AP:  Off ──► Starting ──► On(config) ──► Stopping ──► Off
//!               │  fail/timeout ▲            │ fail
//!               └──────► Off    └────────────┘
//!
//! STA: Inactive ──► Connecting(config) ──► Connected(config)
//!                     │ fail                    │ link lost
//!                     ▼                         ▼
//!                   Failed(reason) ◄────────────┘
//! ```
//!
//! They run independently but share a capability gate: unless the device
//! is known to support STA/AP concurrency, a role may only be entered while
//! the other one is idle.
//!
//! Transitions run in spawned tasks bounded by a timeout. Every caller that
//! asks for a transition already in flight waits on the same outcome instead
//! of starting another one. Each transition carries an epoch so a late
//! result from a cancelled or superseded attempt cannot land.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use mesh_core::config::MeshConfig;
use mesh_core::{HotspotConfig, VirtualAddr};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::{MeshError, MeshResult};
use crate::platform::{HotspotRequest, PlatformError, PlatformEvent, WifiPlatform};
use crate::state::{
    ApStatus, ConcurrencySupport, HotspotState, Mutation, NodeStateStore, WifiStationState,
};

/// Timeouts and hotspot parameters for the controller.
#[derive(Debug, Clone)]
pub struct WifiSettings {
    pub request: HotspotRequest,
    /// Advertised in every connect link we hand out.
    pub mesh_port: u16,
    pub start_timeout: Duration,
    pub connect_timeout: Duration,
}

impl WifiSettings {
    pub fn from_config(config: &MeshConfig) -> Self {
        Self {
            request: HotspotRequest {
                band: config.wifi.band,
                hotspot_type: config.wifi.hotspot_type,
            },
            mesh_port: config.network.mesh_port,
            start_timeout: config.wifi.hotspot_start_timeout(),
            connect_timeout: config.wifi.station_connect_timeout(),
        }
    }
}

/// Result slot shared by everyone waiting on one transition.
type Outcome = Option<MeshResult<()>>;

enum ApRole {
    Off,
    Starting {
        epoch: u64,
        done: watch::Sender<Outcome>,
    },
    On(HotspotConfig),
    Stopping {
        epoch: u64,
        done: watch::Sender<Outcome>,
        previous: HotspotConfig,
    },
}

/// Where a station attempt lands if it times out.
#[derive(Clone)]
enum StaFallback {
    Inactive,
    Failed {
        config: Option<HotspotConfig>,
        reason: String,
    },
}

enum StaRole {
    Inactive,
    Connecting {
        epoch: u64,
        target: HotspotConfig,
        done: watch::Sender<Outcome>,
        task: AbortHandle,
        fallback: StaFallback,
    },
    Connected(HotspotConfig),
    Failed {
        config: Option<HotspotConfig>,
        reason: String,
    },
}

impl From<StaFallback> for StaRole {
    fn from(f: StaFallback) -> Self {
        match f {
            StaFallback::Inactive => StaRole::Inactive,
            StaFallback::Failed { config, reason } => StaRole::Failed { config, reason },
        }
    }
}

struct Roles {
    ap: ApRole,
    sta: StaRole,
    epoch: u64,
}

impl Roles {
    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}

#[derive(Clone, Copy)]
enum Role {
    Ap,
    Sta,
}

struct Shared {
    platform: Arc<dyn WifiPlatform>,
    store: NodeStateStore,
    local: VirtualAddr,
    settings: WifiSettings,
    roles: Mutex<Roles>,
    probe: tokio::sync::Mutex<()>,
    /// Held across every station platform call so a stale disconnect
    /// cannot land on top of a newer join.
    sta_radio: tokio::sync::Mutex<()>,
}

/// Serializes hotspot and station transitions for one node.
#[derive(Clone)]
pub struct WifiRoleController {
    shared: Arc<Shared>,
}

enum Next {
    Done,
    Wait(watch::Receiver<Outcome>),
    /// Another transition of the same role is in flight; wait for it, then
    /// look again.
    Retry(watch::Receiver<Outcome>),
}

async fn outcome(mut rx: watch::Receiver<Outcome>, abandoned: MeshError) -> MeshResult<()> {
    let result = match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
        Err(_) => Err(abandoned),
    };
    result
}

impl WifiRoleController {
    pub fn new(
        platform: Arc<dyn WifiPlatform>,
        store: NodeStateStore,
        settings: WifiSettings,
    ) -> Self {
        let local = store.snapshot().local_addr();
        Self {
            shared: Arc::new(Shared {
                platform,
                store,
                local,
                settings,
                roles: Mutex::new(Roles {
                    ap: ApRole::Off,
                    sta: StaRole::Inactive,
                    epoch: 0,
                }),
                probe: tokio::sync::Mutex::new(()),
                sta_radio: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn roles(&self) -> MutexGuard<'_, Roles> {
        self.shared
            .roles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Publishing ────────────────────────────────────────────────────────
    //
    // Always called with the roles lock held, so the published order of
    // role changes matches the order they happened in.

    fn publish_ap(&self, roles: &Roles) {
        let hotspot = match &roles.ap {
            ApRole::Off => HotspotState::with_status(ApStatus::Off),
            ApRole::Starting { .. } => HotspotState::with_status(ApStatus::Starting),
            ApRole::On(config) => HotspotState::on(config.clone()),
            ApRole::Stopping { .. } => HotspotState::with_status(ApStatus::Stopping),
        };
        self.shared.store.apply(Mutation::Hotspot(hotspot));
    }

    fn publish_sta(&self, roles: &Roles) {
        let station = match &roles.sta {
            StaRole::Inactive => WifiStationState::inactive(),
            StaRole::Connecting { target, .. } => WifiStationState::connecting(target.clone()),
            StaRole::Connected(config) => WifiStationState::connected(config.clone()),
            StaRole::Failed { config, reason } => WifiStationState::failed(config.clone(), reason),
        };
        self.shared.store.apply(Mutation::Station(station));
    }

    fn gate(&self, roles: &Roles, entering: Role) -> MeshResult<()> {
        if self.shared.store.snapshot().concurrency == ConcurrencySupport::Supported {
            return Ok(());
        }
        match entering {
            Role::Ap if !matches!(roles.sta, StaRole::Inactive) => Err(
                MeshError::ConcurrencyUnsupported("station role is not inactive"),
            ),
            Role::Sta if !matches!(roles.ap, ApRole::Off) => {
                Err(MeshError::ConcurrencyUnsupported("hotspot role is not off"))
            }
            _ => Ok(()),
        }
    }

    // ── Hotspot ───────────────────────────────────────────────────────────

    /// Bring the hotspot up or down. Resolves once the AP role has reached
    /// a stable state.
    pub async fn set_hotspot_enabled(&self, enabled: bool) -> MeshResult<()> {
        if enabled {
            self.enable_hotspot().await
        } else {
            self.disable_hotspot().await
        }
    }

    async fn enable_hotspot(&self) -> MeshResult<()> {
        loop {
            let next = {
                let mut roles = self.roles();
                match &roles.ap {
                    ApRole::On(_) => Next::Done,
                    ApRole::Starting { done, .. } => Next::Wait(done.subscribe()),
                    ApRole::Stopping { done, .. } => Next::Retry(done.subscribe()),
                    ApRole::Off => {
                        self.gate(&roles, Role::Ap)?;
                        Next::Wait(self.begin_start(&mut roles))
                    }
                }
            };
            match next {
                Next::Done => return Ok(()),
                Next::Wait(rx) => {
                    return outcome(rx, MeshError::HotspotStartFailed("abandoned".into())).await
                }
                Next::Retry(rx) => {
                    let _ = outcome(rx, MeshError::HotspotStopFailed("abandoned".into())).await;
                }
            }
        }
    }

    async fn disable_hotspot(&self) -> MeshResult<()> {
        loop {
            let next = {
                let mut roles = self.roles();
                match &roles.ap {
                    ApRole::Off => Next::Done,
                    ApRole::Stopping { done, .. } => Next::Wait(done.subscribe()),
                    ApRole::Starting { done, .. } => Next::Retry(done.subscribe()),
                    ApRole::On(_) => Next::Wait(self.begin_stop(&mut roles)),
                }
            };
            match next {
                Next::Done => return Ok(()),
                Next::Wait(rx) => {
                    return outcome(rx, MeshError::HotspotStopFailed("abandoned".into())).await
                }
                Next::Retry(rx) => {
                    let _ = outcome(rx, MeshError::HotspotStartFailed("abandoned".into())).await;
                }
            }
        }
    }

    fn begin_start(&self, roles: &mut Roles) -> watch::Receiver<Outcome> {
        let epoch = roles.next_epoch();
        let (done, rx) = watch::channel(None);
        roles.ap = ApRole::Starting { epoch, done };
        self.publish_ap(roles);
        tracing::info!(epoch, "hotspot starting");

        let this = self.clone();
        tokio::spawn(async move { this.run_start(epoch).await });
        rx
    }

    async fn run_start(&self, epoch: u64) {
        let shared = &self.shared;
        let result = tokio::time::timeout(
            shared.settings.start_timeout,
            shared.platform.start_hotspot(shared.settings.request),
        )
        .await;
        if result.is_err() {
            // Don't leave a half-started AP behind.
            self.cleanup(shared.platform.stop_hotspot(), "hotspot start")
                .await;
        }
        let result = match result {
            Ok(Ok(creds)) => Ok(HotspotConfig {
                ssid: creds.ssid,
                passphrase: creds.passphrase,
                bssid: creds.bssid,
                port: shared.settings.mesh_port,
                addr: shared.local,
                band: creds.band,
            }),
            Ok(Err(e)) => Err(MeshError::HotspotStartFailed(e.to_string())),
            Err(_) => Err(MeshError::HotspotStartFailed("timed out".into())),
        };

        let mut roles = self.roles();
        if !matches!(roles.ap, ApRole::Starting { epoch: e, .. } if e == epoch) {
            return;
        }
        let next = match &result {
            Ok(config) => {
                tracing::info!(ssid = %config.ssid, bssid = %config.bssid, "hotspot on");
                ApRole::On(config.clone())
            }
            Err(e) => {
                tracing::warn!(error = %e, "hotspot start failed");
                ApRole::Off
            }
        };
        let previous = std::mem::replace(&mut roles.ap, next);
        self.publish_ap(&roles);
        if let ApRole::Starting { done, .. } = previous {
            done.send_replace(Some(result.map(|_| ())));
        }
    }

    /// Best-effort undo after a timed-out transition, bounded by the same
    /// timeout.
    async fn cleanup(
        &self,
        undo: BoxFuture<'_, Result<(), PlatformError>>,
        what: &'static str,
    ) {
        match tokio::time::timeout(self.shared.settings.start_timeout, undo).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "cleanup after {what} timeout failed"),
            Err(_) => tracing::debug!("cleanup after {what} timeout timed out"),
        }
    }

    fn begin_stop(&self, roles: &mut Roles) -> watch::Receiver<Outcome> {
        let epoch = roles.next_epoch();
        let (done, rx) = watch::channel(None);
        let previous = match std::mem::replace(&mut roles.ap, ApRole::Off) {
            ApRole::On(config) => config,
            other => {
                // Only reachable from On; put it back untouched.
                roles.ap = other;
                let _ = done.send_replace(Some(Ok(())));
                return rx;
            }
        };
        roles.ap = ApRole::Stopping {
            epoch,
            done,
            previous,
        };
        self.publish_ap(roles);
        tracing::info!(epoch, "hotspot stopping");

        let this = self.clone();
        tokio::spawn(async move { this.run_stop(epoch).await });
        rx
    }

    async fn run_stop(&self, epoch: u64) {
        let shared = &self.shared;
        let result = match tokio::time::timeout(
            shared.settings.start_timeout,
            shared.platform.stop_hotspot(),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MeshError::HotspotStopFailed(e.to_string())),
            Err(_) => Err(MeshError::HotspotStopFailed("timed out".into())),
        };

        let mut roles = self.roles();
        if !matches!(roles.ap, ApRole::Stopping { epoch: e, .. } if e == epoch) {
            return;
        }
        let ApRole::Stopping { done, previous, .. } = std::mem::replace(&mut roles.ap, ApRole::Off)
        else {
            return;
        };
        match &result {
            Ok(()) => tracing::info!("hotspot off"),
            Err(e) => {
                tracing::warn!(error = %e, "hotspot stop failed; still on");
                roles.ap = ApRole::On(previous);
            }
        }
        self.publish_ap(&roles);
        done.send_replace(Some(result));
    }

    // ── Station ───────────────────────────────────────────────────────────

    /// Join another node's hotspot. Resolves once the STA role has reached
    /// a stable state.
    pub async fn connect(&self, config: HotspotConfig) -> MeshResult<()> {
        config.validate()?;
        let target = config.addr;
        if target == self.shared.local {
            return Err(MeshError::AlreadyConnected(target));
        }

        let rx = {
            let mut roles = self.roles();
            if self.shared.store.snapshot().is_reachable(target) {
                return Err(MeshError::AlreadyConnected(target));
            }
            match &roles.sta {
                StaRole::Connected(current) if current.addr == target => {
                    return Err(MeshError::AlreadyConnected(target));
                }
                StaRole::Connecting { target: pending, done, .. } if pending.addr == target => {
                    tracing::debug!(%target, "connect coalesced with in-flight attempt");
                    done.subscribe()
                }
                _ => {
                    self.gate(&roles, Role::Sta)?;
                    self.begin_connect(&mut roles, config)
                }
            }
        };
        outcome(rx, MeshError::StationConnectFailed("abandoned".into())).await
    }

    fn begin_connect(&self, roles: &mut Roles, config: HotspotConfig) -> watch::Receiver<Outcome> {
        let fallback = match std::mem::replace(&mut roles.sta, StaRole::Inactive) {
            StaRole::Connecting {
                task,
                done,
                fallback,
                target,
                ..
            } => {
                task.abort();
                tracing::info!(previous = %target.addr, next = %config.addr, "connect superseded");
                done.send_replace(Some(Err(MeshError::StationConnectFailed(
                    "superseded".into(),
                ))));
                fallback
            }
            StaRole::Failed { config, reason } => StaFallback::Failed { config, reason },
            StaRole::Inactive | StaRole::Connected(_) => StaFallback::Inactive,
        };

        let epoch = roles.next_epoch();
        let (done, rx) = watch::channel(None);
        let this = self.clone();
        let join = config.clone();
        let task = tokio::spawn(async move { this.run_connect(epoch, join).await }).abort_handle();

        tracing::info!(epoch, target = %config.addr, ssid = %config.ssid, "station connecting");
        roles.sta = StaRole::Connecting {
            epoch,
            target: config,
            done,
            task,
            fallback,
        };
        self.publish_sta(roles);
        rx
    }

    async fn run_connect(&self, epoch: u64, config: HotspotConfig) {
        let shared = &self.shared;
        let _radio = shared.sta_radio.lock().await;
        if !matches!(self.roles().sta, StaRole::Connecting { epoch: e, .. } if e == epoch) {
            return;
        }
        let result = tokio::time::timeout(
            shared.settings.connect_timeout,
            shared.platform.connect_station(config.clone()),
        )
        .await;
        if result.is_err() {
            self.cleanup(shared.platform.disconnect_station(), "station connect")
                .await;
        }

        let mut roles = self.roles();
        if !matches!(roles.sta, StaRole::Connecting { epoch: e, .. } if e == epoch) {
            return;
        }
        let StaRole::Connecting { done, fallback, .. } =
            std::mem::replace(&mut roles.sta, StaRole::Inactive)
        else {
            return;
        };
        let outcome = match result {
            Ok(Ok(())) => {
                tracing::info!(target = %config.addr, "station connected");
                roles.sta = StaRole::Connected(config);
                Ok(())
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                tracing::warn!(target = %config.addr, %reason, "station connect failed");
                roles.sta = StaRole::Failed {
                    config: Some(config),
                    reason: reason.clone(),
                };
                Err(MeshError::StationConnectFailed(reason))
            }
            Err(_) => {
                tracing::warn!(target = %config.addr, "station connect timed out");
                roles.sta = fallback.into();
                Err(MeshError::StationConnectFailed("timed out".into()))
            }
        };
        self.publish_sta(&roles);
        done.send_replace(Some(outcome));
    }

    /// Leave the current hotspot, or cancel a join in progress. Safe in any
    /// state; always converges to inactive.
    pub async fn disconnect_station(&self) -> MeshResult<()> {
        {
            let mut roles = self.roles();
            match std::mem::replace(&mut roles.sta, StaRole::Inactive) {
                StaRole::Inactive => return Ok(()),
                StaRole::Connecting { task, done, target, .. } => {
                    task.abort();
                    tracing::info!(target = %target.addr, "station connect cancelled");
                    done.send_replace(Some(Err(MeshError::StationConnectFailed(
                        "cancelled".into(),
                    ))));
                }
                StaRole::Connected(config) => {
                    tracing::info!(target = %config.addr, "station disconnecting");
                }
                StaRole::Failed { .. } => {}
            }
            self.publish_sta(&roles);
        }

        let _radio = self.shared.sta_radio.lock().await;
        if !matches!(self.roles().sta, StaRole::Inactive) {
            tracing::debug!("newer station transition owns the radio, skipping disconnect");
            return Ok(());
        }
        if let Err(e) = self.shared.platform.disconnect_station().await {
            tracing::warn!(error = %e, "platform disconnect failed");
        }
        Ok(())
    }

    // ── Capability & events ───────────────────────────────────────────────

    /// Ask the platform whether both roles can run at once. The answer is
    /// cached in node state; a failed probe leaves it unknown.
    pub async fn probe_concurrency(&self) -> ConcurrencySupport {
        let _serial = self.shared.probe.lock().await;
        let current = self.shared.store.snapshot().concurrency;
        if current != ConcurrencySupport::Unknown {
            return current;
        }
        let support = match self.shared.platform.supports_sta_ap_concurrency().await {
            Ok(true) => ConcurrencySupport::Supported,
            Ok(false) => ConcurrencySupport::Unsupported,
            Err(e) => {
                tracing::warn!(error = %e, "concurrency probe failed");
                return ConcurrencySupport::Unknown;
            }
        };
        tracing::info!(?support, "STA/AP concurrency probed");
        self.shared.store.apply(Mutation::Concurrency(support));
        support
    }

    pub fn handle_platform_event(&self, event: PlatformEvent) {
        let mut roles = self.roles();
        match event {
            PlatformEvent::StationLost { reason } => {
                let lost = match &roles.sta {
                    StaRole::Connected(config) => Some(config.clone()),
                    _ => None,
                };
                if let Some(config) = lost {
                    tracing::warn!(target = %config.addr, %reason, "station link lost");
                    roles.sta = StaRole::Failed {
                        config: Some(config),
                        reason: "link lost".into(),
                    };
                    self.publish_sta(&roles);
                }
            }
            PlatformEvent::HotspotLost { reason } => {
                if matches!(roles.ap, ApRole::On(_)) {
                    tracing::warn!(%reason, "hotspot lost");
                    roles.ap = ApRole::Off;
                    self.publish_ap(&roles);
                }
            }
        }
    }

    /// Feed spontaneous platform events into the state machines until the
    /// platform's event channel closes.
    pub async fn run_platform_events(self) {
        let Some(mut events) = self.shared.platform.take_events() else {
            return;
        };
        while let Some(event) = events.recv().await {
            self.handle_platform_event(event);
        }
        tracing::debug!("platform event channel closed");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
