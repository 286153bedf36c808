//! `VirtualNode`: one mesh participant.
//!
//! Wires the address space, the state store, the originator protocol and the
//! WiFi role controller together around a single local virtual address, and
//! is the only type the daemon and the API need to hold.

use std::sync::Arc;

use mesh_core::config::MeshConfig;
use mesh_core::{AddressSpace, ConnectLink, HotspotConfig, VirtualAddr};

use crate::error::MeshResult;
use crate::originator::OriginatorProtocol;
use crate::platform::WifiPlatform;
use crate::state::{ConcurrencySupport, NodeIdentity, NodeState, NodeStateStore, StateStream};
use crate::wifi::{WifiRoleController, WifiSettings};

#[derive(Clone)]
pub struct VirtualNode {
    identity: NodeIdentity,
    addresses: AddressSpace,
    store: NodeStateStore,
    protocol: Arc<OriginatorProtocol>,
    wifi: WifiRoleController,
}

impl VirtualNode {
    /// Create a node with a freshly allocated link-local address.
    pub fn new(config: &MeshConfig, platform: Arc<dyn WifiPlatform>) -> MeshResult<Self> {
        let addresses = AddressSpace::new();
        let addr = addresses.allocate_local()?;
        Ok(Self::assemble(config, platform, addresses, addr))
    }

    /// Create a node with a fixed address.
    pub fn with_address(
        config: &MeshConfig,
        platform: Arc<dyn WifiPlatform>,
        addr: VirtualAddr,
    ) -> MeshResult<Self> {
        let addresses = AddressSpace::new();
        let addr = addresses.claim_local(addr)?;
        Ok(Self::assemble(config, platform, addresses, addr))
    }

    fn assemble(
        config: &MeshConfig,
        platform: Arc<dyn WifiPlatform>,
        addresses: AddressSpace,
        addr: VirtualAddr,
    ) -> Self {
        let identity = NodeIdentity {
            addr,
            display_name: display_name(config, addr),
        };
        let store = NodeStateStore::new(identity.clone());
        let protocol = Arc::new(OriginatorProtocol::new(
            store.clone(),
            addresses.clone(),
            &config.protocol,
        ));
        let wifi = WifiRoleController::new(platform, store.clone(), WifiSettings::from_config(config));
        tracing::info!(%addr, name = %identity.display_name, "virtual node ready");
        Self {
            identity,
            addresses,
            store,
            protocol,
            wifi,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn addr(&self) -> VirtualAddr {
        self.identity.addr
    }

    pub fn addresses(&self) -> &AddressSpace {
        &self.addresses
    }

    pub fn protocol(&self) -> &Arc<OriginatorProtocol> {
        &self.protocol
    }

    pub fn wifi(&self) -> &WifiRoleController {
        &self.wifi
    }

    pub fn state(&self) -> Arc<NodeState> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> StateStream {
        self.store.subscribe()
    }

    /// The link that lets another node join our hotspot, if it is up.
    pub fn current_link(&self) -> Option<ConnectLink> {
        self.state()
            .hotspot
            .config
            .clone()
            .map(ConnectLink::from_config)
    }

    pub async fn set_hotspot_enabled(&self, enabled: bool) -> MeshResult<()> {
        self.wifi.set_hotspot_enabled(enabled).await
    }

    pub async fn connect(&self, config: HotspotConfig) -> MeshResult<()> {
        self.wifi.connect(config).await
    }

    /// Decode a connect link and join the hotspot it describes. Decode
    /// errors come back before any state is touched.
    pub async fn connect_by_link(&self, uri: &str) -> MeshResult<()> {
        let link = ConnectLink::parse(uri)?;
        self.wifi.connect(link.into_config()).await
    }

    pub async fn disconnect_station(&self) -> MeshResult<()> {
        self.wifi.disconnect_station().await
    }

    pub async fn probe_concurrency(&self) -> ConcurrencySupport {
        self.wifi.probe_concurrency().await
    }
}

fn display_name(config: &MeshConfig, addr: VirtualAddr) -> String {
    let configured = config.node.display_name.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| format!("mesh-node-{}", addr.octets()[3]))
}
