//! mesh-services: the virtual mesh node: node state, the originator
//! routing protocol, and the WiFi role controller.

pub mod error;
pub mod latency;
pub mod node;
pub mod originator;
pub mod platform;
pub mod simulated;
pub mod state;
pub mod wifi;

pub use error::{MeshError, MeshResult};
pub use node::VirtualNode;
pub use originator::{Disposition, DropReason, LinkId, OriginatorProtocol, Reaction};
pub use platform::{HotspotCredentials, HotspotRequest, PlatformError, PlatformEvent, WifiPlatform};
pub use simulated::{SimulatedBehavior, SimulatedPlatform};
pub use state::{
    ApStatus, ConcurrencySupport, HotspotState, LastOriginatorMessage, NodeIdentity, NodeState,
    NodeStateStore, StateStream, StationStatus, WifiStationState,
};
pub use wifi::{WifiRoleController, WifiSettings};
