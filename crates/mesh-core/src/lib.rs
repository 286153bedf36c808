//! mesh-core: virtual addresses, connect links, wire frames and configuration.
//! All other mesh crates depend on this one.

pub mod address;
pub mod config;
pub mod link;
pub mod wire;

pub use address::{AddressError, AddressSpace, VirtualAddr};
pub use link::{ConnectBand, ConnectLink, HotspotConfig, LinkError};
pub use wire::{Frame, OriginatorMessage, WireError};
