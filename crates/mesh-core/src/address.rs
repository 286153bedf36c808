//! Virtual addresses: 32-bit, IPv4-shaped identifiers for mesh participants.
//!
//! A virtual address names a node independently of whichever WiFi role it is
//! currently playing. Addresses live for the lifetime of the process and are
//! never persisted; a restarted node allocates a fresh one.
//!
//! Local allocations are drawn from the link-local block 169.254.0.0/16.
//! Remote addresses may be anything that passes [`validate`].

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// First two octets of the block local addresses are allocated from.
const LOCAL_PREFIX: u32 = 0xA9FE_0000; // 169.254.0.0

/// Random attempts before falling back to a linear scan of the block.
const RANDOM_ATTEMPTS: usize = 64;

// ── VirtualAddr ───────────────────────────────────────────────────────────────

/// A virtual (non-hardware) mesh address.
///
/// Stored as a host-order `u32`; rendered and parsed in dotted-quad form.
/// Serializes as its dotted-quad string so JSON consumers see `"10.0.0.5"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualAddr(u32);

impl VirtualAddr {
    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn from_octets(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(u32::from_be_bytes([a, b, c, d]))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn octets(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Dotted-quad rendering. Total: every `u32` has one.
    pub fn dot_notation(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for VirtualAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl From<Ipv4Addr> for VirtualAddr {
    fn from(ip: Ipv4Addr) -> Self {
        Self(u32::from(ip))
    }
}

impl From<VirtualAddr> for Ipv4Addr {
    fn from(addr: VirtualAddr) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

/// Parses dotted-quad text and validates it. `parse(format(a)) == a` for
/// every address that passes [`validate`].
impl FromStr for VirtualAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: Ipv4Addr = s
            .trim()
            .parse()
            .map_err(|_| AddressError::Malformed(s.to_string()))?;
        validate(VirtualAddr::from(ip))
    }
}

impl Serialize for VirtualAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VirtualAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Reject values that cannot name a mesh participant.
///
/// Reserved: unspecified (0.0.0.0), limited broadcast, loopback, multicast,
/// and any address whose final octet is 0 or 255 (network / broadcast
/// equivalents on the /24 a hotspot hands out).
pub fn validate(candidate: VirtualAddr) -> Result<VirtualAddr, AddressError> {
    let ip = Ipv4Addr::from(candidate);
    let last = candidate.octets()[3];
    if ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_loopback()
        || ip.is_multicast()
        || last == 0
        || last == 255
    {
        return Err(AddressError::Reserved(candidate));
    }
    Ok(candidate)
}

/// Parse a dotted-quad string into a validated address.
pub fn parse(text: &str) -> Result<VirtualAddr, AddressError> {
    text.parse()
}

// ── AddressSpace ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
    Local,
    Remote,
}

/// Process-wide bookkeeping of which virtual addresses are in use.
///
/// Cheap to clone; all clones share the same table. Local allocations stay
/// reserved for the life of the process. Remote entries come and go as the
/// routing protocol learns and forgets peers.
#[derive(Debug, Clone, Default)]
pub struct AddressSpace {
    used: Arc<DashMap<VirtualAddr, Usage>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an address from 169.254.0.0/16 that is not currently in use.
    pub fn allocate_local(&self) -> Result<VirtualAddr, AddressError> {
        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_ATTEMPTS {
            let candidate = VirtualAddr(LOCAL_PREFIX | rng.gen_range(0x0100..0xFF00));
            if self.try_claim(candidate) {
                return Ok(candidate);
            }
        }
        // Dense block: walk it in order.
        (0x0100..0xFF00)
            .map(|host| VirtualAddr(LOCAL_PREFIX | host))
            .find(|candidate| self.try_claim(*candidate))
            .ok_or(AddressError::Exhausted)
    }

    /// Reserve a specific address for local use (e.g. from config).
    pub fn claim_local(&self, addr: VirtualAddr) -> Result<VirtualAddr, AddressError> {
        let addr = validate(addr)?;
        if self.try_claim(addr) {
            Ok(addr)
        } else {
            Err(AddressError::InUse(addr))
        }
    }

    fn try_claim(&self, candidate: VirtualAddr) -> bool {
        if validate(candidate).is_err() {
            return false;
        }
        match self.used.entry(candidate) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Usage::Local);
                true
            }
        }
    }

    /// Record a remote address as known. Local claims are never overwritten.
    pub fn mark_known(&self, addr: VirtualAddr) {
        self.used.entry(addr).or_insert(Usage::Remote);
    }

    /// Forget a remote address. Local claims are left alone.
    pub fn forget(&self, addr: VirtualAddr) {
        self.used.remove_if(&addr, |_, usage| *usage == Usage::Remote);
    }

    pub fn is_known(&self, addr: VirtualAddr) -> bool {
        matches!(self.used.get(&addr).map(|u| *u), Some(Usage::Remote))
    }

    pub fn is_local(&self, addr: VirtualAddr) -> bool {
        matches!(self.used.get(&addr).map(|u| *u), Some(Usage::Local))
    }

    /// All remote addresses currently known, sorted.
    pub fn known(&self) -> Vec<VirtualAddr> {
        let mut out: Vec<VirtualAddr> = self
            .used
            .iter()
            .filter(|e| *e.value() == Usage::Remote)
            .map(|e| *e.key())
            .collect();
        out.sort();
        out
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("malformed virtual address: {0:?}")]
    Malformed(String),
    #[error("reserved virtual address: {0}")]
    Reserved(VirtualAddr),
    #[error("virtual address already in use: {0}")]
    InUse(VirtualAddr),
    #[error("no free virtual address left in 169.254.0.0/16")]
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_notation_round_trip() {
        for addr in [
            VirtualAddr::from_octets(10, 0, 0, 5),
            VirtualAddr::from_octets(169, 254, 12, 200),
            VirtualAddr::from_octets(192, 168, 49, 1),
            VirtualAddr::from_octets(1, 2, 3, 4),
        ] {
            let text = addr.dot_notation();
            assert_eq!(parse(&text).unwrap(), addr, "round trip of {text}");
        }
    }

    #[test]
    fn formats_octets_in_network_order() {
        assert_eq!(VirtualAddr::from_u32(0x0A00_0005).to_string(), "10.0.0.5");
    }

    #[test]
    fn rejects_malformed_text() {
        for bad in ["", "10.0.0", "10.0.0.256", "ten.0.0.1", "10.0.0.1.2", "::1"] {
            assert!(
                matches!(parse(bad), Err(AddressError::Malformed(_))),
                "expected Malformed for {bad:?}"
            );
        }
    }

    #[test]
    fn rejects_reserved_values() {
        for bad in ["0.0.0.0", "255.255.255.255", "10.0.0.0", "10.0.0.255", "127.0.0.1", "224.0.0.1"] {
            assert!(
                matches!(parse(bad), Err(AddressError::Reserved(_))),
                "expected Reserved for {bad}"
            );
        }
    }

    #[test]
    fn allocate_local_is_link_local_and_unique() {
        let space = AddressSpace::new();
        let a = space.allocate_local().unwrap();
        let b = space.allocate_local().unwrap();
        assert_ne!(a, b);
        for addr in [a, b] {
            assert_eq!(&addr.octets()[..2], &[169, 254]);
            assert!(validate(addr).is_ok());
            assert!(space.is_local(addr));
            assert!(!space.is_known(addr));
        }
    }

    #[test]
    fn claim_local_refuses_address_in_use() {
        let space = AddressSpace::new();
        let addr = VirtualAddr::from_octets(169, 254, 3, 3);
        space.claim_local(addr).unwrap();
        assert_eq!(space.claim_local(addr), Err(AddressError::InUse(addr)));
    }

    #[test]
    fn remote_tracking_never_touches_local_claims() {
        let space = AddressSpace::new();
        let local = space.allocate_local().unwrap();
        let remote = VirtualAddr::from_octets(10, 0, 0, 9);

        space.mark_known(remote);
        space.mark_known(local);
        assert!(space.is_known(remote));
        assert!(space.is_local(local));
        assert_eq!(space.known(), vec![remote]);

        space.forget(local);
        space.forget(remote);
        assert!(space.is_local(local));
        assert!(space.known().is_empty());
    }

    #[test]
    fn serializes_as_dotted_quad() {
        let addr = VirtualAddr::from_octets(10, 0, 0, 5);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"10.0.0.5\"");
        let back: VirtualAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<VirtualAddr>("\"0.0.0.0\"").is_err());
    }
}
