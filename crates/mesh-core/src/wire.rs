//! Mesh wire format: link-local frames exchanged between neighbours.
//!
//! These types ARE the protocol. Every field, every size, every reserved byte
//! is part of the wire format.
//!
//! All frames are #[repr(C, packed)] with zerocopy derives for allocation-free
//! serialization. Multi-byte integers are big-endian on the wire. Every frame
//! starts with the same four bytes (magic, version, kind) and ends with a
//! 4-byte truncated BLAKE3 checksum over everything before it.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::address::{self, VirtualAddr};

// ── Constants ─────────────────────────────────────────────────────────────────

/// First two bytes of every frame.
pub const FRAME_MAGIC: [u8; 2] = *b"VN";

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Hop count ceiling. Messages that would exceed it are not forwarded.
pub const MAX_HOPS: u8 = 32;

/// IPv6 link-local multicast address frames are sent to.
pub const MULTICAST_ADDR: &str = "ff02::1";

/// Default UDP port for mesh frames.
pub const DEFAULT_MESH_PORT: u16 = 4242;

/// Frame kind discriminator, third header byte after the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Originator = 0x01,
    Probe = 0x02,
    ProbeReply = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Originator),
            0x02 => Ok(FrameKind::Probe),
            0x03 => Ok(FrameKind::ProbeReply),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ── Originator ────────────────────────────────────────────────────────────────

/// Logical content of an originator advertisement: "`origin` is reachable
/// in `hop_count` hops with an accumulated latency of `latency_ms`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginatorMessage {
    pub origin: VirtualAddr,
    /// Hops travelled so far, ≥ 1. The originator itself sends 1.
    pub hop_count: u8,
    /// Sum of per-hop link latency estimates, milliseconds.
    pub latency_ms: u32,
    /// Per-origin sequence number. Wraps.
    pub sequence: u32,
}

impl OriginatorMessage {
    /// The message as the next hop will see it: one more hop, plus the
    /// latency of the link it is about to cross. Saturates at [`MAX_HOPS`].
    pub fn forwarded(self, link_latency_ms: u32) -> Self {
        Self {
            hop_count: self.hop_count.saturating_add(1).min(MAX_HOPS),
            latency_ms: self.latency_ms.saturating_add(link_latency_ms),
            ..self
        }
    }
}

/// Originator advertisement on the wire.
///
/// Wire size: 28 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct OriginatorFrame {
    pub magic: [u8; 2],
    pub version: u8,
    pub kind: u8,
    /// Node the advertisement is about.
    pub origin: [u8; 4],
    /// Neighbour that transmitted this copy of the frame.
    pub last_hop: [u8; 4],
    pub hop_count: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    pub reserved: [u8; 2],
    pub latency_ms: U32<NetworkEndian>,
    pub sequence: U32<NetworkEndian>,
    pub checksum: [u8; 4],
}

assert_eq_size!(OriginatorFrame, [u8; 28]);

impl OriginatorFrame {
    pub fn new(message: &OriginatorMessage, last_hop: VirtualAddr) -> Self {
        let mut frame = Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            kind: FrameKind::Originator as u8,
            origin: message.origin.octets(),
            last_hop: last_hop.octets(),
            hop_count: message.hop_count,
            flags: 0,
            reserved: [0; 2],
            latency_ms: U32::new(message.latency_ms),
            sequence: U32::new(message.sequence),
            checksum: [0; 4],
        };
        frame.checksum = checksum(&frame.as_bytes()[..Self::CHECKED_LEN]);
        frame
    }

    const CHECKED_LEN: usize = 24;
}

// ── Link probes ───────────────────────────────────────────────────────────────

/// Round-trip probe used to estimate per-link latency.
///
/// A node sends `Probe` with its own address, a nonce and its monotonic send
/// stamp. The neighbour answers with `ProbeReply`, echoing nonce and stamp and
/// filling in `responder`. The prober computes RTT from its own clock only.
///
/// Wire size: 28 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ProbeFrame {
    pub magic: [u8; 2],
    pub version: u8,
    pub kind: u8,
    pub sender: [u8; 4],
    /// Zero in a `Probe`; the answering node's address in a `ProbeReply`.
    pub responder: [u8; 4],
    pub nonce: U32<NetworkEndian>,
    /// Sender's monotonic clock, microseconds since its process start.
    pub sent_at_us: U64<NetworkEndian>,
    pub checksum: [u8; 4],
}

assert_eq_size!(ProbeFrame, [u8; 28]);

impl ProbeFrame {
    const CHECKED_LEN: usize = 24;

    pub fn probe(sender: VirtualAddr, nonce: u32, sent_at_us: u64) -> Self {
        let mut frame = Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            kind: FrameKind::Probe as u8,
            sender: sender.octets(),
            responder: [0; 4],
            nonce: U32::new(nonce),
            sent_at_us: U64::new(sent_at_us),
            checksum: [0; 4],
        };
        frame.seal();
        frame
    }

    /// Answer to a probe, echoing its nonce and stamp.
    pub fn reply(probe: &Probe, responder: VirtualAddr) -> Self {
        let mut frame = Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            kind: FrameKind::ProbeReply as u8,
            sender: probe.sender.octets(),
            responder: responder.octets(),
            nonce: U32::new(probe.nonce),
            sent_at_us: U64::new(probe.sent_at_us),
            checksum: [0; 4],
        };
        frame.seal();
        frame
    }

    fn seal(&mut self) {
        self.checksum = checksum(&self.as_bytes()[..Self::CHECKED_LEN]);
    }
}

/// Decoded probe or probe reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub sender: VirtualAddr,
    /// `None` for a probe, `Some` for a reply.
    pub responder: Option<VirtualAddr>,
    pub nonce: u32,
    pub sent_at_us: u64,
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Any frame that can arrive on a mesh socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Originator {
        message: OriginatorMessage,
        last_hop: VirtualAddr,
    },
    Probe(Probe),
    ProbeReply(Probe),
}

impl Frame {
    /// Parse and verify a datagram. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
        if buf.len() < 4 {
            return Err(WireError::Truncated(buf.len()));
        }
        if buf[..2] != FRAME_MAGIC {
            return Err(WireError::BadMagic);
        }
        if buf[2] != FRAME_VERSION {
            return Err(WireError::UnknownVersion(buf[2]));
        }

        match FrameKind::try_from(buf[3])? {
            FrameKind::Originator => {
                let frame = OriginatorFrame::read_from_prefix(buf)
                    .ok_or(WireError::Truncated(buf.len()))?;
                verify(&frame.as_bytes()[..OriginatorFrame::CHECKED_LEN], frame.checksum)?;
                let flags = frame.flags;
                if flags != 0 {
                    return Err(WireError::ReservedFlagsSet(flags));
                }
                let message = OriginatorMessage {
                    origin: wire_addr(frame.origin)?,
                    hop_count: frame.hop_count,
                    latency_ms: frame.latency_ms.get(),
                    sequence: frame.sequence.get(),
                };
                Ok(Frame::Originator {
                    message,
                    last_hop: wire_addr(frame.last_hop)?,
                })
            }
            kind @ (FrameKind::Probe | FrameKind::ProbeReply) => {
                let frame = ProbeFrame::read_from_prefix(buf)
                    .ok_or(WireError::Truncated(buf.len()))?;
                verify(&frame.as_bytes()[..ProbeFrame::CHECKED_LEN], frame.checksum)?;
                let responder = if kind == FrameKind::ProbeReply {
                    Some(wire_addr(frame.responder)?)
                } else {
                    None
                };
                let probe = Probe {
                    sender: wire_addr(frame.sender)?,
                    responder,
                    nonce: frame.nonce.get(),
                    sent_at_us: frame.sent_at_us.get(),
                };
                Ok(match kind {
                    FrameKind::Probe => Frame::Probe(probe),
                    _ => Frame::ProbeReply(probe),
                })
            }
        }
    }
}

fn wire_addr(octets: [u8; 4]) -> Result<VirtualAddr, WireError> {
    address::validate(VirtualAddr::from_u32(u32::from_be_bytes(octets)))
        .map_err(|_| WireError::InvalidAddress(octets))
}

fn checksum(bytes: &[u8]) -> [u8; 4] {
    let hash = blake3::hash(bytes);
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.as_bytes()[..4]);
    out
}

fn verify(bytes: &[u8], expected: [u8; 4]) -> Result<(), WireError> {
    if checksum(bytes) == expected {
        Ok(())
    } else {
        Err(WireError::ChecksumMismatch)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("bad frame magic")]
    BadMagic,

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("invalid virtual address on the wire: {0:?}")]
    InvalidAddress([u8; 4]),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
