//! OpenVPN wire protocol primitives.
//!
//! Every OpenVPN packet starts with one byte carrying a 5-bit opcode and a
//! 3-bit key id:
//!
//! ```text
//! ┌───────────────────────┬────────────┐
//! │ opcode (bits 7..3)    │ key (2..0) │
//! └───────────────────────┴────────────┘
//! ```
//!
//! Control packets continue with an 8-byte session id; data packets carry
//! either nothing more (`DATA_V1`) or a 24-bit peer id (`DATA_V2`).

mod bidirectional;
pub mod packet;
mod replay;

use std::fmt;

pub use bidirectional::BidirectionalState;
pub use packet::{Ack, ControlPacket};
pub use replay::ReplayWindow;

/// Mask of the key id bits in the opcode byte.
pub const KEY_MASK: u8 = 0x07;

/// Size of a session id in bytes.
pub const SESSION_ID_LENGTH: usize = 8;

/// Size of a control or data packet id in bytes.
pub const PACKET_ID_LENGTH: usize = 4;

/// Size of the `DATA_V2` peer id in bytes.
pub const PEER_ID_LENGTH: usize = 3;

/// Peer id value meaning "no peer id assigned".
pub const PEER_ID_DISABLED: u32 = 0x00ff_ffff;

/// Packet id carried by pure acks (`ACK_V1`).
pub const ACK_PACKET_ID: u32 = u32::MAX;

/// Largest control payload sent in a single packet.
pub const CONTROL_MAX_PACKET_SIZE: usize = 1000;

/// Most packet ids acknowledged by a single `ACK_V1`.
pub const MAX_ACKS_PER_PACKET: usize = 8;

/// Number of key ids (3 bits).
pub const NUM_KEY_IDS: u8 = 8;

/// Payload of a data channel keep-alive ping.
pub const KEEP_ALIVE_MAGIC: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7, 0x48,
];

/// OpenVPN packet opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketCode {
    /// Renegotiation request, either side
    SoftResetV1,
    /// TLS ciphertext on the control channel
    ControlV1,
    /// Pure acknowledgment
    AckV1,
    /// Data packet with one-byte header
    DataV1,
    /// Client session start
    HardResetClientV2,
    /// Server session start
    HardResetServerV2,
    /// Data packet with peer id
    DataV2,
    /// Any other opcode
    Unknown,
}

impl PacketCode {
    /// Numeric opcode; `Unknown` maps to 0.
    pub fn value(&self) -> u8 {
        match self {
            PacketCode::SoftResetV1 => 3,
            PacketCode::ControlV1 => 4,
            PacketCode::AckV1 => 5,
            PacketCode::DataV1 => 6,
            PacketCode::HardResetClientV2 => 7,
            PacketCode::HardResetServerV2 => 8,
            PacketCode::DataV2 => 9,
            PacketCode::Unknown => 0,
        }
    }

    /// Whether packets with this code travel on the data channel.
    pub fn is_data(&self) -> bool {
        matches!(self, PacketCode::DataV1 | PacketCode::DataV2)
    }
}

impl From<u8> for PacketCode {
    fn from(value: u8) -> Self {
        match value {
            3 => PacketCode::SoftResetV1,
            4 => PacketCode::ControlV1,
            5 => PacketCode::AckV1,
            6 => PacketCode::DataV1,
            7 => PacketCode::HardResetClientV2,
            8 => PacketCode::HardResetServerV2,
            9 => PacketCode::DataV2,
            _ => PacketCode::Unknown,
        }
    }
}

impl fmt::Display for PacketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketCode::SoftResetV1 => "SOFT_RESET_V1",
            PacketCode::ControlV1 => "CONTROL_V1",
            PacketCode::AckV1 => "ACK_V1",
            PacketCode::DataV1 => "DATA_V1",
            PacketCode::HardResetClientV2 => "HARD_RESET_CLIENT_V2",
            PacketCode::HardResetServerV2 => "HARD_RESET_SERVER_V2",
            PacketCode::DataV2 => "DATA_V2",
            PacketCode::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Compose the opcode byte.
pub fn opcode(code: PacketCode, key: u8) -> u8 {
    (code.value() << 3) | (key & KEY_MASK)
}

/// Split an opcode byte into code and key id.
pub fn parse_opcode(byte: u8) -> (PacketCode, u8) {
    (PacketCode::from(byte >> 3), byte & KEY_MASK)
}

/// Opaque 8-byte session identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId([u8; SESSION_ID_LENGTH]);

impl SessionId {
    /// Wrap raw bytes.
    pub const fn new(bytes: [u8; SESSION_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Read from the first 8 bytes of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; SESSION_ID_LENGTH] = bytes.get(..SESSION_ID_LENGTH)?.try_into().ok()?;
        Some(Self(raw))
    }

    /// Generate a random session id.
    pub fn random(prng: &dyn crate::crypto::Prng) -> Self {
        let mut raw = [0u8; SESSION_ID_LENGTH];
        prng.fill(&mut raw);
        Self(raw)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
