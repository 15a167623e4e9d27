//! Control packet framing and serialization.
//!
//! Wire format:
//! ```text
//! ┌──────────────┬────────────────┬──────────────┬─────────────────┐
//! │ opcode|key(1)│ session id (8) │ ack count (1)│ ack ids (4 * n) │
//! ├──────────────┴────────────────┴──────────────┴─────────────────┤
//! │ ack remote session id (8, only when n > 0)                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ packet id (4, absent for ACK_V1) │ payload (variable)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are big-endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{opcode, parse_opcode, PacketCode, SessionId, ACK_PACKET_ID, PACKET_ID_LENGTH, SESSION_ID_LENGTH};
use crate::error::{Error, Result};

/// Acknowledgments piggy-backed on a control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Acknowledged packet ids
    pub ids: Vec<u32>,
    /// Session id of the peer whose packets are acknowledged
    pub remote_session_id: SessionId,
}

impl Ack {
    /// Ids that fit the one-byte count on the wire; the rest are not sent.
    pub fn wire_ids(&self) -> &[u32] {
        &self.ids[..self.ids.len().min(u8::MAX as usize)]
    }
}

/// A control channel packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    /// Packet opcode
    pub code: PacketCode,
    /// Key id (0..=7)
    pub key: u8,
    /// Sender session id
    pub session_id: SessionId,
    /// Packet id, [`ACK_PACKET_ID`] for pure acks
    pub packet_id: u32,
    /// Opaque payload, usually TLS records
    pub payload: Option<Bytes>,
    /// Piggy-backed acknowledgments
    pub ack: Option<Ack>,
}

impl ControlPacket {
    /// Create a packet carrying a payload.
    pub fn new(code: PacketCode, key: u8, session_id: SessionId, packet_id: u32, payload: Option<Bytes>) -> Self {
        Self {
            code,
            key,
            session_id,
            packet_id,
            payload: payload.filter(|p| !p.is_empty()),
            ack: None,
        }
    }

    /// Create a pure `ACK_V1` packet.
    pub fn ack(key: u8, session_id: SessionId, ids: Vec<u32>, remote_session_id: SessionId) -> Self {
        Self {
            code: PacketCode::AckV1,
            key,
            session_id,
            packet_id: ACK_PACKET_ID,
            payload: None,
            ack: Some(Ack {
                ids,
                remote_session_id,
            }),
        }
    }

    /// Piggy-back acknowledgments.
    pub fn with_ack(mut self, ids: Vec<u32>, remote_session_id: SessionId) -> Self {
        self.ack = Some(Ack {
            ids,
            remote_session_id,
        });
        self
    }

    /// Whether this is a pure ack without packet id.
    pub fn is_ack(&self) -> bool {
        self.code == PacketCode::AckV1
    }

    /// First byte on the wire.
    pub fn opcode(&self) -> u8 {
        opcode(self.code, self.key)
    }

    /// Size of the body written by [`put_body`](Self::put_body).
    pub fn body_len(&self) -> usize {
        let acks = match &self.ack {
            Some(ack) if !ack.ids.is_empty() => 1 + ack.wire_ids().len() * 4 + SESSION_ID_LENGTH,
            _ => 1,
        };
        let rest = if self.is_ack() {
            0
        } else {
            PACKET_ID_LENGTH + self.payload.as_ref().map_or(0, Bytes::len)
        };
        acks + rest
    }

    /// Write everything after the session id: acks, packet id, payload.
    pub fn put_body(&self, buf: &mut impl BufMut) {
        match &self.ack {
            Some(ack) if !ack.ids.is_empty() => {
                let ids = ack.wire_ids();
                buf.put_u8(ids.len() as u8);
                for id in ids {
                    buf.put_u32(*id);
                }
                buf.put_slice(ack.remote_session_id.as_bytes());
            }
            _ => buf.put_u8(0),
        }
        if !self.is_ack() {
            buf.put_u32(self.packet_id);
            if let Some(payload) = &self.payload {
                buf.put_slice(payload);
            }
        }
    }

    /// Serialize the packet to bytes.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + SESSION_ID_LENGTH + self.body_len());
        buf.put_u8(self.opcode());
        buf.put_slice(self.session_id.as_bytes());
        self.put_body(&mut buf);
        buf.freeze()
    }

    /// Deserialize a packet from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(Error::control("missing opcode"));
        }
        let (code, key) = parse_opcode(buf.get_u8());
        if code == PacketCode::Unknown {
            return Err(Error::control("unknown code"));
        }
        let session_id = read_session_id(&mut buf).ok_or_else(|| Error::control("missing session id"))?;
        Self::deserialize_body(code, key, session_id, buf)
    }

    /// Parse everything after the session id.
    pub fn deserialize_body(code: PacketCode, key: u8, session_id: SessionId, body: &[u8]) -> Result<Self> {
        let mut buf = body;
        if !buf.has_remaining() {
            return Err(Error::control("missing ack count"));
        }
        let ack_count = buf.get_u8() as usize;

        let mut ack = None;
        if ack_count > 0 {
            if buf.remaining() < ack_count * 4 {
                return Err(Error::control("missing acks"));
            }
            let ids = (0..ack_count).map(|_| buf.get_u32()).collect();
            let remote_session_id =
                read_session_id(&mut buf).ok_or_else(|| Error::control("missing ack remote session id"))?;
            ack = Some(Ack {
                ids,
                remote_session_id,
            });
        }

        if code == PacketCode::AckV1 {
            if ack.is_none() {
                return Err(Error::control("malformed ack"));
            }
            return Ok(Self {
                code,
                key,
                session_id,
                packet_id: ACK_PACKET_ID,
                payload: None,
                ack,
            });
        }

        if buf.remaining() < PACKET_ID_LENGTH {
            return Err(Error::control("missing packet id"));
        }
        let packet_id = buf.get_u32();
        let payload = if buf.has_remaining() {
            Some(Bytes::copy_from_slice(buf))
        } else {
            None
        };

        Ok(Self {
            code,
            key,
            session_id,
            packet_id,
            payload,
            ack,
        })
    }
}

fn read_session_id(buf: &mut &[u8]) -> Option<SessionId> {
    let id = SessionId::from_slice(buf)?;
    buf.advance(SESSION_ID_LENGTH);
    Some(id)
}

impl fmt::Display for ControlPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}/{} sid={}", self.code, self.key, self.session_id)?;
        if !self.is_ack() {
            write!(f, " pid={}", self.packet_id)?;
        }
        if let Some(ack) = &self.ack {
            write!(f, " acks={:?} rsid={}", ack.ids, ack.remote_session_id)?;
        }
        if let Some(payload) = &self.payload {
            write!(f, " len={}", payload.len())?;
        }
        f.write_str("}")
    }
}
