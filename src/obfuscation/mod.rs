//! Link-level packet scrambling and TCP stream framing.
//!
//! The processor sits between the protocol and the socket and is invisible
//! to both the control and data channels:
//!
//! ```text
//!   control / data packets
//!            │
//!   ┌────────▼────────┐   UDP: one datagram per processed packet
//!   │ PacketProcessor │
//!   └────────┬────────┘   TCP: u16be(len) || processed packet, repeated
//!            ▼
//!          socket
//! ```
//!
//! Scrambling is the XOR patch family (`scramble xormask|xorptrpos|reverse|
//! obfuscate`). It hides OpenVPN opcodes from naive DPI and provides no
//! confidentiality.

mod xor;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Error, Result};

pub use xor::{Direction, XorMethod};

/// Size of the TCP frame length prefix.
pub const STREAM_LENGTH_PREFIX: usize = 2;

/// Applies the configured scrambling and TCP framing.
#[derive(Debug, Clone, Default)]
pub struct PacketProcessor {
    method: Option<XorMethod>,
}

impl PacketProcessor {
    /// Create a processor; `None` leaves packets untouched.
    pub fn new(method: Option<XorMethod>) -> Self {
        Self { method }
    }

    /// Configured method.
    pub fn method(&self) -> Option<&XorMethod> {
        self.method.as_ref()
    }

    /// Scramble (outbound) or unscramble (inbound) one packet.
    pub fn process_packet(&self, packet: &[u8], direction: Direction) -> Bytes {
        match &self.method {
            Some(method) => {
                let mut out = packet.to_vec();
                method.apply(&mut out, direction);
                Bytes::from(out)
            }
            None => Bytes::copy_from_slice(packet),
        }
    }

    /// Scramble and frame packets for a TCP stream.
    ///
    /// # Errors
    ///
    /// A packet longer than `u16::MAX` cannot be framed.
    pub fn stream(&self, packets: &[Bytes]) -> Result<Bytes> {
        let total: usize = packets.iter().map(|p| p.len() + STREAM_LENGTH_PREFIX).sum();
        let mut out = BytesMut::with_capacity(total);
        for packet in packets {
            let length = u16::try_from(packet.len()).map_err(|_| Error::Buffer {
                expected: u16::MAX as usize,
                actual: packet.len(),
            })?;
            out.put_u16(length);
            out.put_slice(&self.process_packet(packet, Direction::Outbound));
        }
        Ok(out.freeze())
    }

    /// Split a TCP stream into unscrambled packets.
    ///
    /// Returns the complete packets and the number of bytes consumed; a
    /// trailing partial frame is left for the next read.
    pub fn packets(&self, stream: &[u8]) -> (Vec<Bytes>, usize) {
        let mut packets = Vec::new();
        let mut offset = 0;
        while stream.len() - offset >= STREAM_LENGTH_PREFIX {
            let length = u16::from_be_bytes([stream[offset], stream[offset + 1]]) as usize;
            let start = offset + STREAM_LENGTH_PREFIX;
            if stream.len() - start < length {
                break;
            }
            packets.push(self.process_packet(&stream[start..start + length], Direction::Inbound));
            offset = start + length;
        }
        trace!(packets = packets.len(), consumed = offset, "obfuscation: stream split");
        (packets, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn method_strategy() -> impl Strategy<Value = Option<XorMethod>> {
        let mask = proptest::collection::vec(any::<u8>(), 0..8);
        prop_oneof![
            Just(None),
            mask.clone().prop_map(|m| Some(XorMethod::XorMask(m))),
            Just(Some(XorMethod::XorPtrPos)),
            Just(Some(XorMethod::Reverse)),
            mask.prop_map(|m| Some(XorMethod::Obfuscate(m))),
        ]
    }

    #[test]
    fn test_stream_layout() {
        let processor = PacketProcessor::new(Some(XorMethod::XorMask(vec![0xff])));
        let stream = processor
            .stream(&[Bytes::from_static(&[0x00, 0x01]), Bytes::from_static(&[0x10])])
            .unwrap();
        assert_eq!(&stream[..], &[0x00, 0x02, 0xff, 0xfe, 0x00, 0x01, 0xef]);
    }

    #[test]
    fn test_partial_frame_left_unconsumed() {
        let processor = PacketProcessor::default();
        let stream = processor.stream(&[Bytes::from_static(b"abc"), Bytes::from_static(b"defg")]).unwrap();

        let (packets, consumed) = processor.packets(&stream[..stream.len() - 1]);
        assert_eq!(packets, vec![Bytes::from_static(b"abc")]);
        assert_eq!(consumed, 5);

        let (packets, consumed) = processor.packets(&stream[..1]);
        assert!(packets.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let processor = PacketProcessor::default();
        let huge = Bytes::from(vec![0u8; 70_000]);
        assert!(processor.stream(&[huge]).is_err());
    }

    proptest! {
        #[test]
        fn prop_process_packet_reversible(
            method in method_strategy(),
            packet in proptest::collection::vec(any::<u8>(), 0..600),
        ) {
            let processor = PacketProcessor::new(method);
            let scrambled = processor.process_packet(&packet, Direction::Outbound);
            let restored = processor.process_packet(&scrambled, Direction::Inbound);
            prop_assert_eq!(&restored[..], &packet[..]);
        }

        #[test]
        fn prop_stream_survives_any_chunking(
            method in method_strategy(),
            packets in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..200), 0..8),
            chunk in 1usize..50,
        ) {
            let processor = PacketProcessor::new(method);
            let packets: Vec<Bytes> = packets.into_iter().map(Bytes::from).collect();
            let stream = processor.stream(&packets).unwrap();

            let mut buffer = Vec::new();
            let mut received = Vec::new();
            for piece in stream.chunks(chunk) {
                buffer.extend_from_slice(piece);
                let (mut complete, consumed) = processor.packets(&buffer);
                buffer.drain(..consumed);
                received.append(&mut complete);
            }
            prop_assert!(buffer.is_empty());
            prop_assert_eq!(received, packets);
        }
    }
}
