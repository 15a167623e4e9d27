//! Reliable control channel.
//!
//! Provides ordered, acknowledged delivery of TLS records over an unreliable
//! link:
//!
//! - Outbound payloads split into packets of at most 1000 bytes
//! - Retransmission of unacknowledged packets after a caller-chosen delay
//! - Inbound reordering with duplicate suppression
//! - Ack bookkeeping bound to the local session id
//!
//! ```text
//!            enqueue_outbound                    read_inbound
//!  payload ──────────────────▶ outbound ──▶ wire ──────────────▶ acks
//!                               queue               │
//!                                 ▲                 ▼
//!                                 └── acked ◀── enqueue_inbound ──▶ in-order packets
//! ```
//!
//! The channel is single-threaded by construction (`&mut self`); the session
//! driver owns it.

mod reorder;
mod serializer;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

pub use reorder::{PacketIdentified, ReorderBuffer};
pub use serializer::{AuthSerializer, ControlChannelSerializer, CryptSerializer, TlsWrap};

use crate::crypto::Prng;
use crate::error::{Error, Result};
use crate::protocol::{
    BidirectionalState, ControlPacket, PacketCode, SessionId, CONTROL_MAX_PACKET_SIZE, MAX_ACKS_PER_PACKET,
};

/// Reliable control channel of one session.
pub struct ControlChannel {
    serializer: ControlChannelSerializer,
    prng: Arc<dyn Prng>,
    session_id: Option<SessionId>,
    remote_session_id: Option<SessionId>,
    next_packet_id: u32,
    /// Packets sent and not yet acknowledged, in id order
    outbound: VecDeque<ControlPacket>,
    /// Last send time by packet id
    sent_dates: HashMap<u32, Instant>,
    /// Ids sent and not yet acknowledged
    pending_acks: HashSet<u32>,
    inbound: ReorderBuffer<ControlPacket>,
    max_packet_size: usize,
    data_count: BidirectionalState<u64>,
}

impl ControlChannel {
    /// Create a channel. Call [`reset`](Self::reset) with
    /// `for_new_session = true` before enqueueing.
    pub fn new(serializer: ControlChannelSerializer, prng: Arc<dyn Prng>) -> Self {
        Self {
            serializer,
            prng,
            session_id: None,
            remote_session_id: None,
            next_packet_id: 0,
            outbound: VecDeque::new(),
            sent_dates: HashMap::new(),
            pending_acks: HashSet::new(),
            inbound: ReorderBuffer::new(0),
            max_packet_size: CONTROL_MAX_PACKET_SIZE,
            data_count: BidirectionalState::new(0),
        }
    }

    /// Override the maximum payload per packet.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.max(1);
        self
    }

    /// Local session id, once generated.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Remote session id, once learned from the server hard reset.
    pub fn remote_session_id(&self) -> Option<SessionId> {
        self.remote_session_id
    }

    /// Record the server session id.
    pub fn set_remote_session_id(&mut self, id: SessionId) {
        self.remote_session_id = Some(id);
    }

    /// Clear queues, counters and serializer replay state. A new random
    /// session id is generated when `for_new_session` is set.
    pub fn reset(&mut self, for_new_session: bool) {
        if for_new_session {
            let id = SessionId::random(self.prng.as_ref());
            debug!(session_id = %id, "control channel: new session id");
            self.session_id = Some(id);
            self.remote_session_id = None;
        }
        self.next_packet_id = 0;
        self.outbound.clear();
        self.sent_dates.clear();
        self.pending_acks.clear();
        self.inbound.reset();
        self.data_count.reset();
        self.serializer.reset();
    }

    /// Queue `payload` for delivery, split into packets with consecutive ids.
    ///
    /// # Panics
    ///
    /// Panics if no session id was generated, i.e. `reset(true)` was never
    /// called.
    pub fn enqueue_outbound(&mut self, code: PacketCode, key: u8, payload: &[u8]) {
        let Some(session_id) = self.session_id else {
            panic!("control channel: enqueue before a session id was generated");
        };

        let payload = Bytes::copy_from_slice(payload);
        let chunks: Vec<Bytes> = if payload.is_empty() {
            vec![Bytes::new()]
        } else {
            (0..payload.len())
                .step_by(self.max_packet_size)
                .map(|start| payload.slice(start..(start + self.max_packet_size).min(payload.len())))
                .collect()
        };

        for chunk in chunks {
            let packet = ControlPacket::new(code, key, session_id, self.next_packet_id, Some(chunk));
            trace!(%packet, "control channel: enqueue");
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            self.outbound.push_back(packet);
        }
    }

    /// Serialize every queued packet that was never sent or was last sent
    /// at least `resend_after` ago.
    pub fn write_outbound(&mut self, resend_after: Duration, now: Instant) -> Result<Vec<Bytes>> {
        let mut raw = Vec::new();
        for packet in &self.outbound {
            if let Some(sent) = self.sent_dates.get(&packet.packet_id) {
                if now.saturating_duration_since(*sent) < resend_after {
                    continue;
                }
                debug!(packet_id = packet.packet_id, "control channel: resend");
            }
            raw.push(self.serializer.serialize(packet)?);
            self.sent_dates.insert(packet.packet_id, now);
            self.pending_acks.insert(packet.packet_id);
        }
        Ok(raw)
    }

    /// Whether packets are waiting for acknowledgment.
    pub fn has_pending_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Ids sent and not yet acknowledged.
    pub fn pending_acks(&self) -> &HashSet<u32> {
        &self.pending_acks
    }

    /// Next inbound packet id to be delivered.
    pub fn next_expected(&self) -> u32 {
        self.inbound.next_expected()
    }

    /// Ids of all queued outbound packets, in order.
    pub fn outbound_ids(&self) -> Vec<u32> {
        self.outbound.iter().map(|p| p.packet_id).collect()
    }

    /// Deserialize a packet and process its piggy-backed acks.
    pub fn read_inbound(&mut self, data: &[u8]) -> Result<ControlPacket> {
        let packet = self.serializer.deserialize(data)?;
        trace!(%packet, "control channel: received");
        if let Some(ack) = &packet.ack {
            self.handle_acks(&ack.ids, ack.remote_session_id)?;
        }
        Ok(packet)
    }

    /// Feed an inbound packet to the reorder buffer and return the packets
    /// now deliverable in order.
    pub fn enqueue_inbound(&mut self, packet: ControlPacket) -> Vec<ControlPacket> {
        let mut ready = Vec::new();
        self.inbound.enqueue_inbound(packet, |p| ready.push(p));
        ready
    }

    /// Serialize `ACK_V1` packets for `ids`, at most
    /// [`MAX_ACKS_PER_PACKET`] ids each.
    pub fn write_acks(&mut self, key: u8, ids: &[u32], remote_session_id: SessionId) -> Result<Vec<Bytes>> {
        let session_id = self.session_id.ok_or(Error::MissingSessionId)?;
        ids.chunks(MAX_ACKS_PER_PACKET)
            .map(|chunk| {
                let packet = ControlPacket::ack(key, session_id, chunk.to_vec(), remote_session_id);
                trace!(%packet, "control channel: ack");
                self.serializer.serialize(&packet)
            })
            .collect()
    }

    fn handle_acks(&mut self, ids: &[u32], remote_session_id: SessionId) -> Result<()> {
        let session_id = self.session_id.ok_or(Error::MissingSessionId)?;
        if remote_session_id != session_id {
            warn!(
                expected = %session_id,
                received = %remote_session_id,
                "control channel: ack for another session"
            );
            return Err(Error::SessionMismatch);
        }

        for id in ids {
            self.pending_acks.remove(id);
            self.sent_dates.remove(id);
        }
        self.outbound.retain(|p| !ids.contains(&p.packet_id));
        Ok(())
    }

    /// Account tunnel traffic carried under this session.
    pub fn add_data_count(&mut self, inbound: u64, outbound: u64) {
        self.data_count.inbound += inbound;
        self.data_count.outbound += outbound;
    }

    /// `(inbound, outbound)` data bytes since the last reset.
    pub fn data_count(&self) -> (u64, u64) {
        (self.data_count.inbound, self.data_count.outbound)
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("session_id", &self.session_id)
            .field("remote_session_id", &self.remote_session_id)
            .field("outbound", &self.outbound.len())
            .field("pending_acks", &self.pending_acks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SeededRandom;

    fn channel() -> ControlChannel {
        let mut channel = ControlChannel::new(ControlChannelSerializer::Plain, Arc::new(SeededRandom::new(11)));
        channel.reset(true);
        channel
    }

    fn remote(channel: &ControlChannel, ids: Vec<u32>) -> Vec<u8> {
        ControlPacket::new(PacketCode::ControlV1, 0, SessionId::new([7; 8]), 0, None)
            .with_ack(ids, channel.session_id().unwrap())
            .serialize()
            .to_vec()
    }

    #[test]
    fn test_reset_generates_session_id() {
        let mut channel = ControlChannel::new(ControlChannelSerializer::Plain, Arc::new(SeededRandom::new(1)));
        assert!(channel.session_id().is_none());
        channel.reset(true);
        let first = channel.session_id().unwrap();

        channel.set_remote_session_id(SessionId::new([1; 8]));
        channel.reset(false);
        assert_eq!(channel.session_id(), Some(first));
        assert!(channel.remote_session_id().is_some());

        channel.reset(true);
        assert_ne!(channel.session_id(), Some(first));
        assert!(channel.remote_session_id().is_none());
    }

    #[test]
    #[should_panic]
    fn test_enqueue_without_session_id_panics() {
        let mut channel = ControlChannel::new(ControlChannelSerializer::Plain, Arc::new(SeededRandom::new(1)));
        channel.enqueue_outbound(PacketCode::ControlV1, 0, b"x");
    }

    #[test]
    fn test_split_into_consecutive_ids() {
        let mut channel = channel();
        channel.enqueue_outbound(PacketCode::ControlV1, 1, &[0xab; 2500]);
        assert_eq!(channel.outbound_ids(), vec![0, 1, 2]);

        let raw = channel.write_outbound(Duration::from_secs(2), Instant::now()).unwrap();
        let sizes: Vec<usize> = raw
            .iter()
            .map(|r| ControlPacket::deserialize(r).unwrap().payload.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);

        channel.enqueue_outbound(PacketCode::ControlV1, 1, b"next");
        assert_eq!(channel.outbound_ids(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_hard_reset_has_no_payload() {
        let mut channel = channel();
        channel.enqueue_outbound(PacketCode::HardResetClientV2, 0, &[]);
        let raw = channel.write_outbound(Duration::from_secs(2), Instant::now()).unwrap();
        let packet = ControlPacket::deserialize(&raw[0]).unwrap();
        assert_eq!(packet.code, PacketCode::HardResetClientV2);
        assert!(packet.payload.is_none());
    }

    #[test]
    fn test_retransmission_timing() {
        let mut channel = channel();
        channel.enqueue_outbound(PacketCode::ControlV1, 0, b"hello");
        let start = Instant::now();

        assert_eq!(channel.write_outbound(Duration::from_secs(2), start).unwrap().len(), 1);
        assert!(channel.pending_acks().contains(&0));
        assert!(channel
            .write_outbound(Duration::from_secs(2), start + Duration::from_secs(1))
            .unwrap()
            .is_empty());
        assert_eq!(
            channel
                .write_outbound(Duration::from_secs(2), start + Duration::from_secs(2))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_acks_clear_bookkeeping() {
        let mut channel = channel();
        for _ in 0..4 {
            channel.enqueue_outbound(PacketCode::ControlV1, 0, b"data");
        }
        channel.write_outbound(Duration::from_secs(2), Instant::now()).unwrap();

        let raw = remote(&channel, vec![0, 1, 2]);
        channel.read_inbound(&raw).unwrap();
        assert_eq!(channel.outbound_ids(), vec![3]);
        assert_eq!(channel.pending_acks().len(), 1);
        assert!(channel.pending_acks().contains(&3));
    }

    #[test]
    fn test_mismatched_ack_changes_nothing() {
        let mut channel = channel();
        channel.enqueue_outbound(PacketCode::ControlV1, 0, b"data");
        channel.write_outbound(Duration::from_secs(2), Instant::now()).unwrap();

        let raw = ControlPacket::ack(0, SessionId::new([7; 8]), vec![0], SessionId::new([0xee; 8])).serialize();
        assert!(matches!(channel.read_inbound(&raw), Err(Error::SessionMismatch)));
        assert_eq!(channel.outbound_ids(), vec![0]);
        assert!(channel.pending_acks().contains(&0));
    }

    #[test]
    fn test_inbound_reordering() {
        let mut channel = channel();
        let remote_sid = SessionId::new([3; 8]);
        let packet = |id| ControlPacket::new(PacketCode::ControlV1, 0, remote_sid, id, Some(Bytes::from_static(b"x")));

        assert!(channel.enqueue_inbound(packet(1)).is_empty());
        let ready = channel.enqueue_inbound(packet(0));
        assert_eq!(ready.iter().map(|p| p.packet_id).collect::<Vec<_>>(), vec![0, 1]);
        assert!(channel.enqueue_inbound(packet(0)).is_empty());
    }

    #[test]
    fn test_write_acks() {
        let mut channel = channel();
        let raw = channel.write_acks(2, &[5, 6], SessionId::new([9; 8])).unwrap();
        assert_eq!(raw.len(), 1);
        let ack = ControlPacket::deserialize(&raw[0]).unwrap();
        assert!(ack.is_ack());
        assert_eq!(ack.key, 2);
        assert_eq!(ack.session_id, channel.session_id().unwrap());
        assert_eq!(ack.ack.unwrap().ids, vec![5, 6]);

        let mut fresh = ControlChannel::new(ControlChannelSerializer::Plain, Arc::new(SeededRandom::new(1)));
        assert!(matches!(
            fresh.write_acks(0, &[1], SessionId::new([9; 8])),
            Err(Error::MissingSessionId)
        ));
    }

    #[test]
    fn test_write_acks_splits_long_lists() {
        let mut channel = channel();
        let ids: Vec<u32> = (0..10).collect();
        let raw = channel.write_acks(0, &ids, SessionId::new([9; 8])).unwrap();
        assert_eq!(raw.len(), 2);

        let acked: Vec<Vec<u32>> = raw
            .iter()
            .map(|r| ControlPacket::deserialize(r).unwrap().ack.unwrap().ids)
            .collect();
        assert_eq!(acked, vec![(0..8).collect::<Vec<u32>>(), vec![8, 9]]);

        assert!(channel.write_acks(0, &[], SessionId::new([9; 8])).unwrap().is_empty());
    }

    #[test]
    fn test_reset_clears_queues() {
        let mut channel = channel();
        channel.enqueue_outbound(PacketCode::ControlV1, 0, b"data");
        channel.write_outbound(Duration::from_secs(2), Instant::now()).unwrap();
        channel.add_data_count(10, 20);
        channel.reset(false);

        assert!(!channel.has_pending_outbound());
        assert!(channel.pending_acks().is_empty());
        assert_eq!(channel.data_count(), (0, 0));
        channel.enqueue_outbound(PacketCode::ControlV1, 0, b"again");
        assert_eq!(channel.outbound_ids(), vec![0]);
    }
}
