use std::collections::BTreeMap;

use crate::protocol::ControlPacket;

/// Anything carrying a sequential packet id.
pub trait PacketIdentified {
    /// Sequential id of this packet.
    fn packet_id(&self) -> u32;
}

impl PacketIdentified for ControlPacket {
    fn packet_id(&self) -> u32 {
        self.packet_id
    }
}

/// Inbound reorder buffer releasing packets strictly in id order.
#[derive(Debug, Clone)]
pub struct ReorderBuffer<T> {
    queue: BTreeMap<u32, T>,
    next_expected: u32,
    first_id: u32,
}

impl<T: PacketIdentified> ReorderBuffer<T> {
    /// Create a buffer expecting `first_id` next.
    pub fn new(first_id: u32) -> Self {
        Self {
            queue: BTreeMap::new(),
            next_expected: first_id,
            first_id,
        }
    }

    /// Insert `packet` and hand every packet that is now in order to
    /// `handle`.
    ///
    /// Ids below the next expected one are stale duplicates and dropped. A
    /// gap keeps everything after it buffered.
    pub fn enqueue_inbound(&mut self, packet: T, mut handle: impl FnMut(T)) {
        let id = packet.packet_id();
        if id < self.next_expected {
            return;
        }
        self.queue.entry(id).or_insert(packet);

        while let Some(packet) = self.queue.remove(&self.next_expected) {
            handle(packet);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
    }

    /// Id expected next.
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Number of out-of-order packets held.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything and expect the first id again.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.next_expected = self.first_id;
    }
}
