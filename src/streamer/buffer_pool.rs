//! Bounded output-buffer pool
//!
//! At most one buffer is being filled at a time. Bytes accumulate in a
//! staging area until the slot is submitted to the output queue, which rents
//! it until its completion callback releases it. The in-use bitmap plus the
//! modular fill cursor give strict FIFO submission order.

use crate::parser::PacketDescription;

/// Cap on per-buffer packet descriptors for variable-bitrate data.
pub(crate) const MAX_PACKET_DESCS: usize = 512;

pub(crate) struct BufferPool {
    count: usize,
    capacity: usize,
    inuse: Vec<bool>,
    buffers_used: usize,
    fill_index: usize,
    bytes_filled: usize,
    packets_filled: usize,
    staging: Vec<u8>,
    descriptors: Vec<PacketDescription>,
}

impl BufferPool {
    pub(crate) fn new(count: usize, capacity: usize) -> Self {
        assert!(count > 0 && capacity > 0);
        Self {
            count,
            capacity,
            inuse: vec![false; count],
            buffers_used: 0,
            fill_index: 0,
            bytes_filled: 0,
            packets_filled: 0,
            staging: vec![0; capacity],
            descriptors: Vec::with_capacity(MAX_PACKET_DESCS),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn buffers_used(&self) -> usize {
        self.buffers_used
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity - self.bytes_filled
    }

    pub(crate) fn fill_buffer_inuse(&self) -> bool {
        self.inuse[self.fill_index]
    }

    pub(crate) fn has_partial_fill(&self) -> bool {
        self.bytes_filled > 0
    }

    pub(crate) fn descriptors_full(&self) -> bool {
        self.packets_filled >= MAX_PACKET_DESCS
    }

    pub(crate) fn all_free(&self) -> bool {
        self.buffers_used == 0
    }

    /// Copy one packet into the fill buffer and record its descriptor.
    /// The caller has already checked capacity.
    pub(crate) fn write_packet(&mut self, packet: &[u8], frames: u32) {
        debug_assert!(!self.inuse[self.fill_index]);
        debug_assert!(packet.len() <= self.remaining());
        debug_assert!(self.packets_filled < MAX_PACKET_DESCS);

        let start = self.bytes_filled;
        self.staging[start..start + packet.len()].copy_from_slice(packet);
        self.descriptors.push(PacketDescription {
            start_offset: start as u64,
            byte_size: packet.len() as u32,
            frames,
        });
        self.bytes_filled += packet.len();
        self.packets_filled += 1;
    }

    /// Copy as much constant-bitrate data as fits; returns the byte count
    /// actually copied.
    pub(crate) fn write_bytes(&mut self, data: &[u8]) -> usize {
        debug_assert!(!self.inuse[self.fill_index]);

        let n = data.len().min(self.remaining());
        let start = self.bytes_filled;
        self.staging[start..start + n].copy_from_slice(&data[..n]);
        self.bytes_filled += n;
        n
    }

    /// Mark the fill buffer rented and expose its contents for submission.
    pub(crate) fn take_filled(&mut self) -> (usize, &[u8], &[PacketDescription]) {
        assert!(!self.inuse[self.fill_index]);
        self.inuse[self.fill_index] = true;
        self.buffers_used += 1;
        (
            self.fill_index,
            &self.staging[..self.bytes_filled],
            &self.descriptors[..],
        )
    }

    /// Move the fill cursor to the next slot and reset the fill state.
    pub(crate) fn advance(&mut self) {
        self.fill_index = (self.fill_index + 1) % self.count;
        self.bytes_filled = 0;
        self.packets_filled = 0;
        self.descriptors.clear();
    }

    /// Completion callback for `index`; false when the slot was not rented
    /// (stale callback after a reset).
    pub(crate) fn release(&mut self, index: usize) -> bool {
        if index >= self.count || !self.inuse[index] {
            return false;
        }
        self.inuse[index] = false;
        self.buffers_used -= 1;
        true
    }

    /// Return every buffer and clear the fill state. Used after a hard stop,
    /// which hands all rented buffers back without completion callbacks.
    pub(crate) fn reset(&mut self) {
        for slot in &mut self.inuse {
            *slot = false;
        }
        self.buffers_used = 0;
        self.bytes_filled = 0;
        self.packets_filled = 0;
        self.descriptors.clear();
    }

    #[cfg(test)]
    pub(crate) fn inuse_count(&self) -> usize {
        self.inuse.iter().filter(|&&b| b).count()
    }

    #[cfg(test)]
    pub(crate) fn fill_index(&self) -> usize {
        self.fill_index
    }
}
