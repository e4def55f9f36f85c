//! PreEventRingBuffer, half of C8 (spec §4.8).

use std::collections::VecDeque;

use crate::types::RingBufferEntry;

/// Fixed-capacity FIFO of the most recent frames, drained in order when a
/// recording trigger needs pre-roll footage. Capacity is `preRollSeconds
/// * fps` and is set once at construction; cameras with different fps/
/// pre-roll settings each get their own buffer.
pub struct PreEventRingBuffer {
    capacity: usize,
    entries: VecDeque<RingBufferEntry>,
}

impl PreEventRingBuffer {
    pub fn new(pre_roll_seconds: u32, fps: u32) -> Self {
        let capacity = (pre_roll_seconds * fps).max(1) as usize;
        PreEventRingBuffer {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a post-analysis frame, dropping the oldest if at capacity.
    pub fn push(&mut self, entry: RingBufferEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain the buffer in FIFO (oldest-first) order for pre-roll writeout.
    /// Leaves the buffer empty; a trigger only needs the backlog once.
    pub fn drain_fifo(&mut self) -> Vec<RingBufferEntry> {
        self.entries.drain(..).collect()
    }
}
