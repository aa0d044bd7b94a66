//! Payloads waiting for an outgoing unidirectional stream.

use bytes::Bytes;
use std::collections::VecDeque;

/// FIFO of completed unidirectional payloads.
///
/// Echo order equals completion order. The queue is unbounded: under
/// sustained one-way traffic with no outgoing stream credit it grows
/// without limit.
#[derive(Debug, Default)]
pub struct PendingEchoQueue {
    entries: VecDeque<Bytes>,
    queued_bytes: usize,
    high_water_mark: usize,
}

impl PendingEchoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed payload.
    pub fn push_back(&mut self, payload: Bytes) {
        self.queued_bytes += payload.len();
        self.entries.push_back(payload);
        self.high_water_mark = self.high_water_mark.max(self.entries.len());
    }

    /// Take the oldest payload.
    pub fn pop_front(&mut self) -> Option<Bytes> {
        let payload = self.entries.pop_front()?;
        self.queued_bytes -= payload.len();
        Some(payload)
    }

    /// Put a payload back at the head, e.g. when its stream could not be opened.
    pub fn push_front(&mut self, payload: Bytes) {
        self.queued_bytes += payload.len();
        self.entries.push_front(payload);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes waiting.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Largest number of entries ever waiting at once.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}
