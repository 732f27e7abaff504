//! Offline broadcast queue
//!
//! While no remote peer is connected, outbound broadcasts are buffered here
//! and replayed to the next peer that connects: an isolated writer's
//! content is delayed, not lost.

use std::collections::VecDeque;

use tracing::debug;

use super::protocol::WireMessage;

pub const DEFAULT_CAP: usize = 1000;

pub struct OfflineQueue {
    items: VecDeque<WireMessage>,
    cap: usize,
}

impl OfflineQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::new(),
            cap: cap.max(2),
        }
    }

    /// Append a message, trimming to the most recent half on overflow.
    pub fn push(&mut self, message: WireMessage) {
        self.items.push_back(message);
        if self.items.len() > self.cap {
            let keep = self.cap / 2;
            let dropped = self.items.len() - keep;
            self.items.drain(..dropped);
            debug!(dropped, keep, "Offline queue overflow, trimmed oldest");
        }
    }

    /// Take everything queued, oldest first.
    pub fn drain(&mut self) -> Vec<WireMessage> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAP)
    }
}
