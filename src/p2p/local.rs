//! In-process fan-out channel
//!
//! Co-located node instances sharing one underlying store (the same-origin
//! case) notify each other through this bus instead of the wire transport.
//! Envelopes carry the origin id so instances can skip their own sends;
//! everything received here still runs through the normal dedup and gate
//! pipeline, so a message arriving from both the wire and this channel is
//! processed exactly once.

use tokio::sync::broadcast;

use crate::sync::protocol::WireMessage;

#[derive(Debug, Clone)]
pub struct LocalEnvelope {
    pub origin: String,
    pub message: WireMessage,
}

#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<LocalEnvelope>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocalEnvelope> {
        self.tx.subscribe()
    }

    /// Publish to every co-located subscriber. No subscribers is fine.
    pub fn publish(&self, origin: &str, message: WireMessage) {
        let _ = self.tx.send(LocalEnvelope {
            origin: origin.to_string(),
            message,
        });
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}
