//! Domain event bus
//!
//! The store and sync layers emit typed events; consumers (a UI layer, the
//! dashboard, tests) subscribe independently. The core never calls back into
//! a renderer.

use tokio::sync::broadcast;

use crate::content::RecordKind;

#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// A record passed validation and the gates and was persisted.
    RecordAccepted { kind: RecordKind, id: String },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    /// A sync response from a peer was merged.
    SyncCompleted { peer_id: String, merged: usize },
    /// The periodic self-check found tables it cannot read back.
    IntegrityAlert { issues: Vec<String> },
}

/// Cheaply cloneable fan-out handle.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
