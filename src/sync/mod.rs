//! Gossip/sync subsystem
//!
//! Handles:
//! - Full and delta sync via request/response
//! - Live broadcast of newly created records with mesh-flood dedup
//! - Offline queuing while no peer is reachable
//! - The per-peer connection state machine and peer-list exchange

pub mod coordinator;
pub mod dedup;
pub mod engine;
pub mod protocol;
pub mod queue;

pub use coordinator::{AppCommand, PeerPhase, SyncCoordinator, TransportCommand, TransportEvent};
pub use engine::SyncEngine;
pub use protocol::WireMessage;
