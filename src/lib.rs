//! agora-node - peer-to-peer replicated community board node
//!
//! Independent nodes create signed, content-addressed records (communities,
//! posts, comments, votes, tips) and propagate them over an unreliable,
//! dynamically-discovered mesh, converging on a shared dataset without a
//! central coordinator.
//!
//! ## Subsystems
//!
//! - **Content**: record types, content addressing, signature verification
//! - **Store**: SQLite-backed replicated store with idempotent upserts and
//!   last-writer-wins vote resolution
//! - **Sync**: gossip protocol (full/delta sync, broadcast dedup, offline
//!   queuing) and the per-peer connection state machine
//! - **P2P**: libp2p transport (TCP/QUIC, mDNS, Kademlia, request-response)
//!   plus an in-process fan-out channel for co-located instances

pub mod archive;
pub mod config;
pub mod content;
pub mod events;
pub mod node;
pub mod p2p;
pub mod store;
pub mod sync;
pub mod validate;

pub use config::Config;
pub use events::{DomainEvent, EventBus};
pub use node::Node;
