//! Transport and discovery
//!
//! The production transport is a libp2p swarm (TCP/QUIC with mDNS and
//! Kademlia discovery); `local` is the in-process fan-out channel for
//! co-located instances. Both talk to the sync coordinator exclusively
//! through `TransportEvent`/`TransportCommand` channels, so discovery is
//! pluggable and the sync logic never sees libp2p types.

pub mod local;
pub mod protocols;
pub mod transport;

pub use local::{LocalBus, LocalEnvelope};
pub use transport::{build_swarm, AgoraSwarm};
