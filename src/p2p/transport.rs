//! libp2p transport configuration
//!
//! Builds the AgoraSwarm with multi-transport support (QUIC + TCP/Noise/Yamux),
//! mDNS discovery, Kademlia DHT, and request-response for the sync protocol.
//! The swarm event loop translates libp2p events into `TransportEvent`s and
//! consumes `TransportCommand`s, so everything above it stays
//! transport-agnostic.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{
    identity, kad, mdns, noise, request_response, tcp, yamux, Multiaddr, PeerId, StreamProtocol,
    Swarm, SwarmBuilder,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::P2pConfig;
use crate::sync::coordinator::{TransportCommand, TransportEvent};
use crate::sync::protocol::WireMessage;

use super::protocols::{SyncCodec, SYNC_PROTOCOL};

/// Combined libp2p behaviour for agora nodes.
#[derive(NetworkBehaviour)]
pub struct AgoraBehaviour {
    pub request_response: request_response::Behaviour<SyncCodec>,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: libp2p::identify::Behaviour,
}

/// Wrapper around the libp2p Swarm with agora-specific helpers.
pub struct AgoraSwarm {
    swarm: Swarm<AgoraBehaviour>,
    local_peer_id: PeerId,
    /// Response channels for inbound requests, keyed by the token handed to
    /// the coordinator.
    pending_responses: HashMap<u64, request_response::ResponseChannel<WireMessage>>,
    next_channel_token: u64,
}

impl AgoraSwarm {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Run the swarm event loop: forward events to the coordinator, apply
    /// commands from it. Returns when the command channel closes.
    pub async fn run(
        mut self,
        event_tx: mpsc::Sender<TransportEvent>,
        mut commands: mpsc::Receiver<TransportCommand>,
    ) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event, &event_tx).await;
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
            }
        }
        info!("Transport event loop stopped");
    }

    fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Dial { peer_id } => {
                let Ok(peer_id) = peer_id.parse::<PeerId>() else {
                    warn!(%peer_id, "Cannot dial unparseable peer id");
                    return;
                };
                if let Err(e) = self.swarm.dial(peer_id) {
                    debug!(%peer_id, error = %e, "Dial attempt rejected");
                }
            }

            TransportCommand::SendRequest { peer_id, message } => {
                let Ok(peer_id) = peer_id.parse::<PeerId>() else {
                    warn!(%peer_id, "Cannot send to unparseable peer id");
                    return;
                };
                self.swarm
                    .behaviour_mut()
                    .request_response
                    .send_request(&peer_id, message);
            }

            TransportCommand::SendResponse { channel, message } => {
                match self.pending_responses.remove(&channel) {
                    Some(response_channel) => {
                        if self
                            .swarm
                            .behaviour_mut()
                            .request_response
                            .send_response(response_channel, message)
                            .is_err()
                        {
                            debug!(channel, "Response channel already closed");
                        }
                    }
                    None => warn!(channel, "Unknown response channel token"),
                }
            }
        }
    }

    async fn handle_swarm_event(
        &mut self,
        event: libp2p::swarm::SwarmEvent<AgoraBehaviourEvent>,
        event_tx: &mpsc::Sender<TransportEvent>,
    ) {
        use libp2p::swarm::SwarmEvent as LibSwarmEvent;

        match event {
            // mDNS discovery
            LibSwarmEvent::Behaviour(AgoraBehaviourEvent::Mdns(mdns::Event::Discovered(
                peers,
            ))) => {
                for (peer_id, addr) in peers {
                    debug!(%peer_id, %addr, "mDNS: peer discovered");
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                    let _ = event_tx
                        .send(TransportEvent::PeerDiscovered {
                            peer_id: peer_id.to_string(),
                        })
                        .await;
                }
            }
            LibSwarmEvent::Behaviour(AgoraBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _addr) in peers {
                    debug!(%peer_id, "mDNS: peer expired");
                    let _ = event_tx
                        .send(TransportEvent::PeerExpired {
                            peer_id: peer_id.to_string(),
                        })
                        .await;
                }
            }

            // Request-response events
            LibSwarmEvent::Behaviour(AgoraBehaviourEvent::RequestResponse(
                request_response::Event::Message { peer, message },
            )) => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let token = self.next_channel_token;
                    self.next_channel_token = self.next_channel_token.wrapping_add(1);
                    self.pending_responses.insert(token, channel);
                    let _ = event_tx
                        .send(TransportEvent::InboundRequest {
                            peer_id: peer.to_string(),
                            request,
                            channel: token,
                        })
                        .await;
                }
                request_response::Message::Response { response, .. } => {
                    let _ = event_tx
                        .send(TransportEvent::ResponseReceived {
                            peer_id: peer.to_string(),
                            response,
                        })
                        .await;
                }
            },
            LibSwarmEvent::Behaviour(AgoraBehaviourEvent::RequestResponse(
                request_response::Event::OutboundFailure { peer, error, .. },
            )) => {
                let _ = event_tx
                    .send(TransportEvent::OutboundFailure {
                        peer_id: peer.to_string(),
                        error: error.to_string(),
                    })
                    .await;
            }
            LibSwarmEvent::Behaviour(AgoraBehaviourEvent::RequestResponse(
                request_response::Event::InboundFailure { peer, error, .. },
            )) => {
                debug!(%peer, %error, "Inbound request failed");
            }

            // Identify events (log only)
            LibSwarmEvent::Behaviour(AgoraBehaviourEvent::Identify(
                libp2p::identify::Event::Received { peer_id, info },
            )) => {
                debug!(%peer_id, agent = %info.agent_version, "Identified peer");
            }

            // Kademlia events (log only)
            LibSwarmEvent::Behaviour(AgoraBehaviourEvent::Kademlia(event)) => {
                debug!(?event, "Kademlia event");
            }

            // Connection events
            LibSwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening on");
            }
            LibSwarmEvent::ConnectionEstablished {
                peer_id,
                num_established,
                ..
            } => {
                debug!(%peer_id, "Connection established");
                if num_established.get() == 1 {
                    let _ = event_tx
                        .send(TransportEvent::ConnectionEstablished {
                            peer_id: peer_id.to_string(),
                        })
                        .await;
                }
            }
            LibSwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                debug!(%peer_id, "Connection closed");
                if num_established == 0 {
                    let _ = event_tx
                        .send(TransportEvent::ConnectionClosed {
                            peer_id: peer_id.to_string(),
                        })
                        .await;
                }
            }

            _ => {}
        }
    }
}

/// Build the libp2p swarm from config.
///
/// Creates or loads an Ed25519 identity keypair, configures transports,
/// and constructs the composite behaviour.
pub fn build_swarm(config: &P2pConfig, data_dir: &Path) -> Result<AgoraSwarm> {
    // Load or generate identity keypair
    let keypair = load_or_generate_keypair(data_dir)?;
    let local_peer_id = PeerId::from(keypair.public());
    info!(%local_peer_id, "Node identity");

    let mdns_enabled = config.mdns_enabled;

    // Build the swarm
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .context("TCP transport")?
        .with_quic()
        .with_behaviour(|key| {
            // Request-response for the sync protocol
            let sync_protocol = StreamProtocol::new(SYNC_PROTOCOL);
            let rr_config = request_response::Config::default()
                .with_request_timeout(Duration::from_secs(30));
            let request_response = request_response::Behaviour::with_codec(
                SyncCodec,
                [(sync_protocol, request_response::ProtocolSupport::Full)],
                rr_config,
            );

            // mDNS for local peer discovery (optional)
            let mdns = Toggle::from(if mdns_enabled {
                Some(
                    mdns::tokio::Behaviour::new(
                        mdns::Config::default(),
                        key.public().to_peer_id(),
                    )
                    .expect("mDNS behaviour"),
                )
            } else {
                None
            });

            // Kademlia DHT
            let store = kad::store::MemoryStore::new(key.public().to_peer_id());
            let mut kademlia = kad::Behaviour::new(key.public().to_peer_id(), store);
            kademlia.set_mode(Some(kad::Mode::Server));

            // Identify protocol
            let identify = libp2p::identify::Behaviour::new(
                libp2p::identify::Config::new("/agora/id/1.0.0".to_string(), key.public())
                    .with_agent_version(format!("agora-node/{}", env!("CARGO_PKG_VERSION"))),
            );

            AgoraBehaviour {
                request_response,
                mdns,
                kademlia,
                identify,
            }
        })
        .context("swarm behaviour")?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    let mut agora_swarm = AgoraSwarm {
        swarm,
        local_peer_id,
        pending_responses: HashMap::new(),
        next_channel_token: 0,
    };

    // Start listening on configured addresses
    for addr_str in &config.listen_addrs {
        let addr: Multiaddr = addr_str
            .parse()
            .with_context(|| format!("invalid listen address: {}", addr_str))?;
        agora_swarm
            .swarm
            .listen_on(addr)
            .with_context(|| format!("failed to listen on {}", addr_str))?;
    }

    // Add bootstrap nodes to Kademlia
    for node_str in &config.bootstrap_nodes {
        if let Some((peer_id, addr)) = parse_peer_addr(node_str) {
            agora_swarm
                .swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr);
            info!(%peer_id, "Added bootstrap node");
        } else {
            warn!(addr = %node_str, "Invalid bootstrap node address, skipping");
        }
    }

    Ok(agora_swarm)
}

/// Load an Ed25519 keypair from disk, or generate and persist a new one.
///
/// The keypair is stored as protobuf-encoded bytes at `{data_dir}/node_key`.
fn load_or_generate_keypair(data_dir: &Path) -> Result<identity::Keypair> {
    let key_path = data_dir.join("node_key");

    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("reading node key")?;
        let keypair =
            identity::Keypair::from_protobuf_encoding(&bytes).context("decoding node key")?;
        info!("Loaded existing node identity");
        Ok(keypair)
    } else {
        let keypair = identity::Keypair::generate_ed25519();
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let bytes = keypair
            .to_protobuf_encoding()
            .context("encoding node key")?;
        std::fs::write(&key_path, &bytes).context("writing node key")?;
        info!("Generated new node identity");
        Ok(keypair)
    }
}

/// Parse a multiaddr string like `/ip4/1.2.3.4/tcp/4201/p2p/12D3Koo...`
/// into a (PeerId, Multiaddr) pair.
fn parse_peer_addr(addr_str: &str) -> Option<(PeerId, Multiaddr)> {
    let addr: Multiaddr = addr_str.parse().ok()?;
    let peer_id = addr.iter().find_map(|p| {
        if let libp2p::multiaddr::Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })?;
    // Kademlia wants the addr without the /p2p/ suffix
    let addr_without_p2p: Multiaddr = addr
        .iter()
        .filter(|p| !matches!(p, libp2p::multiaddr::Protocol::P2p(_)))
        .collect();
    Some((peer_id, addr_without_p2p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_addr() {
        let peer_id = PeerId::random();
        let addr_str = format!("/ip4/10.0.0.1/tcp/4201/p2p/{}", peer_id);
        let (parsed_id, addr) = parse_peer_addr(&addr_str).unwrap();
        assert_eq!(parsed_id, peer_id);
        assert_eq!(addr.to_string(), "/ip4/10.0.0.1/tcp/4201");
    }

    #[test]
    fn test_parse_peer_addr_without_peer_id() {
        assert!(parse_peer_addr("/ip4/10.0.0.1/tcp/4201").is_none());
        assert!(parse_peer_addr("garbage").is_none());
    }

    #[test]
    fn test_keypair_persistence_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = load_or_generate_keypair(dir.path()).unwrap();
        let second = load_or_generate_keypair(dir.path()).unwrap();
        assert_eq!(
            PeerId::from(first.public()),
            PeerId::from(second.public())
        );
    }
}
