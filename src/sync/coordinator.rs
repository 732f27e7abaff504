//! Sync coordinator: the per-peer connection state machine
//!
//! Consumes transport events, drives the sync handshake and gossip
//! forwarding, and issues transport commands back. The coordinator never
//! touches libp2p types: any transport that can feed `TransportEvent`s and
//! consume `TransportCommand`s (the libp2p swarm, or a test harness) plugs
//! in here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::content::now_ms;
use crate::events::{DomainEvent, EventBus};
use crate::p2p::local::{LocalBus, LocalEnvelope};

use super::engine::{BroadcastDisposition, SyncEngine};
use super::protocol::WireMessage;
use super::queue::OfflineQueue;

/// Events a transport implementation feeds into the coordinator.
#[derive(Debug)]
pub enum TransportEvent {
    /// Discovery produced a peer identifier.
    PeerDiscovered { peer_id: String },
    /// Discovery says the peer is gone; it is no longer "known".
    PeerExpired { peer_id: String },
    ConnectionEstablished { peer_id: String },
    ConnectionClosed { peer_id: String },
    /// Inbound request; `channel` is the transport's token for the reply.
    InboundRequest {
        peer_id: String,
        request: WireMessage,
        channel: u64,
    },
    ResponseReceived {
        peer_id: String,
        response: WireMessage,
    },
    OutboundFailure { peer_id: String, error: String },
}

/// Commands the coordinator issues to the transport.
#[derive(Debug)]
pub enum TransportCommand {
    Dial { peer_id: String },
    SendRequest {
        peer_id: String,
        message: WireMessage,
    },
    SendResponse { channel: u64, message: WireMessage },
}

/// Local application commands (record publication).
#[derive(Debug)]
pub enum AppCommand {
    Publish { message: WireMessage },
}

/// Connection lifecycle for one known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Discovered,
    Connecting,
    Connected,
    Syncing,
    Steady,
    Disconnected,
}

struct PeerState {
    phase: PeerPhase,
    /// Completion time of the last successful sync with this peer; the
    /// `since` watermark of the next request. None until first contact.
    last_synced_at: Option<u64>,
    /// A SyncRequest is outstanding; the next SyncResponse completes it.
    awaiting_sync: bool,
    dial_started: Option<Instant>,
    last_dial: Option<Instant>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            phase: PeerPhase::Discovered,
            last_synced_at: None,
            awaiting_sync: false,
            dial_started: None,
            last_dial: None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.phase,
            PeerPhase::Connected | PeerPhase::Syncing | PeerPhase::Steady
        )
    }
}

pub struct SyncCoordinator {
    local_peer_id: String,
    engine: SyncEngine,
    peers: HashMap<String, PeerState>,
    queue: OfflineQueue,
    bus: EventBus,
    local_bus: LocalBus,
    reconnect_interval: Duration,
    dial_timeout: Duration,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer_id: String,
        engine: SyncEngine,
        queue: OfflineQueue,
        bus: EventBus,
        local_bus: LocalBus,
        reconnect_interval: Duration,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            local_peer_id,
            engine,
            peers: HashMap::new(),
            queue,
            bus,
            local_bus,
            reconnect_interval,
            dial_timeout,
        }
    }

    pub fn peer_phase(&self, peer_id: &str) -> Option<PeerPhase> {
        self.peers.get(peer_id).map(|p| p.phase)
    }

    pub fn known_peers(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Run the coordinator event loop until the transport event channel
    /// closes.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        commands: mpsc::Sender<TransportCommand>,
        mut app_commands: mpsc::Receiver<AppCommand>,
    ) {
        let mut local_rx = self.local_bus.subscribe();
        let mut local_open = true;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_transport_event(event, &commands).await;
                }
                Some(cmd) = app_commands.recv() => {
                    self.handle_app_command(cmd, &commands).await;
                }
                envelope = local_rx.recv(), if local_open => {
                    match envelope {
                        Ok(envelope) => self.handle_local_message(envelope).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Same-origin channel lagged, messages skipped");
                        }
                        Err(broadcast::error::RecvError::Closed) => local_open = false,
                    }
                }
                _ = tick.tick() => {
                    self.reconnect_pass(&commands).await;
                }
            }
        }
        info!("Sync coordinator stopped");
    }

    pub async fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        commands: &mpsc::Sender<TransportCommand>,
    ) {
        match event {
            TransportEvent::PeerDiscovered { peer_id } => {
                self.on_peer_discovered(peer_id, commands).await;
            }

            TransportEvent::PeerExpired { peer_id } => {
                if self.peers.remove(&peer_id).is_some() {
                    info!(%peer_id, "Peer expired, removed from sync list");
                }
            }

            TransportEvent::ConnectionEstablished { peer_id } => {
                self.on_connected(peer_id, commands).await;
            }

            TransportEvent::ConnectionClosed { peer_id } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.phase = PeerPhase::Disconnected;
                    peer.awaiting_sync = false;
                    debug!(%peer_id, "Peer disconnected");
                    self.bus.emit(DomainEvent::PeerDisconnected { peer_id });
                }
            }

            TransportEvent::InboundRequest {
                peer_id,
                request,
                channel,
            } => {
                let response = self.handle_request(&peer_id, request, commands).await;
                let _ = commands
                    .send(TransportCommand::SendResponse {
                        channel,
                        message: response,
                    })
                    .await;
            }

            TransportEvent::ResponseReceived { peer_id, response } => {
                self.handle_response(&peer_id, response).await;
            }

            TransportEvent::OutboundFailure { peer_id, error } => {
                warn!(%peer_id, %error, "Outbound request failed");
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.awaiting_sync = false;
                }
            }
        }
    }

    async fn on_peer_discovered(
        &mut self,
        peer_id: String,
        commands: &mpsc::Sender<TransportCommand>,
    ) {
        if peer_id == self.local_peer_id || self.peers.contains_key(&peer_id) {
            return;
        }
        info!(%peer_id, "New peer discovered");
        let mut state = PeerState::new();
        state.phase = PeerPhase::Connecting;
        state.dial_started = Some(Instant::now());
        state.last_dial = Some(Instant::now());
        self.peers.insert(peer_id.clone(), state);
        let _ = commands.send(TransportCommand::Dial { peer_id }).await;
    }

    /// On connect: immediately request a sync (delta if we have a watermark),
    /// flush queued offline broadcasts to the new peer, and exchange known
    /// peers to grow mesh connectivity.
    async fn on_connected(
        &mut self,
        peer_id: String,
        commands: &mpsc::Sender<TransportCommand>,
    ) {
        let peer = self.peers.entry(peer_id.clone()).or_insert_with(PeerState::new);
        peer.phase = PeerPhase::Connected;
        peer.dial_started = None;
        let since = peer.last_synced_at;
        peer.awaiting_sync = true;
        peer.phase = PeerPhase::Syncing;

        info!(%peer_id, ?since, "Peer connected, requesting sync");
        self.bus.emit(DomainEvent::PeerConnected {
            peer_id: peer_id.clone(),
        });

        let _ = commands
            .send(TransportCommand::SendRequest {
                peer_id: peer_id.clone(),
                message: WireMessage::SyncRequest { since },
            })
            .await;

        for message in self.queue.drain() {
            let _ = commands
                .send(TransportCommand::SendRequest {
                    peer_id: peer_id.clone(),
                    message,
                })
                .await;
        }

        let known: Vec<String> = self
            .peers
            .keys()
            .filter(|id| **id != peer_id)
            .cloned()
            .collect();
        if !known.is_empty() {
            let _ = commands
                .send(TransportCommand::SendRequest {
                    peer_id,
                    message: WireMessage::PeerList { data: known },
                })
                .await;
        }
    }

    /// Produce the reply for an inbound request. Broadcasts are acknowledged
    /// with an empty sync response after running the merge pipeline.
    async fn handle_request(
        &mut self,
        peer_id: &str,
        request: WireMessage,
        commands: &mpsc::Sender<TransportCommand>,
    ) -> WireMessage {
        match request {
            WireMessage::SyncRequest { since } => {
                match self.engine.build_sync_response(since).await {
                    Ok(data) => {
                        debug!(peer_id, ?since, records = data.len(), "Answering sync request");
                        WireMessage::SyncResponse { data }
                    }
                    Err(e) => {
                        warn!(peer_id, error = %e, "Failed to build sync response");
                        WireMessage::SyncResponse {
                            data: Default::default(),
                        }
                    }
                }
            }

            WireMessage::PeerList { data } => {
                self.handle_peer_list(data, commands).await;
                empty_ack()
            }

            message if message.is_broadcast() => {
                match self.engine.handle_broadcast(&message).await {
                    Ok(BroadcastDisposition::Accepted(_)) => {
                        // Flood onward so the record reaches the whole
                        // connected component; dedup stops the loop.
                        self.forward_broadcast(&message, Some(peer_id), commands).await;
                        self.local_bus.publish(&self.local_peer_id, message);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(peer_id, error = %e, "Broadcast merge failed");
                    }
                }
                empty_ack()
            }

            other => {
                warn!(peer_id, label = other.label(), "Unexpected message type as request");
                empty_ack()
            }
        }
    }

    async fn handle_response(&mut self, peer_id: &str, response: WireMessage) {
        match response {
            WireMessage::SyncResponse { data } => {
                let completes_sync = self
                    .peers
                    .get(peer_id)
                    .map(|p| p.awaiting_sync)
                    .unwrap_or(false);

                if !completes_sync && data.is_empty() {
                    // Plain acknowledgement of a broadcast or peer list
                    return;
                }

                let records = data.len();
                match self.engine.apply_batch(data).await {
                    Ok(stats) => {
                        if completes_sync {
                            if let Some(peer) = self.peers.get_mut(peer_id) {
                                peer.awaiting_sync = false;
                                peer.last_synced_at = Some(now_ms());
                                peer.phase = PeerPhase::Steady;
                            }
                            info!(
                                peer_id,
                                records,
                                merged = stats.merged(),
                                "Sync completed"
                            );
                            self.bus.emit(DomainEvent::SyncCompleted {
                                peer_id: peer_id.to_string(),
                                merged: stats.merged(),
                            });
                        }
                    }
                    Err(e) => {
                        warn!(peer_id, error = %e, "Failed to merge sync response");
                        if let Some(peer) = self.peers.get_mut(peer_id) {
                            peer.awaiting_sync = false;
                        }
                    }
                }
            }

            other => {
                warn!(peer_id, label = other.label(), "Unexpected response type");
            }
        }
    }

    async fn handle_peer_list(
        &mut self,
        peer_ids: Vec<String>,
        commands: &mpsc::Sender<TransportCommand>,
    ) {
        for peer_id in peer_ids {
            if peer_id == self.local_peer_id || self.peers.contains_key(&peer_id) {
                continue;
            }
            debug!(%peer_id, "Learned peer from exchange");
            self.on_peer_discovered(peer_id, commands).await;
        }
    }

    pub async fn handle_app_command(
        &mut self,
        command: AppCommand,
        commands: &mpsc::Sender<TransportCommand>,
    ) {
        match command {
            AppCommand::Publish { message } => {
                if let Err(e) = self.engine.publish_local(&message).await {
                    warn!(error = %e, "Failed to persist local record");
                    return;
                }
                self.local_bus.publish(&self.local_peer_id, message.clone());

                let connected = self.connected_peers();
                if connected.is_empty() {
                    self.queue.push(message);
                    debug!(queued = self.queue.len(), "No peers connected, queued broadcast");
                } else {
                    self.forward_broadcast(&message, None, commands).await;
                }
            }
        }
    }

    async fn handle_local_message(&mut self, envelope: LocalEnvelope) {
        if envelope.origin == self.local_peer_id {
            return;
        }
        if let Err(e) = self.engine.handle_broadcast(&envelope.message).await {
            warn!(origin = %envelope.origin, error = %e, "Local channel merge failed");
        }
    }

    /// Send a broadcast to every connected peer except `skip`.
    async fn forward_broadcast(
        &self,
        message: &WireMessage,
        skip: Option<&str>,
        commands: &mpsc::Sender<TransportCommand>,
    ) {
        for peer_id in self.connected_peers() {
            if skip == Some(peer_id.as_str()) {
                continue;
            }
            let _ = commands
                .send(TransportCommand::SendRequest {
                    peer_id,
                    message: message.clone(),
                })
                .await;
        }
    }

    fn connected_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, p)| p.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Periodic pass: abandon dials that exceeded the timeout, redial known
    /// peers that dropped.
    pub async fn reconnect_pass(&mut self, commands: &mpsc::Sender<TransportCommand>) {
        let now = Instant::now();
        let mut to_dial = Vec::new();

        for (peer_id, peer) in self.peers.iter_mut() {
            match peer.phase {
                PeerPhase::Connecting => {
                    if let Some(started) = peer.dial_started {
                        if now.duration_since(started) >= self.dial_timeout {
                            warn!(%peer_id, "Dial timed out");
                            peer.phase = PeerPhase::Disconnected;
                            peer.dial_started = None;
                        }
                    }
                }
                PeerPhase::Discovered | PeerPhase::Disconnected => {
                    let due = peer
                        .last_dial
                        .map(|t| now.duration_since(t) >= self.reconnect_interval)
                        .unwrap_or(true);
                    if due {
                        peer.phase = PeerPhase::Connecting;
                        peer.dial_started = Some(now);
                        peer.last_dial = Some(now);
                        to_dial.push(peer_id.clone());
                    }
                }
                _ => {}
            }
        }

        for peer_id in to_dial {
            debug!(%peer_id, "Reconnecting");
            let _ = commands.send(TransportCommand::Dial { peer_id }).await;
        }
    }
}

fn empty_ack() -> WireMessage {
    WireMessage::SyncResponse {
        data: Default::default(),
    }
}
