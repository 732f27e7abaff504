//! Node lifecycle
//!
//! One `Node` owns the whole runtime: store, sync engine, coordinator,
//! transport, and the periodic integrity check. Everything is constructed
//! here and handed down explicitly, with no ambient global state, and
//! `shutdown` tears every task and transport handle down deterministically.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::content::identity::Keystore;
use crate::content::{
    new_record_id, now_ms, Comment, Community, Post, TargetType, Tip, Vote,
};
use crate::events::{DomainEvent, EventBus};
use crate::p2p::{self, LocalBus};
use crate::store::ContentStore;
use crate::sync::coordinator::AppCommand;
use crate::sync::engine::SyncEngine;
use crate::sync::queue::OfflineQueue;
use crate::sync::{SyncCoordinator, TransportEvent, WireMessage};

pub struct Node {
    store: Arc<Mutex<ContentStore>>,
    events: EventBus,
    keystore: Arc<Keystore>,
    display_name: String,
    publisher: mpsc::Sender<AppCommand>,
    local_peer_id: String,
    tasks: Vec<JoinHandle<()>>,
    /// Kept open when no transport is running, so the coordinator's event
    /// loop stays alive for local publishes and the same-origin channel.
    _transport_events: Option<mpsc::Sender<TransportEvent>>,
}

impl Node {
    /// Start a node with its own in-process fan-out channel.
    pub async fn start(config: Config, keystore: Keystore) -> Result<Self> {
        Self::start_with_local_bus(config, keystore, LocalBus::default()).await
    }

    /// Start a node on a shared fan-out channel (co-located instances).
    pub async fn start_with_local_bus(
        config: Config,
        keystore: Keystore,
        local_bus: LocalBus,
    ) -> Result<Self> {
        let store = Arc::new(Mutex::new(
            ContentStore::open(&config.node.data_dir).context("opening content store")?,
        ));
        let events = EventBus::default();
        let mut tasks = Vec::new();

        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(256);
        let (app_tx, app_rx) = mpsc::channel(64);

        // Transport. A node that cannot bring up the swarm still runs: it
        // serves local reads/writes and the same-origin channel, and content
        // waits in the offline queue.
        let mut held_event_tx = None;
        let local_peer_id = match p2p::build_swarm(&config.p2p, &config.node.data_dir) {
            Ok(swarm) => {
                let peer_id = swarm.local_peer_id().to_string();
                info!(%peer_id, "P2P swarm built");
                tasks.push(tokio::spawn(swarm.run(event_tx, command_rx)));
                peer_id
            }
            Err(e) => {
                error!(error = %e, "Failed to build P2P swarm, running without transport");
                held_event_tx = Some(event_tx);
                format!("offline-{}", new_record_id())
            }
        };

        let engine = SyncEngine::new(
            store.clone(),
            events.clone(),
            Duration::from_millis(config.sync.dedup_ttl_ms),
        );
        let coordinator = SyncCoordinator::new(
            local_peer_id.clone(),
            engine,
            OfflineQueue::new(config.sync.offline_queue_cap),
            events.clone(),
            local_bus,
            Duration::from_secs(config.sync.reconnect_interval_secs),
            Duration::from_secs(config.sync.dial_timeout_secs),
        );
        tasks.push(tokio::spawn(coordinator.run(event_rx, command_tx, app_rx)));

        tasks.push(spawn_integrity_task(
            store.clone(),
            events.clone(),
            Duration::from_secs(config.sync.integrity_interval_secs),
        ));

        info!("Node started");
        Ok(Self {
            store,
            events,
            keystore: Arc::new(keystore),
            display_name: config.node.display_name.unwrap_or_default(),
            publisher: app_tx,
            local_peer_id,
            tasks,
            _transport_events: held_event_tx,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn store(&self) -> Arc<Mutex<ContentStore>> {
        self.store.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Queue a wire message for local persistence and broadcast.
    pub async fn publish(&self, message: WireMessage) -> Result<()> {
        self.publisher
            .send(AppCommand::Publish { message })
            .await
            .context("sync coordinator is gone")
    }

    // --- local mutations: stamp, persist, broadcast ---

    pub async fn create_community(&self, name: &str, description: &str) -> Result<Community> {
        let mut community = Community {
            id: new_record_id(),
            name: name.to_string(),
            description: description.to_string(),
            creator: String::new(),
            created_at: now_ms(),
            content_hash: String::new(),
            signature: String::new(),
        };
        self.keystore
            .stamp_community(&mut community)
            .context("stamping community")?;
        self.publish(WireMessage::NewCommunity {
            data: community.clone(),
        })
        .await?;
        Ok(community)
    }

    pub async fn create_post(&self, community_id: &str, title: &str, body: &str) -> Result<Post> {
        let mut post = Post {
            id: new_record_id(),
            title: title.to_string(),
            body: body.to_string(),
            author: String::new(),
            author_display_name: self.display_name.clone(),
            community_id: community_id.to_string(),
            created_at: now_ms(),
            content_hash: String::new(),
            signature: String::new(),
        };
        self.keystore.stamp_post(&mut post).context("stamping post")?;
        self.publish(WireMessage::NewPost { data: post.clone() }).await?;
        Ok(post)
    }

    pub async fn create_comment(
        &self,
        post_id: &str,
        parent_id: Option<String>,
        body: &str,
    ) -> Result<Comment> {
        let mut comment = Comment {
            id: new_record_id(),
            body: body.to_string(),
            author: String::new(),
            author_display_name: self.display_name.clone(),
            post_id: post_id.to_string(),
            parent_id,
            created_at: now_ms(),
            content_hash: String::new(),
            signature: String::new(),
        };
        self.keystore
            .stamp_comment(&mut comment)
            .context("stamping comment")?;
        self.publish(WireMessage::NewComment {
            data: comment.clone(),
        })
        .await?;
        Ok(comment)
    }

    pub async fn cast_vote(
        &self,
        target_id: &str,
        target_type: TargetType,
        value: i32,
    ) -> Result<Vote> {
        let mut vote = Vote {
            id: new_record_id(),
            target_id: target_id.to_string(),
            target_type,
            voter: String::new(),
            value,
            created_at: now_ms(),
            signature: String::new(),
        };
        self.keystore.stamp_vote(&mut vote).context("stamping vote")?;
        self.publish(WireMessage::Vote { data: vote.clone() }).await?;
        Ok(vote)
    }

    /// Record a tip whose payment already settled on the external chain.
    pub async fn record_tip(
        &self,
        to: &str,
        amount_raw: &str,
        block_hash: &str,
        target_id: &str,
        target_type: TargetType,
    ) -> Result<Tip> {
        let mut tip = Tip {
            id: new_record_id(),
            from: String::new(),
            to: to.to_string(),
            amount_raw: amount_raw.to_string(),
            block_hash: block_hash.to_string(),
            target_id: target_id.to_string(),
            target_type,
            created_at: now_ms(),
            signature: String::new(),
        };
        self.keystore.stamp_tip(&mut tip).context("stamping tip")?;
        self.publish(WireMessage::Tip { data: tip.clone() }).await?;
        Ok(tip)
    }

    /// Stop every task and drop all transport handles.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Node stopped");
    }
}

fn spawn_integrity_task(
    store: Arc<Mutex<ContentStore>>,
    events: EventBus,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;
        loop {
            interval.tick().await;
            let result = {
                let store = store.lock().await;
                store.integrity_check()
            };
            match result {
                Ok(issues) if issues.is_empty() => {}
                Ok(issues) => {
                    let issues: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
                    error!(?issues, "Store integrity check failed");
                    events.emit(DomainEvent::IntegrityAlert { issues });
                }
                Err(e) => error!(error = %e, "Integrity check could not run"),
            }
        }
    })
}
