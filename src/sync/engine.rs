//! Sync engine core
//!
//! The transport-agnostic half of the gossip protocol: every inbound payload
//! runs dedup → validator → signature gate → content-hash check → store
//! merge, and every sync request is answered from a snapshot or delta read.
//! The coordinator owns the peer bookkeeping; this type owns the pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::content::{address, identity, now_ms, RecordBatch};
use crate::events::{DomainEvent, EventBus};
use crate::store::{ContentStore, MergeStats, StoreError};
use crate::validate;

use super::dedup::SeenSet;
use super::protocol::WireMessage;

/// What became of an inbound broadcast.
#[derive(Debug)]
pub enum BroadcastDisposition {
    /// Seen inside the dedup window; no work done.
    Duplicate,
    /// Survived the gates and changed the store.
    Accepted(MergeStats),
    /// Validated away, failed a gate, or was already present.
    Ignored,
}

pub struct SyncEngine {
    store: Arc<Mutex<ContentStore>>,
    bus: EventBus,
    seen: SeenSet,
}

impl SyncEngine {
    pub fn new(store: Arc<Mutex<ContentStore>>, bus: EventBus, dedup_ttl: Duration) -> Self {
        Self {
            store,
            bus,
            seen: SeenSet::new(dedup_ttl),
        }
    }

    pub fn store(&self) -> Arc<Mutex<ContentStore>> {
        self.store.clone()
    }

    /// Answer a `SyncRequest`: full snapshot on first contact, otherwise
    /// only records created strictly after the peer's watermark.
    pub async fn build_sync_response(
        &self,
        since: Option<u64>,
    ) -> Result<RecordBatch, StoreError> {
        let store = self.store.lock().await;
        match since {
            Some(watermark) => store.records_since(watermark),
            None => store.snapshot(),
        }
    }

    /// Run a batch through the full inbound pipeline and merge it.
    ///
    /// Integrity violations drop the single offending record, never the
    /// batch; the merge itself is one atomic transaction.
    pub async fn apply_batch(&self, batch: RecordBatch) -> Result<MergeStats, StoreError> {
        let batch = validate::filter_batch(batch, now_ms());
        let batch = gate_batch(batch);
        if batch.is_empty() {
            return Ok(MergeStats::default());
        }

        let stats = {
            let mut store = self.store.lock().await;
            store.merge_batch(&batch)?
        };
        for (kind, id) in &stats.accepted {
            self.bus.emit(DomainEvent::RecordAccepted {
                kind: *kind,
                id: id.clone(),
            });
        }
        Ok(stats)
    }

    /// Handle a live gossip message (from the wire or the in-process
    /// channel). Dedup happens before any validation or storage work.
    pub async fn handle_broadcast(
        &mut self,
        message: &WireMessage,
    ) -> Result<BroadcastDisposition, StoreError> {
        let Some(key) = message.dedup_key() else {
            return Ok(BroadcastDisposition::Ignored);
        };
        if !self.seen.first_sighting(&key) {
            debug!(key, "Duplicate broadcast suppressed");
            return Ok(BroadcastDisposition::Duplicate);
        }
        let Some(batch) = message.to_batch() else {
            return Ok(BroadcastDisposition::Ignored);
        };
        let stats = self.apply_batch(batch).await?;
        if stats.merged() > 0 {
            Ok(BroadcastDisposition::Accepted(stats))
        } else {
            Ok(BroadcastDisposition::Ignored)
        }
    }

    /// Persist a locally-created record before it is broadcast.
    ///
    /// The dedup key is marked seen so the echo of our own message (from the
    /// in-process channel or a fast peer re-flood) is suppressed.
    pub async fn publish_local(
        &mut self,
        message: &WireMessage,
    ) -> Result<MergeStats, StoreError> {
        if let Some(key) = message.dedup_key() {
            self.seen.first_sighting(&key);
        }
        match message.to_batch() {
            Some(batch) => self.apply_batch(batch).await,
            None => Ok(MergeStats::default()),
        }
    }
}

/// The hard gate: signatures and content hashes. Anything non-anonymous
/// without a verifying signature is rejected; a claimed digest that does not
/// recompute is rejected.
fn gate_batch(batch: RecordBatch) -> RecordBatch {
    let before = batch.len();
    let gated = RecordBatch {
        communities: batch
            .communities
            .into_iter()
            .filter(|c| {
                identity::verify_community(c) && address::verify_content_hash(c, &c.content_hash)
            })
            .collect(),
        posts: batch
            .posts
            .into_iter()
            .filter(|p| identity::verify_post(p) && address::verify_content_hash(p, &p.content_hash))
            .collect(),
        comments: batch
            .comments
            .into_iter()
            .filter(|c| {
                identity::verify_comment(c) && address::verify_content_hash(c, &c.content_hash)
            })
            .collect(),
        votes: batch.votes.into_iter().filter(identity::verify_vote).collect(),
        tips: batch.tips.into_iter().filter(identity::verify_tip).collect(),
    };
    let dropped = before - gated.len();
    if dropped > 0 {
        debug!(dropped, "Signature/content-hash gate dropped records");
    }
    gated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::identity::Keystore;
    use crate::content::{new_record_id, Post, ANONYMOUS};

    fn engine() -> SyncEngine {
        let store = Arc::new(Mutex::new(ContentStore::open_in_memory().unwrap()));
        SyncEngine::new(store, EventBus::default(), Duration::from_secs(30))
    }

    fn anonymous_post(id: &str) -> Post {
        Post {
            id: id.into(),
            title: "t".into(),
            body: "b".into(),
            author: ANONYMOUS.into(),
            author_display_name: String::new(),
            community_id: "c".into(),
            created_at: now_ms(),
            content_hash: String::new(),
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn test_signed_post_accepted_forged_rejected() {
        let engine = engine();
        let keystore = Keystore::generate();

        let mut good = anonymous_post(&new_record_id());
        keystore.stamp_post(&mut good).unwrap();

        let mut forged = anonymous_post(&new_record_id());
        forged.author = keystore.address();
        forged.signature = "deadbeef".into();

        let batch = RecordBatch {
            posts: vec![good.clone(), forged.clone()],
            ..Default::default()
        };
        let stats = engine.apply_batch(batch).await.unwrap();
        assert_eq!(stats.merged(), 1);

        let store = engine.store();
        let store = store.lock().await;
        assert!(store.get_post(&good.id).unwrap().is_some());
        assert!(store.get_post(&forged.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_hash_rejected() {
        let engine = engine();
        let mut post = anonymous_post(&new_record_id());
        post.content_hash = address::content_hash(&post).unwrap();
        post.body = "tampered".into();

        let batch = RecordBatch {
            posts: vec![post],
            ..Default::default()
        };
        let stats = engine.apply_batch(batch).await.unwrap();
        assert_eq!(stats.merged(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_dedup_single_write_single_event() {
        let mut engine = engine();
        let mut rx = engine.bus.subscribe();
        let message = WireMessage::NewPost {
            data: anonymous_post("p-dup"),
        };

        let first = engine.handle_broadcast(&message).await.unwrap();
        assert!(matches!(first, BroadcastDisposition::Accepted(_)));
        let second = engine.handle_broadcast(&message).await.unwrap();
        assert!(matches!(second, BroadcastDisposition::Duplicate));

        // Exactly one downstream notification
        assert!(matches!(
            rx.try_recv().unwrap(),
            DomainEvent::RecordAccepted { .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_own_publish_echo_suppressed() {
        let mut engine = engine();
        let message = WireMessage::NewPost {
            data: anonymous_post("p-own"),
        };
        engine.publish_local(&message).await.unwrap();
        let echo = engine.handle_broadcast(&message).await.unwrap();
        assert!(matches!(echo, BroadcastDisposition::Duplicate));
    }

    #[tokio::test]
    async fn test_sync_response_full_vs_delta() {
        let engine = engine();
        let mut early = anonymous_post("p-early");
        early.created_at = 1_000;
        let mut late = anonymous_post("p-late");
        late.created_at = 2_000;
        engine
            .apply_batch(RecordBatch {
                posts: vec![early, late],
                ..Default::default()
            })
            .await
            .unwrap();

        let full = engine.build_sync_response(None).await.unwrap();
        assert_eq!(full.posts.len(), 2);

        let delta = engine.build_sync_response(Some(1_000)).await.unwrap();
        assert_eq!(delta.posts.len(), 1);
        assert_eq!(delta.posts[0].id, "p-late");
    }
}
