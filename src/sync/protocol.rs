//! Sync wire protocol
//!
//! A closed tagged union; every inbound payload is parsed into a variant
//! before any business logic sees it. The JSON shape keeps the original
//! SCREAMING_SNAKE tag names so exports and cross-implementation peers stay
//! interoperable; on the wire the messages travel as MessagePack.

use serde::{Deserialize, Serialize};

use crate::content::{Comment, Community, Post, RecordBatch, Tip, Vote};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// Request records; `since` absent means full sync.
    SyncRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },
    SyncResponse { data: RecordBatch },
    NewCommunity { data: Community },
    NewPost { data: Post },
    NewComment { data: Comment },
    Vote { data: Vote },
    Tip { data: Tip },
    /// Known-peer identifiers, exchanged to grow mesh connectivity.
    PeerList { data: Vec<String> },
}

impl WireMessage {
    /// Content-identity key for broadcast deduplication.
    ///
    /// Sync request/response are exempt: they are point-to-point and
    /// idempotent in the store layer anyway. Peer lists are cheap and
    /// change over time, so they are not deduplicated either.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            WireMessage::NewCommunity { data } => Some(format!("community:{}", data.id)),
            WireMessage::NewPost { data } => Some(format!("post:{}", data.id)),
            WireMessage::NewComment { data } => Some(format!("comment:{}", data.id)),
            WireMessage::Vote { data } => {
                Some(format!("vote:{}:{}", data.target_id, data.voter))
            }
            WireMessage::Tip { data } => Some(format!("tip:{}", data.id)),
            WireMessage::SyncRequest { .. }
            | WireMessage::SyncResponse { .. }
            | WireMessage::PeerList { .. } => None,
        }
    }

    /// True for the record-carrying gossip variants.
    pub fn is_broadcast(&self) -> bool {
        self.dedup_key().is_some()
    }

    /// Wrap the carried record (if any) into a single-record batch for the
    /// shared merge pipeline.
    pub fn to_batch(&self) -> Option<RecordBatch> {
        let mut batch = RecordBatch::default();
        match self {
            WireMessage::NewCommunity { data } => batch.communities.push(data.clone()),
            WireMessage::NewPost { data } => batch.posts.push(data.clone()),
            WireMessage::NewComment { data } => batch.comments.push(data.clone()),
            WireMessage::Vote { data } => batch.votes.push(data.clone()),
            WireMessage::Tip { data } => batch.tips.push(data.clone()),
            _ => return None,
        }
        Some(batch)
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            WireMessage::SyncRequest { .. } => "SYNC_REQUEST",
            WireMessage::SyncResponse { .. } => "SYNC_RESPONSE",
            WireMessage::NewCommunity { .. } => "NEW_COMMUNITY",
            WireMessage::NewPost { .. } => "NEW_POST",
            WireMessage::NewComment { .. } => "NEW_COMMENT",
            WireMessage::Vote { .. } => "VOTE",
            WireMessage::Tip { .. } => "TIP",
            WireMessage::PeerList { .. } => "PEER_LIST",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{TargetType, ANONYMOUS};

    fn sample_vote() -> Vote {
        Vote {
            id: "v1".into(),
            target_id: "p1".into(),
            target_type: TargetType::Post,
            voter: ANONYMOUS.into(),
            value: 1,
            created_at: 100,
            signature: String::new(),
        }
    }

    #[test]
    fn test_json_tag_names() {
        let msg = WireMessage::SyncRequest { since: Some(42) };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "SYNC_REQUEST");
        assert_eq!(json["since"], 42);

        let msg = WireMessage::Vote { data: sample_vote() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "VOTE");
        assert_eq!(json["data"]["targetId"], "p1");
    }

    #[test]
    fn test_sync_request_without_since() {
        let msg: WireMessage = serde_json::from_str(r#"{"type":"SYNC_REQUEST"}"#).unwrap();
        match msg {
            WireMessage::SyncRequest { since } => assert!(since.is_none()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let msg = WireMessage::Vote { data: sample_vote() };
        let encoded = rmp_serde::to_vec_named(&msg).unwrap();
        let decoded: WireMessage = rmp_serde::from_slice(&encoded).unwrap();
        match decoded {
            WireMessage::Vote { data } => assert_eq!(data, sample_vote()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_fails_to_parse() {
        let result: Result<WireMessage, _> =
            serde_json::from_str(r#"{"type":"SELF_DESTRUCT","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_dedup_keys() {
        assert_eq!(
            WireMessage::Vote { data: sample_vote() }.dedup_key().unwrap(),
            "vote:p1:anonymous"
        );
        assert!(WireMessage::SyncRequest { since: None }.dedup_key().is_none());
        assert!(WireMessage::PeerList { data: vec![] }.dedup_key().is_none());
    }
}
