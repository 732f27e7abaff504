//! Record types shared across the mesh
//!
//! Five record kinds, each immutable once created except votes. Serde names
//! stay camelCase so payloads interoperate with existing peers on the wire
//! and in export files.

pub mod address;
pub mod identity;

use serde::{Deserialize, Serialize};

/// Identity string carried by unsigned records.
pub const ANONYMOUS: &str = "anonymous";

/// Traversal cap for rendering comment trees. A maliciously constructed
/// `parent_id` cycle is a rendering-loop risk only (records are immutable
/// and id-addressed), so consumers bound their walk instead of the merge
/// path walking ancestry.
pub const MAX_THREAD_DEPTH: usize = 64;

/// What a vote or tip points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Post,
    Comment,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Post => "post",
            TargetType::Comment => "comment",
        }
    }
}

impl std::str::FromStr for TargetType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(TargetType::Post),
            "comment" => Ok(TargetType::Comment),
            _ => Err(()),
        }
    }
}

/// Record kind discriminant, used for events and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Community,
    Post,
    Comment,
    Vote,
    Tip,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordKind::Community => "community",
            RecordKind::Post => "post",
            RecordKind::Comment => "comment",
            RecordKind::Vote => "vote",
            RecordKind::Tip => "tip",
        };
        write!(f, "{}", s)
    }
}

/// A community (topic board). The name is a normalized slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Community {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub creator: String,
    pub created_at: u64,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub title: String,
    pub body: String,
    pub author: String,
    #[serde(default)]
    pub author_display_name: String,
    /// Soft FK: the community may not be locally known yet.
    pub community_id: String,
    pub created_at: u64,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub author: String,
    #[serde(default)]
    pub author_display_name: String,
    /// Soft FK: the post may not be locally known yet.
    pub post_id: String,
    /// None means top-level; otherwise a soft FK to another comment.
    #[serde(default)]
    pub parent_id: Option<String>,
    pub created_at: u64,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub signature: String,
}

/// The only mutable record kind. Conflict identity is `(target_id, voter)`;
/// the `id` field exists but plays no part in conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub id: String,
    pub target_id: String,
    pub target_type: TargetType,
    pub voter: String,
    /// +1 or -1
    pub value: i32,
    pub created_at: u64,
    #[serde(default)]
    pub signature: String,
}

/// A tip references an external payment-chain transaction via `block_hash`;
/// that proof is not verified by this subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tip {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Integer string, arbitrary precision.
    pub amount_raw: String,
    pub block_hash: String,
    pub target_id: String,
    pub target_type: TargetType,
    pub created_at: u64,
    #[serde(default)]
    pub signature: String,
}

/// The five-array payload carried by sync responses and export files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    #[serde(default)]
    pub communities: Vec<Community>,
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub votes: Vec<Vote>,
    #[serde(default)]
    pub tips: Vec<Tip>,
}

impl RecordBatch {
    pub fn is_empty(&self) -> bool {
        self.communities.is_empty()
            && self.posts.is_empty()
            && self.comments.is_empty()
            && self.votes.is_empty()
            && self.tips.is_empty()
    }

    pub fn len(&self) -> usize {
        self.communities.len()
            + self.posts.len()
            + self.comments.len()
            + self.votes.len()
            + self.tips.len()
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Creator-generated opaque record id.
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
