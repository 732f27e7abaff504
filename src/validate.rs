//! Inbound record validation
//!
//! Schema, bounds, and timestamp sanity checks applied to every inbound
//! payload before it can touch the store. Records failing a check are
//! dropped individually; a malformed peer degrades gracefully instead of
//! poisoning the whole merge.

use tracing::debug;

use crate::content::{Comment, Community, Post, RecordBatch, Tip, Vote};

pub const MAX_ID_LEN: usize = 100;
pub const MAX_NAME_LEN: usize = 50;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_TITLE_LEN: usize = 300;
pub const MAX_POST_BODY_LEN: usize = 40_000;
pub const MAX_COMMENT_BODY_LEN: usize = 10_000;
pub const MAX_DISPLAY_NAME_LEN: usize = 100;
pub const MAX_AMOUNT_LEN: usize = 40;

/// Tolerated forward clock skew. Anything stamped further into the future
/// is treated as garbage, bounding replay of far-future records.
pub const MAX_FUTURE_SKEW_MS: u64 = 5 * 60 * 1000;

fn id_ok(id: &str) -> bool {
    !id.is_empty() && id.chars().count() <= MAX_ID_LEN
}

fn identity_ok(identity: &str) -> bool {
    !identity.is_empty() && identity.chars().count() <= MAX_ID_LEN
}

fn timestamp_ok(created_at: u64, now_ms: u64) -> bool {
    created_at <= now_ms + MAX_FUTURE_SKEW_MS
}

fn slug_ok(name: &str) -> bool {
    !name.is_empty()
        && name.chars().count() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn amount_ok(amount: &str) -> bool {
    !amount.is_empty()
        && amount.len() <= MAX_AMOUNT_LEN
        && amount.chars().all(|c| c.is_ascii_digit())
}

pub fn validate_community(c: &Community, now_ms: u64) -> bool {
    id_ok(&c.id)
        && slug_ok(&c.name)
        && c.description.chars().count() <= MAX_DESCRIPTION_LEN
        && identity_ok(&c.creator)
        && timestamp_ok(c.created_at, now_ms)
}

pub fn validate_post(p: &Post, now_ms: u64) -> bool {
    id_ok(&p.id)
        && !p.title.is_empty()
        && p.title.chars().count() <= MAX_TITLE_LEN
        && p.body.chars().count() <= MAX_POST_BODY_LEN
        && identity_ok(&p.author)
        && p.author_display_name.chars().count() <= MAX_DISPLAY_NAME_LEN
        && id_ok(&p.community_id)
        && timestamp_ok(p.created_at, now_ms)
}

pub fn validate_comment(c: &Comment, now_ms: u64) -> bool {
    id_ok(&c.id)
        && !c.body.is_empty()
        && c.body.chars().count() <= MAX_COMMENT_BODY_LEN
        && identity_ok(&c.author)
        && c.author_display_name.chars().count() <= MAX_DISPLAY_NAME_LEN
        && id_ok(&c.post_id)
        && c.parent_id.as_deref().map_or(true, id_ok)
        && timestamp_ok(c.created_at, now_ms)
}

pub fn validate_vote(v: &Vote, now_ms: u64) -> bool {
    id_ok(&v.id)
        && id_ok(&v.target_id)
        && identity_ok(&v.voter)
        && (v.value == 1 || v.value == -1)
        && timestamp_ok(v.created_at, now_ms)
}

pub fn validate_tip(t: &Tip, now_ms: u64) -> bool {
    id_ok(&t.id)
        && identity_ok(&t.from)
        && identity_ok(&t.to)
        && amount_ok(&t.amount_raw)
        && !t.block_hash.is_empty()
        && id_ok(&t.target_id)
        && timestamp_ok(t.created_at, now_ms)
}

/// Filter a batch down to the records passing validation.
pub fn filter_batch(batch: RecordBatch, now_ms: u64) -> RecordBatch {
    let before = batch.len();
    let filtered = RecordBatch {
        communities: batch
            .communities
            .into_iter()
            .filter(|c| validate_community(c, now_ms))
            .collect(),
        posts: batch
            .posts
            .into_iter()
            .filter(|p| validate_post(p, now_ms))
            .collect(),
        comments: batch
            .comments
            .into_iter()
            .filter(|c| validate_comment(c, now_ms))
            .collect(),
        votes: batch
            .votes
            .into_iter()
            .filter(|v| validate_vote(v, now_ms))
            .collect(),
        tips: batch
            .tips
            .into_iter()
            .filter(|t| validate_tip(t, now_ms))
            .collect(),
    };
    let dropped = before - filtered.len();
    if dropped > 0 {
        debug!(dropped, "Validator dropped records from inbound batch");
    }
    filtered
}
