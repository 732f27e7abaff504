//! Replicated content store
//!
//! SQLite-backed table-per-entity storage with idempotent upserts, compound-key
//! last-writer-wins resolution for votes, and an all-or-nothing bulk merge for
//! sync payloads. WAL mode keeps concurrent readers from other same-process
//! contexts working while a merge is in flight.
//!
//! Conflict rules:
//! - communities/posts/comments/tips: insert-if-absent by primary id. Ids are
//!   creator-generated random tokens, so a collision is either a duplicate
//!   delivery (ignored) or a forgery that already failed the signature gate.
//! - votes: keyed `(target_id, voter)`; the record with the greater-or-equal
//!   `created_at` wins, and a resubmission of the same value is suppressed
//!   without touching `created_at`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::content::{
    Comment, Community, Post, RecordBatch, RecordKind, TargetType, Tip, Vote,
};

/// Backoff for transient local-storage contention (concurrent processes
/// sharing the database). After the retries are exhausted the error
/// propagates to the caller.
const RETRY_BASE_MS: u64 = 100;
const RETRY_CAP_MS: u64 = 2_000;
const MAX_RETRIES: u32 = 3;

/// SQLite's default variable limit is 999; stay well under it.
const ID_QUERY_CHUNK: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("data directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a vote upsert under the `(target_id, voter)` conflict key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote by this voter on this target.
    Inserted,
    /// Same value as the stored vote; toggle resubmission suppressed.
    Unchanged,
    /// Newer (or tied) vote replaced the stored one.
    Replaced,
    /// Older than the stored vote; dropped.
    Stale,
}

impl VoteOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, VoteOutcome::Inserted | VoteOutcome::Replaced)
    }
}

/// Result of a bulk merge: how much was new, and exactly which records were
/// accepted (for downstream notification).
#[derive(Debug, Default)]
pub struct MergeStats {
    pub accepted: Vec<(RecordKind, String)>,
}

impl MergeStats {
    pub fn merged(&self) -> usize {
        self.accepted.len()
    }
}

/// A table whose row count disagrees with actual readability.
#[derive(Debug, Clone)]
pub struct IntegrityIssue {
    pub table: String,
    pub count: u64,
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table {} reports {} rows but a sample read returned nothing",
            self.table, self.count
        )
    }
}

impl ToSql for TargetType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for TargetType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|_| FromSqlError::InvalidType)
    }
}

pub struct ContentStore {
    conn: Connection,
}

impl ContentStore {
    /// Open or create the content database under the data directory.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("content.db");
        let conn = Connection::open(&db_path)?;
        let store = Self::init(conn)?;
        info!(path = %db_path.display(), "Content store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // Enable WAL mode for concurrent read access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS communities (
                id            TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                description   TEXT NOT NULL,
                creator       TEXT NOT NULL,
                created_at    INTEGER NOT NULL,
                content_hash  TEXT NOT NULL,
                signature     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS posts (
                id                  TEXT PRIMARY KEY,
                title               TEXT NOT NULL,
                body                TEXT NOT NULL,
                author              TEXT NOT NULL,
                author_display_name TEXT NOT NULL,
                community_id        TEXT NOT NULL,
                created_at          INTEGER NOT NULL,
                content_hash        TEXT NOT NULL,
                signature           TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS comments (
                id                  TEXT PRIMARY KEY,
                body                TEXT NOT NULL,
                author              TEXT NOT NULL,
                author_display_name TEXT NOT NULL,
                post_id             TEXT NOT NULL,
                parent_id           TEXT,
                created_at          INTEGER NOT NULL,
                content_hash        TEXT NOT NULL,
                signature           TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS votes (
                id           TEXT NOT NULL,
                target_id    TEXT NOT NULL,
                target_type  TEXT NOT NULL,
                voter        TEXT NOT NULL,
                value        INTEGER NOT NULL,
                created_at   INTEGER NOT NULL,
                signature    TEXT NOT NULL,
                PRIMARY KEY (target_id, voter)
            );
            CREATE TABLE IF NOT EXISTS tips (
                id           TEXT PRIMARY KEY,
                sender       TEXT NOT NULL,
                recipient    TEXT NOT NULL,
                amount_raw   TEXT NOT NULL,
                block_hash   TEXT NOT NULL,
                target_id    TEXT NOT NULL,
                target_type  TEXT NOT NULL,
                created_at   INTEGER NOT NULL,
                signature    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_communities_created ON communities(created_at);
            CREATE INDEX IF NOT EXISTS idx_posts_created ON posts(created_at);
            CREATE INDEX IF NOT EXISTS idx_comments_created ON comments(created_at);
            CREATE INDEX IF NOT EXISTS idx_votes_created ON votes(created_at);
            CREATE INDEX IF NOT EXISTS idx_tips_created ON tips(created_at);
            CREATE INDEX IF NOT EXISTS idx_posts_community ON posts(community_id);
            CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id);",
        )?;
        Ok(Self { conn })
    }

    // --- single-record upserts (local mutations) ---

    pub fn upsert_community(&mut self, c: &Community) -> Result<bool, StoreError> {
        let conn = &mut self.conn;
        Ok(with_retry(|| insert_community(conn, c))? > 0)
    }

    pub fn upsert_post(&mut self, p: &Post) -> Result<bool, StoreError> {
        let conn = &mut self.conn;
        Ok(with_retry(|| insert_post(conn, p))? > 0)
    }

    pub fn upsert_comment(&mut self, c: &Comment) -> Result<bool, StoreError> {
        let conn = &mut self.conn;
        Ok(with_retry(|| insert_comment(conn, c))? > 0)
    }

    pub fn upsert_tip(&mut self, t: &Tip) -> Result<bool, StoreError> {
        let conn = &mut self.conn;
        Ok(with_retry(|| insert_tip(conn, t))? > 0)
    }

    /// Vote upsert under the compound conflict key, wrapped in a transaction
    /// so the read-compare-write is indivisible.
    pub fn upsert_vote(&mut self, v: &Vote) -> Result<VoteOutcome, StoreError> {
        let conn = &mut self.conn;
        let outcome = with_retry(|| {
            let tx = conn.transaction()?;
            let outcome = apply_vote(&tx, v)?;
            tx.commit()?;
            Ok(outcome)
        })?;
        Ok(outcome)
    }

    // --- bulk merge (sync payloads) ---

    /// Merge a validated and verified batch.
    ///
    /// One read per table computes the already-present ids, then a single
    /// transaction spanning all five tables inserts the unknown records and
    /// applies vote resolution, so a sync application is all-or-nothing with
    /// respect to crash consistency.
    pub fn merge_batch(&mut self, batch: &RecordBatch) -> Result<MergeStats, StoreError> {
        let conn = &mut self.conn;
        let stats = with_retry(|| {
            let tx = conn.transaction()?;
            let mut accepted: Vec<(RecordKind, String)> = Vec::new();

            let known = known_ids(&tx, "communities", batch.communities.iter().map(|c| c.id.as_str()))?;
            for c in batch.communities.iter().filter(|c| !known.contains(&c.id)) {
                if insert_community(&tx, c)? > 0 {
                    accepted.push((RecordKind::Community, c.id.clone()));
                }
            }

            let known = known_ids(&tx, "posts", batch.posts.iter().map(|p| p.id.as_str()))?;
            for p in batch.posts.iter().filter(|p| !known.contains(&p.id)) {
                if insert_post(&tx, p)? > 0 {
                    accepted.push((RecordKind::Post, p.id.clone()));
                }
            }

            let known = known_ids(&tx, "comments", batch.comments.iter().map(|c| c.id.as_str()))?;
            for c in batch.comments.iter().filter(|c| !known.contains(&c.id)) {
                if insert_comment(&tx, c)? > 0 {
                    accepted.push((RecordKind::Comment, c.id.clone()));
                }
            }

            for v in &batch.votes {
                if apply_vote(&tx, v)?.changed() {
                    accepted.push((RecordKind::Vote, v.id.clone()));
                }
            }

            let known = known_ids(&tx, "tips", batch.tips.iter().map(|t| t.id.as_str()))?;
            for t in batch.tips.iter().filter(|t| !known.contains(&t.id)) {
                if insert_tip(&tx, t)? > 0 {
                    accepted.push((RecordKind::Tip, t.id.clone()));
                }
            }

            tx.commit()?;
            Ok(MergeStats { accepted })
        })?;

        if stats.merged() > 0 {
            debug!(merged = stats.merged(), total = batch.len(), "Merged batch");
        }
        Ok(stats)
    }

    // --- reads ---

    /// Full table snapshot (a first-contact sync response).
    pub fn snapshot(&self) -> Result<RecordBatch, StoreError> {
        self.read_batch(None)
    }

    /// Records created strictly after the watermark (a delta sync response).
    pub fn records_since(&self, since: u64) -> Result<RecordBatch, StoreError> {
        self.read_batch(Some(since))
    }

    fn read_batch(&self, since: Option<u64>) -> Result<RecordBatch, StoreError> {
        let floor = since.map(|s| s as i64).unwrap_or(-1);
        Ok(RecordBatch {
            communities: self.read_communities(floor)?,
            posts: self.read_posts(floor)?,
            comments: self.read_comments(floor)?,
            votes: self.read_votes(floor)?,
            tips: self.read_tips(floor)?,
        })
    }

    fn read_communities(&self, floor: i64) -> Result<Vec<Community>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, name, description, creator, created_at, content_hash, signature
             FROM communities WHERE created_at > ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([floor], |row| {
            Ok(Community {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                creator: row.get(3)?,
                created_at: row.get(4)?,
                content_hash: row.get(5)?,
                signature: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn read_posts(&self, floor: i64) -> Result<Vec<Post>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, title, body, author, author_display_name, community_id,
                    created_at, content_hash, signature
             FROM posts WHERE created_at > ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([floor], |row| {
            Ok(Post {
                id: row.get(0)?,
                title: row.get(1)?,
                body: row.get(2)?,
                author: row.get(3)?,
                author_display_name: row.get(4)?,
                community_id: row.get(5)?,
                created_at: row.get(6)?,
                content_hash: row.get(7)?,
                signature: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn read_comments(&self, floor: i64) -> Result<Vec<Comment>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, body, author, author_display_name, post_id, parent_id,
                    created_at, content_hash, signature
             FROM comments WHERE created_at > ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([floor], |row| {
            Ok(Comment {
                id: row.get(0)?,
                body: row.get(1)?,
                author: row.get(2)?,
                author_display_name: row.get(3)?,
                post_id: row.get(4)?,
                parent_id: row.get(5)?,
                created_at: row.get(6)?,
                content_hash: row.get(7)?,
                signature: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn read_votes(&self, floor: i64) -> Result<Vec<Vote>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, target_id, target_type, voter, value, created_at, signature
             FROM votes WHERE created_at > ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([floor], |row| {
            Ok(Vote {
                id: row.get(0)?,
                target_id: row.get(1)?,
                target_type: row.get(2)?,
                voter: row.get(3)?,
                value: row.get(4)?,
                created_at: row.get(5)?,
                signature: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn read_tips(&self, floor: i64) -> Result<Vec<Tip>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, sender, recipient, amount_raw, block_hash, target_id,
                    target_type, created_at, signature
             FROM tips WHERE created_at > ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([floor], |row| {
            Ok(Tip {
                id: row.get(0)?,
                from: row.get(1)?,
                to: row.get(2)?,
                amount_raw: row.get(3)?,
                block_hash: row.get(4)?,
                target_id: row.get(5)?,
                target_type: row.get(6)?,
                created_at: row.get(7)?,
                signature: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_post(&self, id: &str) -> Result<Option<Post>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, title, body, author, author_display_name, community_id,
                    created_at, content_hash, signature
             FROM posts WHERE id = ?1",
        )?;
        let post = stmt
            .query_row([id], |row| {
                Ok(Post {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    body: row.get(2)?,
                    author: row.get(3)?,
                    author_display_name: row.get(4)?,
                    community_id: row.get(5)?,
                    created_at: row.get(6)?,
                    content_hash: row.get(7)?,
                    signature: row.get(8)?,
                })
            })
            .optional()?;
        Ok(post)
    }

    pub fn get_vote(&self, target_id: &str, voter: &str) -> Result<Option<Vote>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, target_id, target_type, voter, value, created_at, signature
             FROM votes WHERE target_id = ?1 AND voter = ?2",
        )?;
        let vote = stmt
            .query_row([target_id, voter], |row| {
                Ok(Vote {
                    id: row.get(0)?,
                    target_id: row.get(1)?,
                    target_type: row.get(2)?,
                    voter: row.get(3)?,
                    value: row.get(4)?,
                    created_at: row.get(5)?,
                    signature: row.get(6)?,
                })
            })
            .optional()?;
        Ok(vote)
    }

    /// Row counts per table.
    pub fn counts(&self) -> Result<Vec<(RecordKind, u64)>, StoreError> {
        let mut out = Vec::with_capacity(5);
        for (kind, table) in TABLES {
            let count: u64 =
                self.conn
                    .query_row(&format!("SELECT count(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
            out.push((kind, count));
        }
        Ok(out)
    }

    /// Confirm counts are consistent with actual readability: a table that
    /// claims rows but cannot produce a sample row is corrupted. Surfaced,
    /// never auto-repaired.
    pub fn integrity_check(&self) -> Result<Vec<IntegrityIssue>, StoreError> {
        let mut issues = Vec::new();
        for (_, table) in TABLES {
            let count: u64 =
                self.conn
                    .query_row(&format!("SELECT count(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
            if count == 0 {
                continue;
            }
            let sample: Option<String> = self
                .conn
                .query_row(&format!("SELECT id FROM {} LIMIT 1", table), [], |row| {
                    row.get(0)
                })
                .optional()?;
            if sample.is_none() {
                warn!(table, count, "Integrity check failed");
                issues.push(IntegrityIssue {
                    table: table.to_string(),
                    count,
                });
            }
        }
        Ok(issues)
    }
}

const TABLES: [(RecordKind, &str); 5] = [
    (RecordKind::Community, "communities"),
    (RecordKind::Post, "posts"),
    (RecordKind::Comment, "comments"),
    (RecordKind::Vote, "votes"),
    (RecordKind::Tip, "tips"),
];

// --- raw SQL helpers (shared between single upserts and the bulk merge) ---

fn insert_community(conn: &Connection, c: &Community) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO communities
         (id, name, description, creator, created_at, content_hash, signature)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![c.id, c.name, c.description, c.creator, c.created_at, c.content_hash, c.signature],
    )
}

fn insert_post(conn: &Connection, p: &Post) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO posts
         (id, title, body, author, author_display_name, community_id,
          created_at, content_hash, signature)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            p.id,
            p.title,
            p.body,
            p.author,
            p.author_display_name,
            p.community_id,
            p.created_at,
            p.content_hash,
            p.signature
        ],
    )
}

fn insert_comment(conn: &Connection, c: &Comment) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO comments
         (id, body, author, author_display_name, post_id, parent_id,
          created_at, content_hash, signature)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            c.id,
            c.body,
            c.author,
            c.author_display_name,
            c.post_id,
            c.parent_id,
            c.created_at,
            c.content_hash,
            c.signature
        ],
    )
}

fn insert_tip(conn: &Connection, t: &Tip) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO tips
         (id, sender, recipient, amount_raw, block_hash, target_id,
          target_type, created_at, signature)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            t.id,
            t.from,
            t.to,
            t.amount_raw,
            t.block_hash,
            t.target_id,
            t.target_type,
            t.created_at,
            t.signature
        ],
    )
}

/// Last-writer-wins resolution for one vote. Incoming wins ties: a single
/// honest voter only issues one vote stream, so out-of-order delivery is the
/// only realistic tie source.
fn apply_vote(conn: &Connection, v: &Vote) -> rusqlite::Result<VoteOutcome> {
    let existing: Option<(i32, u64)> = conn
        .query_row(
            "SELECT value, created_at FROM votes WHERE target_id = ?1 AND voter = ?2",
            params![v.target_id, v.voter],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO votes (id, target_id, target_type, voter, value, created_at, signature)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![v.id, v.target_id, v.target_type, v.voter, v.value, v.created_at, v.signature],
            )?;
            Ok(VoteOutcome::Inserted)
        }
        Some((value, _)) if value == v.value => Ok(VoteOutcome::Unchanged),
        Some((_, created_at)) if v.created_at >= created_at => {
            conn.execute(
                "UPDATE votes SET id = ?1, target_type = ?2, value = ?3,
                        created_at = ?4, signature = ?5
                 WHERE target_id = ?6 AND voter = ?7",
                params![v.id, v.target_type, v.value, v.created_at, v.signature, v.target_id, v.voter],
            )?;
            Ok(VoteOutcome::Replaced)
        }
        Some(_) => Ok(VoteOutcome::Stale),
    }
}

/// One read answering "which of these ids are already present".
fn known_ids<'a>(
    conn: &Connection,
    table: &str,
    ids: impl Iterator<Item = &'a str>,
) -> rusqlite::Result<HashSet<String>> {
    let ids: Vec<&str> = ids.collect();
    let mut known = HashSet::new();
    for chunk in ids.chunks(ID_QUERY_CHUNK) {
        if chunk.is_empty() {
            continue;
        }
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!("SELECT id FROM {} WHERE id IN ({})", table, placeholders);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        for row in rows {
            known.insert(row?);
        }
    }
    Ok(known)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Retry a storage operation on transient contention with bounded
/// exponential backoff.
fn with_retry<T, F>(mut op: F) -> rusqlite::Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let mut attempt: u32 = 0;
    loop {
        match op() {
            Err(e) if is_busy(&e) && attempt < MAX_RETRIES => {
                let delay = (RETRY_BASE_MS << attempt).min(RETRY_CAP_MS);
                debug!(attempt, delay_ms = delay, "Storage busy, retrying");
                std::thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
            other => return other,
        }
    }
}
