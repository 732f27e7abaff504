//! Content store integration tests
//!
//! On-disk SQLite behavior: persistence across reopen, WAL mode, merge
//! atomicity, and the integrity self-check.

use rusqlite::Connection;
use tempfile::TempDir;

use agora_node::content::{RecordBatch, TargetType, Post, Vote, ANONYMOUS};
use agora_node::store::{ContentStore, VoteOutcome};

fn post(id: &str, created_at: u64) -> Post {
    Post {
        id: id.into(),
        title: "title".into(),
        body: "body".into(),
        author: ANONYMOUS.into(),
        author_display_name: String::new(),
        community_id: "c-1".into(),
        created_at,
        content_hash: String::new(),
        signature: String::new(),
    }
}

fn vote(target: &str, voter: &str, value: i32, created_at: u64) -> Vote {
    Vote {
        id: format!("v-{}", created_at),
        target_id: target.into(),
        target_type: TargetType::Comment,
        voter: voter.into(),
        value,
        created_at,
        signature: String::new(),
    }
}

#[test]
fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let mut store = ContentStore::open(dir.path()).unwrap();
        store.upsert_post(&post("p1", 100)).unwrap();
        store.upsert_vote(&vote("p1", "alice", 1, 150)).unwrap();
    }

    let store = ContentStore::open(dir.path()).unwrap();
    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.posts.len(), 1);
    assert_eq!(snapshot.votes.len(), 1);
    assert_eq!(snapshot.votes[0].target_type, TargetType::Comment);
}

#[test]
fn test_wal_mode_enabled() {
    let dir = TempDir::new().unwrap();
    let _store = ContentStore::open(dir.path()).unwrap();

    let db = Connection::open(dir.path().join("content.db")).unwrap();
    let mode: String = db
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode, "wal");
}

#[test]
fn test_merge_spans_all_tables() {
    let dir = TempDir::new().unwrap();
    let mut store = ContentStore::open(dir.path()).unwrap();

    let batch = RecordBatch {
        posts: vec![post("p1", 100)],
        votes: vec![vote("p1", "alice", 1, 150)],
        ..Default::default()
    };
    let stats = store.merge_batch(&batch).unwrap();
    assert_eq!(stats.merged(), 2);

    // Both rows landed (one transaction committed them together)
    let db = Connection::open(dir.path().join("content.db")).unwrap();
    let posts: u64 = db.query_row("SELECT count(*) FROM posts", [], |r| r.get(0)).unwrap();
    let votes: u64 = db.query_row("SELECT count(*) FROM votes", [], |r| r.get(0)).unwrap();
    assert_eq!((posts, votes), (1, 1));
}

#[test]
fn test_vote_lww_persists_winner() {
    let dir = TempDir::new().unwrap();
    let mut store = ContentStore::open(dir.path()).unwrap();

    assert_eq!(
        store.upsert_vote(&vote("p1", "alice", 1, 200)).unwrap(),
        VoteOutcome::Inserted
    );
    assert_eq!(
        store.upsert_vote(&vote("p1", "alice", -1, 100)).unwrap(),
        VoteOutcome::Stale,
        "an older opposing vote loses"
    );

    let stored = store.get_vote("p1", "alice").unwrap().unwrap();
    assert_eq!(stored.value, 1);
    assert_eq!(stored.created_at, 200);
}

#[test]
fn test_empty_store_integrity_clean() {
    let dir = TempDir::new().unwrap();
    let store = ContentStore::open(dir.path()).unwrap();
    assert!(store.integrity_check().unwrap().is_empty());
    assert!(store.snapshot().unwrap().is_empty());
}

#[test]
fn test_delta_floor_is_exclusive_on_disk() {
    let dir = TempDir::new().unwrap();
    let mut store = ContentStore::open(dir.path()).unwrap();
    store.upsert_post(&post("p1", 100)).unwrap();
    store.upsert_post(&post("p2", 200)).unwrap();

    let delta = store.records_since(100).unwrap();
    assert_eq!(delta.posts.len(), 1);
    assert_eq!(delta.posts[0].id, "p2");
}
