//! Out-of-band export/import
//!
//! The export file is a JSON object with exactly the five array fields
//! `communities, posts, comments, votes, tips`, the same shape as a sync
//! response payload. Import is the same trust boundary as a sync payload,
//! just delivered via a file instead of the live transport, so it runs the
//! identical validator/gate/merge pipeline. These are user-initiated
//! actions: errors surface synchronously to the caller.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::info;

use crate::content::RecordBatch;
use crate::store::{ContentStore, MergeStats};
use crate::sync::engine::SyncEngine;

/// Write the full local dataset to a JSON file.
pub async fn export_to_path(store: &Arc<Mutex<ContentStore>>, path: &Path) -> Result<usize> {
    let batch = {
        let store = store.lock().await;
        store.snapshot().context("reading store snapshot")?
    };
    let json = serde_json::to_string_pretty(&batch).context("serializing export")?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), records = batch.len(), "Exported dataset");
    Ok(batch.len())
}

/// Read a JSON export file and merge it through the full inbound pipeline.
pub async fn import_from_path(engine: &SyncEngine, path: &Path) -> Result<MergeStats> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let batch: RecordBatch = serde_json::from_str(&raw).context("parsing import file")?;
    let total = batch.len();
    let stats = engine
        .apply_batch(batch)
        .await
        .context("merging imported records")?;
    info!(
        path = %path.display(),
        records = total,
        merged = stats.merged(),
        "Imported dataset"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{now_ms, Post, ANONYMOUS};
    use crate::events::EventBus;
    use std::time::Duration;

    fn post(id: &str) -> Post {
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
    async fn test_export_import_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("export.json");

        let store = Arc::new(Mutex::new(ContentStore::open_in_memory().unwrap()));
        {
            let mut s = store.lock().await;
            s.upsert_post(&post("p1")).unwrap();
            s.upsert_post(&post("p2")).unwrap();
        }
        let exported = export_to_path(&store, &path).await.unwrap();
        assert_eq!(exported, 2);

        // The file is the five-array shape
        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 5);
        assert_eq!(value["posts"].as_array().unwrap().len(), 2);

        // Import into a fresh store
        let fresh = Arc::new(Mutex::new(ContentStore::open_in_memory().unwrap()));
        let engine = SyncEngine::new(fresh.clone(), EventBus::default(), Duration::from_secs(30));
        let stats = import_from_path(&engine, &path).await.unwrap();
        assert_eq!(stats.merged(), 2);

        // Importing twice is idempotent
        let stats = import_from_path(&engine, &path).await.unwrap();
        assert_eq!(stats.merged(), 0);
    }

    #[tokio::test]
    async fn test_import_runs_validator() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("import.json");

        let mut bad = post("p-bad");
        bad.created_at = now_ms() + 60 * 60 * 1000; // an hour in the future
        let batch = RecordBatch {
            posts: vec![post("p-good"), bad],
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string(&batch).unwrap()).unwrap();

        let store = Arc::new(Mutex::new(ContentStore::open_in_memory().unwrap()));
        let engine = SyncEngine::new(store.clone(), EventBus::default(), Duration::from_secs(30));
        let stats = import_from_path(&engine, &path).await.unwrap();
        assert_eq!(stats.merged(), 1);

        let store = store.lock().await;
        assert!(store.get_post("p-good").unwrap().is_some());
        assert!(store.get_post("p-bad").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_import_malformed_file_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("garbage.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = Arc::new(Mutex::new(ContentStore::open_in_memory().unwrap()));
        let engine = SyncEngine::new(store, EventBus::default(), Duration::from_secs(30));
        assert!(import_from_path(&engine, &path).await.is_err());
    }
}
