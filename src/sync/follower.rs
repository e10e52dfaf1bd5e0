//! Follower-Side Incremental Sync
//!
//! Drives the chunk protocol against a leader behind the [`ChunkSource`]
//! seam and three-way-merges each mismatched chunk into the local engine:
//! local-only keys outside any leader chunk are removed, local keys absent
//! from a mismatched chunk are removed, and keys that are new or carry a
//! different revision are fetched by offset and upserted with the leader's
//! revision intact.
//!
//! Anything malformed coming back from the leader is a [`Error::Protocol`]:
//! it aborts only the current sync attempt, and the caller retries with a
//! fresh context.

use std::collections::BTreeMap;
use std::ops::Bound::Included;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::engine::{Document, StorageEngine};
use crate::error::{Error, Result};
use crate::sync::{chunk_hash_entry, ChunkListing, KeyRev, CHUNK_HASH_VERSION};

/// Leader access used by the sync driver. Local in tests, HTTP in
/// deployments ([`crate::sync::client::HttpChunkSource`]).
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn key_chunks(&self, collection: &str, chunk_size: u64) -> Result<ChunkListing>;

    async fn keys(
        &self,
        collection: &str,
        chunk: u64,
        chunk_size: u64,
        low_key: &str,
    ) -> Result<Vec<KeyRev>>;

    async fn documents(
        &self,
        collection: &str,
        chunk: u64,
        chunk_size: u64,
        offsets: &[u64],
    ) -> Result<Vec<Document>>;
}

/// What one sync pass did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub chunks_total: usize,
    pub chunks_matched: usize,
    pub documents_fetched: usize,
    pub documents_removed: usize,
}

/// Converge one local collection to the leader's state
pub async fn sync_collection(
    engine: &StorageEngine,
    source: &dyn ChunkSource,
    collection: &str,
    chunk_size: u64,
) -> Result<SyncReport> {
    let listing = source.key_chunks(collection, chunk_size).await?;
    if listing.version != CHUNK_HASH_VERSION {
        return Err(Error::HashVersionMismatch {
            leader: listing.version,
            local: CHUNK_HASH_VERSION,
        });
    }
    validate_chunks(&listing)?;

    let local: BTreeMap<String, u64> = engine
        .snapshot()
        .collection(collection)?
        .documents
        .iter()
        .map(|(k, d)| (k.clone(), d.revision))
        .collect();

    let mut report = SyncReport {
        chunks_total: listing.chunks.len(),
        ..Default::default()
    };

    // Pass 1: local keys not covered by any leader chunk cannot exist on
    // the leader, remove them outright
    for key in local.keys() {
        let covered = listing
            .chunks
            .iter()
            .any(|c| key.as_str() >= c.low_key.as_str() && key.as_str() <= c.high_key.as_str());
        if !covered {
            engine.apply_removal(collection, key)?;
            report.documents_removed += 1;
        }
    }

    // Pass 2: per-chunk hash comparison and merge
    for (index, chunk) in listing.chunks.iter().enumerate() {
        let range = local.range::<str, _>((
            Included(chunk.low_key.as_str()),
            Included(chunk.high_key.as_str()),
        ));
        let mut local_hash = 0u64;
        for (key, revision) in range.clone() {
            local_hash ^= chunk_hash_entry(key, *revision);
        }
        if local_hash == chunk.combined_hash {
            report.chunks_matched += 1;
            continue;
        }

        debug!(collection, chunk = index, "chunk hash mismatch, merging");
        let remote = source
            .keys(collection, index as u64, chunk_size, &chunk.low_key)
            .await?;
        if remote.is_empty() {
            return Err(Error::Protocol(format!(
                "empty keys response for mismatched chunk {}",
                index
            )));
        }
        if !remote.windows(2).all(|w| w[0].key < w[1].key) {
            return Err(Error::Protocol(format!(
                "keys response for chunk {} is not strictly sorted",
                index
            )));
        }

        // local keys in the chunk range the leader no longer has
        let remote_revs: BTreeMap<&str, u64> =
            remote.iter().map(|kr| (kr.key.as_str(), kr.revision)).collect();
        for (key, _) in range {
            if !remote_revs.contains_key(key.as_str()) {
                engine.apply_removal(collection, key)?;
                report.documents_removed += 1;
            }
        }

        // offsets of keys that are new here or differ in revision
        let offsets: Vec<u64> = remote
            .iter()
            .enumerate()
            .filter(|(_, kr)| local.get(&kr.key) != Some(&kr.revision))
            .map(|(i, _)| i as u64)
            .collect();
        if offsets.is_empty() {
            continue;
        }

        let documents = source
            .documents(collection, index as u64, chunk_size, &offsets)
            .await?;
        if documents.len() != offsets.len() {
            return Err(Error::Protocol(format!(
                "expected {} documents for chunk {}, got {}",
                offsets.len(),
                index,
                documents.len()
            )));
        }
        for (doc, &offset) in documents.iter().zip(offsets.iter()) {
            let expected = &remote[offset as usize].key;
            if &doc.key != expected {
                return Err(Error::Protocol(format!(
                    "document at offset {} has key '{}', expected '{}'",
                    offset, doc.key, expected
                )));
            }
            engine.apply_document(collection, doc.clone())?;
            report.documents_fetched += 1;
        }
    }

    info!(
        collection,
        chunks = report.chunks_total,
        matched = report.chunks_matched,
        fetched = report.documents_fetched,
        removed = report.documents_removed,
        "incremental sync pass complete"
    );
    Ok(report)
}

fn validate_chunks(listing: &ChunkListing) -> Result<()> {
    for (i, chunk) in listing.chunks.iter().enumerate() {
        if chunk.low_key > chunk.high_key {
            return Err(Error::Protocol(format!(
                "chunk {} has low key above high key",
                i
            )));
        }
        if i > 0 && listing.chunks[i - 1].high_key >= chunk.low_key {
            return Err(Error::Protocol(format!("chunk {} overlaps its predecessor", i)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextManager;
    use crate::engine::MemoryEngine;
    use crate::id::IdGenerator;
    use crate::sync::{dump_documents_by_offset, dump_key_chunks, dump_keys};
    use crate::tick::TickSource;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn new_engine(dir: &std::path::Path) -> Arc<StorageEngine> {
        let engine = MemoryEngine::open(
            Arc::new(TickSource::new(0)),
            1,
            dir.to_path_buf(),
            false,
            64,
        )
        .unwrap();
        engine.create_collection("docs").unwrap();
        StorageEngine::memory(engine)
    }

    /// In-process chunk source over one leader context, one per sync pass
    struct LocalSource {
        manager: Arc<ContextManager>,
        context: u64,
        version: u32,
    }

    impl LocalSource {
        fn new(engine: &Arc<StorageEngine>) -> Self {
            let manager = Arc::new(ContextManager::new(
                Arc::clone(engine),
                IdGenerator::new(1),
            ));
            let (context, _) = manager.create_context(Duration::from_secs(60), 1, 0, None);
            Self {
                manager,
                context,
                version: CHUNK_HASH_VERSION,
            }
        }
    }

    #[async_trait]
    impl ChunkSource for LocalSource {
        async fn key_chunks(&self, collection: &str, chunk_size: u64) -> Result<ChunkListing> {
            let guard = self.manager.lease(self.context)?;
            let mut listing = dump_key_chunks(&guard, collection, chunk_size)?;
            listing.version = self.version;
            Ok(listing)
        }

        async fn keys(
            &self,
            collection: &str,
            chunk: u64,
            chunk_size: u64,
            low_key: &str,
        ) -> Result<Vec<KeyRev>> {
            let guard = self.manager.lease(self.context)?;
            dump_keys(&guard, collection, chunk, chunk_size, Some(low_key))
        }

        async fn documents(
            &self,
            collection: &str,
            chunk: u64,
            chunk_size: u64,
            offsets: &[u64],
        ) -> Result<Vec<Document>> {
            let guard = self.manager.lease(self.context)?;
            dump_documents_by_offset(&guard, collection, chunk, chunk_size, offsets)
        }
    }

    fn leader_chunks(engine: &Arc<StorageEngine>, chunk_size: u64) -> Vec<crate::sync::KeyChunk> {
        let manager = ContextManager::new(Arc::clone(engine), IdGenerator::new(9));
        let (id, _) = manager.create_context(Duration::from_secs(60), 1, 0, None);
        let guard = manager.lease(id).unwrap();
        dump_key_chunks(&guard, "docs", chunk_size).unwrap().chunks
    }

    #[tokio::test]
    async fn test_initial_sync_then_full_match() {
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();
        let leader = new_engine(leader_dir.path());
        let follower = new_engine(follower_dir.path());
        for i in 0..25 {
            leader
                .insert_document("docs", &format!("key{:03}", i), json!({ "i": i }))
                .unwrap();
        }

        let source = LocalSource::new(&leader);
        let report = sync_collection(&follower, &source, "docs", 10).await.unwrap();
        assert_eq!(report.chunks_total, 3);
        assert_eq!(report.documents_fetched, 25);

        // identical key/revision sets now yield identical chunk summaries
        assert_eq!(leader_chunks(&leader, 10), leader_chunks(&follower, 10));

        // a second pass over identical data touches nothing
        let source = LocalSource::new(&leader);
        let report = sync_collection(&follower, &source, "docs", 10).await.unwrap();
        assert_eq!(report.chunks_matched, report.chunks_total);
        assert_eq!(report.documents_fetched, 0);
        assert_eq!(report.documents_removed, 0);
    }

    #[tokio::test]
    async fn test_single_difference_touches_one_chunk() {
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();
        let leader = new_engine(leader_dir.path());
        let follower = new_engine(follower_dir.path());
        for i in 0..30 {
            leader
                .insert_document("docs", &format!("key{:03}", i), json!({ "i": i }))
                .unwrap();
        }
        sync_collection(&follower, &LocalSource::new(&leader), "docs", 10)
            .await
            .unwrap();

        // one document changes on the leader (new revision)
        leader
            .insert_document("docs", "key015", json!({ "i": 15, "edited": true }))
            .unwrap();

        let report = sync_collection(&follower, &LocalSource::new(&leader), "docs", 10)
            .await
            .unwrap();
        assert_eq!(report.chunks_total - report.chunks_matched, 1);
        assert_eq!(report.documents_fetched, 1);
        assert_eq!(leader_chunks(&leader, 10), leader_chunks(&follower, 10));
    }

    #[tokio::test]
    async fn test_local_only_keys_are_removed() {
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();
        let leader = new_engine(leader_dir.path());
        let follower = new_engine(follower_dir.path());
        for i in 10..20 {
            leader
                .insert_document("docs", &format!("key{:03}", i), json!({ "i": i }))
                .unwrap();
        }
        sync_collection(&follower, &LocalSource::new(&leader), "docs", 5)
            .await
            .unwrap();

        // stray follower keys: below the first chunk, inside a chunk range,
        // and above the last chunk
        follower.insert_document("docs", "key000", json!({})).unwrap();
        follower.insert_document("docs", "key012a", json!({})).unwrap();
        follower.insert_document("docs", "key999", json!({})).unwrap();

        let report = sync_collection(&follower, &LocalSource::new(&leader), "docs", 5)
            .await
            .unwrap();
        assert_eq!(report.documents_removed, 3);
        assert_eq!(leader_chunks(&leader, 5), leader_chunks(&follower, 5));
    }

    #[tokio::test]
    async fn test_empty_leader_empties_follower() {
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();
        let leader = new_engine(leader_dir.path());
        let follower = new_engine(follower_dir.path());
        for i in 0..5 {
            follower
                .insert_document("docs", &format!("key{:03}", i), json!({ "i": i }))
                .unwrap();
        }

        let report = sync_collection(&follower, &LocalSource::new(&leader), "docs", 10)
            .await
            .unwrap();
        assert_eq!(report.chunks_total, 0);
        assert_eq!(report.documents_removed, 5);
        assert!(follower
            .snapshot()
            .collection("docs")
            .unwrap()
            .documents
            .is_empty());
    }

    #[tokio::test]
    async fn test_hash_version_mismatch_aborts() {
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();
        let leader = new_engine(leader_dir.path());
        let follower = new_engine(follower_dir.path());
        leader.insert_document("docs", "a", json!({})).unwrap();

        let mut source = LocalSource::new(&leader);
        source.version = CHUNK_HASH_VERSION + 1;

        let err = sync_collection(&follower, &source, "docs", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HashVersionMismatch { .. }));
        assert!(err.is_retryable_sync() || matches!(err, Error::HashVersionMismatch { .. }));
    }
}
