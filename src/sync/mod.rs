//! Incremental Sync Protocol
//!
//! Converges a follower collection to the leader's without a full dump:
//! the leader's key space is cut into chunks of up to `chunk_size` keys in
//! primary-key order, each summarized by an order-independent combined
//! hash. The follower compares hashes, fetches `{key, revision}` pairs only
//! for mismatched chunks, three-way-merges them against its local state,
//! and fetches full bodies only for the documents it actually needs.
//!
//! This module is the leader side; [`follower`] drives the merge and
//! [`client`] speaks the HTTP wire.

pub mod client;
pub mod follower;

use serde::{Deserialize, Serialize};

use crate::context::{ContextGuard, CursorOrder};
use crate::engine::Document;
use crate::error::{Error, Result};
use crate::tick::tick_str;

/// Version of the chunk hash function. Leader and follower must agree; a
/// follower seeing a different version aborts instead of diffing garbage.
pub const CHUNK_HASH_VERSION: u32 = 1;

/// FNV-1a, 64 bit. Pinned as chunk hash version 1: do not swap this out
/// without bumping [`CHUNK_HASH_VERSION`].
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Contribution of one document to its chunk's combined hash. The revision
/// is hashed in its decimal-string wire form; XOR keeps the combination
/// order-independent within the chunk.
pub fn chunk_hash_entry(key: &str, revision: u64) -> u64 {
    fnv1a64(key.as_bytes()) ^ fnv1a64(revision.to_string().as_bytes())
}

/// One key-range chunk summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChunk {
    #[serde(rename = "low")]
    pub low_key: String,
    #[serde(rename = "high")]
    pub high_key: String,
    #[serde(rename = "hash", with = "tick_str")]
    pub combined_hash: u64,
}

/// Chunk listing plus the hash version it was computed with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkListing {
    pub version: u32,
    pub chunks: Vec<KeyChunk>,
}

/// `{key, revision}` pair as served for one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRev {
    pub key: String,
    #[serde(rename = "rev", with = "tick_str")]
    pub revision: u64,
}

fn chunk_bounds(chunk: u64, chunk_size: u64, total: usize) -> Result<(usize, usize)> {
    if chunk_size == 0 {
        return Err(Error::BadRequest("chunkSize must be positive".into()));
    }
    let start = chunk
        .checked_mul(chunk_size)
        .ok_or(Error::ChunkOverflow { chunk, chunk_size })?;
    let end = start
        .checked_add(chunk_size)
        .ok_or(Error::ChunkOverflow { chunk, chunk_size })?;
    if start >= total as u64 {
        return Err(Error::BadRequest(format!(
            "chunk {} out of range for {} keys",
            chunk, total
        )));
    }
    Ok((start as usize, (end as u64).min(total as u64) as usize))
}

/// Cut the collection's key space into chunk summaries. An empty collection
/// yields zero chunks.
pub fn dump_key_chunks(
    guard: &ContextGuard<'_>,
    collection: &str,
    chunk_size: u64,
) -> Result<ChunkListing> {
    if chunk_size == 0 {
        return Err(Error::BadRequest("chunkSize must be positive".into()));
    }
    let cursor = guard.bind_collection(collection, CursorOrder::PrimaryKey)?;
    let handle = cursor.acquire()?;

    let mut chunks = Vec::new();
    let total = handle.len();
    let mut start = 0usize;
    while start < total {
        let end = (start + chunk_size as usize).min(total);
        let mut combined = 0u64;
        for offset in start..end {
            let doc = handle.document_at(offset).ok_or_else(|| {
                Error::Inconsistency(format!("missing document at offset {}", offset))
            })?;
            combined ^= chunk_hash_entry(&doc.key, doc.revision);
        }
        chunks.push(KeyChunk {
            low_key: handle.key_at(start).unwrap_or_default().to_string(),
            high_key: handle.key_at(end - 1).unwrap_or_default().to_string(),
            combined_hash: combined,
        });
        start = end;
    }

    Ok(ChunkListing {
        version: CHUNK_HASH_VERSION,
        chunks,
    })
}

/// `{key, revision}` pairs for one chunk. A `low_key` lets the caller
/// re-anchor the cursor; otherwise the chunk index positions it.
pub fn dump_keys(
    guard: &ContextGuard<'_>,
    collection: &str,
    chunk: u64,
    chunk_size: u64,
    low_key: Option<&str>,
) -> Result<Vec<KeyRev>> {
    let cursor = guard.bind_collection(collection, CursorOrder::PrimaryKey)?;
    let handle = cursor.acquire()?;
    let (start, end) = chunk_bounds(chunk, chunk_size, handle.len())?;

    // anchoring by key exercises the seek cache on forward re-reads
    if let Some(low_key) = low_key {
        let sought = handle.seek_to_key(low_key);
        if sought != start {
            return Err(Error::BadRequest(format!(
                "lowKey '{}' does not match chunk {}",
                low_key, chunk
            )));
        }
    }

    let mut pairs = Vec::with_capacity(end - start);
    for offset in start..end {
        let doc = handle.document_at(offset).ok_or_else(|| {
            Error::Inconsistency(format!("missing document at offset {}", offset))
        })?;
        pairs.push(KeyRev {
            key: doc.key.clone(),
            revision: doc.revision,
        });
    }
    Ok(pairs)
}

/// Full bodies for the given offsets within one chunk
pub fn dump_documents_by_offset(
    guard: &ContextGuard<'_>,
    collection: &str,
    chunk: u64,
    chunk_size: u64,
    offsets: &[u64],
) -> Result<Vec<Document>> {
    let cursor = guard.bind_collection(collection, CursorOrder::PrimaryKey)?;
    let handle = cursor.acquire()?;
    let (start, end) = chunk_bounds(chunk, chunk_size, handle.len())?;

    let mut documents = Vec::with_capacity(offsets.len());
    for &offset in offsets {
        let absolute = (start as u64)
            .checked_add(offset)
            .ok_or(Error::ChunkOverflow { chunk, chunk_size })?;
        if absolute >= end as u64 {
            return Err(Error::BadRequest(format!(
                "offset {} beyond chunk {} bounds",
                offset, chunk
            )));
        }
        let doc = handle.document_at(absolute as usize).ok_or_else(|| {
            Error::Inconsistency(format!("missing document at offset {}", absolute))
        })?;
        documents.push(doc.clone());
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextManager;
    use crate::engine::{MemoryEngine, StorageEngine};
    use crate::id::IdGenerator;
    use crate::tick::TickSource;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path, docs: usize) -> (Arc<StorageEngine>, ContextManager) {
        let engine = MemoryEngine::open(
            Arc::new(TickSource::new(0)),
            1,
            dir.to_path_buf(),
            false,
            64,
        )
        .unwrap();
        engine.create_collection("docs").unwrap();
        for i in 0..docs {
            engine
                .insert_document("docs", &format!("key{:03}", i), json!({ "i": i }))
                .unwrap();
        }
        let engine = StorageEngine::memory(engine);
        let manager = ContextManager::new(Arc::clone(&engine), IdGenerator::new(1));
        (engine, manager)
    }

    fn leased(manager: &ContextManager) -> crate::context::ContextGuard<'_> {
        let (id, _) = manager.create_context(Duration::from_secs(60), 1, 0, None);
        manager.lease(id).unwrap()
    }

    #[test]
    fn test_chunking_covers_all_keys() {
        let dir = tempdir().unwrap();
        let (_, manager) = setup(dir.path(), 25);
        let guard = leased(&manager);

        let listing = dump_key_chunks(&guard, "docs", 10).unwrap();
        assert_eq!(listing.version, CHUNK_HASH_VERSION);
        assert_eq!(listing.chunks.len(), 3);
        assert_eq!(listing.chunks[0].low_key, "key000");
        assert_eq!(listing.chunks[0].high_key, "key009");
        assert_eq!(listing.chunks[2].low_key, "key020");
        assert_eq!(listing.chunks[2].high_key, "key024");
    }

    #[test]
    fn test_empty_collection_yields_no_chunks() {
        let dir = tempdir().unwrap();
        let (_, manager) = setup(dir.path(), 0);
        let guard = leased(&manager);
        let listing = dump_key_chunks(&guard, "docs", 10).unwrap();
        assert!(listing.chunks.is_empty());
    }

    #[test]
    fn test_hash_is_order_independent_and_revision_sensitive() {
        let a = chunk_hash_entry("k1", 10) ^ chunk_hash_entry("k2", 20);
        let b = chunk_hash_entry("k2", 20) ^ chunk_hash_entry("k1", 10);
        assert_eq!(a, b);

        let c = chunk_hash_entry("k1", 11) ^ chunk_hash_entry("k2", 20);
        assert_ne!(a, c);
    }

    #[test]
    fn test_keys_and_documents_for_chunk() {
        let dir = tempdir().unwrap();
        let (_, manager) = setup(dir.path(), 25);
        let guard = leased(&manager);

        let pairs = dump_keys(&guard, "docs", 1, 10, Some("key010")).unwrap();
        assert_eq!(pairs.len(), 10);
        assert_eq!(pairs[0].key, "key010");
        assert_eq!(pairs[9].key, "key019");

        let docs = dump_documents_by_offset(&guard, "docs", 1, 10, &[0, 3, 9]).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].key, "key010");
        assert_eq!(docs[1].key, "key013");
        assert_eq!(docs[2].key, "key019");
    }

    #[test]
    fn test_bad_chunk_parameters() {
        let dir = tempdir().unwrap();
        let (_, manager) = setup(dir.path(), 5);
        let guard = leased(&manager);

        assert!(matches!(
            dump_keys(&guard, "docs", 0, 0, None),
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            dump_keys(&guard, "docs", u64::MAX, 1000, None),
            Err(Error::ChunkOverflow { .. })
        ));
        assert!(matches!(
            dump_keys(&guard, "docs", 7, 10, None),
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            dump_documents_by_offset(&guard, "docs", 0, 10, &[99]),
            Err(Error::BadRequest(_))
        ));
        // a lowKey disagreeing with the chunk index is rejected
        assert!(matches!(
            dump_keys(&guard, "docs", 0, 3, Some("key004")),
            Err(Error::BadRequest(_))
        ));
    }
}
