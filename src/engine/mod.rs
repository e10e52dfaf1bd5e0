//! Storage Engine Facade
//!
//! The replication layer consumes a narrow capability surface of the node's
//! log-structured storage engine: sequence-numbered WAL iteration, snapshot
//! reads, WAL segment listing/deletion, and the object-id directory. The
//! engine is selected once at startup from a closed variant set and passed
//! around as `Arc<StorageEngine>`; it is never dispatched per call site.

pub mod memory;
pub mod wal;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tick::Tick;

pub use memory::{EngineSnapshot, MemoryEngine, SnapshotCollection, TxOp};
pub use wal::{ColumnFamily, TagKind, WalBatch, WalEvent};

/// A single document as stored and replicated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Primary key
    #[serde(rename = "_key")]
    pub key: String,
    /// Revision, minted from the WAL tick of the write
    #[serde(rename = "_rev", with = "crate::tick::tick_str")]
    pub revision: u64,
    /// User payload
    #[serde(flatten)]
    pub body: serde_json::Value,
}

/// What an internal object id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Collection,
    View,
}

/// Directory entry mapping an internal numeric object id to its owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub database_id: u64,
    pub collection_id: u64,
    pub name: String,
    pub kind: ObjectKind,
}

impl ObjectRef {
    /// System collections are prefixed with an underscore and excluded from
    /// tailing unless the client asks for them
    pub fn is_system(&self) -> bool {
        self.name.starts_with('_')
    }
}

/// Point-in-time copy of the object-id directory, used by the WAL parser to
/// resolve keyed events to collections
#[derive(Debug, Clone, Default)]
pub struct ObjectDirectory {
    entries: HashMap<u64, ObjectRef>,
}

impl ObjectDirectory {
    pub fn new(entries: HashMap<u64, ObjectRef>) -> Self {
        Self { entries }
    }

    pub fn resolve(&self, object_id: u64) -> Option<&ObjectRef> {
        self.entries.get(&object_id)
    }
}

/// Listing entry for one WAL segment, re-derived from the engine on every
/// retention pass and never authoritative on its own
#[derive(Debug, Clone)]
pub struct WalSegmentInfo {
    /// First sequence number covered
    pub start_sequence: Tick,
    /// Last sequence number covered
    pub last_sequence: Tick,
    /// Whether the segment has been archived (only archived segments are
    /// candidates for pruning)
    pub archived: bool,
    /// On-disk size in bytes (0 for the live window)
    pub size: u64,
    /// Path of the archived file
    pub path: Option<PathBuf>,
}

/// The closed set of storage engines a node may run on.
///
/// Chosen once at startup; every capability call dispatches through this
/// enum rather than a trait object.
pub enum StorageEngine {
    Memory(MemoryEngine),
}

impl StorageEngine {
    pub fn memory(engine: MemoryEngine) -> Arc<Self> {
        Arc::new(StorageEngine::Memory(engine))
    }

    fn inner(&self) -> &MemoryEngine {
        match self {
            StorageEngine::Memory(engine) => engine,
        }
    }

    /// Numeric id of the database this node serves
    pub fn database_id(&self) -> u64 {
        self.inner().database_id()
    }

    /// Highest sequence number handed out so far
    pub fn current_sequence(&self) -> Tick {
        self.inner().current_sequence()
    }

    /// Oldest sequence number still readable from the WAL
    pub fn oldest_retained_sequence(&self) -> Tick {
        self.inner().oldest_retained_sequence()
    }

    // --- collection DDL -------------------------------------------------

    pub fn create_collection(&self, name: &str) -> Result<u64> {
        self.inner().create_collection(name)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.inner().drop_collection(name)
    }

    pub fn rename_collection(&self, old: &str, new: &str) -> Result<()> {
        self.inner().rename_collection(old, new)
    }

    pub fn change_collection(&self, name: &str, props: serde_json::Value) -> Result<()> {
        self.inner().change_collection(name, props)
    }

    pub fn truncate_collection(&self, name: &str) -> Result<()> {
        self.inner().truncate_collection(name)
    }

    pub fn create_index(&self, collection: &str, definition: serde_json::Value) -> Result<u64> {
        self.inner().create_index(collection, definition)
    }

    pub fn drop_index(&self, collection: &str, index_id: u64) -> Result<()> {
        self.inner().drop_index(collection, index_id)
    }

    pub fn create_view(&self, name: &str, definition: serde_json::Value) -> Result<u64> {
        self.inner().create_view(name, definition)
    }

    pub fn change_view(&self, name: &str, definition: serde_json::Value) -> Result<()> {
        self.inner().change_view(name, definition)
    }

    pub fn drop_view(&self, name: &str) -> Result<()> {
        self.inner().drop_view(name)
    }

    // --- document writes ------------------------------------------------

    /// Insert or update a document, returning its new revision
    pub fn insert_document(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> Result<u64> {
        self.inner().insert_document(collection, key, body)
    }

    /// Follower-side upsert preserving the leader-assigned revision
    pub fn apply_document(&self, collection: &str, doc: Document) -> Result<()> {
        self.inner().apply_document(collection, doc)
    }

    /// Follower-side removal; missing keys are a no-op
    pub fn apply_removal(&self, collection: &str, key: &str) -> Result<()> {
        self.inner().apply_removal(collection, key)
    }

    pub fn remove_document(&self, collection: &str, key: &str) -> Result<()> {
        self.inner().remove_document(collection, key)
    }

    /// Apply a multi-document transaction atomically under one WAL batch
    pub fn write_transaction(&self, tx_id: u64, ops: Vec<TxOp>) -> Result<()> {
        self.inner().write_transaction(tx_id, ops)
    }

    // --- snapshot reads -------------------------------------------------

    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner().snapshot()
    }

    pub fn object_directory(&self) -> ObjectDirectory {
        self.inner().object_directory()
    }

    /// Maintained document count for a collection (may drift from the true
    /// count; corrected via [`Self::adjust_document_count`])
    pub fn stored_count(&self, collection: &str) -> Result<u64> {
        self.inner().stored_count(collection)
    }

    pub fn adjust_document_count(&self, collection: &str, diff: i64) -> Result<()> {
        self.inner().adjust_document_count(collection, diff)
    }

    // --- sync-summary blockers -----------------------------------------

    pub fn place_sync_blocker(&self, collection: &str, blocker_id: u64) -> Result<()> {
        self.inner().place_sync_blocker(collection, blocker_id)
    }

    pub fn remove_sync_blocker(&self, blocker_id: u64) {
        self.inner().remove_sync_blocker(blocker_id)
    }

    pub fn has_sync_blockers(&self, collection: &str) -> Result<bool> {
        self.inner().has_sync_blockers(collection)
    }

    // --- WAL access -----------------------------------------------------

    /// Read all batches whose sequence range ends at or after `from`
    pub fn wal_batches_from(&self, from: Tick) -> Result<Vec<WalBatch>> {
        self.inner().wal_batches_from(from)
    }

    /// Archive completed groups of live batches into segment files.
    /// With `force`, the remainder is archived too (shutdown path).
    pub fn flush_wal(&self, force: bool) -> Result<usize> {
        self.inner().flush_wal(force)
    }

    pub fn list_wal_segments(&self) -> Vec<WalSegmentInfo> {
        self.inner().list_wal_segments()
    }

    /// Delete one archived segment. Returns false if the file was already
    /// gone (treated as pruned, not an error).
    pub fn delete_wal_segment(&self, start_sequence: Tick) -> Result<bool> {
        self.inner().delete_wal_segment(start_sequence)
    }

    /// Test/diagnostic hook: append a raw pre-built batch to the live WAL
    pub fn append_raw_batch(&self, events: Vec<WalEvent>) -> Result<Tick> {
        self.inner().append_raw_batch(events)
    }
}
