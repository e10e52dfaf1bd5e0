//! In-Process Storage Engine
//!
//! A log-structured engine keeping collection data in copy-on-write ordered
//! maps and the WAL as sequence-numbered batches. Recent batches stay in a
//! live in-memory window; older ones are archived into segment files (see
//! [`super::wal`]) that the retention manager may prune.
//!
//! Snapshots are O(collections): each collection's document map lives behind
//! an `Arc`, and every write swaps in a fresh map, so a snapshot simply
//! clones the `Arc`s and stays immutable from then on.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde_json::json;
use tracing::debug;

use super::wal::{
    self, ColumnFamily, TagKind, WalBatch, WalEvent,
};
use super::{Document, ObjectDirectory, ObjectKind, ObjectRef, WalSegmentInfo};
use crate::error::{Error, Result};
use crate::tick::{Tick, TickSource};

/// One operation inside a multi-document transaction
#[derive(Debug, Clone)]
pub struct TxOp {
    pub collection: String,
    pub key: String,
    /// `Some` inserts/updates, `None` removes
    pub body: Option<serde_json::Value>,
}

/// Immutable point-in-time view over all collections
#[derive(Clone)]
pub struct EngineSnapshot {
    /// Sequence number at which the snapshot was taken
    pub sequence: Tick,
    pub collections: BTreeMap<String, SnapshotCollection>,
}

impl EngineSnapshot {
    pub fn collection(&self, name: &str) -> Result<&SnapshotCollection> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }
}

/// One collection inside a snapshot
#[derive(Clone)]
pub struct SnapshotCollection {
    pub id: u64,
    pub object_id: u64,
    pub name: String,
    pub documents: Arc<BTreeMap<String, Document>>,
    /// Maintained count at snapshot time (may drift from `documents.len()`)
    pub stored_count: u64,
}

struct Collection {
    id: u64,
    object_id: u64,
    name: String,
    documents: Arc<BTreeMap<String, Document>>,
    stored_count: u64,
    indexes: BTreeMap<u64, serde_json::Value>,
    /// Blocker reservations keeping the sync summary alive for clients
    sync_blockers: Vec<u64>,
}

struct View {
    object_id: u64,
    #[allow(dead_code)]
    definition: serde_json::Value,
}

struct ArchivedInfo {
    path: PathBuf,
    last_sequence: Tick,
    size: u64,
}

struct EngineState {
    collections: BTreeMap<String, Collection>,
    views: BTreeMap<String, View>,
    objects: HashMap<u64, ObjectRef>,
    live: VecDeque<WalBatch>,
    archived: BTreeMap<Tick, ArchivedInfo>,
    next_collection_id: u64,
    next_object_id: u64,
}

/// In-process storage engine
pub struct MemoryEngine {
    ticks: Arc<TickSource>,
    database_id: u64,
    archive_dir: PathBuf,
    compression: bool,
    segment_batches: usize,
    state: RwLock<EngineState>,
}

impl MemoryEngine {
    /// Open an engine over the given archive directory, rebuilding the
    /// segment index from existing files and advancing the tick source past
    /// the highest archived sequence.
    pub fn open(
        ticks: Arc<TickSource>,
        database_id: u64,
        archive_dir: PathBuf,
        compression: bool,
        segment_batches: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(&archive_dir)?;

        let mut archived = BTreeMap::new();
        for path in wal::list_segment_files(&archive_dir)? {
            let header = wal::read_segment_header(&path)?;
            let size = std::fs::metadata(&path)?.len();
            ticks.advance_to(header.last_sequence);
            archived.insert(
                header.first_sequence,
                ArchivedInfo {
                    path,
                    last_sequence: header.last_sequence,
                    size,
                },
            );
        }

        Ok(Self {
            ticks,
            database_id,
            archive_dir,
            compression,
            segment_batches,
            state: RwLock::new(EngineState {
                collections: BTreeMap::new(),
                views: BTreeMap::new(),
                objects: HashMap::new(),
                live: VecDeque::new(),
                archived,
                next_collection_id: 1,
                next_object_id: 1000,
            }),
        })
    }

    pub fn database_id(&self) -> u64 {
        self.database_id
    }

    pub fn current_sequence(&self) -> Tick {
        self.ticks.current()
    }

    pub fn oldest_retained_sequence(&self) -> Tick {
        let state = self.state.read().unwrap();
        state
            .archived
            .keys()
            .next()
            .copied()
            .or_else(|| state.live.front().map(|b| b.start_sequence))
            .unwrap_or_else(|| self.ticks.current() + 1)
    }

    // --- collection DDL -------------------------------------------------

    pub fn create_collection(&self, name: &str) -> Result<u64> {
        let mut state = self.state.write().unwrap();
        if state.collections.contains_key(name) {
            return Err(Error::Engine(format!(
                "collection '{}' already exists",
                name
            )));
        }

        let id = state.next_collection_id;
        state.next_collection_id += 1;
        let object_id = state.next_object_id;
        state.next_object_id += 1;

        let definition = json!({
            "id": id.to_string(),
            "objectId": object_id,
            "name": name,
            "type": 2,
        });

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::CollectionCreate,
                database_id: self.database_id,
                object_id: Some(object_id),
                payload: definition.clone(),
            },
            WalEvent::Put {
                cf: ColumnFamily::Definitions,
                object_id,
                key: name.to_string(),
                value: serde_json::to_vec(&definition)?,
            },
        ];

        state.objects.insert(
            object_id,
            ObjectRef {
                database_id: self.database_id,
                collection_id: id,
                name: name.to_string(),
                kind: ObjectKind::Collection,
            },
        );
        state.collections.insert(
            name.to_string(),
            Collection {
                id,
                object_id,
                name: name.to_string(),
                documents: Arc::new(BTreeMap::new()),
                stored_count: 0,
                indexes: BTreeMap::new(),
                sync_blockers: Vec::new(),
            },
        );
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });

        Ok(id)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let coll = state
            .collections
            .remove(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))?;

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::CollectionDrop,
                database_id: self.database_id,
                object_id: Some(coll.object_id),
                payload: json!({ "id": coll.id.to_string(), "name": name }),
            },
            WalEvent::Delete {
                cf: ColumnFamily::Definitions,
                object_id: coll.object_id,
                key: name.to_string(),
            },
        ];
        // The object directory keeps the tombstoned entry so older WAL
        // ranges can still be resolved during tailing.
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    pub fn rename_collection(&self, old: &str, new: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.collections.contains_key(new) {
            return Err(Error::Engine(format!("collection '{}' already exists", new)));
        }
        let mut coll = state
            .collections
            .remove(old)
            .ok_or_else(|| Error::CollectionNotFound(old.to_string()))?;
        coll.name = new.to_string();
        let object_id = coll.object_id;
        let id = coll.id;

        let definition = json!({
            "id": id.to_string(),
            "objectId": object_id,
            "name": new,
            "from": old,
            "type": 2,
        });

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::CollectionRename,
                database_id: self.database_id,
                object_id: Some(object_id),
                payload: definition.clone(),
            },
            WalEvent::Put {
                cf: ColumnFamily::Definitions,
                object_id,
                key: new.to_string(),
                value: serde_json::to_vec(&definition)?,
            },
        ];

        if let Some(entry) = state.objects.get_mut(&object_id) {
            entry.name = new.to_string();
        }
        state.collections.insert(new.to_string(), coll);
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    pub fn change_collection(&self, name: &str, props: serde_json::Value) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let coll = state
            .collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))?;
        let object_id = coll.object_id;
        let id = coll.id;

        let mut definition = json!({
            "id": id.to_string(),
            "objectId": object_id,
            "name": name,
            "type": 2,
        });
        if let (Some(def), Some(extra)) = (definition.as_object_mut(), props.as_object()) {
            for (k, v) in extra {
                def.insert(k.clone(), v.clone());
            }
        }

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::CollectionChange,
                database_id: self.database_id,
                object_id: Some(object_id),
                payload: definition.clone(),
            },
            WalEvent::Put {
                cf: ColumnFamily::Definitions,
                object_id,
                key: name.to_string(),
                value: serde_json::to_vec(&definition)?,
            },
        ];
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    pub fn truncate_collection(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let database_id = self.database_id;
        let coll = state
            .collections
            .get_mut(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))?;
        coll.documents = Arc::new(BTreeMap::new());
        coll.stored_count = 0;
        let object_id = coll.object_id;
        let id = coll.id;

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::CollectionTruncate,
                database_id,
                object_id: Some(object_id),
                payload: json!({ "id": id.to_string(), "name": name }),
            },
            WalEvent::Put {
                cf: ColumnFamily::Definitions,
                object_id,
                key: name.to_string(),
                value: serde_json::to_vec(&json!({ "id": id.to_string(), "name": name }))?,
            },
        ];
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    pub fn create_index(&self, collection: &str, definition: serde_json::Value) -> Result<u64> {
        let mut state = self.state.write().unwrap();
        let index_id = state.next_object_id;
        state.next_object_id += 1;
        let database_id = self.database_id;
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        let object_id = coll.object_id;

        let mut payload = json!({ "id": index_id.to_string() });
        if let (Some(p), Some(extra)) = (payload.as_object_mut(), definition.as_object()) {
            for (k, v) in extra {
                p.insert(k.clone(), v.clone());
            }
        }
        coll.indexes.insert(index_id, payload.clone());

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::IndexCreate,
                database_id,
                object_id: Some(object_id),
                payload: payload.clone(),
            },
            WalEvent::Put {
                cf: ColumnFamily::Definitions,
                object_id,
                key: format!("{}/index/{}", collection, index_id),
                value: serde_json::to_vec(&payload)?,
            },
        ];
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(index_id)
    }

    pub fn drop_index(&self, collection: &str, index_id: u64) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let database_id = self.database_id;
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        if coll.indexes.remove(&index_id).is_none() {
            return Err(Error::NotFound(format!(
                "index {} on collection '{}'",
                index_id, collection
            )));
        }
        let object_id = coll.object_id;

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::IndexDrop,
                database_id,
                object_id: Some(object_id),
                payload: json!({ "id": index_id.to_string() }),
            },
            WalEvent::Delete {
                cf: ColumnFamily::Definitions,
                object_id,
                key: format!("{}/index/{}", collection, index_id),
            },
        ];
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    pub fn create_view(&self, name: &str, definition: serde_json::Value) -> Result<u64> {
        let mut state = self.state.write().unwrap();
        if state.views.contains_key(name) {
            return Err(Error::Engine(format!("view '{}' already exists", name)));
        }
        let object_id = state.next_object_id;
        state.next_object_id += 1;

        state.objects.insert(
            object_id,
            ObjectRef {
                database_id: self.database_id,
                collection_id: 0,
                name: name.to_string(),
                kind: ObjectKind::View,
            },
        );
        state.views.insert(
            name.to_string(),
            View {
                object_id,
                definition: definition.clone(),
            },
        );

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::ViewCreate,
                database_id: self.database_id,
                object_id: Some(object_id),
                payload: definition.clone(),
            },
            WalEvent::Put {
                cf: ColumnFamily::Definitions,
                object_id,
                key: format!("view/{}", name),
                value: serde_json::to_vec(&definition)?,
            },
        ];
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(object_id)
    }

    pub fn change_view(&self, name: &str, definition: serde_json::Value) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let view = state
            .views
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("view '{}'", name)))?;
        view.definition = definition.clone();
        let object_id = view.object_id;

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::ViewChange,
                database_id: self.database_id,
                object_id: Some(object_id),
                payload: definition.clone(),
            },
            WalEvent::Put {
                cf: ColumnFamily::Definitions,
                object_id,
                key: format!("view/{}", name),
                value: serde_json::to_vec(&definition)?,
            },
        ];
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    pub fn drop_view(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let view = state
            .views
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("view '{}'", name)))?;

        let start = self.ticks.reserve(1);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::ViewDrop,
                database_id: self.database_id,
                object_id: Some(view.object_id),
                payload: json!({ "name": name }),
            },
            WalEvent::Delete {
                cf: ColumnFamily::Definitions,
                object_id: view.object_id,
                key: format!("view/{}", name),
            },
        ];
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    // --- document writes ------------------------------------------------

    pub fn insert_document(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> Result<u64> {
        if !body.is_object() {
            return Err(Error::BadRequest("document body must be an object".into()));
        }

        let mut state = self.state.write().unwrap();
        let database_id = self.database_id;
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        let object_id = coll.object_id;

        // Two keyed events: document body + primary-index entry
        let start = self.ticks.reserve(2);
        let revision = start;
        let doc = Document {
            key: key.to_string(),
            revision,
            body,
        };

        let events = vec![
            WalEvent::Tag {
                kind: TagKind::SinglePut,
                database_id,
                object_id: Some(object_id),
                payload: serde_json::Value::Null,
            },
            WalEvent::Put {
                cf: ColumnFamily::Documents,
                object_id,
                key: key.to_string(),
                value: serde_json::to_vec(&doc)?,
            },
            WalEvent::Put {
                cf: ColumnFamily::PrimaryIndex,
                object_id,
                key: key.to_string(),
                value: revision.to_le_bytes().to_vec(),
            },
        ];

        let mut documents = (*coll.documents).clone();
        if documents.insert(key.to_string(), doc).is_none() {
            coll.stored_count += 1;
        }
        coll.documents = Arc::new(documents);

        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(revision)
    }

    /// Follower-side upsert: store a replicated document keeping the
    /// leader-assigned revision. Still writes WAL events so a downstream
    /// consumer can tail this node in turn.
    pub fn apply_document(&self, collection: &str, doc: Document) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let database_id = self.database_id;
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        let object_id = coll.object_id;

        let start = self.ticks.reserve(2);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::SinglePut,
                database_id,
                object_id: Some(object_id),
                payload: serde_json::Value::Null,
            },
            WalEvent::Put {
                cf: ColumnFamily::Documents,
                object_id,
                key: doc.key.clone(),
                value: serde_json::to_vec(&doc)?,
            },
            WalEvent::Put {
                cf: ColumnFamily::PrimaryIndex,
                object_id,
                key: doc.key.clone(),
                value: doc.revision.to_le_bytes().to_vec(),
            },
        ];

        let mut documents = (*coll.documents).clone();
        if documents.insert(doc.key.clone(), doc).is_none() {
            coll.stored_count += 1;
        }
        coll.documents = Arc::new(documents);

        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    /// Follower-side removal; a missing key is a no-op so replay stays
    /// idempotent
    pub fn apply_removal(&self, collection: &str, key: &str) -> Result<()> {
        {
            let state = self.state.read().unwrap();
            let coll = state
                .collections
                .get(collection)
                .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
            if !coll.documents.contains_key(key) {
                return Ok(());
            }
        }
        self.remove_document(collection, key)
    }

    pub fn remove_document(&self, collection: &str, key: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let database_id = self.database_id;
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        let object_id = coll.object_id;

        if !coll.documents.contains_key(key) {
            return Err(Error::NotFound(format!(
                "document '{}' in collection '{}'",
                key, collection
            )));
        }

        let start = self.ticks.reserve(2);
        let events = vec![
            WalEvent::Tag {
                kind: TagKind::SingleRemove,
                database_id,
                object_id: Some(object_id),
                payload: serde_json::Value::Null,
            },
            WalEvent::Delete {
                cf: ColumnFamily::Documents,
                object_id,
                key: key.to_string(),
            },
            WalEvent::Delete {
                cf: ColumnFamily::PrimaryIndex,
                object_id,
                key: key.to_string(),
            },
        ];

        let mut documents = (*coll.documents).clone();
        documents.remove(key);
        coll.stored_count = coll.stored_count.saturating_sub(1);
        coll.documents = Arc::new(documents);

        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    pub fn write_transaction(&self, tx_id: u64, ops: Vec<TxOp>) -> Result<()> {
        if ops.is_empty() {
            return Err(Error::BadRequest("empty transaction".into()));
        }
        for op in &ops {
            if let Some(body) = &op.body {
                if !body.is_object() {
                    return Err(Error::BadRequest("document body must be an object".into()));
                }
            }
        }

        let mut state = self.state.write().unwrap();
        for op in &ops {
            if !state.collections.contains_key(&op.collection) {
                return Err(Error::CollectionNotFound(op.collection.clone()));
            }
        }

        // Two keyed events per document op, bracketed by begin/commit tags
        let start = self.ticks.reserve(2 * ops.len() as u64);
        let tid_payload = json!({ "tid": tx_id.to_string() });

        let mut events = vec![WalEvent::Tag {
            kind: TagKind::BeginTransaction,
            database_id: self.database_id,
            object_id: None,
            payload: tid_payload.clone(),
        }];

        for (i, op) in ops.iter().enumerate() {
            let coll = state.collections.get_mut(&op.collection).unwrap();
            let object_id = coll.object_id;
            let revision = start + 2 * i as u64;

            match &op.body {
                Some(body) => {
                    let doc = Document {
                        key: op.key.clone(),
                        revision,
                        body: body.clone(),
                    };
                    events.push(WalEvent::Put {
                        cf: ColumnFamily::Documents,
                        object_id,
                        key: op.key.clone(),
                        value: serde_json::to_vec(&doc)?,
                    });
                    events.push(WalEvent::Put {
                        cf: ColumnFamily::PrimaryIndex,
                        object_id,
                        key: op.key.clone(),
                        value: revision.to_le_bytes().to_vec(),
                    });

                    let mut documents = (*coll.documents).clone();
                    if documents.insert(op.key.clone(), doc).is_none() {
                        coll.stored_count += 1;
                    }
                    coll.documents = Arc::new(documents);
                }
                None => {
                    events.push(WalEvent::Delete {
                        cf: ColumnFamily::Documents,
                        object_id,
                        key: op.key.clone(),
                    });
                    events.push(WalEvent::Delete {
                        cf: ColumnFamily::PrimaryIndex,
                        object_id,
                        key: op.key.clone(),
                    });

                    let mut documents = (*coll.documents).clone();
                    if documents.remove(&op.key).is_some() {
                        coll.stored_count = coll.stored_count.saturating_sub(1);
                    }
                    coll.documents = Arc::new(documents);
                }
            }
        }

        events.push(WalEvent::Tag {
            kind: TagKind::CommitTransaction,
            database_id: self.database_id,
            object_id: None,
            payload: tid_payload,
        });

        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(())
    }

    // --- snapshot reads -------------------------------------------------

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.read().unwrap();
        let collections = state
            .collections
            .values()
            .map(|c| {
                (
                    c.name.clone(),
                    SnapshotCollection {
                        id: c.id,
                        object_id: c.object_id,
                        name: c.name.clone(),
                        documents: Arc::clone(&c.documents),
                        stored_count: c.stored_count,
                    },
                )
            })
            .collect();
        EngineSnapshot {
            sequence: self.ticks.current(),
            collections,
        }
    }

    pub fn object_directory(&self) -> ObjectDirectory {
        let state = self.state.read().unwrap();
        ObjectDirectory::new(state.objects.clone())
    }

    pub fn stored_count(&self, collection: &str) -> Result<u64> {
        let state = self.state.read().unwrap();
        state
            .collections
            .get(collection)
            .map(|c| c.stored_count)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    pub fn adjust_document_count(&self, collection: &str, diff: i64) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        if diff >= 0 {
            coll.stored_count = coll.stored_count.saturating_add(diff as u64);
        } else {
            coll.stored_count = coll.stored_count.saturating_sub(diff.unsigned_abs());
        }
        Ok(())
    }

    // --- sync-summary blockers -----------------------------------------

    pub fn place_sync_blocker(&self, collection: &str, blocker_id: u64) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        coll.sync_blockers.push(blocker_id);
        Ok(())
    }

    pub fn remove_sync_blocker(&self, blocker_id: u64) {
        let mut state = self.state.write().unwrap();
        for coll in state.collections.values_mut() {
            coll.sync_blockers.retain(|b| *b != blocker_id);
        }
    }

    pub fn has_sync_blockers(&self, collection: &str) -> Result<bool> {
        let state = self.state.read().unwrap();
        state
            .collections
            .get(collection)
            .map(|c| !c.sync_blockers.is_empty())
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    // --- WAL access -----------------------------------------------------

    pub fn wal_batches_from(&self, from: Tick) -> Result<Vec<WalBatch>> {
        let state = self.state.read().unwrap();
        let mut batches = Vec::new();

        for info in state.archived.values() {
            if info.last_sequence < from {
                continue;
            }
            for batch in wal::read_segment(&info.path)? {
                if batch.end_sequence() >= from {
                    batches.push(batch);
                }
            }
        }

        for batch in &state.live {
            if batch.end_sequence() >= from {
                batches.push(batch.clone());
            }
        }

        Ok(batches)
    }

    pub fn flush_wal(&self, force: bool) -> Result<usize> {
        let mut state = self.state.write().unwrap();
        let mut archived_files = 0;

        loop {
            let take = if state.live.len() >= self.segment_batches {
                self.segment_batches
            } else if force && !state.live.is_empty() {
                state.live.len()
            } else {
                break;
            };

            let group: Vec<WalBatch> = state.live.drain(..take).collect();
            let first = group[0].start_sequence;
            let last = group.last().unwrap().end_sequence();
            let path = wal::segment_path(&self.archive_dir, first);
            wal::write_segment(&path, &group, self.compression)?;
            let size = std::fs::metadata(&path)?.len();
            debug!(first, last, size, "archived WAL segment");
            state.archived.insert(
                first,
                ArchivedInfo {
                    path,
                    last_sequence: last,
                    size,
                },
            );
            archived_files += 1;
        }

        Ok(archived_files)
    }

    pub fn list_wal_segments(&self) -> Vec<WalSegmentInfo> {
        let state = self.state.read().unwrap();
        let mut infos: Vec<WalSegmentInfo> = state
            .archived
            .iter()
            .map(|(start, info)| WalSegmentInfo {
                start_sequence: *start,
                last_sequence: info.last_sequence,
                archived: true,
                size: info.size,
                path: Some(info.path.clone()),
            })
            .collect();

        if let (Some(front), Some(back)) = (state.live.front(), state.live.back()) {
            infos.push(WalSegmentInfo {
                start_sequence: front.start_sequence,
                last_sequence: back.end_sequence(),
                archived: false,
                size: 0,
                path: None,
            });
        }

        infos
    }

    pub fn delete_wal_segment(&self, start_sequence: Tick) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        let info = state
            .archived
            .get(&start_sequence)
            .ok_or_else(|| Error::NotFound(format!("WAL segment {}", start_sequence)))?;

        match std::fs::remove_file(&info.path) {
            Ok(()) => {
                state.archived.remove(&start_sequence);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Already pruned out from under us; drop the index entry
                state.archived.remove(&start_sequence);
                Ok(false)
            }
            // Keep the index entry so the next cycle retries
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn append_raw_batch(&self, events: Vec<WalEvent>) -> Result<Tick> {
        let keyed = events.iter().filter(|e| e.is_keyed()).count() as u64;
        let mut state = self.state.write().unwrap();
        let start = self.ticks.reserve(keyed.max(1));
        state.live.push_back(WalBatch {
            start_sequence: start,
            events,
        });
        Ok(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_engine(dir: &std::path::Path, segment_batches: usize) -> MemoryEngine {
        MemoryEngine::open(
            Arc::new(TickSource::new(0)),
            1,
            dir.to_path_buf(),
            true,
            segment_batches,
        )
        .unwrap()
    }

    #[test]
    fn test_insert_and_snapshot_isolation() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path(), 64);
        engine.create_collection("docs").unwrap();

        engine
            .insert_document("docs", "a", json!({ "v": 1 }))
            .unwrap();
        let snap = engine.snapshot();
        engine
            .insert_document("docs", "b", json!({ "v": 2 }))
            .unwrap();

        let coll = snap.collection("docs").unwrap();
        assert_eq!(coll.documents.len(), 1);
        assert!(coll.documents.contains_key("a"));

        let later = engine.snapshot();
        assert_eq!(later.collection("docs").unwrap().documents.len(), 2);
        assert!(later.sequence > snap.sequence);
    }

    #[test]
    fn test_revision_is_write_tick() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path(), 64);
        engine.create_collection("docs").unwrap();

        let r1 = engine
            .insert_document("docs", "a", json!({ "v": 1 }))
            .unwrap();
        let r2 = engine
            .insert_document("docs", "a", json!({ "v": 2 }))
            .unwrap();
        assert!(r2 > r1);

        let snap = engine.snapshot();
        let doc = snap.collection("docs").unwrap().documents.get("a").unwrap();
        assert_eq!(doc.revision, r2);
        assert_eq!(doc.body["v"], json!(2));
        // update of an existing key does not change the count
        assert_eq!(engine.stored_count("docs").unwrap(), 1);
    }

    #[test]
    fn test_transaction_batch_layout() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path(), 64);
        engine.create_collection("docs").unwrap();

        engine
            .write_transaction(
                99,
                vec![
                    TxOp {
                        collection: "docs".into(),
                        key: "a".into(),
                        body: Some(json!({ "v": 1 })),
                    },
                    TxOp {
                        collection: "docs".into(),
                        key: "b".into(),
                        body: Some(json!({ "v": 2 })),
                    },
                ],
            )
            .unwrap();

        let batches = engine.wal_batches_from(0).unwrap();
        let tx_batch = batches.last().unwrap();
        assert_eq!(tx_batch.keyed_count(), 4);
        assert!(matches!(
            tx_batch.events.first(),
            Some(WalEvent::Tag { kind: TagKind::BeginTransaction, .. })
        ));
        assert!(matches!(
            tx_batch.events.last(),
            Some(WalEvent::Tag { kind: TagKind::CommitTransaction, .. })
        ));
    }

    #[test]
    fn test_flush_and_read_back() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path(), 2);
        engine.create_collection("docs").unwrap();
        for i in 0..5 {
            engine
                .insert_document("docs", &format!("k{}", i), json!({ "i": i }))
                .unwrap();
        }

        // 6 batches live (1 DDL + 5 inserts), segment size 2 -> 3 full groups
        let archived = engine.flush_wal(false).unwrap();
        assert_eq!(archived, 3);

        let segments = engine.list_wal_segments();
        let archived_segments: Vec<_> = segments.iter().filter(|s| s.archived).collect();
        assert_eq!(archived_segments.len(), 3);

        // everything must still be readable across the archive/live boundary
        let batches = engine.wal_batches_from(1).unwrap();
        assert_eq!(batches.len(), 6);
        assert_eq!(engine.oldest_retained_sequence(), 1);
    }

    #[test]
    fn test_delete_segment_and_missing_file() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path(), 1);
        engine.create_collection("docs").unwrap();
        engine
            .insert_document("docs", "a", json!({ "v": 1 }))
            .unwrap();
        engine.flush_wal(true).unwrap();

        let segments = engine.list_wal_segments();
        let first = segments.iter().find(|s| s.archived).unwrap();
        let path = first.path.clone().unwrap();
        let start = first.start_sequence;

        // delete behind the engine's back: must not be an error
        std::fs::remove_file(&path).unwrap();
        assert!(!engine.delete_wal_segment(start).unwrap());

        // second delete: the index entry is gone
        assert!(engine.delete_wal_segment(start).is_err());
    }

    #[test]
    fn test_reopen_advances_ticks() {
        let dir = tempdir().unwrap();
        let last = {
            let engine = test_engine(dir.path(), 1);
            engine.create_collection("docs").unwrap();
            engine
                .insert_document("docs", "a", json!({ "v": 1 }))
                .unwrap();
            engine.flush_wal(true).unwrap();
            engine.current_sequence()
        };

        let reopened = test_engine(dir.path(), 1);
        assert_eq!(reopened.current_sequence(), last);
        assert_eq!(reopened.oldest_retained_sequence(), 1);
    }

    #[test]
    fn test_count_adjustment() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path(), 64);
        engine.create_collection("docs").unwrap();
        engine
            .insert_document("docs", "a", json!({ "v": 1 }))
            .unwrap();

        engine.adjust_document_count("docs", 3).unwrap();
        assert_eq!(engine.stored_count("docs").unwrap(), 4);
        engine.adjust_document_count("docs", -3).unwrap();
        assert_eq!(engine.stored_count("docs").unwrap(), 1);
    }

    #[test]
    fn test_blockers() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path(), 64);
        engine.create_collection("docs").unwrap();

        engine.place_sync_blocker("docs", 42).unwrap();
        assert!(engine.has_sync_blockers("docs").unwrap());
        engine.remove_sync_blocker(42);
        assert!(!engine.has_sync_blockers("docs").unwrap());
    }

    #[test]
    fn test_truncate_resets_documents_and_count() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path(), 64);
        engine.create_collection("docs").unwrap();
        engine
            .insert_document("docs", "a", json!({ "v": 1 }))
            .unwrap();
        engine.truncate_collection("docs").unwrap();

        assert_eq!(engine.stored_count("docs").unwrap(), 0);
        let snap = engine.snapshot();
        assert!(snap.collection("docs").unwrap().documents.is_empty());
    }
}
