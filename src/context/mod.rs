//! Replication Context / Snapshot Manager
//!
//! Each replication client negotiates a context: a TTL-bounded bundle of one
//! engine snapshot plus per-collection cursors, giving the client an
//! isolated, consistent view for dumping. The snapshot is bound lazily on
//! first real use so creating contexts stays cheap.
//!
//! Lifecycle discipline: callers never hold a context directly, only a
//! [`ContextGuard`] leased from the manager. The guard marks the context
//! in use; the expiry sweep will not free an in-use context, only mark it
//! to-delete, and the actual teardown happens when the last guard drops.
//! No handle is ever freed under a caller.

pub mod cursor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::{EngineSnapshot, StorageEngine};
use crate::error::{Error, Result};
use crate::id::{BlockerId, ContextId, IdGenerator};
use crate::tick::{tick_str, Tick, UNBOUNDED_TICK};

pub use cursor::{CollectionCursor, CursorHandle, CursorOrder, DumpPage};

/// One collection in an inventory response
#[derive(Debug, Clone, Serialize)]
pub struct InventoryCollection {
    #[serde(with = "tick_str")]
    pub id: u64,
    pub name: String,
    pub count: u64,
}

/// Handshake response: the collections a follower may sync, pinned by
/// blockers until the owning context goes away
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    #[serde(with = "tick_str")]
    pub tick: Tick,
    pub collections: Vec<InventoryCollection>,
}

struct ContextEntry {
    syncer_id: u64,
    client_id: u64,
    /// Originally negotiated TTL; extensions never go below it
    ttl: Duration,
    expires_at: DateTime<Utc>,
    /// Bound on first real use
    snapshot: Option<EngineSnapshot>,
    cursors: HashMap<String, Arc<CollectionCursor>>,
    in_use: u32,
    to_delete: bool,
    /// Collection whose document count is corrected once at end-of-scan
    patch_count: Option<String>,
    blockers: Vec<BlockerId>,
}

/// Owns all replication contexts; one coarse mutex, short critical sections.
/// Document-copy work happens outside the lock, holding only the snapshot
/// `Arc`s and a cursor handle.
pub struct ContextManager {
    engine: Arc<StorageEngine>,
    ids: IdGenerator,
    contexts: Mutex<HashMap<ContextId, ContextEntry>>,
}

impl ContextManager {
    pub fn new(engine: Arc<StorageEngine>, ids: IdGenerator) -> Self {
        Self {
            engine,
            ids,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new context. Returns its id and the engine's current tick
    /// so the client knows where tailing must start to cover the snapshot.
    pub fn create_context(
        &self,
        ttl: Duration,
        syncer_id: u64,
        client_id: u64,
        patch_count: Option<String>,
    ) -> (ContextId, Tick) {
        let id = self.ids.generate();
        let entry = ContextEntry {
            syncer_id,
            client_id,
            ttl,
            expires_at: expiry(ttl),
            snapshot: None,
            cursors: HashMap::new(),
            in_use: 0,
            to_delete: false,
            patch_count,
            blockers: Vec::new(),
        };
        let mut contexts = self.contexts.lock().unwrap();
        contexts.insert(id, entry);
        debug!(id, syncer_id, client_id, "created replication context");
        (id, self.engine.current_sequence())
    }

    /// Lease a context for use. Extends its expiry; the returned guard
    /// releases the lease on drop.
    pub fn lease(&self, id: ContextId) -> Result<ContextGuard<'_>> {
        let mut contexts = self.contexts.lock().unwrap();
        let entry = contexts.get_mut(&id).ok_or(Error::ContextNotFound(id))?;
        if entry.to_delete {
            return Err(Error::ContextNotFound(id));
        }
        entry.in_use += 1;
        entry.expires_at = expiry(entry.ttl);
        Ok(ContextGuard { manager: self, id })
    }

    /// Keep-alive: extend the TTL, never below the originally negotiated one
    pub fn extend(&self, id: ContextId, requested: Duration) -> Result<()> {
        let mut contexts = self.contexts.lock().unwrap();
        let entry = contexts.get_mut(&id).ok_or(Error::ContextNotFound(id))?;
        entry.expires_at = expiry(requested.max(entry.ttl));
        Ok(())
    }

    /// Destroy a context. If it is currently leased, destruction is
    /// deferred to the last guard drop; returns whether it was immediate.
    pub fn delete(&self, id: ContextId) -> Result<bool> {
        let mut contexts = self.contexts.lock().unwrap();
        let entry = contexts.get_mut(&id).ok_or(Error::ContextNotFound(id))?;
        if entry.in_use > 0 {
            entry.to_delete = true;
            debug!(id, "context in use, deferred deletion to release");
            return Ok(false);
        }
        let entry = contexts.remove(&id).unwrap();
        drop(contexts);
        self.release_blockers(&entry);
        Ok(true)
    }

    /// Drop contexts expired before `threshold` that are not in use; mark
    /// in-use ones for deletion on release. Returns how many were freed.
    pub fn sweep(&self, threshold: DateTime<Utc>) -> usize {
        let mut contexts = self.contexts.lock().unwrap();
        let expired: Vec<ContextId> = contexts
            .iter()
            .filter(|(_, e)| e.expires_at < threshold)
            .map(|(id, _)| *id)
            .collect();

        let mut removed = Vec::new();
        for id in expired {
            let entry = contexts.get_mut(&id).unwrap();
            if entry.in_use > 0 {
                entry.to_delete = true;
                debug!(id, "expired context in use, marked for deletion");
            } else {
                removed.push(contexts.remove(&id).unwrap());
                debug!(id, "swept expired context");
            }
        }
        drop(contexts);

        for entry in &removed {
            self.release_blockers(entry);
        }
        removed.len()
    }

    /// Lowest snapshot sequence still pinned by a live context. Contexts
    /// that have not bound a snapshot yet pin nothing; callers treat the
    /// unbounded result as "no context in the way".
    pub fn lowest_snapshot_sequence(&self) -> Tick {
        let contexts = self.contexts.lock().unwrap();
        contexts
            .values()
            .filter_map(|e| e.snapshot.as_ref().map(|s| s.sequence))
            .min()
            .unwrap_or(UNBOUNDED_TICK)
    }

    /// Number of live contexts, for diagnostics
    pub fn len(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_blockers(&self, entry: &ContextEntry) {
        for blocker in &entry.blockers {
            self.engine.remove_sync_blocker(*blocker);
        }
    }

    /// Run `f` on one context under the table lock, binding the snapshot
    /// first if this is the context's first real use
    fn with_entry<T>(
        &self,
        id: ContextId,
        f: impl FnOnce(&mut ContextEntry) -> Result<T>,
    ) -> Result<T> {
        let mut contexts = self.contexts.lock().unwrap();
        let entry = contexts.get_mut(&id).ok_or(Error::ContextNotFound(id))?;
        if entry.snapshot.is_none() {
            entry.snapshot = Some(self.engine.snapshot());
        }
        f(entry)
    }
}

/// TTLs beyond the representable range are treated as "never expires",
/// not as zero
fn expiry(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Leased access to one context. Dropping the guard releases the lease and
/// completes any deferred deletion.
pub struct ContextGuard<'a> {
    manager: &'a ContextManager,
    id: ContextId,
}

impl ContextGuard<'_> {
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Tick at which this context's snapshot was taken; binds the snapshot
    /// if not yet bound
    pub fn snapshot_sequence(&self) -> Result<Tick> {
        self.manager
            .with_entry(self.id, |entry| Ok(entry.snapshot.as_ref().unwrap().sequence))
    }

    /// Create-or-reuse the cursor for one collection over this context's
    /// snapshot. The cursor keeps its position across leases.
    pub fn bind_collection(
        &self,
        name: &str,
        order: CursorOrder,
    ) -> Result<Arc<CollectionCursor>> {
        self.manager.with_entry(self.id, |entry| {
            if let Some(existing) = entry.cursors.get(name) {
                return Ok(Arc::clone(existing));
            }
            let snapshot = entry.snapshot.as_ref().unwrap();
            let collection = snapshot.collection(name)?.clone();
            let cursor = Arc::new(CollectionCursor::new(collection, order));
            entry.cursors.insert(name.to_string(), Arc::clone(&cursor));
            Ok(cursor)
        })
    }

    /// Enumerate the snapshot's non-system collections, placing a blocker on
    /// each so its sync summary survives until this context goes away
    pub fn inventory(&self) -> Result<Inventory> {
        let engine = self.manager.engine.clone();
        let ids = &self.manager.ids;

        self.manager.with_entry(self.id, |entry| {
            let snapshot = entry.snapshot.as_ref().unwrap();
            let mut collections = Vec::new();
            for coll in snapshot.collections.values() {
                if coll.name.starts_with('_') {
                    continue;
                }
                let blocker = ids.generate();
                engine.place_sync_blocker(&coll.name, blocker)?;
                entry.blockers.push(blocker);
                collections.push(InventoryCollection {
                    id: coll.id,
                    name: coll.name.clone(),
                    count: coll.stored_count,
                });
            }
            Ok(Inventory {
                tick: snapshot.sequence,
                collections,
            })
        })
    }

    /// Advance the collection's cursor by up to `budget_bytes` of documents.
    /// When the scan completes and this context carries a count-correction
    /// ticket for the collection, the correction is applied exactly once.
    pub fn dump_documents(&self, collection: &str, budget_bytes: usize) -> Result<DumpPage> {
        let cursor = self.bind_collection(collection, CursorOrder::PrimaryKey)?;
        let handle = cursor.acquire()?;
        let page = handle.next_page(budget_bytes)?;

        if !page.has_more {
            self.apply_count_correction(collection, handle.len() as u64)?;
        }
        Ok(page)
    }

    /// Compare-and-adjust the engine's maintained count against what a full
    /// scan actually delivered. Consumes the ticket; drift is a warning,
    /// never an error to the caller.
    fn apply_count_correction(&self, collection: &str, scanned: u64) -> Result<()> {
        let ticket = self.manager.with_entry(self.id, |entry| {
            if entry.patch_count.as_deref() == Some(collection) {
                Ok(entry.patch_count.take())
            } else {
                Ok(None)
            }
        })?;
        let Some(collection) = ticket else {
            return Ok(());
        };

        let stored = self.manager.engine.stored_count(&collection)?;
        if stored != scanned {
            warn!(
                collection = %collection,
                stored,
                scanned,
                "document count drift detected at end of scan, correcting"
            );
            self.manager
                .engine
                .adjust_document_count(&collection, scanned as i64 - stored as i64)?;
        }
        Ok(())
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let mut contexts = self.manager.contexts.lock().unwrap();
        let Some(entry) = contexts.get_mut(&self.id) else {
            return;
        };
        entry.in_use = entry.in_use.saturating_sub(1);
        if entry.to_delete && entry.in_use == 0 {
            let entry = contexts.remove(&self.id).unwrap();
            drop(contexts);
            self.manager.release_blockers(&entry);
            debug!(id = self.id, "released and destroyed context");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::tick::TickSource;
    use serde_json::json;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(60);

    fn setup(dir: &std::path::Path) -> (Arc<StorageEngine>, ContextManager) {
        let engine = MemoryEngine::open(
            Arc::new(TickSource::new(0)),
            1,
            dir.to_path_buf(),
            false,
            64,
        )
        .unwrap();
        engine.create_collection("docs").unwrap();
        let engine = StorageEngine::memory(engine);
        let manager = ContextManager::new(Arc::clone(&engine), IdGenerator::new(1));
        (engine, manager)
    }

    #[test]
    fn test_unknown_context_is_not_found() {
        let dir = tempdir().unwrap();
        let (_, manager) = setup(dir.path());
        assert!(matches!(manager.lease(42), Err(Error::ContextNotFound(42))));
        assert!(manager.extend(42, TTL).is_err());
        assert!(manager.delete(42).is_err());
    }

    #[test]
    fn test_snapshot_binds_lazily_on_first_use() {
        let dir = tempdir().unwrap();
        let (engine, manager) = setup(dir.path());
        let (id, _) = manager.create_context(TTL, 1, 0, None);

        // writes after creation but before first use are visible
        engine.insert_document("docs", "a", json!({ "v": 1 })).unwrap();
        let guard = manager.lease(id).unwrap();
        let cursor = guard.bind_collection("docs", CursorOrder::PrimaryKey).unwrap();
        assert_eq!(cursor.len(), 1);
        assert_eq!(guard.snapshot_sequence().unwrap(), engine.current_sequence());
        assert_eq!(manager.lowest_snapshot_sequence(), engine.current_sequence());
        drop(guard);

        // writes after binding are not
        engine.insert_document("docs", "b", json!({ "v": 2 })).unwrap();
        let guard = manager.lease(id).unwrap();
        let cursor = guard.bind_collection("docs", CursorOrder::PrimaryKey).unwrap();
        assert_eq!(cursor.len(), 1);
    }

    #[test]
    fn test_cursor_position_survives_releases() {
        let dir = tempdir().unwrap();
        let (engine, manager) = setup(dir.path());
        for i in 0..10 {
            engine
                .insert_document("docs", &format!("k{}", i), json!({ "i": i }))
                .unwrap();
        }
        let (id, _) = manager.create_context(TTL, 1, 0, None);

        let mut delivered = 0;
        let mut calls = 0;
        loop {
            // a fresh lease per call, as the wire layer does
            let guard = manager.lease(id).unwrap();
            let page = guard.dump_documents("docs", 1).unwrap();
            delivered += page.documents.len();
            calls += 1;
            if !page.has_more {
                break;
            }
        }
        assert_eq!(delivered, 10);
        assert_eq!(calls, 10);
    }

    #[test]
    fn test_extend_never_shrinks_below_creation_ttl() {
        let dir = tempdir().unwrap();
        let (_, manager) = setup(dir.path());
        let (id, _) = manager.create_context(TTL, 1, 0, None);

        // a shorter extension still buys the full creation TTL
        manager.extend(id, Duration::from_millis(1)).unwrap();
        let just_under = Utc::now() + chrono::Duration::from_std(TTL).unwrap()
            - chrono::Duration::seconds(1);
        assert_eq!(manager.sweep(just_under), 0);
        assert!(manager.lease(id).is_ok());
    }

    #[test]
    fn test_out_of_range_ttl_never_expires() {
        let dir = tempdir().unwrap();
        let (_, manager) = setup(dir.path());
        let (id, _) = manager.create_context(Duration::MAX, 1, 0, None);

        let far = Utc::now() + chrono::Duration::days(365 * 100);
        assert_eq!(manager.sweep(far), 0);
        assert!(manager.lease(id).is_ok());
    }

    #[test]
    fn test_sweep_respects_in_use_contexts() {
        let dir = tempdir().unwrap();
        let (_, manager) = setup(dir.path());
        let (expired, _) = manager.create_context(Duration::from_millis(1), 1, 0, None);
        let (held, _) = manager.create_context(Duration::from_millis(1), 2, 0, None);

        let guard = manager.lease(held).unwrap();
        let far = Utc::now() + chrono::Duration::days(1);
        assert_eq!(manager.sweep(far), 1); // only the unleased one
        assert!(manager.lease(expired).is_err());

        // the held one is gone once the guard drops
        drop(guard);
        assert!(manager.lease(held).is_err());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_delete_defers_while_leased() {
        let dir = tempdir().unwrap();
        let (_, manager) = setup(dir.path());
        let (id, _) = manager.create_context(TTL, 1, 0, None);

        let guard = manager.lease(id).unwrap();
        assert!(!manager.delete(id).unwrap()); // deferred
        assert!(manager.lease(id).is_err()); // no new leases
        drop(guard);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_inventory_places_and_releases_blockers() {
        let dir = tempdir().unwrap();
        let (engine, manager) = setup(dir.path());
        engine.create_collection("_system").unwrap();
        let (id, _) = manager.create_context(TTL, 1, 0, None);

        let guard = manager.lease(id).unwrap();
        let inventory = guard.inventory().unwrap();
        drop(guard);

        // system collections are not offered
        assert_eq!(inventory.collections.len(), 1);
        assert_eq!(inventory.collections[0].name, "docs");
        assert!(engine.has_sync_blockers("docs").unwrap());

        manager.delete(id).unwrap();
        assert!(!engine.has_sync_blockers("docs").unwrap());
    }

    #[test]
    fn test_count_correction_applied_exactly_once() {
        let dir = tempdir().unwrap();
        let (engine, manager) = setup(dir.path());
        for i in 0..5 {
            engine
                .insert_document("docs", &format!("k{}", i), json!({ "i": i }))
                .unwrap();
        }
        // introduce drift in the maintained count
        engine.adjust_document_count("docs", 3).unwrap();
        assert_eq!(engine.stored_count("docs").unwrap(), 8);

        let (id, _) = manager.create_context(TTL, 1, 0, Some("docs".to_string()));
        let guard = manager.lease(id).unwrap();
        let page = guard.dump_documents("docs", 1 << 20).unwrap();
        assert!(!page.has_more);
        assert_eq!(engine.stored_count("docs").unwrap(), 5);

        // a second full scan with the ticket consumed does not re-adjust
        engine.adjust_document_count("docs", 2).unwrap();
        let cursor = guard.bind_collection("docs", CursorOrder::PrimaryKey).unwrap();
        cursor.acquire().unwrap().set_offset(0);
        let page = guard.dump_documents("docs", 1 << 20).unwrap();
        assert!(!page.has_more);
        assert_eq!(engine.stored_count("docs").unwrap(), 7);
    }
}
