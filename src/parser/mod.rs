//! WAL Log Parser
//!
//! Replays the engine's low-level WAL events into [`LogicalOperation`]s,
//! scoped to one database and optionally one collection.
//!
//! The parser is a small state machine: a tag event announces intent, which
//! the next matching keyed event consumes to emit a full operation. A
//! transaction tag opens a state that persists across many keyed events
//! until its commit tag. Anything else the parser does not understand is
//! logged and skipped; tick accounting still advances for every keyed event
//! so a caller scanning a range sees contiguous positions even when most
//! content is filtered out.

pub mod intent;
pub mod operation;

use serde_json::json;
use tracing::{debug, trace, warn};

use crate::engine::{ColumnFamily, ObjectDirectory, ObjectKind, WalBatch, WalEvent};
use crate::tick::Tick;

pub use intent::Intent;
pub use operation::{LogicalOperation, OperationType};

/// Streaming WAL-to-logical-operation parser.
///
/// Holds no state across calls other than the single pending intent, so one
/// instance can be driven batch by batch over an arbitrarily long range.
pub struct WalTailParser {
    database_id: u64,
    /// Public collection id filter; `None` parses the whole database
    collection_id: Option<u64>,
    include_system: bool,
    directory: ObjectDirectory,
    pending: Option<Intent>,
    /// Highest tick emitted so far, for the debug monotonicity check
    last_emitted: Tick,
}

impl WalTailParser {
    pub fn new(database_id: u64, directory: ObjectDirectory) -> Self {
        Self {
            database_id,
            collection_id: None,
            include_system: false,
            directory,
            pending: None,
            last_emitted: 0,
        }
    }

    /// Restrict output to a single collection (by public id)
    pub fn with_collection(mut self, collection_id: u64) -> Self {
        self.collection_id = Some(collection_id);
        self
    }

    pub fn with_system_collections(mut self, include: bool) -> Self {
        self.include_system = include;
        self
    }

    /// Discard any pending intent, returning to the ground state
    pub fn reset(&mut self) {
        self.pending = None;
    }

    pub fn parse(&mut self, batches: &[WalBatch]) -> Vec<LogicalOperation> {
        let mut out = Vec::new();
        for batch in batches {
            self.parse_batch(batch, &mut out);
        }
        out
    }

    /// Replay one batch, appending emitted operations to `out`
    pub fn parse_batch(&mut self, batch: &WalBatch, out: &mut Vec<LogicalOperation>) {
        let mut keyed_seen: u64 = 0;

        for event in &batch.events {
            match event {
                WalEvent::Tag {
                    kind,
                    database_id,
                    object_id,
                    payload,
                } => {
                    // Tags at the front of the batch carry the start
                    // sequence; later ones the tick of the last keyed event
                    let tick = if keyed_seen == 0 {
                        batch.start_sequence
                    } else {
                        batch.start_sequence + keyed_seen - 1
                    };
                    self.handle_tag(tick, *kind, *database_id, *object_id, payload, out);
                }
                keyed => {
                    let tick = batch.start_sequence + keyed_seen;
                    keyed_seen += 1;
                    self.handle_keyed(tick, keyed, out);
                }
            }
        }
    }

    fn handle_tag(
        &mut self,
        tick: Tick,
        kind: crate::engine::TagKind,
        database_id: u64,
        object_id: Option<u64>,
        payload: &serde_json::Value,
        out: &mut Vec<LogicalOperation>,
    ) {
        use crate::engine::TagKind;

        if database_id != self.database_id {
            // Foreign database activity invalidates whatever was pending
            self.pending = None;
            return;
        }

        match kind {
            TagKind::DatabaseCreate | TagKind::DatabaseDrop => {
                self.pending = None;
                if self.collection_id.is_none() {
                    let op_type = if kind == TagKind::DatabaseCreate {
                        OperationType::DatabaseCreate
                    } else {
                        OperationType::DatabaseDrop
                    };
                    self.emit(
                        LogicalOperation::database_scoped(
                            tick,
                            op_type,
                            database_id,
                            Some(payload.clone()),
                        ),
                        out,
                    );
                }
            }
            TagKind::CommitTransaction => {
                let open_tid = self.pending.as_ref().and_then(Intent::transaction_id);
                match (open_tid, intent::parse_tid(payload)) {
                    (Some(open), Some(committed)) if open == committed => {
                        self.pending = None;
                        if self.collection_id.is_none() {
                            let mut op = LogicalOperation::database_scoped(
                                tick,
                                OperationType::TransactionCommit,
                                database_id,
                                None,
                            );
                            op.tid = committed;
                            self.emit(op, out);
                        }
                    }
                    (open, committed) => {
                        warn!(?open, ?committed, "commit tag without matching open transaction");
                        self.pending = None;
                    }
                }
            }
            TagKind::BeginTransaction => {
                if self.pending.take().and_then(|i| i.transaction_id()).is_some() {
                    debug!("transaction never committed in observed range");
                }
                if let Some(intent) = Intent::from_tag(kind, object_id, payload) {
                    if self.collection_id.is_none() {
                        let mut op = LogicalOperation::database_scoped(
                            tick,
                            OperationType::TransactionBegin,
                            database_id,
                            None,
                        );
                        op.tid = intent.transaction_id().unwrap_or(0);
                        self.emit(op, out);
                    }
                    self.pending = Some(intent);
                } else {
                    warn!("begin-transaction tag without a transaction id");
                }
            }
            _ => {
                if self.pending.take().and_then(|i| i.transaction_id()).is_some() {
                    debug!("transaction never committed in observed range");
                }
                self.pending = Intent::from_tag(kind, object_id, payload);
            }
        }
    }

    fn handle_keyed(&mut self, tick: Tick, event: &WalEvent, out: &mut Vec<LogicalOperation>) {
        // Open transaction: document-family events emit with the tid, the
        // intent stays in place
        if let Some(tid) = self.pending.as_ref().and_then(Intent::transaction_id) {
            match event {
                WalEvent::Put {
                    cf: ColumnFamily::Documents,
                    object_id,
                    key,
                    value,
                } => self.emit_document_put(tick, tid, *object_id, key, value, out),
                WalEvent::Delete {
                    cf: ColumnFamily::Documents,
                    object_id,
                    key,
                } => self.emit_document_remove(tick, tid, *object_id, key, out),
                _ => trace!(tick, "skipping non-document event inside transaction"),
            }
            return;
        }

        // One-shot intents are moved out; a mismatch discards them
        let Some(pending) = self.pending.take() else {
            trace!(tick, "keyed event without pending intent");
            return;
        };
        if !pending.matches(event) {
            trace!(tick, "keyed event does not match pending intent");
            return;
        }

        match pending {
            Intent::Ddl {
                op_type,
                object_id,
                payload,
            } => self.emit_ddl(tick, op_type, object_id, &payload, event, out),
            Intent::SinglePut { object_id } => {
                if let WalEvent::Put { key, value, .. } = event {
                    self.emit_document_put(tick, 0, object_id, key, value, out);
                }
            }
            Intent::SingleRemove { object_id } => {
                if let WalEvent::Delete { key, .. } = event {
                    self.emit_document_remove(tick, 0, object_id, key, out);
                }
            }
            Intent::Transaction { .. } => unreachable!("handled above"),
        }
    }

    /// Resolve an object id and apply database/collection/system filtering.
    /// Returns the entry only when the event should be emitted.
    fn resolve(&self, object_id: u64) -> Option<&crate::engine::ObjectRef> {
        let Some(entry) = self.directory.resolve(object_id) else {
            warn!(object_id, "WAL event references unknown object id, skipping");
            return None;
        };
        if entry.database_id != self.database_id {
            return None;
        }
        if let Some(wanted) = self.collection_id {
            if entry.kind != ObjectKind::Collection || entry.collection_id != wanted {
                return None;
            }
        }
        if entry.is_system() && !self.include_system {
            return None;
        }
        Some(entry)
    }

    fn emit_document_put(
        &mut self,
        tick: Tick,
        tid: u64,
        object_id: u64,
        key: &str,
        value: &[u8],
        out: &mut Vec<LogicalOperation>,
    ) {
        let Some(entry) = self.resolve(object_id) else {
            return;
        };
        let data: serde_json::Value = match serde_json::from_slice(value) {
            Ok(data) => data,
            Err(e) => {
                warn!(tick, key, error = %e, "malformed document payload, skipping");
                return;
            }
        };
        let op = LogicalOperation {
            tick,
            op_type: OperationType::DocumentInsert,
            database_id: self.database_id,
            collection_id: Some(entry.collection_id.to_string()),
            collection_name: Some(entry.name.clone()),
            tid,
            data: Some(data),
        };
        self.emit(op, out);
    }

    fn emit_document_remove(
        &mut self,
        tick: Tick,
        tid: u64,
        object_id: u64,
        key: &str,
        out: &mut Vec<LogicalOperation>,
    ) {
        let Some(entry) = self.resolve(object_id) else {
            return;
        };
        let op = LogicalOperation {
            tick,
            op_type: OperationType::DocumentRemove,
            database_id: self.database_id,
            collection_id: Some(entry.collection_id.to_string()),
            collection_name: Some(entry.name.clone()),
            tid,
            data: Some(json!({ "_key": key })),
        };
        self.emit(op, out);
    }

    fn emit_ddl(
        &mut self,
        tick: Tick,
        op_type: OperationType,
        object_id: u64,
        tag_payload: &serde_json::Value,
        event: &WalEvent,
        out: &mut Vec<LogicalOperation>,
    ) {
        let Some(entry) = self.resolve(object_id) else {
            return;
        };

        // Prefer the definitions-family value; fall back to the tag payload
        // for deletes, which carry no value
        let data = match event {
            WalEvent::Put { value, .. } => match serde_json::from_slice(value) {
                Ok(data) => data,
                Err(e) => {
                    warn!(tick, error = %e, "malformed definition payload, using tag metadata");
                    tag_payload.clone()
                }
            },
            _ => tag_payload.clone(),
        };

        let (collection_id, collection_name) = match entry.kind {
            ObjectKind::Collection => (
                Some(entry.collection_id.to_string()),
                Some(entry.name.clone()),
            ),
            ObjectKind::View => (None, Some(entry.name.clone())),
        };

        let op = LogicalOperation {
            tick,
            op_type,
            database_id: self.database_id,
            collection_id,
            collection_name,
            tid: 0,
            data: Some(data),
        };
        self.emit(op, out);
    }

    fn emit(&mut self, op: LogicalOperation, out: &mut Vec<LogicalOperation>) {
        debug_assert!(
            op.tick >= self.last_emitted,
            "parser emitted non-monotonic tick {} after {}",
            op.tick,
            self.last_emitted
        );
        self.last_emitted = op.tick;
        out.push(op);
    }
}
