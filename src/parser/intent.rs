//! Pending Parse Intent
//!
//! A tag event in the WAL announces what the following keyed event means.
//! That announcement is held as a single tagged value and *moved out* when
//! the matching keyed event consumes it, so a stale intent can never leak
//! into an unrelated event: anything that does not match simply drops it.

use serde_json::Value;

use crate::engine::{ColumnFamily, TagKind, WalEvent};
use crate::parser::operation::OperationType;

/// Intent set by a tag event, consumed by the next matching keyed event
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// DDL intent waiting for its definitions-family write
    Ddl {
        op_type: OperationType,
        object_id: u64,
        payload: Value,
    },
    /// A standalone document write waiting for its documents-family put
    SinglePut { object_id: u64 },
    /// A standalone document removal waiting for its documents-family delete
    SingleRemove { object_id: u64 },
    /// Open transaction; persists across keyed events until commit or an
    /// unrelated tag resets it
    Transaction { tid: u64 },
}

impl Intent {
    /// Build the intent announced by a tag event, if any.
    ///
    /// Commit tags do not produce an intent: they terminate one.
    pub fn from_tag(kind: TagKind, object_id: Option<u64>, payload: &Value) -> Option<Intent> {
        let ddl = |op_type| {
            object_id.map(|object_id| Intent::Ddl {
                op_type,
                object_id,
                payload: payload.clone(),
            })
        };

        match kind {
            TagKind::CollectionCreate => ddl(OperationType::CollectionCreate),
            TagKind::CollectionDrop => ddl(OperationType::CollectionDrop),
            TagKind::CollectionRename => ddl(OperationType::CollectionRename),
            TagKind::CollectionChange => ddl(OperationType::CollectionChange),
            TagKind::CollectionTruncate => ddl(OperationType::CollectionTruncate),
            TagKind::IndexCreate => ddl(OperationType::IndexCreate),
            TagKind::IndexDrop => ddl(OperationType::IndexDrop),
            TagKind::ViewCreate => ddl(OperationType::ViewCreate),
            TagKind::ViewDrop => ddl(OperationType::ViewDrop),
            TagKind::ViewChange => ddl(OperationType::ViewChange),
            TagKind::SinglePut => object_id.map(|object_id| Intent::SinglePut { object_id }),
            TagKind::SingleRemove => object_id.map(|object_id| Intent::SingleRemove { object_id }),
            TagKind::BeginTransaction => {
                parse_tid(payload).map(|tid| Intent::Transaction { tid })
            }
            // Database markers and commits are emitted directly from the tag
            TagKind::DatabaseCreate
            | TagKind::DatabaseDrop
            | TagKind::CommitTransaction => None,
        }
    }

    /// Whether this intent is consumed by the given keyed event
    pub fn matches(&self, event: &WalEvent) -> bool {
        match (self, event) {
            (
                Intent::Ddl { object_id, .. },
                WalEvent::Put { cf: ColumnFamily::Definitions, object_id: ev, .. },
            )
            | (
                Intent::Ddl { object_id, .. },
                WalEvent::Delete { cf: ColumnFamily::Definitions, object_id: ev, .. },
            ) => object_id == ev,
            (
                Intent::SinglePut { object_id },
                WalEvent::Put { cf: ColumnFamily::Documents, object_id: ev, .. },
            ) => object_id == ev,
            (
                Intent::SingleRemove { object_id },
                WalEvent::Delete { cf: ColumnFamily::Documents, object_id: ev, .. },
            ) => object_id == ev,
            // Transactions span many events; they are never consumed by one
            (Intent::Transaction { .. }, _) => false,
            _ => false,
        }
    }

    pub fn transaction_id(&self) -> Option<u64> {
        match self {
            Intent::Transaction { tid } => Some(*tid),
            _ => None,
        }
    }
}

/// Transaction ids travel in tag payloads as decimal strings
pub fn parse_tid(payload: &Value) -> Option<u64> {
    payload.get("tid")?.as_str()?.parse().ok()
}
