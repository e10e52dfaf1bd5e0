//! Logical Replication Operations
//!
//! The wire-level record emitted to tailing followers. Type codes are pinned
//! numeric values from the replication wire protocol; ticks and ids cross the
//! wire as decimal strings so JSON consumers do not lose u64 precision.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::tick::{tick_str, Tick};

/// Wire type code of a logical operation.
///
/// The numeric values are part of the follower-facing protocol and must not
/// be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    DatabaseCreate,
    DatabaseDrop,
    CollectionCreate,
    CollectionDrop,
    CollectionRename,
    CollectionChange,
    CollectionTruncate,
    IndexCreate,
    IndexDrop,
    ViewCreate,
    ViewDrop,
    ViewChange,
    TransactionBegin,
    TransactionCommit,
    DocumentInsert,
    DocumentRemove,
}

impl OperationType {
    pub fn code(self) -> u32 {
        match self {
            OperationType::DatabaseCreate => 1100,
            OperationType::DatabaseDrop => 1101,
            OperationType::CollectionCreate => 2000,
            OperationType::CollectionDrop => 2001,
            OperationType::CollectionRename => 2002,
            OperationType::CollectionChange => 2003,
            OperationType::CollectionTruncate => 2004,
            OperationType::IndexCreate => 2100,
            OperationType::IndexDrop => 2101,
            OperationType::ViewCreate => 2110,
            OperationType::ViewDrop => 2111,
            OperationType::ViewChange => 2112,
            OperationType::TransactionBegin => 2200,
            OperationType::TransactionCommit => 2201,
            OperationType::DocumentInsert => 2300,
            OperationType::DocumentRemove => 2302,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1100 => OperationType::DatabaseCreate,
            1101 => OperationType::DatabaseDrop,
            2000 => OperationType::CollectionCreate,
            2001 => OperationType::CollectionDrop,
            2002 => OperationType::CollectionRename,
            2003 => OperationType::CollectionChange,
            2004 => OperationType::CollectionTruncate,
            2100 => OperationType::IndexCreate,
            2101 => OperationType::IndexDrop,
            2110 => OperationType::ViewCreate,
            2111 => OperationType::ViewDrop,
            2112 => OperationType::ViewChange,
            2200 => OperationType::TransactionBegin,
            2201 => OperationType::TransactionCommit,
            2300 => OperationType::DocumentInsert,
            2302 => OperationType::DocumentRemove,
            _ => return None,
        })
    }

    /// Document-level operations carry a transaction id; everything else is
    /// metadata
    pub fn is_document(self) -> bool {
        matches!(
            self,
            OperationType::DocumentInsert | OperationType::DocumentRemove
        )
    }
}

impl Serialize for OperationType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for OperationType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        OperationType::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown operation type code {}", code)))
    }
}

/// One logical, collection-scoped operation reconstructed from the WAL.
///
/// Never persisted by this subsystem; produced by the parser and consumed by
/// the wire layer or a follower's applier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalOperation {
    /// Log position, as a decimal string on the wire
    #[serde(with = "tick_str")]
    pub tick: Tick,

    #[serde(rename = "type")]
    pub op_type: OperationType,

    /// Numeric id of the database, as a decimal string on the wire
    #[serde(rename = "database", with = "tick_str")]
    pub database_id: u64,

    /// Public collection id, present for collection-scoped operations
    #[serde(rename = "cid", skip_serializing_if = "Option::is_none", default)]
    pub collection_id: Option<String>,

    /// Collection name at emission time
    #[serde(rename = "cname", skip_serializing_if = "Option::is_none", default)]
    pub collection_name: Option<String>,

    /// Transaction id; "0" for operations outside any transaction
    #[serde(with = "tick_str")]
    pub tid: u64,

    /// Operation payload: the full document for inserts, `{"_key": ...}` for
    /// removes, the definition for DDL
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
}

impl LogicalOperation {
    /// Metadata operation scoped to the database only
    pub fn database_scoped(
        tick: Tick,
        op_type: OperationType,
        database_id: u64,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            tick,
            op_type,
            database_id,
            collection_id: None,
            collection_name: None,
            tid: 0,
            data,
        }
    }
}
