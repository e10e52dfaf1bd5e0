//! QuillSync - Document Database Replication Layer
//!
//! The replication and change-data-capture layer of a document database node
//! built on a log-structured storage engine. Followers replicate a leader by
//! combining three mechanisms: full initial sync from a consistent snapshot,
//! chunked incremental sync driven by per-range key/revision hashes, and
//! continuous tailing of the write-ahead log translated into logical
//! operations.
//!
//! # Architecture
//!
//! Every write on the leader lands in the WAL stamped with a tick from a
//! single monotonic counter. The [`parser`] turns raw WAL batches back into
//! logical operations, pairing each intent tag with the keyed event that
//! realizes it. Followers open a replication context ([`context`]) that pins
//! a snapshot and a WAL floor, walk collections with sorted cursors, and
//! reconcile divergence chunk-by-chunk ([`sync`]). The [`retention`] manager
//! prunes archived WAL segments only once no context, tracked client, or
//! in-flight read still needs them.
//!
//! # Features
//!
//! - WAL tailing as newline-delimited logical operations with honest
//!   from-present reporting
//! - Consistent snapshot dumps with per-collection sorted cursors
//! - Incremental sync via chunked key/revision hashing (pinned hash version)
//! - TTL-guarded replication contexts with lazy snapshot binding
//! - Grace-window WAL retention with an archive size cap
//! - Client progress tracking that gates pruning
//! - HTTP API for the whole replication surface
//! - Snowflake ID generation for context and blocker identifiers

pub mod api;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod id;
pub mod node;
pub mod parser;
pub mod progress;
pub mod retention;
pub mod sync;
pub mod tick;

pub use config::QuillSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::QuillSyncConfig;
    pub use crate::context::ContextManager;
    pub use crate::engine::StorageEngine;
    pub use crate::error::{Error, Result};
    pub use crate::node::ReplicationNode;
    pub use crate::parser::{LogicalOperation, WalTailParser};
    pub use crate::progress::ProgressTracker;
    pub use crate::retention::RetentionManager;
    pub use crate::tick::{Tick, TickSource, UNBOUNDED_TICK};
}
