//! QuillSync Error Types

use thiserror::Error;

/// Result type alias for QuillSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// QuillSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Replication context {0} not found or expired")]
    ContextNotFound(u64),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    // Request errors
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Chunk arithmetic overflow: chunk {chunk} with chunk size {chunk_size}")]
    ChunkOverflow { chunk: u64, chunk_size: u64 },

    // Protocol errors (follower side)
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Chunk hash version mismatch: leader {leader}, local {local}")]
    HashVersionMismatch { leader: u32, local: u32 },

    // Engine / WAL errors
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL segment corrupted at sequence {sequence}: {reason}")]
    WalCorrupted { sequence: u64, reason: String },

    #[error("WAL serialization error: {0}")]
    WalSerialization(#[from] bincode::Error),

    // Internal consistency
    #[error("Internal inconsistency: {0}")]
    Inconsistency(String),

    #[error("Cursor for collection '{0}' is already in use")]
    CursorBusy(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization of wire payloads
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Remote communication (follower-side client)
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error should map to a 404 on the wire
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::ContextNotFound(_) | Error::CollectionNotFound(_)
        )
    }

    /// Check if this error should map to a 400 on the wire
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Error::BadRequest(_) | Error::ChunkOverflow { .. })
    }

    /// Check if a follower should retry the whole sync attempt with a fresh context
    pub fn is_retryable_sync(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Http(_) | Error::ContextNotFound(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_classification() {
        assert!(Error::ContextNotFound(7).is_not_found());
        assert!(Error::CollectionNotFound("docs".into()).is_not_found());
        assert!(Error::ChunkOverflow { chunk: u64::MAX, chunk_size: 5000 }.is_bad_request());
        assert!(!Error::Wal("boom".into()).is_bad_request());
    }

    #[test]
    fn test_sync_retry_classification() {
        assert!(Error::Protocol("bad keys response".into()).is_retryable_sync());
        assert!(!Error::Inconsistency("index entry without document".into()).is_retryable_sync());
    }
}
