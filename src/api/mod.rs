//! HTTP API Module
//!
//! Follower-facing replication endpoints: batch (context) lifecycle, WAL
//! tailing, inventory, dumps, and the incremental-sync key/chunk/document
//! protocol.

mod http;

pub use http::HttpServer;
