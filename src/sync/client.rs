//! HTTP Chunk Source
//!
//! [`ChunkSource`] implementation that speaks the leader's replication API
//! over HTTP. Owns one batch (context) on the leader for snapshot
//! consistency across chunk, key, and document requests, and extends or
//! drops it explicitly.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::engine::Document;
use crate::error::{Error, Result};
use crate::sync::follower::ChunkSource;
use crate::sync::{ChunkListing, KeyRev};
use crate::tick::tick_str;

#[derive(Debug, Deserialize)]
struct BatchCreated {
    #[serde(with = "tick_str")]
    id: u64,
    #[serde(rename = "lastTick", with = "tick_str")]
    last_tick: u64,
}

/// Chunk source backed by a remote leader
pub struct HttpChunkSource {
    http: reqwest::Client,
    base_url: String,
    batch_id: u64,
    /// Leader tick at batch creation; tailing must start at or before this
    last_tick: u64,
}

impl HttpChunkSource {
    /// Create a batch on the leader and bind to it
    pub async fn connect(
        base_url: &str,
        ttl: Duration,
        syncer_id: u64,
        client_id: u64,
    ) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let response = http
            .post(format!("{}/replication/batch", base_url))
            .json(&json!({
                "ttl": ttl.as_secs(),
                "syncerId": syncer_id.to_string(),
                "serverId": client_id.to_string(),
            }))
            .send()
            .await?;
        let created: BatchCreated = check(response).await?.json().await?;

        Ok(Self {
            http,
            base_url,
            batch_id: created.id,
            last_tick: created.last_tick,
        })
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }

    /// Keep the leader-side batch alive
    pub async fn extend(&self, ttl: Duration) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/replication/batch/{}", self.base_url, self.batch_id))
            .json(&json!({ "ttl": ttl.as_secs() }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Drop the leader-side batch
    pub async fn close(self) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/replication/batch/{}", self.base_url, self.batch_id))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn key_chunks(&self, collection: &str, chunk_size: u64) -> Result<ChunkListing> {
        let response = self
            .http
            .get(format!("{}/replication/keys-chunks", self.base_url))
            .query(&[
                ("batchId", self.batch_id.to_string()),
                ("collection", collection.to_string()),
                ("chunkSize", chunk_size.to_string()),
            ])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn keys(
        &self,
        collection: &str,
        chunk: u64,
        chunk_size: u64,
        low_key: &str,
    ) -> Result<Vec<KeyRev>> {
        let response = self
            .http
            .get(format!("{}/replication/keys", self.base_url))
            .query(&[
                ("batchId", self.batch_id.to_string()),
                ("collection", collection.to_string()),
                ("chunk", chunk.to_string()),
                ("chunkSize", chunk_size.to_string()),
                ("lowKey", low_key.to_string()),
            ])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn documents(
        &self,
        collection: &str,
        chunk: u64,
        chunk_size: u64,
        offsets: &[u64],
    ) -> Result<Vec<Document>> {
        let response = self
            .http
            .put(format!("{}/replication/docs", self.base_url))
            .query(&[
                ("batchId", self.batch_id.to_string()),
                ("collection", collection.to_string()),
                ("chunk", chunk.to_string()),
                ("chunkSize", chunk_size.to_string()),
            ])
            .json(&offsets)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

/// Map HTTP statuses back onto the local error taxonomy
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        404 => Error::NotFound(body),
        400 => Error::BadRequest(body),
        _ => Error::Http(format!("leader returned {}: {}", status, body)),
    })
}
