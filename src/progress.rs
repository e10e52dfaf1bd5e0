//! Replication Client Progress Tracker
//!
//! Records each replication client's last-served tick so the retention
//! manager never deletes WAL segments a live client might still need. One
//! coarse lock, short critical sections; the table is tiny (one record per
//! client) and touched only on client calls and the sweep cycle.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::tick::{tick_str, Tick, UNBOUNDED_TICK};

/// Progress record for one replication client
#[derive(Debug, Clone, Serialize)]
pub struct ClientProgressRecord {
    #[serde(rename = "syncerId", with = "tick_str")]
    pub syncer_id: u64,
    #[serde(rename = "serverId", with = "tick_str")]
    pub client_id: u64,
    pub label: String,
    #[serde(rename = "lastServedTick", with = "tick_str")]
    pub last_served_tick: Tick,
    #[serde(rename = "expires")]
    pub expires_at: DateTime<Utc>,
}

/// Record identity. A non-zero syncer id takes precedence over the client
/// id; older-generation clients carry only a client id. Both generations
/// must resolve through this one function or they silently collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ClientKey {
    Syncer(u64),
    Client(u64),
}

fn client_key(syncer_id: u64, client_id: u64) -> ClientKey {
    if syncer_id != 0 {
        ClientKey::Syncer(syncer_id)
    } else {
        ClientKey::Client(client_id)
    }
}

/// Tracker table, shared between the wire layer and the retention sweep
#[derive(Default)]
pub struct ProgressTracker {
    records: RwLock<HashMap<ClientKey, ClientProgressRecord>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a record: the expiry is advanced and the served tick
    /// raised monotonically. A tick of zero extends only.
    pub async fn track(
        &self,
        syncer_id: u64,
        client_id: u64,
        label: &str,
        last_served_tick: Tick,
        ttl: Duration,
    ) {
        // out-of-range TTLs mean "never expires", not zero
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut records = self.records.write().await;
        let record = records
            .entry(client_key(syncer_id, client_id))
            .or_insert_with(|| ClientProgressRecord {
                syncer_id,
                client_id,
                label: label.to_string(),
                last_served_tick: 0,
                expires_at,
            });

        record.expires_at = record.expires_at.max(expires_at);
        if !label.is_empty() {
            record.label = label.to_string();
        }
        if last_served_tick > record.last_served_tick {
            record.last_served_tick = last_served_tick;
        }
    }

    /// Keep-alive: bump the expiry without touching the tick
    pub async fn extend(&self, syncer_id: u64, client_id: u64, ttl: Duration) {
        self.track(syncer_id, client_id, "", 0, ttl).await;
    }

    /// Remove a client's record immediately
    pub async fn untrack(&self, syncer_id: u64, client_id: u64) {
        let mut records = self.records.write().await;
        records.remove(&client_key(syncer_id, client_id));
    }

    /// Drop all records expired before `threshold`, returning how many
    pub async fn garbage_collect(&self, threshold: DateTime<Utc>) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.expires_at >= threshold);
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, "garbage-collected expired client progress records");
        }
        removed
    }

    /// Minimum served tick across live records, or [`UNBOUNDED_TICK`] when no
    /// record constrains retention. Records that have not yet reported a tick
    /// do not constrain it either.
    pub async fn lowest_served_value(&self) -> Tick {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| r.last_served_tick > 0)
            .map(|r| r.last_served_tick)
            .min()
            .unwrap_or(UNBOUNDED_TICK)
    }

    /// All live records, for operator inspection
    pub async fn list(&self) -> Vec<ClientProgressRecord> {
        let records = self.records.read().await;
        let mut out: Vec<_> = records.values().cloned().collect();
        out.sort_by_key(|r| (r.syncer_id, r.client_id));
        out
    }
}
