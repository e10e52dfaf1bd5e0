//! Replication Node
//!
//! Wires the engine, tick source, progress tracker, retention manager, and
//! context manager together, and runs the background sweep cycle that keeps
//! the whole subsystem tidy: expired progress records and contexts age out,
//! prunable WAL segments get recomputed and deleted, and completed live WAL
//! groups get archived. A failed cycle is logged and retried on the next
//! interval, never fatal to the process.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::QuillSyncConfig;
use crate::context::ContextManager;
use crate::engine::{MemoryEngine, StorageEngine};
use crate::error::Result;
use crate::id::IdGenerator;
use crate::progress::ProgressTracker;
use crate::retention::RetentionManager;
use crate::tick::TickSource;

pub struct ReplicationNode {
    config: QuillSyncConfig,
    ticks: Arc<TickSource>,
    engine: Arc<StorageEngine>,
    progress: Arc<ProgressTracker>,
    retention: Arc<RetentionManager>,
    contexts: Arc<ContextManager>,
}

impl ReplicationNode {
    /// Open the engine under the configured data directory and wire up all
    /// components
    pub fn open(config: QuillSyncConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let ticks = Arc::new(TickSource::new(0));
        let engine = StorageEngine::memory(MemoryEngine::open(
            Arc::clone(&ticks),
            config.node.database_id,
            config.archive_dir(),
            config.wal.compression,
            config.wal.segment_batches,
        )?);
        info!(
            node = %config.node.id,
            database = config.node.database_id,
            sequence = engine.current_sequence(),
            "opened storage engine"
        );

        let progress = Arc::new(ProgressTracker::new());
        let retention = Arc::new(RetentionManager::new(
            Arc::clone(&engine),
            Arc::clone(&progress),
            config.grace_window(),
            config.archive_cap_bytes(),
        ));
        let contexts = Arc::new(ContextManager::new(
            Arc::clone(&engine),
            IdGenerator::new(IdGenerator::parse_node_id(&config.node.id)),
        ));

        Ok(Arc::new(Self {
            config,
            ticks,
            engine,
            progress,
            retention,
            contexts,
        }))
    }

    pub fn config(&self) -> &QuillSyncConfig {
        &self.config
    }

    pub fn ticks(&self) -> &TickSource {
        &self.ticks
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    /// One maintenance pass: progress GC, context sweep, retention
    /// recompute + prune, WAL archival
    pub async fn sweep_cycle(&self) -> Result<()> {
        let now = Utc::now();
        let records = self.progress.garbage_collect(now).await;
        let contexts = self.contexts.sweep(now);

        // surviving contexts pin the floor; client progress and the
        // released tick bound it further inside the retention manager
        let floor = self.contexts.lowest_snapshot_sequence();
        let candidates = self.retention.determine_prunable(floor).await;
        let pruned = self.retention.prune().await?;
        let archived = self.engine.flush_wal(false)?;

        debug!(
            records,
            contexts, candidates, pruned, archived, "sweep cycle complete"
        );
        Ok(())
    }

    /// Run the sweep on the configured interval until the task is aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = node.sweep_cycle().await {
                    error!(error = %e, "sweep cycle failed, will retry next interval");
                }
            }
        })
    }

    /// Archive any remaining live WAL batches; called on shutdown
    pub fn flush(&self) -> Result<()> {
        self.engine.flush_wal(true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_node(dir: &std::path::Path) -> Arc<ReplicationNode> {
        let mut config = QuillSyncConfig::default();
        config.node.data_dir = dir.to_path_buf();
        config.wal.segment_batches = 1;
        config.wal.grace_window_secs = 0;
        ReplicationNode::open(config).unwrap()
    }

    #[tokio::test]
    async fn test_sweep_cycle_archives_and_prunes() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        node.engine().create_collection("docs").unwrap();
        for i in 0..3 {
            node.engine()
                .insert_document("docs", &format!("k{}", i), json!({ "i": i }))
                .unwrap();
        }

        // first cycle archives completed groups; no client constrains the
        // floor, so everything archived becomes a candidate and is pruned
        // on the following cycle
        node.sweep_cycle().await.unwrap();
        node.sweep_cycle().await.unwrap();
        let archived: Vec<_> = node
            .engine()
            .list_wal_segments()
            .into_iter()
            .filter(|s| s.archived)
            .collect();
        assert!(archived.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_cycle_respects_tracked_client() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        node.engine().create_collection("docs").unwrap();
        node.engine()
            .insert_document("docs", "a", json!({}))
            .unwrap();
        let tick = node.engine().current_sequence();
        node.progress()
            .track(1, 0, "follower", 1, Duration::from_secs(60))
            .await;

        node.sweep_cycle().await.unwrap();
        node.sweep_cycle().await.unwrap();

        // the follower at tick 1 pins every segment
        let segments = node.engine().list_wal_segments();
        assert!(segments.iter().any(|s| s.archived));
        assert!(node.engine().current_sequence() >= tick);
    }

    #[tokio::test]
    async fn test_flush_on_shutdown() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        node.engine().create_collection("docs").unwrap();
        node.flush().unwrap();
        assert!(node
            .engine()
            .list_wal_segments()
            .iter()
            .any(|s| s.archived));
    }
}
