//! WAL Retention Manager
//!
//! Decides which archived WAL segments are safe to delete and deletes them,
//! without breaking a live tailing client. Candidates are re-derived from
//! the engine's segment listing on every pass and stamped with a grace
//! expiry; actual deletion runs only when the exclusive side of the purge
//! lease can be acquired without blocking, so a concurrent tailing read
//! (holding the shared side) always wins.
//!
//! When the archive outgrows its size cap, the oldest segments are
//! force-expired regardless of client progress. That deliberately trades
//! replication continuity for disk safety; affected clients must fall back
//! to a full resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

use crate::engine::StorageEngine;
use crate::error::Result;
use crate::progress::ProgressTracker;
use crate::tick::{Tick, UNBOUNDED_TICK};

/// Expiry stamp meaning "forced, delete on the next prune pass"
pub const FORCED_EXPIRY: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// One archived WAL segment scheduled for deletion
#[derive(Debug, Clone)]
pub struct PrunableWalFile {
    pub start_sequence: Tick,
    pub end_sequence: Tick,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
}

impl PrunableWalFile {
    pub fn is_forced(&self) -> bool {
        self.expires_at == FORCED_EXPIRY
    }
}

/// Shared guard keeping the pruner out while a WAL read is in flight.
/// Dropping it releases the hold; any number may coexist.
pub struct PurgePreventer {
    _guard: OwnedRwLockReadGuard<()>,
}

pub struct RetentionManager {
    engine: Arc<StorageEngine>,
    progress: Arc<ProgressTracker>,
    grace_window: Duration,
    archive_cap_bytes: u64,
    /// Shared side = purge preventers, exclusive side = the prune pass
    lease: Arc<RwLock<()>>,
    /// Current deletion candidates, keyed by start sequence
    candidates: Mutex<HashMap<Tick, PrunableWalFile>>,
    /// Tick explicitly released by an operator or a finished client
    released_tick: AtomicU64,
}

impl RetentionManager {
    pub fn new(
        engine: Arc<StorageEngine>,
        progress: Arc<ProgressTracker>,
        grace_window: Duration,
        archive_cap_bytes: u64,
    ) -> Self {
        Self {
            engine,
            progress,
            grace_window,
            archive_cap_bytes,
            lease: Arc::new(RwLock::new(())),
            candidates: Mutex::new(HashMap::new()),
            released_tick: AtomicU64::new(UNBOUNDED_TICK),
        }
    }

    /// Explicitly release history up to `tick`: segments ending at or after
    /// it stay, everything older becomes eligible
    pub fn set_released_tick(&self, tick: Tick) {
        self.released_tick.store(tick, Ordering::SeqCst);
    }

    /// Hold off pruning while reading the WAL. Never blocks a prune that is
    /// already running out, only the next one.
    pub async fn prevent_purge(&self) -> PurgePreventer {
        PurgePreventer {
            _guard: Arc::clone(&self.lease).read_owned().await,
        }
    }

    /// Recompute the candidate set against the current segment listing.
    ///
    /// The retention floor is the minimum of the caller's floor, the
    /// explicitly released tick, and the lowest tick any tracked client has
    /// been served. A segment becomes a candidate only when its end
    /// sequence lies below that floor; candidates keep their original
    /// expiry stamp across passes. Returns the candidate count.
    pub async fn determine_prunable(&self, caller_floor: Tick) -> usize {
        let min_tick_to_keep = caller_floor
            .min(self.released_tick.load(Ordering::SeqCst))
            .min(self.progress.lowest_served_value().await);

        let segments = self.engine.list_wal_segments();
        let mut candidates = self.candidates.lock().await;

        // the listing is authoritative: forget anything no longer present
        let listed: std::collections::HashSet<Tick> = segments
            .iter()
            .filter(|s| s.archived)
            .map(|s| s.start_sequence)
            .collect();
        candidates.retain(|start, _| listed.contains(start));

        // an out-of-range grace window keeps candidates forever rather
        // than expiring them immediately
        let expires_at = chrono::Duration::from_std(self.grace_window)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        for segment in segments.iter().filter(|s| s.archived) {
            if segment.last_sequence >= min_tick_to_keep {
                continue;
            }
            candidates
                .entry(segment.start_sequence)
                .or_insert_with(|| {
                    debug!(
                        start = segment.start_sequence,
                        end = segment.last_sequence,
                        floor = min_tick_to_keep,
                        "WAL segment scheduled for pruning"
                    );
                    PrunableWalFile {
                        start_sequence: segment.start_sequence,
                        end_sequence: segment.last_sequence,
                        size: segment.size,
                        expires_at,
                    }
                });
        }

        self.enforce_archive_cap(&segments, &mut candidates);
        candidates.len()
    }

    /// Force-expire the oldest archived segments until the archive fits its
    /// size cap, ignoring client progress
    fn enforce_archive_cap(
        &self,
        segments: &[crate::engine::WalSegmentInfo],
        candidates: &mut HashMap<Tick, PrunableWalFile>,
    ) {
        let mut total: u64 = segments.iter().filter(|s| s.archived).map(|s| s.size).sum();
        if total <= self.archive_cap_bytes {
            return;
        }

        let mut archived: Vec<_> = segments.iter().filter(|s| s.archived).collect();
        archived.sort_by_key(|s| s.start_sequence);

        for segment in archived {
            if total <= self.archive_cap_bytes {
                break;
            }
            total -= segment.size;
            let entry = candidates
                .entry(segment.start_sequence)
                .or_insert_with(|| PrunableWalFile {
                    start_sequence: segment.start_sequence,
                    end_sequence: segment.last_sequence,
                    size: segment.size,
                    expires_at: FORCED_EXPIRY,
                });
            entry.expires_at = FORCED_EXPIRY;
            warn!(
                start = segment.start_sequence,
                end = segment.last_sequence,
                "WAL archive over size cap, force-expiring segment; \
                 clients behind this point must fully resync"
            );
        }
    }

    /// Delete candidates past their expiry.
    ///
    /// Skipped entirely when any purge preventer is held: the exclusive
    /// lease is taken via try-lock and never waits. A failed delete stays a
    /// candidate and is retried next cycle; a file already gone is treated
    /// as pruned.
    pub async fn prune(&self) -> Result<usize> {
        let Ok(_exclusive) = self.lease.try_write() else {
            debug!("purge preventer held, skipping prune cycle");
            return Ok(0);
        };

        let now = Utc::now();
        let due: Vec<PrunableWalFile> = {
            let candidates = self.candidates.lock().await;
            candidates
                .values()
                .filter(|c| c.expires_at <= now)
                .cloned()
                .collect()
        };

        let mut pruned = 0;
        for candidate in due {
            match self.engine.delete_wal_segment(candidate.start_sequence) {
                Ok(deleted) => {
                    if !deleted {
                        debug!(
                            start = candidate.start_sequence,
                            "WAL segment already gone, treating as pruned"
                        );
                    }
                    let mut candidates = self.candidates.lock().await;
                    candidates.remove(&candidate.start_sequence);
                    pruned += 1;
                }
                Err(e) => {
                    warn!(
                        start = candidate.start_sequence,
                        error = %e,
                        "failed to delete WAL segment, will retry next cycle"
                    );
                }
            }
        }

        if pruned > 0 {
            info!(pruned, "pruned WAL segments");
        }
        Ok(pruned)
    }

    /// Current candidates, for diagnostics
    pub async fn prunable(&self) -> Vec<PrunableWalFile> {
        let candidates = self.candidates.lock().await;
        let mut out: Vec<_> = candidates.values().cloned().collect();
        out.sort_by_key(|c| c.start_sequence);
        out
    }
}
