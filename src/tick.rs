//! Tick Model
//!
//! A tick is the monotonic WAL log position used as the external replication
//! cursor. Every keyed WAL event consumes exactly one tick; tag events do
//! not. Ticks emitted to a single consumer never decrease, and across
//! distinct non-metadata operations within one batch they strictly increase.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serializer};

/// Monotonic WAL log position
pub type Tick = u64;

/// Sentinel meaning "no tick constraint" (used by the progress tracker
/// when no live client records exist)
pub const UNBOUNDED_TICK: Tick = u64::MAX;

/// Process-wide tick counter.
///
/// An explicit atomic counter owned by the node component and passed by
/// reference to the engine and managers, never a global.
#[derive(Debug)]
pub struct TickSource {
    current: AtomicU64,
}

impl TickSource {
    /// Create a tick source starting at the given position
    pub fn new(start: Tick) -> Self {
        Self {
            current: AtomicU64::new(start),
        }
    }

    /// The last tick handed out
    pub fn current(&self) -> Tick {
        self.current.load(Ordering::SeqCst)
    }

    /// Reserve `count` consecutive ticks, returning the first one.
    ///
    /// Used by the engine when appending a write batch: the batch start
    /// sequence is the first reserved tick and each keyed event claims the
    /// next one.
    pub fn reserve(&self, count: u64) -> Tick {
        self.current.fetch_add(count, Ordering::SeqCst) + 1
    }

    /// Advance to at least `tick` (no-op if already past it).
    ///
    /// Used when re-opening a node over an existing WAL directory.
    pub fn advance_to(&self, tick: Tick) {
        self.current.fetch_max(tick, Ordering::SeqCst);
    }
}

impl Default for TickSource {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Serde helpers encoding a tick as a decimal string on the wire.
///
/// JSON consumers cannot represent the full u64 range, so ticks cross the
/// wire as strings, same as in response headers.
pub mod tick_str {
    use super::*;

    pub fn serialize<S: Serializer>(tick: &Tick, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&tick.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Tick, D::Error> {
        let s = String::deserialize(de)?;
        s.parse::<u64>().map_err(serde::de::Error::custom)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_is_contiguous() {
        let ticks = TickSource::new(0);
        let first = ticks.reserve(3);
        assert_eq!(first, 1);
        assert_eq!(ticks.current(), 3);
        let next = ticks.reserve(1);
        assert_eq!(next, 4);
    }

    #[test]
    fn test_advance_to_is_monotonic() {
        let ticks = TickSource::new(10);
        ticks.advance_to(5);
        assert_eq!(ticks.current(), 10);
        ticks.advance_to(42);
        assert_eq!(ticks.current(), 42);
    }

    #[test]
    fn test_concurrent_reserve_never_overlaps() {
        let ticks = Arc::new(TickSource::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let ticks = Arc::clone(&ticks);
            handles.push(std::thread::spawn(move || {
                let mut firsts = Vec::new();
                for _ in 0..1000 {
                    firsts.push(ticks.reserve(2));
                }
                firsts
            }));
        }

        let mut all = std::collections::HashSet::new();
        for handle in handles {
            for first in handle.join().unwrap() {
                assert!(all.insert(first));
                assert!(all.insert(first + 1));
            }
        }
        assert_eq!(ticks.current(), 8000);
    }

    #[test]
    fn test_tick_string_encoding() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wire {
            #[serde(with = "tick_str")]
            tick: Tick,
        }

        let json = serde_json::to_string(&Wire { tick: u64::MAX }).unwrap();
        assert_eq!(json, format!("{{\"tick\":\"{}\"}}", u64::MAX));
        let back: Wire = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tick, u64::MAX);
    }
}
