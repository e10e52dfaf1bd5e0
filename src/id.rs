//! Handle ID Generator
//!
//! Mints unique, time-ordered 64-bit ids for replication contexts and
//! revision-tree blockers without coordination.
//!
//! ID Structure (64 bits):
//! - 1 bit: unused (sign bit)
//! - 41 bits: timestamp (milliseconds since epoch, ~69 years)
//! - 10 bits: node ID (0-1023)
//! - 12 bits: sequence (0-4095 per millisecond)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01 00:00:00 UTC
const QUILL_EPOCH: u64 = 1704067200000;

const NODE_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;

const MAX_NODE_ID: u64 = (1 << NODE_ID_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

const NODE_ID_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = NODE_ID_BITS + SEQUENCE_BITS;

/// Identifier of a replication context (a "batch" on the wire)
pub type ContextId = u64;

/// Identifier of a revision-tree blocker reservation
pub type BlockerId = u64;

/// Handle ID generator
///
/// Lock-free and thread-safe; ids minted by one generator are strictly
/// increasing.
pub struct IdGenerator {
    node_id: u64,
    /// Packed state: upper 52 bits = last timestamp, lower 12 bits = sequence
    state: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator for the given node ID
    ///
    /// # Panics
    /// Panics if node_id > 1023
    pub fn new(node_id: u16) -> Self {
        assert!(
            (node_id as u64) <= MAX_NODE_ID,
            "Node ID must be 0-1023, got {}",
            node_id
        );

        Self {
            node_id: node_id as u64,
            state: AtomicU64::new(0),
        }
    }

    /// Generate a new unique id
    pub fn generate(&self) -> u64 {
        loop {
            let current_time = Self::current_time_millis();
            let old_state = self.state.load(Ordering::Relaxed);
            let old_timestamp = old_state >> SEQUENCE_BITS;
            let old_sequence = old_state & MAX_SEQUENCE;

            let (new_timestamp, new_sequence) = if current_time > old_timestamp {
                (current_time, 0)
            } else if current_time == old_timestamp {
                let next_seq = old_sequence + 1;
                if next_seq > MAX_SEQUENCE {
                    // Sequence overflow, wait for the next millisecond
                    std::thread::yield_now();
                    continue;
                }
                (current_time, next_seq)
            } else {
                // Clock went backwards (rare), keep the old timestamp
                let next_seq = old_sequence + 1;
                if next_seq > MAX_SEQUENCE {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                (old_timestamp, next_seq)
            };

            let new_state = (new_timestamp << SEQUENCE_BITS) | new_sequence;

            if self
                .state
                .compare_exchange(old_state, new_state, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return (new_timestamp << TIMESTAMP_SHIFT)
                    | (self.node_id << NODE_ID_SHIFT)
                    | new_sequence;
            }
            // CAS failed, retry
        }
    }

    /// Get current time in milliseconds since QUILL_EPOCH
    fn current_time_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards before UNIX epoch")
            .as_millis() as u64
            - QUILL_EPOCH
    }

    /// Parse a node ID from a string (e.g., "quill-5" -> 5)
    pub fn parse_node_id(node_id_str: &str) -> u16 {
        let digits: String = node_id_str
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .chars()
            .rev()
            .collect();

        if digits.is_empty() {
            // Hash the string to get a consistent node ID
            let hash = node_id_str
                .bytes()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            (hash % (MAX_NODE_ID + 1)) as u16
        } else {
            digits.parse::<u16>().unwrap_or(0) % (MAX_NODE_ID as u16 + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_generate_unique_ids() {
        let gen = IdGenerator::new(1);
        let mut ids = HashSet::new();

        for _ in 0..10000 {
            let id = gen.generate();
            assert!(ids.insert(id), "Duplicate id generated: {}", id);
        }
    }

    #[test]
    fn test_ids_are_ordered() {
        let gen = IdGenerator::new(1);
        let mut last_id = 0u64;

        for _ in 0..1000 {
            let id = gen.generate();
            assert!(id > last_id, "ids should be monotonically increasing");
            last_id = id;
        }
    }

    #[test]
    fn test_concurrent_generation() {
        let gen = Arc::new(IdGenerator::new(1));
        let mut handles = vec![];

        for _ in 0..4 {
            let gen = Arc::clone(&gen);
            handles.push(thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..1000 {
                    ids.push(gen.generate());
                }
                ids
            }));
        }

        let mut all_ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all_ids.insert(id), "Duplicate id in concurrent test");
            }
        }

        assert_eq!(all_ids.len(), 4000);
    }

    #[test]
    fn test_parse_node_id() {
        assert_eq!(IdGenerator::parse_node_id("quill-5"), 5);
        assert_eq!(IdGenerator::parse_node_id("server123"), 123);
        let id1 = IdGenerator::parse_node_id("alpha");
        let id2 = IdGenerator::parse_node_id("beta");
        assert_ne!(id1, id2);
    }
}
