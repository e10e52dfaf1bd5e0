//! WAL Event Model and Archived Segment Files
//!
//! The storage engine logs every write as a batch of low-level events: keyed
//! puts/deletes scoped to a column family, interleaved with free-form tag
//! events marking DDL or transaction intent. Batches carry a starting
//! sequence number; each keyed event consumes exactly one sequence position,
//! tag events none.
//!
//! Batches that leave the live window are archived into checksummed,
//! optionally LZ4-compressed segment files that the retention manager may
//! later delete.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tick::Tick;

/// Magic bytes at the start of each archived segment file
const SEGMENT_MAGIC: &[u8; 8] = b"QUILLWAL";

/// Segment file version
const SEGMENT_VERSION: u32 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 32;

/// A named, independently-iterable keyspace within the storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnFamily {
    /// Collection / index / view / database definitions
    Definitions,
    /// Full document bodies, keyed by primary key
    Documents,
    /// Primary-key index entries, keyed by primary key, value = revision
    PrimaryIndex,
}

/// Tag kinds marking DDL or transaction intent in the WAL stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagKind {
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
    DatabaseCreate,
    DatabaseDrop,
    BeginTransaction,
    CommitTransaction,
    /// One-shot marker: the next keyed put is a standalone document write
    SinglePut,
    /// One-shot marker: the next keyed delete is a standalone document removal
    SingleRemove,
}

/// A single low-level WAL event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEvent {
    /// Free-form marker carrying DDL/transaction metadata; consumes no tick
    Tag {
        kind: TagKind,
        database_id: u64,
        /// Internal numeric object id of the affected collection/view, if any
        object_id: Option<u64>,
        payload: serde_json::Value,
    },

    /// Keyed write; consumes one tick
    Put {
        cf: ColumnFamily,
        object_id: u64,
        key: String,
        value: Vec<u8>,
    },

    /// Keyed delete; consumes one tick
    Delete {
        cf: ColumnFamily,
        object_id: u64,
        key: String,
    },
}

impl WalEvent {
    /// Whether this event consumes a sequence position
    pub fn is_keyed(&self) -> bool {
        !matches!(self, WalEvent::Tag { .. })
    }
}

/// An ordered group of WAL events sharing one starting sequence number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalBatch {
    /// Sequence number of the first keyed event in this batch
    pub start_sequence: Tick,
    pub events: Vec<WalEvent>,
}

impl WalBatch {
    /// Number of keyed events (= sequence positions consumed)
    pub fn keyed_count(&self) -> u64 {
        self.events.iter().filter(|e| e.is_keyed()).count() as u64
    }

    /// Sequence number of the last keyed event, or `start_sequence` for a
    /// batch with no keyed events
    pub fn end_sequence(&self) -> Tick {
        let keyed = self.keyed_count();
        if keyed == 0 {
            self.start_sequence
        } else {
            self.start_sequence + keyed - 1
        }
    }
}

/// Archived segment file header
#[derive(Debug, Clone)]
pub struct SegmentHeader {
    /// First sequence number covered by this segment
    pub first_sequence: Tick,
    /// Last sequence number covered by this segment
    pub last_sequence: Tick,
    /// Number of batches in this segment
    pub batch_count: u32,
}

impl SegmentHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.first_sequence.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.last_sequence.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.batch_count.to_le_bytes());
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Wal("Segment header too short".into()));
        }

        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::Wal("Invalid segment magic bytes".into()));
        }

        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != SEGMENT_VERSION {
            return Err(Error::Wal(format!(
                "Unsupported segment version: {}",
                version
            )));
        }

        Ok(Self {
            first_sequence: u64::from_le_bytes(bytes[12..20].try_into().unwrap()),
            last_sequence: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
            batch_count: u32::from_le_bytes(bytes[28..32].try_into().unwrap()),
        })
    }
}

/// Build the file name for an archived segment starting at `first_sequence`
pub fn segment_path(dir: &Path, first_sequence: Tick) -> PathBuf {
    dir.join(format!("wal_{:020}.log", first_sequence))
}

/// Write a group of batches as one archived segment file
pub fn write_segment(path: &Path, batches: &[WalBatch], compression: bool) -> Result<()> {
    let first = batches
        .first()
        .ok_or_else(|| Error::Wal("cannot archive an empty segment".into()))?;
    let last = batches.last().unwrap();

    let header = SegmentHeader {
        first_sequence: first.start_sequence,
        last_sequence: last.end_sequence(),
        batch_count: batches.len() as u32,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&header.to_bytes())?;

    for batch in batches {
        let serialized = bincode::serialize(batch)?;
        let data = if compression {
            lz4_flex::compress_prepend_size(&serialized)
        } else {
            serialized
        };

        // Entry format: [length: u32][compressed: u8][data: bytes][checksum: u32]
        let checksum = crc32fast::hash(&data);
        file.write_all(&(data.len() as u32).to_le_bytes())?;
        file.write_all(&[compression as u8])?;
        file.write_all(&data)?;
        file.write_all(&checksum.to_le_bytes())?;
    }

    file.sync_all()?;
    Ok(())
}

/// Read only the header of an archived segment file
pub fn read_segment_header(path: &Path) -> Result<SegmentHeader> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    let mut header_bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut header_bytes)?;
    SegmentHeader::from_bytes(&header_bytes)
}

/// Read all batches from an archived segment file
pub fn read_segment(path: &Path) -> Result<Vec<WalBatch>> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    let mut header_bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut header_bytes)?;
    let header = SegmentHeader::from_bytes(&header_bytes)?;

    let mut batches = Vec::with_capacity(header.batch_count as usize);
    file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

    for _ in 0..header.batch_count {
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut compressed_flag = [0u8; 1];
        file.read_exact(&mut compressed_flag)?;
        let is_compressed = compressed_flag[0] != 0;

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        if crc32fast::hash(&data) != stored {
            return Err(Error::WalCorrupted {
                sequence: header.first_sequence,
                reason: "Checksum mismatch".into(),
            });
        }

        let serialized = if is_compressed {
            lz4_flex::decompress_size_prepended(&data)
                .map_err(|e| Error::Wal(format!("Decompression failed: {}", e)))?
        } else {
            data
        };

        batches.push(bincode::deserialize(&serialized)?);
    }

    Ok(batches)
}

/// List all archived segment files in a directory, sorted by start sequence
pub fn list_segment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "log")
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .map_or(false, |s| s.starts_with("wal_"))
        {
            segments.push(path);
        }
    }

    segments.sort();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn batch(start: Tick, keys: &[&str]) -> WalBatch {
        let mut events = vec![WalEvent::Tag {
            kind: TagKind::SinglePut,
            database_id: 1,
            object_id: Some(100),
            payload: serde_json::Value::Null,
        }];
        for key in keys {
            events.push(WalEvent::Put {
                cf: ColumnFamily::Documents,
                object_id: 100,
                key: key.to_string(),
                value: b"{}".to_vec(),
            });
        }
        WalBatch {
            start_sequence: start,
            events,
        }
    }

    #[test]
    fn test_keyed_count_ignores_tags() {
        let b = batch(5, &["a", "b", "c"]);
        assert_eq!(b.keyed_count(), 3);
        assert_eq!(b.end_sequence(), 7);
    }

    #[test]
    fn test_segment_round_trip() {
        let dir = tempdir().unwrap();
        let path = segment_path(dir.path(), 1);

        let batches = vec![batch(1, &["a", "b"]), batch(3, &["c"])];
        write_segment(&path, &batches, true).unwrap();

        let header = read_segment_header(&path).unwrap();
        assert_eq!(header.first_sequence, 1);
        assert_eq!(header.last_sequence, 3);
        assert_eq!(header.batch_count, 2);

        let restored = read_segment(&path).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].start_sequence, 1);
        assert_eq!(restored[1].start_sequence, 3);
        assert_eq!(restored[1].keyed_count(), 1);
    }

    #[test]
    fn test_segment_round_trip_uncompressed() {
        let dir = tempdir().unwrap();
        let path = segment_path(dir.path(), 10);

        write_segment(&path, &[batch(10, &["x"])], false).unwrap();
        let restored = read_segment(&path).unwrap();
        assert_eq!(restored[0].start_sequence, 10);
    }

    #[test]
    fn test_corrupted_segment_detected() {
        let dir = tempdir().unwrap();
        let path = segment_path(dir.path(), 1);
        write_segment(&path, &[batch(1, &["a"])], false).unwrap();

        // Flip a byte inside the entry body
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_segment(&path),
            Err(Error::WalCorrupted { .. })
        ));
    }

    #[test]
    fn test_list_segment_files_sorted() {
        let dir = tempdir().unwrap();
        write_segment(&segment_path(dir.path(), 50), &[batch(50, &["a"])], false).unwrap();
        write_segment(&segment_path(dir.path(), 3), &[batch(3, &["b"])], false).unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let files = list_segment_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(read_segment_header(&files[0]).unwrap().first_sequence, 3);
        assert_eq!(read_segment_header(&files[1]).unwrap().first_sequence, 50);
    }
}
