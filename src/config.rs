//! QuillSync Configuration
//!
//! Configuration structures for the replication layer of a QuillDB node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main QuillSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuillSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Write-Ahead Log retention configuration
    #[serde(default)]
    pub wal: WalConfig,

    /// Replication protocol configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory for WAL archive storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Numeric database id served by this node
    #[serde(default = "default_database_id")]
    pub database_id: u64,
}

/// Write-Ahead Log retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Enable LZ4 compression for archived WAL segments
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Number of write batches per archived segment
    #[serde(default = "default_segment_batches")]
    pub segment_batches: usize,

    /// Grace window before an eligible segment is actually deleted, seconds
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,

    /// Maximum total size of the WAL archive in megabytes; when exceeded,
    /// the oldest archived segments are force-expired regardless of client
    /// progress (replication continuity is traded for disk safety)
    #[serde(default = "default_archive_cap_mb")]
    pub archive_cap_mb: u64,

    /// Background sweep interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Replication protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Default context TTL in seconds when the client does not send one
    #[serde(default = "default_context_ttl_secs")]
    pub context_ttl_secs: u64,

    /// Default byte budget per dump / tailing call
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: u64,

    /// Maximum byte budget a client may request per call
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,

    /// Default number of keys per key chunk during incremental sync
    #[serde(default = "default_keys_per_chunk")]
    pub keys_per_chunk: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/quilldb")
}

fn default_database_id() -> u64 {
    1
}

fn default_compression() -> bool {
    true
}

fn default_segment_batches() -> usize {
    256
}

fn default_grace_window_secs() -> u64 {
    60
}

fn default_archive_cap_mb() -> u64 {
    1024
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_context_ttl_secs() -> u64 {
    600
}

fn default_chunk_bytes() -> u64 {
    128 * 1024
}

fn default_max_chunk_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_keys_per_chunk() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8529".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "quill-1".to_string(),
            data_dir: default_data_dir(),
            database_id: default_database_id(),
        }
    }
}

impl Default for QuillSyncConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            wal: WalConfig::default(),
            replication: ReplicationConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            segment_batches: default_segment_batches(),
            grace_window_secs: default_grace_window_secs(),
            archive_cap_mb: default_archive_cap_mb(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            context_ttl_secs: default_context_ttl_secs(),
            chunk_bytes: default_chunk_bytes(),
            max_chunk_bytes: default_max_chunk_bytes(),
            keys_per_chunk: default_keys_per_chunk(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl QuillSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: QuillSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.wal.segment_batches == 0 {
            return Err(crate::Error::Config(
                "wal.segment_batches must be at least 1".into(),
            ));
        }

        if self.replication.chunk_bytes == 0
            || self.replication.chunk_bytes > self.replication.max_chunk_bytes
        {
            return Err(crate::Error::Config(
                "replication.chunk_bytes must be between 1 and max_chunk_bytes".into(),
            ));
        }

        Ok(())
    }

    /// Get the WAL archive directory path
    pub fn archive_dir(&self) -> PathBuf {
        self.node.data_dir.join("wal-archive")
    }

    /// Get the pruning grace window as a Duration
    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.wal.grace_window_secs)
    }

    /// Get the background sweep interval as a Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.wal.sweep_interval_ms)
    }

    /// Get the archive size cap in bytes
    pub fn archive_cap_bytes(&self) -> u64 {
        self.wal.archive_cap_mb * 1024 * 1024
    }

    /// Get the default context TTL as a Duration
    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.replication.context_ttl_secs)
    }
}
