//! Runtime configuration for peer-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Cache sizing, protocol signing and peer networking knobs all live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::protocol::SigningMode;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "peer-cache", about = "Issue cache operations against a peer-cache node")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Peer address ("host" or "host:port").
    pub peer: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Peer operation to run.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch a value, optionally a byte range of it.
    Get {
        key: String,
        #[arg(long)]
        offset: Option<u32>,
        #[arg(long)]
        length: Option<u32>,
    },
    /// Store a value.
    Set {
        key: String,
        value: String,
        /// Expiry in seconds (0 = never).
        #[arg(long, default_value_t = 0)]
        expire: u32,
        /// Do not wait for the peer's acknowledgement.
        #[arg(long)]
        no_reply: bool,
    },
    /// Store a value only if the key is absent.
    Add {
        key: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        expire: u32,
        #[arg(long)]
        no_reply: bool,
    },
    /// Delete a key on its owner.
    Delete {
        key: String,
        #[arg(long)]
        no_reply: bool,
    },
    /// Drop a key from the peer's local cache only.
    Evict {
        key: String,
        #[arg(long)]
        no_reply: bool,
    },
    /// Check whether a key exists.
    Exists { key: String },
    /// Refresh a key's expiry.
    Touch { key: String },
    /// Print the peer's statistics.
    Stats,
    /// Health check.
    Check,
    /// List the keys the peer holds.
    Index,
    /// Abort an in-progress migration.
    MigrateAbort,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local cache sizing.
    pub cache: CacheConfig,

    /// Wire protocol settings.
    pub protocol: ProtocolConfig,

    /// Peer connection settings.
    pub peer: PeerConfig,
}

/// ARC engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity in bytes for resident (MRU + MFU) objects.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Message framing and authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Shared secret for message signing (None = unsigned).
    pub secret: Option<String>,

    /// Digest placement used for outgoing messages.
    pub signing: SigningMode,

    /// Largest record accepted from a peer, in bytes.
    pub max_record_len: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            secret: None,
            signing: SigningMode::PerMessage,
            max_record_len: 256 * 1024 * 1024, // 256 MB
        }
    }
}

/// Peer networking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Port used when a peer address omits one.
    pub default_port: u16,

    /// Connect timeout in milliseconds.
    pub tcp_timeout_ms: u64,

    /// Per-read/write timeout in milliseconds.
    pub io_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            default_port: 4444,
            tcp_timeout_ms: 5000,
            io_timeout_ms: 5000,
        }
    }
}

impl PeerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
