use serde::Deserialize;
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_CHUNK_DURATION_MS, DEFAULT_MAX_RETRIES, RATE_LIMIT_MAX_REQUESTS, RATE_LIMIT_WINDOW_MS,
};

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory object store (development and tests; objects die with the process)
    Memory,
    /// Objects stored as files under `storage.root`
    Filesystem,
}

/// Storage configuration (maps to [storage] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the filesystem backend
    pub root: Option<PathBuf>,
}

/// Rate limit configuration (maps to [rate_limit] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: Option<usize>,
    pub window_ms: Option<i64>,
}

/// Coordinator server configuration file structure
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite database file path (default: tmp/proctor_media.sqlite)
    pub database_path: Option<PathBuf>,
    /// Storage bucket name chunk objects are written under (default: exam-media)
    pub bucket: Option<String>,
    /// Base URL presigned upload targets are issued against
    /// (default: http://127.0.0.1:{port})
    pub public_base_url: Option<String>,
    /// Object storage backend (default: filesystem under tmp/objects)
    pub storage: Option<StorageConfig>,
    /// Signing rate limit per (session, stream)
    pub rate_limit: Option<RateLimitConfig>,
    /// Chunk duration recommended to clients (default: 10000)
    pub chunk_duration_ms: Option<u64>,
    /// Upload retry budget recommended to clients (default: 5)
    pub max_retries: Option<u32>,
}

impl ServerConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("tmp/proctor_media.sqlite"))
    }

    pub fn bucket(&self) -> String {
        self.bucket.clone().unwrap_or_else(|| "exam-media".to_string())
    }

    pub fn chunk_duration_ms(&self) -> u64 {
        self.chunk_duration_ms.unwrap_or(DEFAULT_CHUNK_DURATION_MS)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn rate_limit_max_requests(&self) -> usize {
        self.rate_limit
            .as_ref()
            .and_then(|r| r.max_requests)
            .unwrap_or(RATE_LIMIT_MAX_REQUESTS)
    }

    pub fn rate_limit_window_ms(&self) -> i64 {
        self.rate_limit
            .as_ref()
            .and_then(|r| r.window_ms)
            .unwrap_or(RATE_LIMIT_WINDOW_MS)
    }
}

/// Recording client configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct RecordConfig {
    /// Coordinator base URL (e.g. http://127.0.0.1:3000)
    pub server_url: String,
    /// Exam session identifier to record under (required)
    pub session_id: String,
    /// Owner identity sent with every mutating request (required)
    pub owner_id: String,
    /// Capture the secondary screen stream as well (default: false)
    pub include_screen: Option<bool>,
    /// Byte source file standing in for the primary capture device
    pub source: PathBuf,
    /// Byte source file for the screen stream (required when include_screen)
    pub screen_source: Option<PathBuf>,
    /// Simulated capture byte rate in bytes per second (default: 32768)
    pub byte_rate: Option<u64>,
    /// Local staging database for chunks that could not be uploaded
    /// (default: tmp/{session_id}.offline.sqlite)
    pub offline_db: Option<PathBuf>,
    /// Directory for the per-session recording lock file (default: tmp)
    pub lock_dir: Option<PathBuf>,
}

impl RecordConfig {
    pub fn byte_rate(&self) -> u64 {
        self.byte_rate.unwrap_or(32 * 1024)
    }

    pub fn offline_db(&self) -> PathBuf {
        self.offline_db
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("tmp/{}.offline.sqlite", self.session_id)))
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(|| PathBuf::from("tmp"))
    }
}
