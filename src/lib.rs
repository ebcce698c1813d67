// Library interface for testing

// Declare all modules
pub mod capture;
pub mod chunks;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod finalize;
pub mod manifest;
pub mod offline_store;
pub mod playback;
pub mod queries;
pub mod rate_limit;
pub mod recorder;
pub mod schema;
pub mod serve;
pub mod session_api;
pub mod sessions;
pub mod storage;
pub mod upload_queue;

// Re-export the client-facing defaults for convenience
pub use constants::{DEFAULT_CHUNK_DURATION_MS, DEFAULT_MAX_RETRIES};
