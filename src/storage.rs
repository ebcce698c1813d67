//! Storage facade for chunk objects.
//!
//! Issues short-lived, single-use upload targets and performs object
//! reads/writes/deletes. Two backends: an in-memory store (deterministic
//! test double that records deletions) and a filesystem store. Both mint
//! tokenized upload URLs served by the coordinator's `/storage` routes, so
//! a presigned target is a live URL in either mode.

use chrono::Utc;
use dashmap::DashMap;
use log::warn;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::constants::generate_upload_token;

/// Request for a presigned upload target
pub struct PresignRequest<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub content_type: &'a str,
    pub byte_size: i64,
    pub checksum: &'a str,
    pub ttl_secs: i64,
}

/// A time-boxed, single-use upload target
#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub upload_url: String,
    pub expires_at_ms: i64,
}

#[derive(Debug)]
pub enum StorageError {
    /// Upload token is unknown, already used, or bound to a different object
    TokenInvalid,
    /// Upload token expired before the transfer completed
    TokenExpired,
    /// Transferred byte count does not match the signed size
    SizeMismatch { expected: i64, got: i64 },
    /// Requested object does not exist
    ObjectNotFound(String),
    /// Backend I/O failure
    Io(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::TokenInvalid => write!(f, "Upload token is invalid or already used"),
            StorageError::TokenExpired => write!(f, "Upload token has expired"),
            StorageError::SizeMismatch { expected, got } => {
                write!(
                    f,
                    "Upload size mismatch: signed for {} bytes, got {}",
                    expected, got
                )
            }
            StorageError::ObjectNotFound(key) => write!(f, "Object '{}' not found", key),
            StorageError::Io(msg) => write!(f, "Storage I/O error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Pluggable object storage backend
pub trait ObjectStore: Send + Sync {
    /// Mint a presigned upload target for one object
    fn presign_upload(&self, req: &PresignRequest) -> Result<PresignedUpload, StorageError>;

    /// Validate and consume a single-use upload token
    fn consume_upload_token(
        &self,
        token: &str,
        bucket: &str,
        key: &str,
        byte_size: i64,
    ) -> Result<(), StorageError>;

    /// Write an object (server-side write, no token required)
    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Read an object's bytes
    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete an object; returns whether one existed
    fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;
}

struct TokenEntry {
    bucket: String,
    key: String,
    byte_size: i64,
    expires_at_ms: i64,
}

/// Single-use upload token registry shared by the store backends
struct UploadTokens {
    tokens: DashMap<String, TokenEntry>,
}

impl UploadTokens {
    fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    fn mint(&self, req: &PresignRequest, base_url: &str) -> PresignedUpload {
        let token = generate_upload_token();
        let expires_at_ms = Utc::now().timestamp_millis() + req.ttl_secs * 1000;
        self.tokens.insert(
            token.clone(),
            TokenEntry {
                bucket: req.bucket.to_string(),
                key: req.key.to_string(),
                byte_size: req.byte_size,
                expires_at_ms,
            },
        );
        let upload_url = format!(
            "{}/storage/{}/{}?token={}",
            base_url.trim_end_matches('/'),
            req.bucket,
            req.key,
            urlencoding::encode(&token)
        );
        PresignedUpload {
            upload_url,
            expires_at_ms,
        }
    }

    fn consume(
        &self,
        token: &str,
        bucket: &str,
        key: &str,
        byte_size: i64,
    ) -> Result<(), StorageError> {
        let entry = match self.tokens.get(token) {
            Some(entry) => entry,
            None => return Err(StorageError::TokenInvalid),
        };
        if entry.bucket != bucket || entry.key != key {
            return Err(StorageError::TokenInvalid);
        }
        if Utc::now().timestamp_millis() > entry.expires_at_ms {
            drop(entry);
            self.tokens.remove(token);
            return Err(StorageError::TokenExpired);
        }
        if entry.byte_size != byte_size {
            return Err(StorageError::SizeMismatch {
                expected: entry.byte_size,
                got: byte_size,
            });
        }
        drop(entry);
        self.tokens.remove(token);
        Ok(())
    }
}

/// In-memory object store: the deterministic, no-network test double
pub struct MemoryStore {
    base_url: String,
    objects: DashMap<String, Vec<u8>>,
    tokens: UploadTokens,
    deleted_keys: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: DashMap::new(),
            tokens: UploadTokens::new(),
            deleted_keys: Mutex::new(Vec::new()),
        }
    }

    /// Keys deleted so far, in deletion order
    pub fn deleted_keys(&self) -> Vec<String> {
        self.deleted_keys.lock().unwrap().clone()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{}/{}", bucket, key)
    }
}

impl ObjectStore for MemoryStore {
    fn presign_upload(&self, req: &PresignRequest) -> Result<PresignedUpload, StorageError> {
        Ok(self.tokens.mint(req, &self.base_url))
    }

    fn consume_upload_token(
        &self,
        token: &str,
        bucket: &str,
        key: &str,
        byte_size: i64,
    ) -> Result<(), StorageError> {
        self.tokens.consume(token, bucket, key, byte_size)
    }

    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.objects
            .insert(Self::object_key(bucket, key), data.to_vec());
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .get(&Self::object_key(bucket, key))
            .map(|entry| entry.clone())
            .ok_or_else(|| StorageError::ObjectNotFound(key.to_string()))
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let existed = self
            .objects
            .remove(&Self::object_key(bucket, key))
            .is_some();
        if existed {
            self.deleted_keys.lock().unwrap().push(key.to_string());
        }
        Ok(existed)
    }
}

/// Filesystem-backed object store: objects are files under `root/bucket/key`
pub struct FsStore {
    base_url: String,
    root: PathBuf,
    tokens: UploadTokens,
}

impl FsStore {
    pub fn new(base_url: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            root: root.into(),
            tokens: UploadTokens::new(),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.root.join(bucket);
        // Storage keys are slash-separated; never let a segment escape the root
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                continue;
            }
            path.push(segment);
        }
        path
    }
}

impl ObjectStore for FsStore {
    fn presign_upload(&self, req: &PresignRequest) -> Result<PresignedUpload, StorageError> {
        Ok(self.tokens.mint(req, &self.base_url))
    }

    fn consume_upload_token(
        &self,
        token: &str,
        bucket: &str,
        key: &str,
        byte_size: i64,
    ) -> Result<(), StorageError> {
        self.tokens.consume(token, bucket, key, byte_size)
    }

    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        fs::write(&path, data).map_err(|e| StorageError::Io(e.to_string()))
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key);
        if !path.exists() {
            return Err(StorageError::ObjectNotFound(key.to_string()));
        }
        fs::read(&path).map_err(|e| StorageError::Io(e.to_string()))
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(bucket, key);
        if !path.exists() {
            return Ok(false);
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Failed to delete object {}: {}", path.display(), e);
                Err(StorageError::Io(e.to_string()))
            }
        }
    }
}

/// Delete an object without failing the surrounding operation
/// Returns whether the object was actually removed
pub fn delete_object_best_effort(store: &dyn ObjectStore, bucket: &str, key: &str) -> bool {
    match store.delete_object(bucket, key) {
        Ok(existed) => existed,
        Err(e) => {
            warn!("Best-effort delete of '{}' failed: {}", key, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_presign_request<'a>(bucket: &'a str, key: &'a str) -> PresignRequest<'a> {
        PresignRequest {
            bucket,
            key,
            content_type: "video/webm",
            byte_size: 4,
            checksum: "00000000",
            ttl_secs: 900,
        }
    }

    fn token_from_url(url: &str) -> String {
        url.split("token=").nth(1).unwrap().to_string()
    }

    #[test]
    fn test_presigned_url_shape() {
        let store = MemoryStore::new("http://127.0.0.1:3000");
        let req = default_presign_request("exam-media", "sessions/s1/webcam/chunk-0.webm");
        let signed = store.presign_upload(&req).unwrap();
        assert!(signed
            .upload_url
            .starts_with("http://127.0.0.1:3000/storage/exam-media/sessions/s1/webcam/chunk-0.webm?token="));
        assert!(signed.expires_at_ms > Utc::now().timestamp_millis());
    }

    #[test]
    fn test_upload_token_is_single_use() {
        let store = MemoryStore::new("http://localhost");
        let req = default_presign_request("b", "k");
        let signed = store.presign_upload(&req).unwrap();
        let token = token_from_url(&signed.upload_url);

        store.consume_upload_token(&token, "b", "k", 4).unwrap();
        let second = store.consume_upload_token(&token, "b", "k", 4);
        assert!(matches!(second, Err(StorageError::TokenInvalid)));
    }

    #[test]
    fn test_upload_token_rejects_wrong_object_and_size() {
        let store = MemoryStore::new("http://localhost");
        let req = default_presign_request("b", "k");
        let signed = store.presign_upload(&req).unwrap();
        let token = token_from_url(&signed.upload_url);

        assert!(matches!(
            store.consume_upload_token(&token, "b", "other", 4),
            Err(StorageError::TokenInvalid)
        ));
        assert!(matches!(
            store.consume_upload_token(&token, "b", "k", 999),
            Err(StorageError::SizeMismatch { .. })
        ));
        // Neither failure consumed the token
        store.consume_upload_token(&token, "b", "k", 4).unwrap();
    }

    #[test]
    fn test_expired_token_rejected() {
        let store = MemoryStore::new("http://localhost");
        let req = PresignRequest {
            ttl_secs: -1,
            ..default_presign_request("b", "k")
        };
        let signed = store.presign_upload(&req).unwrap();
        let token = token_from_url(&signed.upload_url);
        assert!(matches!(
            store.consume_upload_token(&token, "b", "k", 4),
            Err(StorageError::TokenExpired)
        ));
    }

    #[test]
    fn test_memory_store_records_deletions() {
        let store = MemoryStore::new("http://localhost");
        store.put_object("b", "k1", b"one").unwrap();
        store.put_object("b", "k2", b"two").unwrap();

        assert!(store.delete_object("b", "k1").unwrap());
        assert!(!store.delete_object("b", "missing").unwrap());
        assert_eq!(store.deleted_keys(), vec!["k1".to_string()]);
        assert_eq!(store.object_count(), 1);
    }

    #[test]
    fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new("http://localhost", dir.path());

        store
            .put_object("bucket", "sessions/s1/webcam/chunk-0.webm", b"payload")
            .unwrap();
        let data = store
            .get_object("bucket", "sessions/s1/webcam/chunk-0.webm")
            .unwrap();
        assert_eq!(data, b"payload");

        assert!(store
            .delete_object("bucket", "sessions/s1/webcam/chunk-0.webm")
            .unwrap());
        assert!(matches!(
            store.get_object("bucket", "sessions/s1/webcam/chunk-0.webm"),
            Err(StorageError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_fs_store_ignores_path_traversal_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new("http://localhost", dir.path());
        store.put_object("bucket", "../../escape", b"x").unwrap();
        assert!(dir.path().join("bucket").join("escape").exists());
    }
}
