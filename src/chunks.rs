//! Server-side chunk upload coordinator.
//!
//! Validates signing requests against session state, rate-limits per
//! (session, stream), issues presigned upload targets through the storage
//! facade, and records chunk status transitions. Chunk existence plus
//! `UPLOADED` status is the single source of truth for what finalize may
//! reference.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::{DEFAULT_CONTENT_TYPE, UPLOAD_URL_TTL_SECS};
use crate::error::ServiceError;
use crate::manifest::{ManifestChunkEntry, StreamKind};
use crate::queries::chunks as q;
use crate::rate_limit::SlidingWindowLimiter;
use crate::sessions::{self, SessionStatus};
use crate::storage::{delete_object_best_effort, ObjectStore, PresignRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChunkStatus {
    Pending,
    Uploaded,
    Failed,
    Deleted,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "PENDING",
            ChunkStatus::Uploaded => "UPLOADED",
            ChunkStatus::Failed => "FAILED",
            ChunkStatus::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ChunkStatus::Pending),
            "UPLOADED" => Ok(ChunkStatus::Uploaded),
            "FAILED" => Ok(ChunkStatus::Failed),
            "DELETED" => Ok(ChunkStatus::Deleted),
            other => Err(format!("Unknown chunk status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub id: String,
    pub session_id: String,
    pub stream_kind: StreamKind,
    pub chunk_index: i64,
    pub status: ChunkStatus,
    pub checksum: Option<String>,
    pub byte_size: Option<i64>,
    pub storage_key: Option<String>,
    pub upload_url: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

pub(crate) fn map_row(row: &SqliteRow) -> Result<MediaChunk, ServiceError> {
    let stream_text: String = row.try_get("stream_kind")?;
    let status_text: String = row.try_get("status")?;
    Ok(MediaChunk {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        stream_kind: stream_text
            .parse::<StreamKind>()
            .map_err(ServiceError::Storage)?,
        chunk_index: row.try_get("chunk_index")?,
        status: status_text
            .parse::<ChunkStatus>()
            .map_err(ServiceError::Storage)?,
        checksum: row.try_get("checksum")?,
        byte_size: row.try_get("byte_size")?,
        storage_key: row.try_get("storage_key")?,
        upload_url: row.try_get("upload_url")?,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

/// Chunk signing request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignChunkRequest {
    pub stream_kind: StreamKind,
    pub chunk_index: i64,
    pub byte_size: i64,
    pub checksum: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Chunk signing response: the new chunk identifier plus its upload target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedChunk {
    pub chunk_id: String,
    pub upload_url: String,
    pub storage_key: String,
    pub expires_at_ms: i64,
}

/// Deterministic storage key for a chunk position
pub fn storage_key_for(session_id: &str, stream_kind: StreamKind, chunk_index: i64) -> String {
    format!(
        "sessions/{}/{}/chunk-{}.webm",
        session_id, stream_kind, chunk_index
    )
}

pub async fn get_chunk(
    pool: &SqlitePool,
    chunk_id: &str,
) -> Result<Option<MediaChunk>, ServiceError> {
    let sql = q::select_by_id(chunk_id);
    let row = sqlx::query(&sql).fetch_optional(pool).await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn require_chunk(pool: &SqlitePool, chunk_id: &str) -> Result<MediaChunk, ServiceError> {
    get_chunk(pool, chunk_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Chunk {} not found", chunk_id)))
}

async fn chunk_at_index(
    pool: &SqlitePool,
    session_id: &str,
    stream_kind: StreamKind,
    chunk_index: i64,
) -> Result<Option<MediaChunk>, ServiceError> {
    let sql = q::select_at_index(session_id, stream_kind.as_str(), chunk_index);
    let row = sqlx::query(&sql).fetch_optional(pool).await?;
    row.as_ref().map(map_row).transpose()
}

/// Validate a signing request and issue a presigned upload target.
///
/// A chunk index that already holds an `UPLOADED` chunk is a conflict -
/// retries must reuse the previously issued identifier, not claim the
/// position again. An index still in `PENDING` state may be re-signed: the
/// same chunk id is returned with a fresh target, which is the recovery
/// path for targets that expired before the transfer completed.
pub async fn request_upload_url(
    pool: &SqlitePool,
    store: &dyn ObjectStore,
    limiter: &SlidingWindowLimiter,
    bucket: &str,
    session_id: &str,
    owner_id: &str,
    req: &SignChunkRequest,
) -> Result<SignedChunk, ServiceError> {
    if req.chunk_index < 0 {
        return Err(ServiceError::Validation(
            "chunkIndex must be non-negative".to_string(),
        ));
    }
    if req.byte_size <= 0 {
        return Err(ServiceError::Validation(
            "byteSize must be positive".to_string(),
        ));
    }
    if req.checksum.is_empty() {
        return Err(ServiceError::Validation(
            "checksum must not be empty".to_string(),
        ));
    }

    let session = sessions::require_session(pool, session_id).await?;
    sessions::ensure_owner(&session, owner_id)?;
    if session.status != SessionStatus::Active {
        return Err(ServiceError::Conflict(format!(
            "Cannot upload when session status is {}",
            session.status
        )));
    }
    if req.stream_kind == StreamKind::Screen && !session.include_screen {
        return Err(ServiceError::Conflict(
            "Screen recording not enabled for this session".to_string(),
        ));
    }

    limiter.consume(&format!("{}:{}", session_id, req.stream_kind))?;

    let content_type = req
        .content_type
        .as_deref()
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    let now_ms = Utc::now().timestamp_millis();

    if let Some(existing) = chunk_at_index(pool, session_id, req.stream_kind, req.chunk_index).await? {
        if existing.status != ChunkStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "Chunk index {} already exists for {}",
                req.chunk_index, req.stream_kind
            )));
        }
        // Pending chunk: reissue the target so the client can recover from
        // an expired upload URL without violating index uniqueness
        let storage_key = existing
            .storage_key
            .clone()
            .unwrap_or_else(|| storage_key_for(session_id, req.stream_kind, req.chunk_index));
        let signed = store
            .presign_upload(&PresignRequest {
                bucket,
                key: &storage_key,
                content_type,
                byte_size: req.byte_size,
                checksum: &req.checksum,
                ttl_secs: UPLOAD_URL_TTL_SECS,
            })
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let sql = q::update_upload_url(&existing.id, &signed.upload_url, now_ms);
        sqlx::query(&sql).execute(pool).await?;
        return Ok(SignedChunk {
            chunk_id: existing.id,
            upload_url: signed.upload_url,
            storage_key,
            expires_at_ms: signed.expires_at_ms,
        });
    }

    let storage_key = storage_key_for(session_id, req.stream_kind, req.chunk_index);
    let signed = store
        .presign_upload(&PresignRequest {
            bucket,
            key: &storage_key,
            content_type,
            byte_size: req.byte_size,
            checksum: &req.checksum,
            ttl_secs: UPLOAD_URL_TTL_SECS,
        })
        .map_err(|e| ServiceError::Storage(e.to_string()))?;

    let chunk_id = Uuid::new_v4().to_string();
    let sql = q::insert(
        &chunk_id,
        session_id,
        req.stream_kind.as_str(),
        req.chunk_index,
        ChunkStatus::Pending.as_str(),
        &storage_key,
        &signed.upload_url,
        now_ms,
    );
    sqlx::query(&sql).execute(pool).await?;

    Ok(SignedChunk {
        chunk_id,
        upload_url: signed.upload_url,
        storage_key,
        expires_at_ms: signed.expires_at_ms,
    })
}

/// Record confirmed completion of a chunk upload.
///
/// The only allowed mutation after creation; stores the confirmed checksum
/// and byte size (which supersede the values supplied at signing time).
/// Idempotent per chunk id.
pub async fn mark_uploaded(
    pool: &SqlitePool,
    session_id: &str,
    owner_id: &str,
    chunk_id: &str,
    checksum: &str,
    byte_size: i64,
) -> Result<MediaChunk, ServiceError> {
    if checksum.is_empty() {
        return Err(ServiceError::Validation(
            "checksum must not be empty".to_string(),
        ));
    }
    if byte_size <= 0 {
        return Err(ServiceError::Validation(
            "byteSize must be positive".to_string(),
        ));
    }

    let session = sessions::require_session(pool, session_id).await?;
    sessions::ensure_owner(&session, owner_id)?;

    let chunk = require_chunk(pool, chunk_id).await?;
    if chunk.session_id != session_id {
        return Err(ServiceError::Conflict(format!(
            "Chunk {} does not belong to session {}",
            chunk_id, session_id
        )));
    }

    let now_ms = Utc::now().timestamp_millis();
    let sql = q::update_uploaded(chunk_id, checksum, byte_size, now_ms);
    sqlx::query(&sql).execute(pool).await?;
    require_chunk(pool, chunk_id).await
}

pub async fn list_chunks(
    pool: &SqlitePool,
    session_id: &str,
    stream_kind: Option<StreamKind>,
) -> Result<Vec<MediaChunk>, ServiceError> {
    let sql = match stream_kind {
        Some(kind) => q::select_by_session_and_stream(session_id, kind.as_str()),
        None => q::select_by_session(session_id),
    };
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(map_row).collect()
}

/// Manifest entries for every confirmed chunk, sorted by index
pub async fn list_uploaded_chunks(
    pool: &SqlitePool,
    session_id: &str,
    stream_kind: Option<StreamKind>,
) -> Result<Vec<ManifestChunkEntry>, ServiceError> {
    let rows = list_chunks(pool, session_id, stream_kind).await?;
    let mut entries = Vec::new();
    for row in rows {
        if row.status != ChunkStatus::Uploaded {
            continue;
        }
        let entry = manifest_entry(&row)?;
        entries.push(entry);
    }
    entries.sort_by_key(|e| e.chunk_index);
    Ok(entries)
}

pub fn manifest_entry(chunk: &MediaChunk) -> Result<ManifestChunkEntry, ServiceError> {
    let storage_key = chunk.storage_key.clone();
    let checksum = chunk.checksum.clone();
    let byte_size = chunk.byte_size;
    match (storage_key, checksum, byte_size) {
        (Some(storage_key), Some(checksum), Some(byte_size)) => Ok(ManifestChunkEntry {
            chunk_id: chunk.id.clone(),
            chunk_index: chunk.chunk_index,
            storage_key,
            checksum,
            byte_size,
        }),
        _ => Err(ServiceError::Storage(format!(
            "Chunk {} missing required metadata",
            chunk.id
        ))),
    }
}

/// Best-effort delete of every chunk object, then removal of all chunk rows.
/// Returns the storage keys actually removed. Used during session abort.
pub async fn delete_chunks(
    pool: &SqlitePool,
    store: &dyn ObjectStore,
    bucket: &str,
    session_id: &str,
) -> Result<Vec<String>, ServiceError> {
    let rows = list_chunks(pool, session_id, None).await?;
    let mut deleted_keys = Vec::new();
    for chunk in &rows {
        if let Some(key) = &chunk.storage_key {
            if delete_object_best_effort(store, bucket, key) {
                deleted_keys.push(key.clone());
            }
        }
    }

    let sql = q::delete_by_session(session_id);
    sqlx::query(&sql).execute(pool).await?;
    Ok(deleted_keys)
}
