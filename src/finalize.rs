//! Server-side recording finalizer.
//!
//! Validates that every referenced chunk is uploaded, in order, and owned by
//! the session, then freezes one Recording row per stream plus its ordered
//! chunk positions and flips the session to COMPLETED. The manifest is
//! derived data: `get_manifest` rebuilds it from the recording and chunk
//! rows. A session can be finalized at most once; a second call is a
//! conflict.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::chunks::{self, ChunkStatus};
use crate::error::ServiceError;
use crate::manifest::{ManifestStream, RecordingManifest, StreamKind};
use crate::queries::recordings as q;
use crate::sessions::{self, SessionStatus};
use crate::storage::ObjectStore;

/// One chunk reference in a finalize request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeChunkRef {
    pub chunk_id: String,
    pub chunk_index: i64,
}

/// Per-stream portion of a finalize request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeStream {
    pub stream_kind: StreamKind,
    pub duration_ms: i64,
    pub chunks: Vec<FinalizeChunkRef>,
}

/// Finalize request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizePayload {
    pub total_duration_ms: i64,
    pub streams: Vec<FinalizeStream>,
}

/// A frozen per-stream recording row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: String,
    pub session_id: String,
    pub stream_kind: StreamKind,
    pub duration_ms: i64,
    pub created_at_ms: i64,
}

/// Result of a successful finalize call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOutcome {
    pub manifest: RecordingManifest,
    pub recordings: Vec<Recording>,
    pub manifest_url: String,
}

fn map_recording_row(row: &SqliteRow) -> Result<Recording, ServiceError> {
    let stream_text: String = row.try_get("stream_kind")?;
    Ok(Recording {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        stream_kind: stream_text
            .parse::<StreamKind>()
            .map_err(ServiceError::Storage)?,
        duration_ms: row.try_get("duration_ms")?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

/// Storage key the frozen manifest is written to.
///
/// It lives at the bucket root so chunk storage keys resolve correctly
/// relative to the manifest's own URL during playback.
pub fn manifest_storage_key(session_id: &str) -> String {
    format!("{}.manifest.json", session_id)
}

pub async fn finalize_recording(
    pool: &SqlitePool,
    store: &dyn ObjectStore,
    bucket: &str,
    session_id: &str,
    owner_id: &str,
    payload: &FinalizePayload,
) -> Result<FinalizeOutcome, ServiceError> {
    let session = sessions::require_session(pool, session_id).await?;
    sessions::ensure_owner(&session, owner_id)?;
    if session.status == SessionStatus::Completed {
        return Err(ServiceError::Conflict(format!(
            "Session {} is already finalized",
            session_id
        )));
    }
    if session.status.is_terminal() {
        return Err(ServiceError::Conflict(format!(
            "Cannot finalize when session status is {}",
            session.status
        )));
    }

    if payload.total_duration_ms <= 0 {
        return Err(ServiceError::Validation(
            "totalDurationMs must be positive".to_string(),
        ));
    }
    if payload.streams.is_empty() {
        return Err(ServiceError::Validation(
            "finalize requires at least one stream".to_string(),
        ));
    }

    let mut manifest_streams = Vec::with_capacity(payload.streams.len());
    for stream in &payload.streams {
        if stream.duration_ms < 0 {
            return Err(ServiceError::Validation(
                "durationMs must be non-negative".to_string(),
            ));
        }
        if stream.chunks.is_empty() {
            return Err(ServiceError::Validation(format!(
                "Stream {} references no chunks",
                stream.stream_kind
            )));
        }

        let mut entries = Vec::with_capacity(stream.chunks.len());
        for chunk_ref in &stream.chunks {
            let record = chunks::require_chunk(pool, &chunk_ref.chunk_id).await?;
            if record.session_id != session_id {
                return Err(ServiceError::Conflict(format!(
                    "Chunk {} does not belong to session {}",
                    chunk_ref.chunk_id, session_id
                )));
            }
            if record.status != ChunkStatus::Uploaded {
                return Err(ServiceError::Conflict(format!(
                    "Chunk {} is not uploaded",
                    chunk_ref.chunk_id
                )));
            }
            if record.chunk_index != chunk_ref.chunk_index {
                return Err(ServiceError::Conflict(format!(
                    "Chunk index mismatch for {}: stored {}, referenced {}",
                    chunk_ref.chunk_id, record.chunk_index, chunk_ref.chunk_index
                )));
            }
            entries.push(chunks::manifest_entry(&record)?);
        }
        // Upload completion order is irrelevant, only index order matters
        entries.sort_by_key(|e| e.chunk_index);

        manifest_streams.push(ManifestStream {
            stream_kind: stream.stream_kind,
            duration_ms: stream.duration_ms,
            chunks: entries,
        });
    }

    let now_ms = Utc::now().timestamp_millis();
    let manifest = RecordingManifest {
        session_id: session_id.to_string(),
        created_at_ms: now_ms,
        total_duration_ms: payload.total_duration_ms,
        streams: manifest_streams,
    };

    let mut recordings = Vec::with_capacity(manifest.streams.len());
    for stream in &manifest.streams {
        let recording_id = Uuid::new_v4().to_string();
        let sql = q::insert_recording(
            &recording_id,
            session_id,
            stream.stream_kind.as_str(),
            stream.duration_ms,
            now_ms,
        );
        sqlx::query(&sql).execute(pool).await?;

        for (position, chunk) in stream.chunks.iter().enumerate() {
            let sql = q::insert_recording_chunk(
                &Uuid::new_v4().to_string(),
                &recording_id,
                &chunk.chunk_id,
                position as i64,
                now_ms,
            );
            sqlx::query(&sql).execute(pool).await?;
        }

        recordings.push(Recording {
            id: recording_id,
            session_id: session_id.to_string(),
            stream_kind: stream.stream_kind,
            duration_ms: stream.duration_ms,
            created_at_ms: now_ms,
        });
    }

    // Freeze a copy of the manifest in object storage so playback can
    // resolve chunk keys relative to the manifest location
    let manifest_json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| ServiceError::Storage(e.to_string()))?;
    let manifest_key = manifest_storage_key(session_id);
    store
        .put_object(bucket, &manifest_key, manifest_json.as_bytes())
        .map_err(|e| ServiceError::Storage(e.to_string()))?;
    let manifest_url = format!("/storage/{}/{}", bucket, manifest_key);

    sessions::mark_completed(pool, session_id, payload.total_duration_ms, &manifest_url).await?;

    Ok(FinalizeOutcome {
        manifest,
        recordings,
        manifest_url,
    })
}

/// Rebuild the manifest from the recording and chunk rows, or not-found if
/// the session never finalized. The rows are the source of truth; the copy
/// in object storage exists only for playback URL resolution.
pub async fn get_manifest(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<RecordingManifest, ServiceError> {
    let recordings = list_recordings(pool, session_id).await?;
    let created_at_ms = match recordings.first() {
        Some(first) => first.created_at_ms,
        None => {
            return Err(ServiceError::NotFound(format!(
                "Manifest not found for session {}",
                session_id
            )))
        }
    };
    let session = sessions::require_session(pool, session_id).await?;

    let mut streams = Vec::with_capacity(recordings.len());
    for recording in &recordings {
        let sql = q::select_chunks_by_recording(&recording.id);
        let rows = sqlx::query(&sql).fetch_all(pool).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = chunks::map_row(row)?;
            entries.push(chunks::manifest_entry(&chunk)?);
        }
        streams.push(ManifestStream {
            stream_kind: recording.stream_kind,
            duration_ms: recording.duration_ms,
            chunks: entries,
        });
    }

    Ok(RecordingManifest {
        session_id: session_id.to_string(),
        created_at_ms,
        total_duration_ms: session.total_duration_ms.unwrap_or(0),
        streams,
    })
}

/// Recordings created for a session, primary stream first
pub async fn list_recordings(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Vec<Recording>, ServiceError> {
    let sql = q::select_by_session(session_id);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(map_recording_row).collect()
}
