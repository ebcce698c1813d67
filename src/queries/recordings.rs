use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::{MediaChunks, RecordingChunks, Recordings};

/// INSERT INTO recordings (id, session_id, stream_kind, duration_ms,
/// created_at_ms, updated_at_ms) VALUES (?, ?, ?, ?, ?, ?)
pub fn insert_recording(
    id: &str,
    session_id: &str,
    stream_kind: &str,
    duration_ms: i64,
    now_ms: i64,
) -> String {
    Query::insert()
        .into_table(Recordings::Table)
        .columns([
            Recordings::Id,
            Recordings::SessionId,
            Recordings::StreamKind,
            Recordings::DurationMs,
            Recordings::CreatedAtMs,
            Recordings::UpdatedAtMs,
        ])
        .values_panic([
            id.into(),
            session_id.into(),
            stream_kind.into(),
            duration_ms.into(),
            now_ms.into(),
            now_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO recording_chunks (id, recording_id, chunk_id, position,
/// created_at_ms) VALUES (?, ?, ?, ?, ?)
pub fn insert_recording_chunk(
    id: &str,
    recording_id: &str,
    chunk_id: &str,
    position: i64,
    now_ms: i64,
) -> String {
    Query::insert()
        .into_table(RecordingChunks::Table)
        .columns([
            RecordingChunks::Id,
            RecordingChunks::RecordingId,
            RecordingChunks::ChunkId,
            RecordingChunks::Position,
            RecordingChunks::CreatedAtMs,
        ])
        .values_panic([
            id.into(),
            recording_id.into(),
            chunk_id.into(),
            position.into(),
            now_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, session_id, stream_kind, duration_ms, created_at_ms,
/// updated_at_ms FROM recordings WHERE session_id = ?
/// ORDER BY created_at_ms, stream_kind DESC
///
/// All recordings of a session share one finalize timestamp; the secondary
/// key keeps the primary (webcam) stream ahead of the screen stream.
pub fn select_by_session(session_id: &str) -> String {
    Query::select()
        .columns([
            Recordings::Id,
            Recordings::SessionId,
            Recordings::StreamKind,
            Recordings::DurationMs,
            Recordings::CreatedAtMs,
            Recordings::UpdatedAtMs,
        ])
        .from(Recordings::Table)
        .and_where(Expr::col(Recordings::SessionId).eq(session_id))
        .order_by(Recordings::CreatedAtMs, Order::Asc)
        .order_by(Recordings::StreamKind, Order::Desc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT media_chunks.<all columns> FROM recording_chunks
/// INNER JOIN media_chunks ON media_chunks.id = recording_chunks.chunk_id
/// WHERE recording_chunks.recording_id = ?
/// ORDER BY recording_chunks.position
pub fn select_chunks_by_recording(recording_id: &str) -> String {
    Query::select()
        .columns([
            (MediaChunks::Table, MediaChunks::Id),
            (MediaChunks::Table, MediaChunks::SessionId),
            (MediaChunks::Table, MediaChunks::StreamKind),
            (MediaChunks::Table, MediaChunks::ChunkIndex),
            (MediaChunks::Table, MediaChunks::Status),
            (MediaChunks::Table, MediaChunks::Checksum),
            (MediaChunks::Table, MediaChunks::ByteSize),
            (MediaChunks::Table, MediaChunks::StorageKey),
            (MediaChunks::Table, MediaChunks::UploadUrl),
            (MediaChunks::Table, MediaChunks::CreatedAtMs),
            (MediaChunks::Table, MediaChunks::UpdatedAtMs),
        ])
        .from(RecordingChunks::Table)
        .inner_join(
            MediaChunks::Table,
            Expr::col((MediaChunks::Table, MediaChunks::Id))
                .equals((RecordingChunks::Table, RecordingChunks::ChunkId)),
        )
        .and_where(Expr::col((RecordingChunks::Table, RecordingChunks::RecordingId)).eq(recording_id))
        .order_by((RecordingChunks::Table, RecordingChunks::Position), Order::Asc)
        .to_string(SqliteQueryBuilder)
}
