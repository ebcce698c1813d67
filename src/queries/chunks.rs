use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::MediaChunks;

const CHUNK_COLUMNS: [MediaChunks; 11] = [
    MediaChunks::Id,
    MediaChunks::SessionId,
    MediaChunks::StreamKind,
    MediaChunks::ChunkIndex,
    MediaChunks::Status,
    MediaChunks::Checksum,
    MediaChunks::ByteSize,
    MediaChunks::StorageKey,
    MediaChunks::UploadUrl,
    MediaChunks::CreatedAtMs,
    MediaChunks::UpdatedAtMs,
];

/// INSERT INTO media_chunks (id, session_id, stream_kind, chunk_index, status,
/// storage_key, upload_url, created_at_ms, updated_at_ms)
/// VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
pub fn insert(
    id: &str,
    session_id: &str,
    stream_kind: &str,
    chunk_index: i64,
    status: &str,
    storage_key: &str,
    upload_url: &str,
    now_ms: i64,
) -> String {
    Query::insert()
        .into_table(MediaChunks::Table)
        .columns([
            MediaChunks::Id,
            MediaChunks::SessionId,
            MediaChunks::StreamKind,
            MediaChunks::ChunkIndex,
            MediaChunks::Status,
            MediaChunks::StorageKey,
            MediaChunks::UploadUrl,
            MediaChunks::CreatedAtMs,
            MediaChunks::UpdatedAtMs,
        ])
        .values_panic([
            id.into(),
            session_id.into(),
            stream_kind.into(),
            chunk_index.into(),
            status.into(),
            storage_key.into(),
            upload_url.into(),
            now_ms.into(),
            now_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT <all columns> FROM media_chunks WHERE id = ?
pub fn select_by_id(id: &str) -> String {
    Query::select()
        .columns(CHUNK_COLUMNS)
        .from(MediaChunks::Table)
        .and_where(Expr::col(MediaChunks::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT <all columns> FROM media_chunks WHERE session_id = ?
/// ORDER BY stream_kind, chunk_index
pub fn select_by_session(session_id: &str) -> String {
    Query::select()
        .columns(CHUNK_COLUMNS)
        .from(MediaChunks::Table)
        .and_where(Expr::col(MediaChunks::SessionId).eq(session_id))
        .order_by(MediaChunks::StreamKind, Order::Asc)
        .order_by(MediaChunks::ChunkIndex, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT <all columns> FROM media_chunks WHERE session_id = ? AND
/// stream_kind = ? ORDER BY chunk_index
pub fn select_by_session_and_stream(session_id: &str, stream_kind: &str) -> String {
    Query::select()
        .columns(CHUNK_COLUMNS)
        .from(MediaChunks::Table)
        .and_where(Expr::col(MediaChunks::SessionId).eq(session_id))
        .and_where(Expr::col(MediaChunks::StreamKind).eq(stream_kind))
        .order_by(MediaChunks::ChunkIndex, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT <all columns> FROM media_chunks WHERE session_id = ? AND
/// stream_kind = ? AND chunk_index = ?
pub fn select_at_index(session_id: &str, stream_kind: &str, chunk_index: i64) -> String {
    Query::select()
        .columns(CHUNK_COLUMNS)
        .from(MediaChunks::Table)
        .and_where(Expr::col(MediaChunks::SessionId).eq(session_id))
        .and_where(Expr::col(MediaChunks::StreamKind).eq(stream_kind))
        .and_where(Expr::col(MediaChunks::ChunkIndex).eq(chunk_index))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE media_chunks SET status = 'UPLOADED', checksum = ?, byte_size = ?,
/// updated_at_ms = ? WHERE id = ?
///
/// The only allowed mutation after creation; records the confirmed values.
pub fn update_uploaded(id: &str, checksum: &str, byte_size: i64, now_ms: i64) -> String {
    Query::update()
        .table(MediaChunks::Table)
        .value(MediaChunks::Status, "UPLOADED")
        .value(MediaChunks::Checksum, checksum)
        .value(MediaChunks::ByteSize, byte_size)
        .value(MediaChunks::UpdatedAtMs, now_ms)
        .and_where(Expr::col(MediaChunks::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE media_chunks SET upload_url = ?, updated_at_ms = ? WHERE id = ?
///
/// Reissues the upload target for a chunk still pending upload.
pub fn update_upload_url(id: &str, upload_url: &str, now_ms: i64) -> String {
    Query::update()
        .table(MediaChunks::Table)
        .value(MediaChunks::UploadUrl, upload_url)
        .value(MediaChunks::UpdatedAtMs, now_ms)
        .and_where(Expr::col(MediaChunks::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM media_chunks WHERE session_id = ?
pub fn delete_by_session(session_id: &str) -> String {
    Query::delete()
        .from_table(MediaChunks::Table)
        .and_where(Expr::col(MediaChunks::SessionId).eq(session_id))
        .to_string(SqliteQueryBuilder)
}
