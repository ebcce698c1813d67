use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{ExamSessions, MediaChunks, RecordingChunks, Recordings};

/// CREATE TABLE IF NOT EXISTS exam_sessions (
///     id TEXT PRIMARY KEY,
///     owner_id TEXT NOT NULL,
///     include_screen INTEGER NOT NULL DEFAULT 0,
///     status TEXT NOT NULL,
///     created_at_ms INTEGER NOT NULL,
///     updated_at_ms INTEGER NOT NULL,
///     started_at_ms INTEGER,
///     ended_at_ms INTEGER,
///     total_duration_ms INTEGER,
///     manifest_url TEXT,
///     failure_reason TEXT
/// )
pub fn create_exam_sessions_table() -> String {
    Table::create()
        .table(ExamSessions::Table)
        .if_not_exists()
        .col(ColumnDef::new(ExamSessions::Id).string().primary_key())
        .col(ColumnDef::new(ExamSessions::OwnerId).string().not_null())
        .col(
            ColumnDef::new(ExamSessions::IncludeScreen)
                .integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(ExamSessions::Status).string().not_null())
        .col(
            ColumnDef::new(ExamSessions::CreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(ExamSessions::UpdatedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(ExamSessions::StartedAtMs).big_integer())
        .col(ColumnDef::new(ExamSessions::EndedAtMs).big_integer())
        .col(ColumnDef::new(ExamSessions::TotalDurationMs).big_integer())
        .col(ColumnDef::new(ExamSessions::ManifestUrl).string())
        .col(ColumnDef::new(ExamSessions::FailureReason).string())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS media_chunks (
///     id TEXT PRIMARY KEY,
///     session_id TEXT NOT NULL REFERENCES exam_sessions(id) ON DELETE CASCADE,
///     stream_kind TEXT NOT NULL,
///     chunk_index INTEGER NOT NULL,
///     status TEXT NOT NULL,
///     checksum TEXT,
///     byte_size INTEGER,
///     storage_key TEXT,
///     upload_url TEXT,
///     created_at_ms INTEGER NOT NULL,
///     updated_at_ms INTEGER NOT NULL
/// )
pub fn create_media_chunks_table() -> String {
    Table::create()
        .table(MediaChunks::Table)
        .if_not_exists()
        .col(ColumnDef::new(MediaChunks::Id).string().primary_key())
        .col(ColumnDef::new(MediaChunks::SessionId).string().not_null())
        .col(ColumnDef::new(MediaChunks::StreamKind).string().not_null())
        .col(
            ColumnDef::new(MediaChunks::ChunkIndex)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(MediaChunks::Status).string().not_null())
        .col(ColumnDef::new(MediaChunks::Checksum).string())
        .col(ColumnDef::new(MediaChunks::ByteSize).big_integer())
        .col(ColumnDef::new(MediaChunks::StorageKey).string())
        .col(ColumnDef::new(MediaChunks::UploadUrl).string())
        .col(
            ColumnDef::new(MediaChunks::CreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(MediaChunks::UpdatedAtMs)
                .big_integer()
                .not_null(),
        )
        .foreign_key(
            ForeignKey::create()
                .from(MediaChunks::Table, MediaChunks::SessionId)
                .to(ExamSessions::Table, ExamSessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE UNIQUE INDEX IF NOT EXISTS idx_media_chunks_session_stream_index
/// ON media_chunks(session_id, stream_kind, chunk_index)
///
/// No two chunks may occupy the same position in a stream's sequence.
pub fn create_media_chunks_unique_index() -> String {
    Index::create()
        .if_not_exists()
        .unique()
        .name("idx_media_chunks_session_stream_index")
        .table(MediaChunks::Table)
        .col(MediaChunks::SessionId)
        .col(MediaChunks::StreamKind)
        .col(MediaChunks::ChunkIndex)
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS recordings (
///     id TEXT PRIMARY KEY,
///     session_id TEXT NOT NULL REFERENCES exam_sessions(id) ON DELETE CASCADE,
///     stream_kind TEXT NOT NULL,
///     duration_ms INTEGER NOT NULL,
///     created_at_ms INTEGER NOT NULL,
///     updated_at_ms INTEGER NOT NULL
/// )
pub fn create_recordings_table() -> String {
    Table::create()
        .table(Recordings::Table)
        .if_not_exists()
        .col(ColumnDef::new(Recordings::Id).string().primary_key())
        .col(ColumnDef::new(Recordings::SessionId).string().not_null())
        .col(ColumnDef::new(Recordings::StreamKind).string().not_null())
        .col(
            ColumnDef::new(Recordings::DurationMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(Recordings::CreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(Recordings::UpdatedAtMs)
                .big_integer()
                .not_null(),
        )
        .foreign_key(
            ForeignKey::create()
                .from(Recordings::Table, Recordings::SessionId)
                .to(ExamSessions::Table, ExamSessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS recording_chunks (
///     id TEXT PRIMARY KEY,
///     recording_id TEXT NOT NULL REFERENCES recordings(id) ON DELETE CASCADE,
///     chunk_id TEXT NOT NULL REFERENCES media_chunks(id) ON DELETE CASCADE,
///     position INTEGER NOT NULL,
///     created_at_ms INTEGER NOT NULL
/// )
pub fn create_recording_chunks_table() -> String {
    Table::create()
        .table(RecordingChunks::Table)
        .if_not_exists()
        .col(ColumnDef::new(RecordingChunks::Id).string().primary_key())
        .col(
            ColumnDef::new(RecordingChunks::RecordingId)
                .string()
                .not_null(),
        )
        .col(ColumnDef::new(RecordingChunks::ChunkId).string().not_null())
        .col(
            ColumnDef::new(RecordingChunks::Position)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(RecordingChunks::CreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .foreign_key(
            ForeignKey::create()
                .from(RecordingChunks::Table, RecordingChunks::RecordingId)
                .to(Recordings::Table, Recordings::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .foreign_key(
            ForeignKey::create()
                .from(RecordingChunks::Table, RecordingChunks::ChunkId)
                .to(MediaChunks::Table, MediaChunks::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE UNIQUE INDEX IF NOT EXISTS idx_recording_chunks_recording_position
/// ON recording_chunks(recording_id, position)
pub fn create_recording_chunks_position_index() -> String {
    Index::create()
        .if_not_exists()
        .unique()
        .name("idx_recording_chunks_recording_position")
        .table(RecordingChunks::Table)
        .col(RecordingChunks::RecordingId)
        .col(RecordingChunks::Position)
        .to_string(SqliteQueryBuilder)
}
