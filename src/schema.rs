use sea_query::Iden;

/// Exam sessions table - one row per proctored session
#[derive(Iden)]
pub enum ExamSessions {
    Table,
    Id,
    OwnerId,
    IncludeScreen,
    Status,
    CreatedAtMs,
    UpdatedAtMs,
    StartedAtMs,
    EndedAtMs,
    TotalDurationMs,
    ManifestUrl,
    FailureReason,
}

/// Media chunks table - individual upload units per stream
#[derive(Iden)]
pub enum MediaChunks {
    Table,
    Id,
    SessionId,
    StreamKind,
    ChunkIndex,
    Status,
    Checksum,
    ByteSize,
    StorageKey,
    UploadUrl,
    CreatedAtMs,
    UpdatedAtMs,
}

/// Recordings table - one per (session, stream) pair, created at finalize
#[derive(Iden)]
pub enum Recordings {
    Table,
    Id,
    SessionId,
    StreamKind,
    DurationMs,
    CreatedAtMs,
    UpdatedAtMs,
}

/// Recording chunks table - ordered chunk positions within a recording
#[derive(Iden)]
pub enum RecordingChunks {
    Table,
    Id,
    RecordingId,
    ChunkId,
    Position,
    CreatedAtMs,
}
