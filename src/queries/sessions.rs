use sea_query::{Expr, Func, Query, SqliteQueryBuilder};

use crate::schema::ExamSessions;

const SESSION_COLUMNS: [ExamSessions; 11] = [
    ExamSessions::Id,
    ExamSessions::OwnerId,
    ExamSessions::IncludeScreen,
    ExamSessions::Status,
    ExamSessions::CreatedAtMs,
    ExamSessions::UpdatedAtMs,
    ExamSessions::StartedAtMs,
    ExamSessions::EndedAtMs,
    ExamSessions::TotalDurationMs,
    ExamSessions::ManifestUrl,
    ExamSessions::FailureReason,
];

/// SELECT <all columns> FROM exam_sessions WHERE id = ?
pub fn select_by_id(id: &str) -> String {
    Query::select()
        .columns(SESSION_COLUMNS)
        .from(ExamSessions::Table)
        .and_where(Expr::col(ExamSessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO exam_sessions (id, owner_id, include_screen, status,
/// created_at_ms, updated_at_ms, started_at_ms) VALUES (?, ?, ?, ?, ?, ?, ?)
pub fn insert(
    id: &str,
    owner_id: &str,
    include_screen: bool,
    status: &str,
    now_ms: i64,
    started_at_ms: i64,
) -> String {
    Query::insert()
        .into_table(ExamSessions::Table)
        .columns([
            ExamSessions::Id,
            ExamSessions::OwnerId,
            ExamSessions::IncludeScreen,
            ExamSessions::Status,
            ExamSessions::CreatedAtMs,
            ExamSessions::UpdatedAtMs,
            ExamSessions::StartedAtMs,
        ])
        .values_panic([
            id.into(),
            owner_id.into(),
            (include_screen as i32).into(),
            status.into(),
            now_ms.into(),
            now_ms.into(),
            started_at_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// UPDATE exam_sessions SET status = ?, include_screen = ?, updated_at_ms = ?,
/// started_at_ms = COALESCE(started_at_ms, ?) WHERE id = ?
///
/// Used by the idempotent start upsert: the first observed start time wins.
pub fn refresh_existing(
    id: &str,
    include_screen: bool,
    status: &str,
    now_ms: i64,
    started_at_fallback_ms: i64,
) -> String {
    Query::update()
        .table(ExamSessions::Table)
        .value(ExamSessions::Status, status)
        .value(ExamSessions::IncludeScreen, include_screen as i32)
        .value(ExamSessions::UpdatedAtMs, now_ms)
        .value(
            ExamSessions::StartedAtMs,
            Func::coalesce([
                Expr::col(ExamSessions::StartedAtMs).into(),
                Expr::val(started_at_fallback_ms).into(),
            ]),
        )
        .and_where(Expr::col(ExamSessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE exam_sessions SET status = ?, updated_at_ms = ?,
/// ended_at_ms = COALESCE(ended_at_ms, ?),
/// total_duration_ms = COALESCE(total_duration_ms, ?),
/// manifest_url = COALESCE(manifest_url, ?),
/// failure_reason = COALESCE(failure_reason, ?) WHERE id = ?
///
/// Terminal transitions use set-if-not-already-set semantics so repeated
/// calls are safe: the first recorded value is preserved.
pub fn update_status(
    id: &str,
    status: &str,
    now_ms: i64,
    ended_at_ms: Option<i64>,
    total_duration_ms: Option<i64>,
    manifest_url: Option<&str>,
    failure_reason: Option<&str>,
) -> String {
    Query::update()
        .table(ExamSessions::Table)
        .value(ExamSessions::Status, status)
        .value(ExamSessions::UpdatedAtMs, now_ms)
        .value(
            ExamSessions::EndedAtMs,
            Func::coalesce([
                Expr::col(ExamSessions::EndedAtMs).into(),
                Expr::val(ended_at_ms).into(),
            ]),
        )
        .value(
            ExamSessions::TotalDurationMs,
            Func::coalesce([
                Expr::col(ExamSessions::TotalDurationMs).into(),
                Expr::val(total_duration_ms).into(),
            ]),
        )
        .value(
            ExamSessions::ManifestUrl,
            Func::coalesce([
                Expr::col(ExamSessions::ManifestUrl).into(),
                Expr::val(manifest_url.map(|s| s.to_string())).into(),
            ]),
        )
        .value(
            ExamSessions::FailureReason,
            Func::coalesce([
                Expr::col(ExamSessions::FailureReason).into(),
                Expr::val(failure_reason.map(|s| s.to_string())).into(),
            ]),
        )
        .and_where(Expr::col(ExamSessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}
