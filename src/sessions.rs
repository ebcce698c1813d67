//! Server-side session coordinator: the authoritative per-session state
//! machine and ownership guard. Sessions move PENDING -> ACTIVE ->
//! {COMPLETED | FAILED | ABORTED}; every mutating operation re-checks the
//! recorded owner against the caller identity.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::str::FromStr;

use crate::error::ServiceError;
use crate::queries::sessions as q;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Aborted
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SessionStatus::Pending),
            "ACTIVE" => Ok(SessionStatus::Active),
            "COMPLETED" => Ok(SessionStatus::Completed),
            "FAILED" => Ok(SessionStatus::Failed),
            "ABORTED" => Ok(SessionStatus::Aborted),
            other => Err(format!("Unknown session status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSession {
    pub id: String,
    pub owner_id: String,
    pub include_screen: bool,
    pub status: SessionStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub ended_at_ms: Option<i64>,
    pub total_duration_ms: Option<i64>,
    pub manifest_url: Option<String>,
    pub failure_reason: Option<String>,
}

fn map_row(row: &SqliteRow) -> Result<ExamSession, ServiceError> {
    let status_text: String = row.try_get("status")?;
    let status = status_text
        .parse::<SessionStatus>()
        .map_err(ServiceError::Storage)?;
    Ok(ExamSession {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        include_screen: row.try_get::<i64, _>("include_screen")? != 0,
        status,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
        started_at_ms: row.try_get("started_at_ms")?,
        ended_at_ms: row.try_get("ended_at_ms")?,
        total_duration_ms: row.try_get("total_duration_ms")?,
        manifest_url: row.try_get("manifest_url")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

pub async fn get_session(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Option<ExamSession>, ServiceError> {
    let sql = q::select_by_id(session_id);
    let row = sqlx::query(&sql).fetch_optional(pool).await?;
    row.as_ref().map(map_row).transpose()
}

/// Fetch a session or report not-found (distinct from forbidden)
pub async fn require_session(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<ExamSession, ServiceError> {
    get_session(pool, session_id).await?.ok_or_else(|| {
        ServiceError::NotFound(format!("Session {} not found", session_id))
    })
}

/// Reject the caller before any state mutation when it is not the owner
pub fn ensure_owner(session: &ExamSession, owner_id: &str) -> Result<(), ServiceError> {
    if session.owner_id != owner_id {
        return Err(ServiceError::Forbidden(format!(
            "Forbidden: owner mismatch for session {}",
            session.id
        )));
    }
    Ok(())
}

/// Idempotent start upsert.
///
/// An existing session only has its `updated_at_ms`, `include_screen` and
/// status refreshed; `started_at_ms` is preserved (first value wins). A new
/// session is created ACTIVE with `started_at_ms` = now. Ownership of an
/// existing session is still enforced.
pub async fn start_session(
    pool: &SqlitePool,
    session_id: &str,
    owner_id: &str,
    include_screen: bool,
) -> Result<ExamSession, ServiceError> {
    let now_ms = Utc::now().timestamp_millis();

    if let Some(existing) = get_session(pool, session_id).await? {
        ensure_owner(&existing, owner_id)?;
        let sql = q::refresh_existing(
            session_id,
            include_screen,
            SessionStatus::Active.as_str(),
            now_ms,
            now_ms,
        );
        sqlx::query(&sql).execute(pool).await?;
        return require_session(pool, session_id).await;
    }

    let sql = q::insert(
        session_id,
        owner_id,
        include_screen,
        SessionStatus::Active.as_str(),
        now_ms,
        now_ms,
    );
    sqlx::query(&sql).execute(pool).await?;
    require_session(pool, session_id).await
}

async fn update_status(
    pool: &SqlitePool,
    session_id: &str,
    status: SessionStatus,
    total_duration_ms: Option<i64>,
    manifest_url: Option<&str>,
    failure_reason: Option<&str>,
) -> Result<ExamSession, ServiceError> {
    let now_ms = Utc::now().timestamp_millis();
    let sql = q::update_status(
        session_id,
        status.as_str(),
        now_ms,
        Some(now_ms),
        total_duration_ms,
        manifest_url,
        failure_reason,
    );
    sqlx::query(&sql).execute(pool).await?;
    require_session(pool, session_id).await
}

pub async fn mark_completed(
    pool: &SqlitePool,
    session_id: &str,
    total_duration_ms: i64,
    manifest_url: &str,
) -> Result<ExamSession, ServiceError> {
    update_status(
        pool,
        session_id,
        SessionStatus::Completed,
        Some(total_duration_ms),
        Some(manifest_url),
        None,
    )
    .await
}

pub async fn mark_failed(
    pool: &SqlitePool,
    session_id: &str,
    reason: Option<&str>,
) -> Result<ExamSession, ServiceError> {
    update_status(
        pool,
        session_id,
        SessionStatus::Failed,
        None,
        None,
        Some(reason.unwrap_or("")),
    )
    .await
}

pub async fn mark_aborted(
    pool: &SqlitePool,
    session_id: &str,
    reason: Option<&str>,
) -> Result<ExamSession, ServiceError> {
    update_status(
        pool,
        session_id,
        SessionStatus::Aborted,
        None,
        None,
        Some(reason.unwrap_or("")),
    )
    .await
}
