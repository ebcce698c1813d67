use axum::http::StatusCode;
use std::fmt;

/// Errors surfaced by the session, chunk and recording coordinators.
///
/// Every rejected mutation maps to a distinct variant so callers can decide
/// whether to retry, re-request a fresh upload target, or abort the session.
#[derive(Debug)]
pub enum ServiceError {
    /// Malformed request shape; no state change
    Validation(String),
    /// Unknown session or chunk
    NotFound(String),
    /// Caller identity does not match the session owner
    Forbidden(String),
    /// Duplicate chunk index, re-finalization, or wrong-status operation
    Conflict(String),
    /// Too many signing requests within the sliding window
    RateLimited(String),
    /// Storage backend failure
    Storage(String),
    /// Underlying database failure
    Database(sqlx::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Validation(msg) => write!(f, "{}", msg),
            ServiceError::NotFound(msg) => write!(f, "{}", msg),
            ServiceError::Forbidden(msg) => write!(f, "{}", msg),
            ServiceError::Conflict(msg) => write!(f, "{}", msg),
            ServiceError::RateLimited(msg) => write!(f, "{}", msg),
            ServiceError::Storage(msg) => write!(f, "Storage error: {}", msg),
            ServiceError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        ServiceError::Database(e)
    }
}

impl ServiceError {
    /// HTTP status code this error is reported with
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
