use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::queries::ddl;

/// Open a file-based database pool for production use
/// Enables WAL mode and foreign keys, creating the file if missing
pub async fn open_database_pool(
    db_path: impl AsRef<Path>,
) -> Result<SqlitePool, Box<dyn std::error::Error + Send + Sync>> {
    let options = SqliteConnectOptions::new()
        .filename(db_path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn init_database_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for sql in [
        ddl::create_exam_sessions_table(),
        ddl::create_media_chunks_table(),
        ddl::create_media_chunks_unique_index(),
        ddl::create_recordings_table(),
        ddl::create_recording_chunks_table(),
        ddl::create_recording_chunks_position_index(),
    ] {
        sqlx::query(&sql).execute(pool).await?;
    }
    Ok(())
}

/// Create an in-memory database pool for testing
/// Pinned to a single connection so the database outlives individual queries
pub async fn create_test_connection_in_memory() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("Valid in-memory connection string")
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("Failed to create in-memory database")
}

/// Create a file-based database pool in a temporary directory for testing
/// Returns the pool together with the directory guard keeping it alive
pub async fn create_test_connection_in_temporary_file(
) -> Result<(SqlitePool, tempfile::TempDir), Box<dyn std::error::Error + Send + Sync>> {
    let dir = tempfile::tempdir()?;
    let pool = open_database_pool(dir.path().join("test.sqlite")).await?;
    Ok((pool, dir))
}
