//! Durable local staging area for chunks that could not be uploaded
//! immediately. Keyed by chunk identifier; survives process restarts.
//!
//! The store tolerates environments without durable local storage: when the
//! backing database cannot be opened, every operation degrades to a no-op
//! (saves succeed silently, reads return nothing) so capture continues
//! best-effort instead of crashing.

use chrono::Utc;
use log::warn;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::manifest::StreamKind;

#[derive(Debug, Clone)]
pub struct StagedChunk {
    pub id: String,
    pub stream_kind: StreamKind,
    pub chunk_index: i64,
    pub duration_ms: i64,
    pub created_at_ms: i64,
    pub payload: Vec<u8>,
}

pub struct OfflineChunkStore {
    conn: Option<Mutex<Connection>>,
}

impl OfflineChunkStore {
    /// Open the staging database, degrading to a disabled store on failure
    pub fn open(path: impl AsRef<Path>) -> Self {
        match Self::try_open(path.as_ref()) {
            Ok(conn) => Self {
                conn: Some(Mutex::new(conn)),
            },
            Err(e) => {
                warn!(
                    "Offline chunk store unavailable ({}); staging disabled",
                    e
                );
                Self { conn: None }
            }
        }
    }

    /// A store with no durable backing; every operation is a no-op
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    /// In-memory store for tests
    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
        Self::init_schema(&conn).expect("Failed to create staged_chunks table");
        Self {
            conn: Some(Mutex::new(conn)),
        }
    }

    fn try_open(path: &Path) -> Result<Connection, Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS staged_chunks (
                id TEXT PRIMARY KEY,
                stream_kind TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                payload BLOB NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    pub fn save(&self, chunk: &StagedChunk) -> Result<(), rusqlite::Error> {
        let conn = match &self.conn {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let conn = conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO staged_chunks
             (id, stream_kind, chunk_index, duration_ms, created_at_ms, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                chunk.id,
                chunk.stream_kind.as_str(),
                chunk.chunk_index,
                chunk.duration_ms,
                chunk.created_at_ms,
                chunk.payload,
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), rusqlite::Error> {
        let conn = match &self.conn {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let conn = conn.lock().unwrap();
        conn.execute("DELETE FROM staged_chunks WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// All staged chunks, oldest first (stable replay order)
    pub fn read_all(&self) -> Result<Vec<StagedChunk>, rusqlite::Error> {
        let conn = match &self.conn {
            Some(conn) => conn,
            None => return Ok(Vec::new()),
        };
        let conn = conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, stream_kind, chunk_index, duration_ms, created_at_ms, payload
             FROM staged_chunks ORDER BY created_at_ms, stream_kind, chunk_index",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Vec<u8>>(5)?,
            ))
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            let (id, stream_text, chunk_index, duration_ms, created_at_ms, payload) = row?;
            let stream_kind = match stream_text.parse::<StreamKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    warn!("Skipping staged chunk {}: {}", id, e);
                    continue;
                }
            };
            chunks.push(StagedChunk {
                id,
                stream_kind,
                chunk_index,
                duration_ms,
                created_at_ms,
                payload,
            });
        }
        Ok(chunks)
    }

    pub fn clear(&self) -> Result<(), rusqlite::Error> {
        let conn = match &self.conn {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let conn = conn.lock().unwrap();
        conn.execute("DELETE FROM staged_chunks", [])?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize, rusqlite::Error> {
        let conn = match &self.conn {
            Some(conn) => conn,
            None => return Ok(0),
        };
        let conn = conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM staged_chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Build a staged record from in-flight chunk data
pub fn staged_chunk(
    id: &str,
    stream_kind: StreamKind,
    chunk_index: i64,
    duration_ms: i64,
    payload: Vec<u8>,
) -> StagedChunk {
    StagedChunk {
        id: id.to_string(),
        stream_kind,
        chunk_index,
        duration_ms,
        created_at_ms: Utc::now().timestamp_millis(),
        payload,
    }
}
