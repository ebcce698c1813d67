//! Client-side durable upload queue.
//!
//! Chunks drain strictly sequentially (one transfer in flight) in FIFO
//! order; chunks recovered from the offline store after regaining
//! connectivity are reinserted at the head so stalled data is retried
//! before newer data. `enqueue` guarantees eventual upload-or-durable-
//! staging; `wait_for_idle` resolves once nothing is queued or in flight.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::chunks::SignChunkRequest;
use crate::manifest::StreamKind;
use crate::offline_store::{OfflineChunkStore, StagedChunk};
use crate::session_api::{ApiCallError, SessionApi};

/// Observed connectivity, injected so retry-vs-stage decisions are
/// deterministic under test
pub trait NetworkStatus: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Default provider for environments without a connectivity signal
pub struct AlwaysOnline;

impl NetworkStatus for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// A chunk awaiting upload
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub id: String,
    pub stream_kind: StreamKind,
    pub chunk_index: i64,
    pub duration_ms: i64,
    pub payload: Vec<u8>,
    /// Set when the chunk was recovered from the offline store
    pub staged: bool,
}

/// Confirmation record for one uploaded chunk
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResult {
    pub chunk_id: String,
    pub stream_kind: StreamKind,
    pub chunk_index: i64,
    pub byte_size: i64,
    pub checksum: String,
    pub storage_key: String,
    pub uploaded_at_ms: i64,
}

#[derive(Debug, Clone)]
pub enum UploadError {
    /// Retry budget exhausted while online
    RetriesExhausted {
        stream_kind: StreamKind,
        chunk_index: i64,
        attempts: u32,
        message: String,
    },
    /// Server rejected the chunk; retrying cannot succeed
    Rejected {
        stream_kind: StreamKind,
        chunk_index: i64,
        status: u16,
        message: String,
    },
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::RetriesExhausted {
                stream_kind,
                chunk_index,
                attempts,
                message,
            } => write!(
                f,
                "Upload of {} chunk {} failed after {} attempts: {}",
                stream_kind, chunk_index, attempts, message
            ),
            UploadError::Rejected {
                stream_kind,
                chunk_index,
                status,
                message,
            } => write!(
                f,
                "Upload of {} chunk {} rejected ({}): {}",
                stream_kind, chunk_index, status, message
            ),
        }
    }
}

impl std::error::Error for UploadError {}

/// Content checksum recorded for a chunk: CRC32 of the raw bytes, hex
pub fn compute_checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

enum QueueEvent {
    Chunk(PendingChunk),
    /// Connectivity regained: replay staged chunks ahead of queued ones
    Online,
    Shutdown,
}

enum AttemptOutcome {
    Uploaded(ChunkUploadResult),
    /// Failure attributable to being offline; stage and pause
    Offline,
    Halt(UploadError),
}

pub struct UploadQueueOptions {
    pub api: Arc<SessionApi>,
    pub offline: Arc<OfflineChunkStore>,
    pub network: Arc<dyn NetworkStatus>,
    pub max_retries: u32,
    pub content_type: String,
    /// Base delay for exponential backoff (tests shrink this)
    pub backoff_base_ms: u64,
}

struct Shared {
    pending: Mutex<usize>,
    idle_cond: Condvar,
    halted: Mutex<Option<UploadError>>,
    uploaded: Mutex<Vec<ChunkUploadResult>>,
}

pub struct UploadQueue {
    tx: Sender<QueueEvent>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    /// Create the queue and spawn its worker thread
    pub fn start(options: UploadQueueOptions) -> Arc<Self> {
        let (tx, rx) = bounded(256);
        let shared = Arc::new(Shared {
            pending: Mutex::new(0),
            idle_cond: Condvar::new(),
            halted: Mutex::new(None),
            uploaded: Mutex::new(Vec::new()),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            run_worker(rx, worker_shared, options);
        });

        Arc::new(Self {
            tx,
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Accept a chunk for eventual upload or durable staging
    pub fn enqueue(&self, chunk: PendingChunk) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            *pending += 1;
        }
        if self.tx.send(QueueEvent::Chunk(chunk)).is_err() {
            warn!("Upload queue worker is gone; chunk dropped");
            let mut pending = self.shared.pending.lock().unwrap();
            *pending = pending.saturating_sub(1);
            self.shared.idle_cond.notify_all();
        }
    }

    /// Signal that connectivity was regained; staged chunks are replayed
    /// at the head of the queue
    pub fn notify_online(&self) {
        let _ = self.tx.send(QueueEvent::Online);
    }

    /// Block until every accepted chunk is uploaded or durably staged.
    /// Returns the halt error when draining stopped on a fatal failure.
    pub fn wait_for_idle(&self) -> Result<(), UploadError> {
        let mut pending = self.shared.pending.lock().unwrap();
        loop {
            if let Some(err) = self.shared.halted.lock().unwrap().clone() {
                return Err(err);
            }
            if *pending == 0 {
                return Ok(());
            }
            pending = self.shared.idle_cond.wait(pending).unwrap();
        }
    }

    /// Confirmed uploads collected so far, in completion order
    pub fn uploaded(&self) -> Vec<ChunkUploadResult> {
        self.shared.uploaded.lock().unwrap().clone()
    }

    /// Chunks accepted but not yet uploaded or staged
    pub fn pending_count(&self) -> usize {
        *self.shared.pending.lock().unwrap()
    }

    /// Stop the worker once the queue drains; joins the worker thread
    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueEvent::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(rx: Receiver<QueueEvent>, shared: Arc<Shared>, options: UploadQueueOptions) {
    let mut queue: VecDeque<PendingChunk> = VecDeque::new();
    let mut paused_offline = false;
    let mut shutdown = false;

    loop {
        // Drain control events without blocking
        while let Ok(event) = rx.try_recv() {
            handle_event(
                event,
                &mut queue,
                &mut paused_offline,
                &mut shutdown,
                &shared,
                &options,
            );
        }

        let halted = shared.halted.lock().unwrap().is_some();
        if queue.is_empty() || paused_offline || halted {
            if shutdown && (queue.is_empty() || halted) {
                break;
            }
            match rx.recv() {
                Ok(event) => {
                    handle_event(
                        event,
                        &mut queue,
                        &mut paused_offline,
                        &mut shutdown,
                        &shared,
                        &options,
                    );
                    continue;
                }
                Err(_) => break,
            }
        }

        let chunk = match queue.pop_front() {
            Some(chunk) => chunk,
            None => continue,
        };

        match upload_with_retries(&chunk, &options) {
            AttemptOutcome::Uploaded(result) => {
                debug!(
                    "Uploaded {} chunk {} ({} bytes)",
                    result.stream_kind, result.chunk_index, result.byte_size
                );
                if chunk.staged {
                    if let Err(e) = options.offline.delete(&chunk.id) {
                        warn!("Failed to purge staged chunk {}: {}", chunk.id, e);
                    }
                }
                shared.uploaded.lock().unwrap().push(result);
                settle_one(&shared);
            }
            AttemptOutcome::Offline => {
                // Stage the failed chunk plus everything still queued so the
                // queue reaches idle with all data durably held
                stage_chunk(&chunk, &options, &shared);
                while let Some(queued) = queue.pop_front() {
                    stage_chunk(&queued, &options, &shared);
                }
                paused_offline = true;
            }
            AttemptOutcome::Halt(err) => {
                error!("Upload queue halted: {}", err);
                *shared.halted.lock().unwrap() = Some(err);
                // Take the pending lock so a waiter between its halt check
                // and wait() cannot miss this wakeup
                let _pending = shared.pending.lock().unwrap();
                shared.idle_cond.notify_all();
            }
        }
    }
}

fn handle_event(
    event: QueueEvent,
    queue: &mut VecDeque<PendingChunk>,
    paused_offline: &mut bool,
    shutdown: &mut bool,
    shared: &Arc<Shared>,
    options: &UploadQueueOptions,
) {
    match event {
        QueueEvent::Chunk(chunk) => {
            if *paused_offline {
                // Nothing can upload while offline; stage immediately
                stage_chunk(&chunk, options, shared);
            } else {
                queue.push_back(chunk);
            }
        }
        QueueEvent::Online => {
            let staged = match options.offline.read_all() {
                Ok(staged) => staged,
                Err(e) => {
                    warn!("Failed to read offline store: {}", e);
                    Vec::new()
                }
            };
            // Head insertion in reverse keeps staged order ahead of newer data
            for chunk in staged.into_iter().rev() {
                {
                    let mut pending = shared.pending.lock().unwrap();
                    *pending += 1;
                }
                queue.push_front(pending_from_staged(chunk));
            }
            *paused_offline = false;
        }
        QueueEvent::Shutdown => {
            *shutdown = true;
        }
    }
}

fn pending_from_staged(chunk: StagedChunk) -> PendingChunk {
    PendingChunk {
        id: chunk.id,
        stream_kind: chunk.stream_kind,
        chunk_index: chunk.chunk_index,
        duration_ms: chunk.duration_ms,
        payload: chunk.payload,
        staged: true,
    }
}

fn stage_chunk(chunk: &PendingChunk, options: &UploadQueueOptions, shared: &Arc<Shared>) {
    if !chunk.staged {
        let staged = StagedChunk {
            id: chunk.id.clone(),
            stream_kind: chunk.stream_kind,
            chunk_index: chunk.chunk_index,
            duration_ms: chunk.duration_ms,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            payload: chunk.payload.clone(),
        };
        if let Err(e) = options.offline.save(&staged) {
            warn!("Failed to stage chunk {} offline: {}", chunk.id, e);
        }
    }
    settle_one(shared);
}

fn settle_one(shared: &Arc<Shared>) {
    let mut pending = shared.pending.lock().unwrap();
    *pending = pending.saturating_sub(1);
    shared.idle_cond.notify_all();
}

/// One full upload cycle for a chunk with exponential backoff.
///
/// Each attempt requests a signed target, transfers the bytes, and confirms
/// completion. Re-signing a still-pending index returns the same chunk id
/// with a fresh target, so a retry after a failed transfer is safe.
fn upload_with_retries(chunk: &PendingChunk, options: &UploadQueueOptions) -> AttemptOutcome {
    let checksum = compute_checksum(&chunk.payload);
    let byte_size = chunk.payload.len() as i64;

    let mut attempt = 0u32;
    loop {
        match upload_once(chunk, &checksum, byte_size, options) {
            Ok(result) => return AttemptOutcome::Uploaded(result),
            Err(e) => {
                if !options.network.is_online() {
                    return AttemptOutcome::Offline;
                }
                let retryable = e.is_retryable();
                if retryable && attempt < options.max_retries {
                    let backoff_ms = options.backoff_base_ms.saturating_mul(1 << attempt);
                    debug!(
                        "Retrying {} chunk {} in {}ms ({})",
                        chunk.stream_kind, chunk.chunk_index, backoff_ms, e
                    );
                    thread::sleep(Duration::from_millis(backoff_ms));
                    attempt += 1;
                    continue;
                }
                return AttemptOutcome::Halt(match e {
                    ApiCallError::Rejected { status, message } if !retryable => {
                        UploadError::Rejected {
                            stream_kind: chunk.stream_kind,
                            chunk_index: chunk.chunk_index,
                            status,
                            message,
                        }
                    }
                    other => UploadError::RetriesExhausted {
                        stream_kind: chunk.stream_kind,
                        chunk_index: chunk.chunk_index,
                        attempts: attempt + 1,
                        message: other.to_string(),
                    },
                });
            }
        }
    }
}

fn upload_once(
    chunk: &PendingChunk,
    checksum: &str,
    byte_size: i64,
    options: &UploadQueueOptions,
) -> Result<ChunkUploadResult, ApiCallError> {
    let signed = options.api.sign_chunk(&SignChunkRequest {
        stream_kind: chunk.stream_kind,
        chunk_index: chunk.chunk_index,
        byte_size,
        checksum: checksum.to_string(),
        content_type: Some(options.content_type.clone()),
    })?;

    options
        .api
        .upload_chunk(&signed.upload_url, &options.content_type, &chunk.payload)?;

    options
        .api
        .complete_chunk(&signed.chunk_id, checksum, byte_size)?;

    Ok(ChunkUploadResult {
        chunk_id: signed.chunk_id,
        stream_kind: chunk.stream_kind,
        chunk_index: chunk.chunk_index,
        byte_size,
        checksum: checksum.to_string(),
        storage_key: signed.storage_key,
        uploaded_at_ms: chrono::Utc::now().timestamp_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = compute_checksum(b"chunk bytes");
        let b = compute_checksum(b"chunk bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, compute_checksum(b"other bytes"));
    }
}
