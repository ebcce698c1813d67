//! Client-side recording session orchestrator.
//!
//! Owns the capture sources, one recorder thread per enabled stream, and
//! the upload queue. States: idle -> initialising -> active <-> paused ->
//! stopped, with failed reachable from any non-terminal state. Stop waits
//! for the queue to quiesce before finalizing; abort waits for quiescence
//! before asking the server to delete chunk objects, so no registration is
//! in flight when objects disappear.

use fs2::FileExt;
use log::{error, warn};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use uuid::Uuid;

use crate::capture::{CaptureDevices, ChunkSource, ScreenCaptureSource};
use crate::constants::{DEFAULT_CHUNK_DURATION_MS, DEFAULT_CONTENT_TYPE, DEFAULT_MAX_RETRIES};
use crate::finalize::{FinalizeChunkRef, FinalizeOutcome, FinalizePayload, FinalizeStream};
use crate::manifest::StreamKind;
use crate::offline_store::OfflineChunkStore;
use crate::session_api::SessionApi;
use crate::upload_queue::{
    NetworkStatus, PendingChunk, UploadQueue, UploadQueueOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStatus {
    Idle,
    Initialising,
    Active,
    Paused,
    Stopped,
    Failed,
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingStatus::Idle => "idle",
            RecordingStatus::Initialising => "initialising",
            RecordingStatus::Active => "active",
            RecordingStatus::Paused => "paused",
            RecordingStatus::Stopped => "stopped",
            RecordingStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Gate recorder threads block on while the session is paused.
/// Pausing affects capture only; the upload queue keeps draining.
struct PauseGate {
    paused: Mutex<bool>,
    cond: Condvar,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait_while_paused(&self) {
        let mut paused = self.paused.lock().unwrap();
        while *paused {
            paused = self.cond.wait(paused).unwrap();
        }
    }

    fn set_paused(&self, value: bool) {
        let mut paused = self.paused.lock().unwrap();
        *paused = value;
        self.cond.notify_all();
    }
}

pub struct RecordingOptions {
    pub api: Arc<SessionApi>,
    pub devices: Box<dyn CaptureDevices>,
    pub include_screen: bool,
    pub offline: Arc<OfflineChunkStore>,
    pub network: Arc<dyn NetworkStatus>,
    /// Directory for the per-session lock file; None disables locking
    pub lock_dir: Option<PathBuf>,
    pub content_type: Option<String>,
    /// Base backoff delay handed to the upload queue (tests shrink this)
    pub backoff_base_ms: u64,
}

pub struct RecordingSession {
    api: Arc<SessionApi>,
    devices: Box<dyn CaptureDevices>,
    include_screen: bool,
    offline: Arc<OfflineChunkStore>,
    network: Arc<dyn NetworkStatus>,
    lock_dir: Option<PathBuf>,
    content_type: String,
    backoff_base_ms: u64,

    status: Mutex<RecordingStatus>,
    queue: Mutex<Option<Arc<UploadQueue>>>,
    recorders: Mutex<Vec<JoinHandle<()>>>,
    stop_flag: Arc<AtomicBool>,
    gate: Arc<PauseGate>,
    stream_durations: Mutex<HashMap<StreamKind, Arc<AtomicU64>>>,
    screen_ended: Arc<AtomicBool>,
    lock_file: Mutex<Option<File>>,
}

impl RecordingSession {
    pub fn new(options: RecordingOptions) -> Self {
        Self {
            api: options.api,
            devices: options.devices,
            include_screen: options.include_screen,
            offline: options.offline,
            network: options.network,
            lock_dir: options.lock_dir,
            content_type: options
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            backoff_base_ms: options.backoff_base_ms,
            status: Mutex::new(RecordingStatus::Idle),
            queue: Mutex::new(None),
            recorders: Mutex::new(Vec::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(PauseGate::new()),
            stream_durations: Mutex::new(HashMap::new()),
            screen_ended: Arc::new(AtomicBool::new(false)),
            lock_file: Mutex::new(None),
        }
    }

    pub fn status(&self) -> RecordingStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: RecordingStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Whether the screen share ended before the session was stopped
    pub fn screen_share_ended(&self) -> bool {
        self.screen_ended.load(Ordering::SeqCst)
    }

    /// The upload queue, for connectivity signals from the embedding surface
    pub fn upload_queue(&self) -> Option<Arc<UploadQueue>> {
        self.queue.lock().unwrap().clone()
    }

    /// Acquire devices, register the session with the server, and start one
    /// segmenting recorder per enabled stream
    pub fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let status = self.status();
            if status != RecordingStatus::Idle && status != RecordingStatus::Stopped {
                return Err(format!("Cannot start recorder from status {}", status).into());
            }
        }
        self.set_status(RecordingStatus::Initialising);

        if let Some(lock_dir) = &self.lock_dir {
            if let Err(e) = self.acquire_lock(lock_dir) {
                self.set_status(RecordingStatus::Failed);
                return Err(e);
            }
        }

        let started = match self.api.start_session(self.include_screen) {
            Ok(response) => response,
            Err(e) => {
                self.set_status(RecordingStatus::Failed);
                return Err(format!("Failed to start exam session: {}", e).into());
            }
        };
        let chunk_duration_ms = if started.recording.chunk_duration_ms > 0 {
            started.recording.chunk_duration_ms
        } else {
            DEFAULT_CHUNK_DURATION_MS
        };
        let max_retries = if started.recording.max_retries > 0 {
            started.recording.max_retries
        } else {
            DEFAULT_MAX_RETRIES
        };

        // Device acquisition may be denied; fail before going active
        let primary = match self.devices.open_primary(chunk_duration_ms) {
            Ok(source) => source,
            Err(e) => {
                self.set_status(RecordingStatus::Failed);
                return Err(format!("Failed to open primary capture source: {}", e).into());
            }
        };
        let screen = if self.include_screen {
            match self.devices.open_screen(chunk_duration_ms) {
                Ok(source) => {
                    let ended = Arc::clone(&self.screen_ended);
                    Some(Box::new(ScreenCaptureSource::new(
                        source,
                        Box::new(move || {
                            warn!("Screen share ended");
                            ended.store(true, Ordering::SeqCst);
                        }),
                    )) as Box<dyn ChunkSource>)
                }
                Err(e) => {
                    self.set_status(RecordingStatus::Failed);
                    return Err(format!("Failed to open screen capture source: {}", e).into());
                }
            }
        } else {
            None
        };

        let queue = UploadQueue::start(UploadQueueOptions {
            api: Arc::clone(&self.api),
            offline: Arc::clone(&self.offline),
            network: Arc::clone(&self.network),
            max_retries,
            content_type: self.content_type.clone(),
            backoff_base_ms: self.backoff_base_ms,
        });
        *self.queue.lock().unwrap() = Some(Arc::clone(&queue));

        self.stop_flag.store(false, Ordering::SeqCst);
        self.gate.set_paused(false);

        let mut recorders = self.recorders.lock().unwrap();
        recorders.push(self.spawn_recorder(StreamKind::Webcam, primary, Arc::clone(&queue)));
        if let Some(screen_source) = screen {
            recorders.push(self.spawn_recorder(StreamKind::Screen, screen_source, queue));
        }
        drop(recorders);

        self.set_status(RecordingStatus::Active);
        Ok(())
    }

    fn acquire_lock(
        &self,
        lock_dir: &PathBuf,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        std::fs::create_dir_all(lock_dir)
            .map_err(|e| format!("Failed to create lock directory: {}", e))?;
        let lock_path = lock_dir.join(format!("{}.lock", self.api.session_id()));
        let lock_file = File::create(&lock_path)
            .map_err(|e| format!("Failed to create lock file '{}': {}", lock_path.display(), e))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            format!(
                "Another instance is already recording session '{}'. Lock file: {}",
                self.api.session_id(),
                lock_path.display()
            )
        })?;
        *self.lock_file.lock().unwrap() = Some(lock_file);
        Ok(())
    }

    fn spawn_recorder(
        &self,
        stream_kind: StreamKind,
        mut source: Box<dyn ChunkSource>,
        queue: Arc<UploadQueue>,
    ) -> JoinHandle<()> {
        let duration_counter = Arc::new(AtomicU64::new(0));
        self.stream_durations
            .lock()
            .unwrap()
            .insert(stream_kind, Arc::clone(&duration_counter));

        let stop_flag = Arc::clone(&self.stop_flag);
        let gate = Arc::clone(&self.gate);

        thread::spawn(move || {
            let mut chunk_index: i64 = 0;
            loop {
                gate.wait_while_paused();
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                match source.next_chunk() {
                    Ok(Some(chunk)) => {
                        if chunk.bytes.is_empty() {
                            continue;
                        }
                        duration_counter.fetch_add(chunk.duration_ms, Ordering::SeqCst);
                        queue.enqueue(PendingChunk {
                            id: Uuid::new_v4().to_string(),
                            stream_kind,
                            chunk_index,
                            duration_ms: chunk.duration_ms as i64,
                            payload: chunk.bytes,
                            staged: false,
                        });
                        chunk_index += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("{} capture error: {}", stream_kind, e);
                        break;
                    }
                }
            }
        })
    }

    /// Pause capture; the upload queue continues draining
    pub fn pause(&self) {
        if self.status() != RecordingStatus::Active {
            return;
        }
        self.gate.set_paused(true);
        self.set_status(RecordingStatus::Paused);
    }

    pub fn resume(&self) {
        if self.status() != RecordingStatus::Paused {
            return;
        }
        self.gate.set_paused(false);
        self.set_status(RecordingStatus::Active);
    }

    /// Block until every recorder thread has exhausted its source
    pub fn wait_for_capture(&self) {
        self.join_recorders();
    }

    fn join_recorders(&self) {
        let handles: Vec<JoinHandle<()>> = self.recorders.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Recorder thread panicked");
            }
        }
    }

    fn stop_capture(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        // Wake any thread parked on the pause gate so it can observe the flag
        self.gate.set_paused(false);
        self.join_recorders();
    }

    /// Stop recording, wait for the queue to reach idle, and finalize the
    /// session with the confirmed chunk references
    pub fn stop(&self) -> Result<FinalizeOutcome, Box<dyn std::error::Error + Send + Sync>> {
        {
            let status = self.status();
            if status != RecordingStatus::Active && status != RecordingStatus::Paused {
                return Err(format!("Cannot stop recorder from status {}", status).into());
            }
        }

        self.stop_capture();

        let queue = match self.upload_queue() {
            Some(queue) => queue,
            None => return Err("Upload queue was never started".into()),
        };
        if let Err(e) = queue.wait_for_idle() {
            self.set_status(RecordingStatus::Failed);
            return Err(format!("Upload queue failed: {}", e).into());
        }

        let payload = self.build_finalize_payload(&queue);
        queue.shutdown();

        let outcome = match self.api.finalize(&payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.set_status(RecordingStatus::Failed);
                return Err(format!("Failed to finalize recording: {}", e).into());
            }
        };

        if let Err(e) = self.offline.clear() {
            warn!("Failed to clear offline store: {}", e);
        }
        self.release_lock();
        self.set_status(RecordingStatus::Stopped);
        Ok(outcome)
    }

    fn build_finalize_payload(&self, queue: &UploadQueue) -> FinalizePayload {
        let mut by_stream: HashMap<StreamKind, Vec<FinalizeChunkRef>> = HashMap::new();
        for result in queue.uploaded() {
            by_stream
                .entry(result.stream_kind)
                .or_default()
                .push(FinalizeChunkRef {
                    chunk_id: result.chunk_id,
                    chunk_index: result.chunk_index,
                });
        }

        let durations = self.stream_durations.lock().unwrap();
        let mut streams = Vec::with_capacity(by_stream.len());
        for (stream_kind, mut chunks) in by_stream {
            chunks.sort_by_key(|c| c.chunk_index);
            let duration_ms = durations
                .get(&stream_kind)
                .map(|d| d.load(Ordering::SeqCst) as i64)
                .unwrap_or(0);
            streams.push(FinalizeStream {
                stream_kind,
                duration_ms,
                chunks,
            });
        }
        // Stable stream order: webcam before screen
        streams.sort_by_key(|s| s.stream_kind.as_str().to_string());
        streams.reverse();

        let total_duration_ms = streams.iter().map(|s| s.duration_ms).max().unwrap_or(0);
        FinalizePayload {
            total_duration_ms,
            streams,
        }
    }

    /// Stop everything, wait for queue quiescence, then ask the server to
    /// abort the session and delete every chunk object
    pub fn abort(
        &self,
        reason: Option<&str>,
    ) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
        self.stop_capture();

        if let Some(queue) = self.upload_queue() {
            // Quiescence only; a halted queue is already quiescent
            if let Err(e) = queue.wait_for_idle() {
                warn!("Upload queue halted before abort: {}", e);
            }
            queue.shutdown();
        }

        let abort_result = self.api.abort(reason);

        if let Err(e) = self.offline.clear() {
            warn!("Failed to clear offline store: {}", e);
        }
        self.release_lock();
        self.set_status(RecordingStatus::Failed);

        match abort_result {
            Ok(response) => Ok(response.deleted_keys),
            Err(e) => Err(format!("Failed to abort session: {}", e).into()),
        }
    }

    fn release_lock(&self) {
        *self.lock_file.lock().unwrap() = None;
    }
}
