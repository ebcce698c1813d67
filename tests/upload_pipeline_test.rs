use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use proctor_media::capture::FileDevices;
use proctor_media::chunks::{self, ChunkStatus};
use proctor_media::db;
use proctor_media::manifest::StreamKind;
use proctor_media::offline_store::OfflineChunkStore;
use proctor_media::playback::{BufferSink, ManifestPlayer};
use proctor_media::rate_limit::SlidingWindowLimiter;
use proctor_media::recorder::{RecordingOptions, RecordingSession, RecordingStatus};
use proctor_media::serve::{build_router, AppState};
use proctor_media::session_api::SessionApi;
use proctor_media::sessions::{self, SessionStatus};
use proctor_media::storage::{MemoryStore, ObjectStore};
use proctor_media::upload_queue::{
    AlwaysOnline, NetworkStatus, PendingChunk, UploadError, UploadQueue, UploadQueueOptions,
};

const BUCKET: &str = "exam-media";

/// Connectivity provider reporting a permanently offline network
struct OfflineNetwork;

impl NetworkStatus for OfflineNetwork {
    fn is_online(&self) -> bool {
        false
    }
}

struct TestCoordinator {
    url: String,
    pool: SqlitePool,
    store: Arc<MemoryStore>,
}

/// Helper to start a real coordinator on an ephemeral port. Presigned
/// upload targets point back at this server's /storage routes.
async fn start_coordinator() -> TestCoordinator {
    let pool = db::create_test_connection_in_memory().await;
    db::init_database_schema(&pool).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{}", addr);

    let store = Arc::new(MemoryStore::new(url.clone()));
    let dyn_store: Arc<dyn ObjectStore> = Arc::clone(&store) as Arc<dyn ObjectStore>;
    let state = Arc::new(AppState {
        pool: pool.clone(),
        store: dyn_store,
        limiter: SlidingWindowLimiter::new(60, 60_000),
        bucket: BUCKET.to_string(),
        chunk_duration_ms: 1_000,
        max_retries: 3,
    });

    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestCoordinator { url, pool, store }
}

/// Base URL nothing listens on, for simulating an unreachable coordinator
async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn write_source_file(dir: &std::path::Path, name: &str, len: usize) -> PathBuf {
    let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn recording_options(
    api: Arc<SessionApi>,
    devices: FileDevices,
    include_screen: bool,
    offline: Arc<OfflineChunkStore>,
) -> RecordingOptions {
    RecordingOptions {
        api,
        devices: Box::new(devices),
        include_screen,
        offline,
        network: Arc::new(AlwaysOnline),
        lock_dir: None,
        content_type: None,
        backoff_base_ms: 1,
    }
}

fn test_chunk(id: &str, chunk_index: i64, payload: &[u8]) -> PendingChunk {
    PendingChunk {
        id: id.to_string(),
        stream_kind: StreamKind::Webcam,
        chunk_index,
        duration_ms: 1_000,
        payload: payload.to_vec(),
        staged: false,
    }
}

#[tokio::test]
async fn test_record_finalize_and_playback_end_to_end() {
    let coord = start_coordinator().await;
    let temp_dir = tempfile::tempdir().unwrap();

    // 2500 bytes at 1000 bytes/sec with 1s chunks = 1000 + 1000 + 500
    let source = write_source_file(temp_dir.path(), "webcam.bin", 2_500);
    let expected = std::fs::read(&source).unwrap();

    let server_url = coord.url.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let api = Arc::new(SessionApi::new(&server_url, "sess-e2e", "student-1").unwrap());
        let devices = FileDevices {
            primary: source,
            screen: None,
            byte_rate: 1_000,
        };
        let session = RecordingSession::new(recording_options(
            api,
            devices,
            false,
            Arc::new(OfflineChunkStore::in_memory()),
        ));

        session.start().unwrap();
        assert_eq!(session.status(), RecordingStatus::Active);

        // Pausing gates capture only; the queue keeps draining
        session.pause();
        assert_eq!(session.status(), RecordingStatus::Paused);
        session.resume();
        assert_eq!(session.status(), RecordingStatus::Active);

        session.wait_for_capture();
        let outcome = session.stop().unwrap();
        assert_eq!(session.status(), RecordingStatus::Stopped);
        outcome
    })
    .await
    .unwrap();

    assert_eq!(outcome.manifest.streams.len(), 1);
    let stream = &outcome.manifest.streams[0];
    assert_eq!(stream.stream_kind, StreamKind::Webcam);
    assert_eq!(stream.duration_ms, 2_500);
    let sizes: Vec<i64> = stream.chunks.iter().map(|c| c.byte_size).collect();
    assert_eq!(sizes, vec![1_000, 1_000, 500]);
    let indices: Vec<i64> = stream.chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    let session = sessions::get_session(&coord.pool, "sess-e2e")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_duration_ms, Some(2_500));

    // Reconstruct playback from the frozen manifest, both strategies
    let manifest_url = format!("{}{}", coord.url, outcome.manifest_url);
    let streamed = expected.clone();
    tokio::task::spawn_blocking(move || {
        let player = ManifestPlayer::new(&manifest_url, None).unwrap();

        let mut sink = BufferSink::new_streaming();
        let summary = player.load(&mut sink).unwrap();
        assert_eq!(summary.chunk_count, 3);
        assert_eq!(summary.total_bytes, streamed.len());
        assert_eq!(sink.data(), streamed.as_slice());
        assert!(sink.is_finished());

        let mut sink = BufferSink::new_buffered();
        player.load(&mut sink).unwrap();
        assert_eq!(sink.data(), streamed.as_slice());
    })
    .await
    .unwrap();

    // The manifest is also served by the coordinator API
    let api_manifest = reqwest::get(format!("{}/api/sessions/sess-e2e/manifest", coord.url))
        .await
        .unwrap();
    assert_eq!(api_manifest.status(), 200);
}

#[tokio::test]
async fn test_screen_stream_recorded_alongside_webcam() {
    let coord = start_coordinator().await;
    let temp_dir = tempfile::tempdir().unwrap();

    let webcam = write_source_file(temp_dir.path(), "webcam.bin", 2_000);
    let screen = write_source_file(temp_dir.path(), "screen.bin", 1_200);

    let server_url = coord.url.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let api = Arc::new(SessionApi::new(&server_url, "sess-screen", "student-1").unwrap());
        let devices = FileDevices {
            primary: webcam,
            screen: Some(screen),
            byte_rate: 1_000,
        };
        let session = RecordingSession::new(recording_options(
            api,
            devices,
            true,
            Arc::new(OfflineChunkStore::in_memory()),
        ));

        session.start().unwrap();
        session.wait_for_capture();
        assert!(session.screen_share_ended());
        session.stop().unwrap()
    })
    .await
    .unwrap();

    assert_eq!(outcome.manifest.streams.len(), 2);
    let webcam_stream = outcome
        .manifest
        .streams
        .iter()
        .find(|s| s.stream_kind == StreamKind::Webcam)
        .unwrap();
    let screen_stream = outcome
        .manifest
        .streams
        .iter()
        .find(|s| s.stream_kind == StreamKind::Screen)
        .unwrap();
    assert_eq!(webcam_stream.chunks.len(), 2);
    assert_eq!(screen_stream.chunks.len(), 2);
    assert_eq!(screen_stream.duration_ms, 1_200);

    // Indices are per stream, both starting at 0
    assert_eq!(screen_stream.chunks[0].chunk_index, 0);
    assert_eq!(outcome.manifest.total_duration_ms, 2_000);
}

#[tokio::test]
async fn test_offline_chunks_replay_after_connectivity_returns() {
    let coord = start_coordinator().await;
    let offline = Arc::new(OfflineChunkStore::in_memory());
    let dead_url = unreachable_url().await;

    // Phase 1: coordinator unreachable, network reports offline. Every
    // enqueued chunk must end up durably staged, and the queue must still
    // reach idle.
    let staging_store = Arc::clone(&offline);
    tokio::task::spawn_blocking(move || {
        let api = Arc::new(SessionApi::new(&dead_url, "sess-offline", "student-1").unwrap());
        let queue = UploadQueue::start(UploadQueueOptions {
            api,
            offline: Arc::clone(&staging_store),
            network: Arc::new(OfflineNetwork),
            max_retries: 3,
            content_type: "video/webm".to_string(),
            backoff_base_ms: 1,
        });

        for index in 0..3 {
            queue.enqueue(test_chunk(
                &format!("offline-{}", index),
                index,
                format!("payload {}", index).as_bytes(),
            ));
        }
        queue.wait_for_idle().unwrap();
        queue.shutdown();

        assert_eq!(staging_store.count().unwrap(), 3);
    })
    .await
    .unwrap();

    // Phase 2: connectivity returns. A fresh queue (as after a restart)
    // replays the staged chunks; each is uploaded exactly once and purged.
    let server_url = coord.url.clone();
    let replay_store = Arc::clone(&offline);
    tokio::task::spawn_blocking(move || {
        let api = Arc::new(SessionApi::new(&server_url, "sess-offline", "student-1").unwrap());
        api.start_session(false).unwrap();

        let queue = UploadQueue::start(UploadQueueOptions {
            api,
            offline: Arc::clone(&replay_store),
            network: Arc::new(AlwaysOnline),
            max_retries: 3,
            content_type: "video/webm".to_string(),
            backoff_base_ms: 1,
        });
        queue.notify_online();

        // The online signal is processed asynchronously by the worker
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while queue.uploaded().len() < 3 {
            assert!(
                std::time::Instant::now() < deadline,
                "Staged chunks were not replayed in time"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
        queue.wait_for_idle().unwrap();
        queue.shutdown();

        assert_eq!(queue.uploaded().len(), 3);
        assert_eq!(replay_store.count().unwrap(), 0);
    })
    .await
    .unwrap();

    let rows = chunks::list_chunks(&coord.pool, "sess-offline", None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|c| c.status == ChunkStatus::Uploaded));
}

#[tokio::test]
async fn test_queue_halts_when_retries_exhausted_online() {
    let dead_url = unreachable_url().await;

    tokio::task::spawn_blocking(move || {
        let api = Arc::new(SessionApi::new(&dead_url, "sess-halt", "student-1").unwrap());
        let queue = UploadQueue::start(UploadQueueOptions {
            api,
            offline: Arc::new(OfflineChunkStore::disabled()),
            network: Arc::new(AlwaysOnline),
            max_retries: 1,
            content_type: "video/webm".to_string(),
            backoff_base_ms: 1,
        });

        queue.enqueue(test_chunk("halt-0", 0, b"payload"));
        let result = queue.wait_for_idle();
        match result {
            Err(UploadError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("Expected retries-exhausted halt, got {:?}", other),
        }
        queue.shutdown();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_queue_halts_on_server_rejection() {
    let coord = start_coordinator().await;

    let server_url = coord.url.clone();
    tokio::task::spawn_blocking(move || {
        let api = Arc::new(SessionApi::new(&server_url, "sess-reject", "student-1").unwrap());
        api.start_session(false).unwrap();

        let queue = UploadQueue::start(UploadQueueOptions {
            api,
            offline: Arc::new(OfflineChunkStore::in_memory()),
            network: Arc::new(AlwaysOnline),
            max_retries: 3,
            content_type: "video/webm".to_string(),
            backoff_base_ms: 1,
        });

        // Same index twice: the second signing request hits the uploaded-
        // index conflict, which is not retryable
        queue.enqueue(test_chunk("dup-a", 0, b"first"));
        queue.enqueue(test_chunk("dup-b", 0, b"second"));

        let result = queue.wait_for_idle();
        match result {
            Err(UploadError::Rejected { status, .. }) => assert_eq!(status, 409),
            other => panic!("Expected rejection halt, got {:?}", other),
        }
        queue.shutdown();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_abort_deletes_every_uploaded_object() {
    let coord = start_coordinator().await;
    let temp_dir = tempfile::tempdir().unwrap();
    let source = write_source_file(temp_dir.path(), "webcam.bin", 3_000);

    let server_url = coord.url.clone();
    let deleted_keys = tokio::task::spawn_blocking(move || {
        let api = Arc::new(SessionApi::new(&server_url, "sess-abort", "student-1").unwrap());
        let devices = FileDevices {
            primary: source,
            screen: None,
            byte_rate: 1_000,
        };
        let session = RecordingSession::new(recording_options(
            api,
            devices,
            false,
            Arc::new(OfflineChunkStore::in_memory()),
        ));

        session.start().unwrap();
        session.wait_for_capture();
        let deleted = session.abort(Some("proctor terminated the exam")).unwrap();
        assert_eq!(session.status(), RecordingStatus::Failed);
        deleted
    })
    .await
    .unwrap();

    assert_eq!(deleted_keys.len(), 3);
    assert_eq!(coord.store.object_count(), 0);

    assert!(chunks::list_chunks(&coord.pool, "sess-abort", None)
        .await
        .unwrap()
        .is_empty());
    let session = sessions::get_session(&coord.pool, "sess-abort")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Aborted);
    assert_eq!(
        session.failure_reason.as_deref(),
        Some("proctor terminated the exam")
    );

    // A never-finalized session has no manifest
    let response = reqwest::get(format!("{}/api/sessions/sess-abort/manifest", coord.url))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_session_lock_prevents_concurrent_recorders() {
    let coord = start_coordinator().await;
    let temp_dir = tempfile::tempdir().unwrap();
    let source_a = write_source_file(temp_dir.path(), "a.bin", 2_000);
    let source_b = write_source_file(temp_dir.path(), "b.bin", 2_000);
    let lock_dir = temp_dir.path().join("locks");

    let server_url = coord.url.clone();
    tokio::task::spawn_blocking(move || {
        let api = Arc::new(SessionApi::new(&server_url, "sess-lock", "student-1").unwrap());
        let mut options = recording_options(
            Arc::clone(&api),
            FileDevices {
                primary: source_a,
                screen: None,
                byte_rate: 1_000,
            },
            false,
            Arc::new(OfflineChunkStore::in_memory()),
        );
        options.lock_dir = Some(lock_dir.clone());
        let first = RecordingSession::new(options);
        first.start().unwrap();

        let mut options = recording_options(
            api,
            FileDevices {
                primary: source_b,
                screen: None,
                byte_rate: 1_000,
            },
            false,
            Arc::new(OfflineChunkStore::in_memory()),
        );
        options.lock_dir = Some(lock_dir);
        let second = RecordingSession::new(options);

        let err = second.start().unwrap_err();
        assert!(err.to_string().contains("already recording"));
        assert_eq!(second.status(), RecordingStatus::Failed);

        first.wait_for_capture();
        first.stop().unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_http_surface_reports_distinct_errors() {
    let coord = start_coordinator().await;

    let server_url = coord.url.clone();
    tokio::task::spawn_blocking(move || {
        let owner = SessionApi::new(&server_url, "sess-http", "student-1").unwrap();
        owner.start_session(false).unwrap();

        // Owner mismatch is forbidden, distinct from not-found
        let intruder = SessionApi::new(&server_url, "sess-http", "intruder").unwrap();
        let err = intruder.abort(None).unwrap_err();
        assert!(err.to_string().contains("403"));

        let missing = SessionApi::new(&server_url, "no-such-session", "student-1").unwrap();
        let err = missing.abort(None).unwrap_err();
        assert!(err.to_string().contains("404"));

        // Finalizing a session with nothing uploaded is a validation error
        let err = owner
            .finalize(&proctor_media::finalize::FinalizePayload {
                total_duration_ms: 1_000,
                streams: Vec::new(),
            })
            .unwrap_err();
        assert!(err.to_string().contains("400"));
    })
    .await
    .unwrap();

    let health = reqwest::get(format!("{}/health", coord.url)).await.unwrap();
    assert_eq!(health.status(), 200);
}
