use sqlx::SqlitePool;

use proctor_media::chunks::{self, SignChunkRequest};
use proctor_media::db;
use proctor_media::error::ServiceError;
use proctor_media::finalize::{self, FinalizeChunkRef, FinalizePayload, FinalizeStream};
use proctor_media::manifest::StreamKind;
use proctor_media::rate_limit::SlidingWindowLimiter;
use proctor_media::sessions::{self, SessionStatus};
use proctor_media::storage::{MemoryStore, ObjectStore};
use proctor_media::upload_queue::compute_checksum;

const BUCKET: &str = "exam-media";
const OWNER: &str = "student-1";

struct TestCoordinator {
    pool: SqlitePool,
    store: MemoryStore,
    limiter: SlidingWindowLimiter,
}

/// Helper to create a coordinator backed by an in-memory database and store
async fn create_coordinator() -> TestCoordinator {
    let pool = db::create_test_connection_in_memory().await;
    db::init_database_schema(&pool).await.unwrap();
    TestCoordinator {
        pool,
        store: MemoryStore::new("http://127.0.0.1:3000"),
        limiter: SlidingWindowLimiter::new(60, 60_000),
    }
}

/// Helper to run the full sign -> transfer -> confirm cycle for one chunk.
/// Returns the chunk id referenced in finalize requests.
async fn upload_chunk(
    coord: &TestCoordinator,
    session_id: &str,
    stream_kind: StreamKind,
    chunk_index: i64,
    payload: &[u8],
) -> FinalizeChunkRef {
    let checksum = compute_checksum(payload);
    let signed = chunks::request_upload_url(
        &coord.pool,
        &coord.store,
        &coord.limiter,
        BUCKET,
        session_id,
        OWNER,
        &SignChunkRequest {
            stream_kind,
            chunk_index,
            byte_size: payload.len() as i64,
            checksum: checksum.clone(),
            content_type: None,
        },
    )
    .await
    .unwrap();

    coord
        .store
        .put_object(BUCKET, &signed.storage_key, payload)
        .unwrap();

    chunks::mark_uploaded(
        &coord.pool,
        session_id,
        OWNER,
        &signed.chunk_id,
        &checksum,
        payload.len() as i64,
    )
    .await
    .unwrap();

    FinalizeChunkRef {
        chunk_id: signed.chunk_id,
        chunk_index,
    }
}

fn single_stream_payload(
    stream_kind: StreamKind,
    duration_ms: i64,
    chunks: Vec<FinalizeChunkRef>,
) -> FinalizePayload {
    FinalizePayload {
        total_duration_ms: duration_ms,
        streams: vec![FinalizeStream {
            stream_kind,
            duration_ms,
            chunks,
        }],
    }
}

#[tokio::test]
async fn test_finalize_orders_chunks_by_index() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();

    let mut refs = Vec::new();
    for index in 0..4 {
        refs.push(upload_chunk(&coord, "sess-1", StreamKind::Webcam, index, b"chunk").await);
    }

    // Reference chunks out of order; the manifest must not care
    refs.swap(0, 3);
    refs.swap(1, 2);

    let outcome = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(StreamKind::Webcam, 40_000, refs),
    )
    .await
    .unwrap();

    let stream = &outcome.manifest.streams[0];
    let indices: Vec<i64> = stream.chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    assert_eq!(outcome.recordings.len(), 1);
    assert_eq!(outcome.recordings[0].stream_kind, StreamKind::Webcam);

    // The rebuilt manifest comes from the recording_chunks positions and
    // must carry the same strictly increasing order
    let rebuilt = finalize::get_manifest(&coord.pool, "sess-1").await.unwrap();
    let rebuilt_indices: Vec<i64> = rebuilt.streams[0].chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(rebuilt_indices, vec![0, 1, 2, 3]);

    let session = sessions::get_session(&coord.pool, "sess-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_duration_ms, Some(40_000));
    assert_eq!(session.manifest_url.as_deref(), Some(outcome.manifest_url.as_str()));
}

#[tokio::test]
async fn test_finalize_persists_manifest_for_lookup() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();
    let chunk_ref = upload_chunk(&coord, "sess-1", StreamKind::Webcam, 0, b"first").await;

    let outcome = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(StreamKind::Webcam, 10_000, vec![chunk_ref]),
    )
    .await
    .unwrap();

    let manifest = finalize::get_manifest(&coord.pool, "sess-1").await.unwrap();
    assert_eq!(manifest.session_id, "sess-1");
    assert_eq!(manifest.total_duration_ms, 10_000);
    assert_eq!(manifest.streams.len(), 1);
    assert_eq!(
        manifest.streams[0].chunks[0].chunk_id,
        outcome.manifest.streams[0].chunks[0].chunk_id
    );

    // A frozen copy also lands in object storage next to the chunks
    let stored = coord
        .store
        .get_object(BUCKET, &finalize::manifest_storage_key("sess-1"))
        .unwrap();
    assert!(!stored.is_empty());
}

#[tokio::test]
async fn test_manifest_rebuilds_both_streams_from_rows() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, true)
        .await
        .unwrap();

    let webcam_refs = vec![
        upload_chunk(&coord, "sess-1", StreamKind::Webcam, 0, b"w0").await,
        upload_chunk(&coord, "sess-1", StreamKind::Webcam, 1, b"w1").await,
    ];
    let screen_refs =
        vec![upload_chunk(&coord, "sess-1", StreamKind::Screen, 0, b"s0").await];

    finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &FinalizePayload {
            total_duration_ms: 20_000,
            streams: vec![
                FinalizeStream {
                    stream_kind: StreamKind::Webcam,
                    duration_ms: 20_000,
                    chunks: webcam_refs,
                },
                FinalizeStream {
                    stream_kind: StreamKind::Screen,
                    duration_ms: 10_000,
                    chunks: screen_refs,
                },
            ],
        },
    )
    .await
    .unwrap();

    let manifest = finalize::get_manifest(&coord.pool, "sess-1").await.unwrap();
    assert_eq!(manifest.total_duration_ms, 20_000);
    assert_eq!(manifest.streams.len(), 2);

    // The primary stream sorts ahead of the screen stream
    assert_eq!(manifest.streams[0].stream_kind, StreamKind::Webcam);
    assert_eq!(manifest.streams[0].chunks.len(), 2);
    assert_eq!(manifest.streams[1].stream_kind, StreamKind::Screen);
    assert_eq!(manifest.streams[1].chunks.len(), 1);
    assert_eq!(manifest.streams[1].duration_ms, 10_000);
    assert_eq!(
        manifest.streams[1].chunks[0].storage_key,
        "sessions/sess-1/screen/chunk-0.webm"
    );
}

#[tokio::test]
async fn test_finalize_manifest_uses_confirmed_checksum() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();

    // Sign with one checksum, confirm with another; the confirmed value is
    // what finalize must freeze into the manifest
    let signed = chunks::request_upload_url(
        &coord.pool,
        &coord.store,
        &coord.limiter,
        BUCKET,
        "sess-1",
        OWNER,
        &SignChunkRequest {
            stream_kind: StreamKind::Webcam,
            chunk_index: 0,
            byte_size: 1024,
            checksum: "11111111".to_string(),
            content_type: None,
        },
    )
    .await
    .unwrap();
    coord
        .store
        .put_object(BUCKET, &signed.storage_key, b"actual bytes")
        .unwrap();
    chunks::mark_uploaded(&coord.pool, "sess-1", OWNER, &signed.chunk_id, "22222222", 12)
        .await
        .unwrap();

    let outcome = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(
            StreamKind::Webcam,
            10_000,
            vec![FinalizeChunkRef {
                chunk_id: signed.chunk_id,
                chunk_index: 0,
            }],
        ),
    )
    .await
    .unwrap();

    let entry = &outcome.manifest.streams[0].chunks[0];
    assert_eq!(entry.checksum, "22222222");
    assert_eq!(entry.byte_size, 12);

    // The rebuilt manifest reads the same confirmed values from the rows
    let rebuilt = finalize::get_manifest(&coord.pool, "sess-1").await.unwrap();
    assert_eq!(rebuilt.streams[0].chunks[0].checksum, "22222222");
    assert_eq!(rebuilt.streams[0].chunks[0].byte_size, 12);
}

#[tokio::test]
async fn test_finalize_rejects_unuploaded_chunk() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();

    let confirmed = upload_chunk(&coord, "sess-1", StreamKind::Webcam, 0, b"zero").await;

    // Chunk 1 was signed but its upload never confirmed
    let pending = chunks::request_upload_url(
        &coord.pool,
        &coord.store,
        &coord.limiter,
        BUCKET,
        "sess-1",
        OWNER,
        &SignChunkRequest {
            stream_kind: StreamKind::Webcam,
            chunk_index: 1,
            byte_size: 4,
            checksum: "deadbeef".to_string(),
            content_type: None,
        },
    )
    .await
    .unwrap();

    let result = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(
            StreamKind::Webcam,
            20_000,
            vec![
                confirmed.clone(),
                FinalizeChunkRef {
                    chunk_id: pending.chunk_id,
                    chunk_index: 1,
                },
            ],
        ),
    )
    .await;
    assert!(matches!(result, Err(ServiceError::Conflict(_))));

    // Referencing only confirmed chunks succeeds
    finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(StreamKind::Webcam, 10_000, vec![confirmed]),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_finalize_rejects_unknown_chunk() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();

    let result = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(
            StreamKind::Webcam,
            10_000,
            vec![FinalizeChunkRef {
                chunk_id: "no-such-chunk".to_string(),
                chunk_index: 0,
            }],
        ),
    )
    .await;

    assert!(matches!(result, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn test_finalize_rejects_index_mismatch() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();
    let mut chunk_ref = upload_chunk(&coord, "sess-1", StreamKind::Webcam, 0, b"zero").await;

    // A client claiming a different position than the stored index is
    // attempting to reorder the stream
    chunk_ref.chunk_index = 5;
    let result = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(StreamKind::Webcam, 10_000, vec![chunk_ref]),
    )
    .await;

    assert!(matches!(result, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn test_finalize_rejects_foreign_chunk() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();
    sessions::start_session(&coord.pool, "sess-2", OWNER, false)
        .await
        .unwrap();
    let foreign = upload_chunk(&coord, "sess-2", StreamKind::Webcam, 0, b"foreign").await;

    let result = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(StreamKind::Webcam, 10_000, vec![foreign]),
    )
    .await;

    assert!(matches!(result, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn test_finalize_owner_mismatch_rejects_before_mutation() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();
    let chunk_ref = upload_chunk(&coord, "sess-1", StreamKind::Webcam, 0, b"zero").await;

    let result = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        "intruder",
        &single_stream_payload(StreamKind::Webcam, 10_000, vec![chunk_ref]),
    )
    .await;
    assert!(matches!(result, Err(ServiceError::Forbidden(_))));

    let session = sessions::get_session(&coord.pool, "sess-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert!(finalize::list_recordings(&coord.pool, "sess-1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_second_finalize_is_a_conflict() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();
    let chunk_ref = upload_chunk(&coord, "sess-1", StreamKind::Webcam, 0, b"zero").await;

    finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(StreamKind::Webcam, 10_000, vec![chunk_ref.clone()]),
    )
    .await
    .unwrap();

    let result = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &single_stream_payload(StreamKind::Webcam, 10_000, vec![chunk_ref]),
    )
    .await;
    assert!(matches!(result, Err(ServiceError::Conflict(_))));

    // Exactly one recording survived
    assert_eq!(
        finalize::list_recordings(&coord.pool, "sess-1")
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_finalize_validates_payload_shape() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();

    let no_streams = FinalizePayload {
        total_duration_ms: 10_000,
        streams: Vec::new(),
    };
    let result =
        finalize::finalize_recording(&coord.pool, &coord.store, BUCKET, "sess-1", OWNER, &no_streams)
            .await;
    assert!(matches!(result, Err(ServiceError::Validation(_))));

    let empty_chunks = single_stream_payload(StreamKind::Webcam, 10_000, Vec::new());
    let result = finalize::finalize_recording(
        &coord.pool,
        &coord.store,
        BUCKET,
        "sess-1",
        OWNER,
        &empty_chunks,
    )
    .await;
    assert!(matches!(result, Err(ServiceError::Validation(_))));
}

#[tokio::test]
async fn test_get_manifest_before_finalize_is_not_found() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();

    let result = finalize::get_manifest(&coord.pool, "sess-1").await;
    assert!(matches!(result, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn test_abort_deletes_objects_and_rows() {
    let coord = create_coordinator().await;
    sessions::start_session(&coord.pool, "sess-1", OWNER, false)
        .await
        .unwrap();

    for index in 0..3 {
        upload_chunk(&coord, "sess-1", StreamKind::Webcam, index, b"chunk").await;
    }

    let deleted = chunks::delete_chunks(&coord.pool, &coord.store, BUCKET, "sess-1")
        .await
        .unwrap();
    sessions::mark_aborted(&coord.pool, "sess-1", Some("left the exam"))
        .await
        .unwrap();

    assert_eq!(deleted.len(), 3);
    assert_eq!(coord.store.object_count(), 0);
    assert_eq!(coord.store.deleted_keys().len(), 3);
    assert!(chunks::list_chunks(&coord.pool, "sess-1", None)
        .await
        .unwrap()
        .is_empty());

    let session = sessions::get_session(&coord.pool, "sess-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Aborted);
    assert_eq!(session.failure_reason.as_deref(), Some("left the exam"));
}
