use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use log::error;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc as StdArc;
use tower_http::cors::{Any, CorsLayer};

use crate::chunks::{self, SignChunkRequest};
use crate::config::{ServerConfig, StorageBackend, StorageConfig};
use crate::db;
use crate::error::ServiceError;
use crate::finalize::{self, FinalizePayload};
use crate::rate_limit::SlidingWindowLimiter;
use crate::sessions;
use crate::storage::{FsStore, MemoryStore, ObjectStore, StorageError};

// State for coordinator API handlers
pub struct AppState {
    pub pool: SqlitePool,
    pub store: StdArc<dyn ObjectStore>,
    pub limiter: SlidingWindowLimiter,
    pub bucket: String,
    pub chunk_duration_ms: u64,
    pub max_retries: u32,
}

fn error_response(err: ServiceError) -> Response {
    if matches!(err, ServiceError::Database(_) | ServiceError::Storage(_)) {
        error!("{}", err);
    }
    (
        err.status_code(),
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

fn storage_error_response(err: StorageError) -> Response {
    let status = match err {
        StorageError::TokenInvalid | StorageError::TokenExpired => StatusCode::FORBIDDEN,
        StorageError::SizeMismatch { .. } => StatusCode::BAD_REQUEST,
        StorageError::ObjectNotFound(_) => StatusCode::NOT_FOUND,
        StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

/// Every mutating operation requires a caller identity to check against the
/// session's recorded owner
fn owner_from_headers(headers: &HeaderMap) -> Result<String, ServiceError> {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| ServiceError::Validation("Missing x-owner-id header".to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionBody {
    #[serde(default)]
    include_screen: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteChunkBody {
    checksum: String,
    byte_size: i64,
}

#[derive(Debug, Default, Deserialize)]
struct AbortBody {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadTokenQuery {
    token: String,
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn start_session_handler(
    State(state): State<StdArc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StartSessionBody>,
) -> impl IntoResponse {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(e) => return error_response(e),
    };

    match sessions::start_session(&state.pool, &session_id, &owner_id, body.include_screen).await {
        Ok(session) => Json(serde_json::json!({
            "session": session,
            "recording": {
                "chunkDurationMs": state.chunk_duration_ms,
                "maxRetries": state.max_retries,
            },
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn sign_chunk_handler(
    State(state): State<StdArc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SignChunkRequest>,
) -> impl IntoResponse {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(e) => return error_response(e),
    };

    match chunks::request_upload_url(
        &state.pool,
        state.store.as_ref(),
        &state.limiter,
        &state.bucket,
        &session_id,
        &owner_id,
        &body,
    )
    .await
    {
        Ok(signed) => Json(signed).into_response(),
        Err(e) => error_response(e),
    }
}

async fn complete_chunk_handler(
    State(state): State<StdArc<AppState>>,
    Path((session_id, chunk_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<CompleteChunkBody>,
) -> impl IntoResponse {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(e) => return error_response(e),
    };

    match chunks::mark_uploaded(
        &state.pool,
        &session_id,
        &owner_id,
        &chunk_id,
        &body.checksum,
        body.byte_size,
    )
    .await
    {
        Ok(_) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn finalize_handler(
    State(state): State<StdArc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FinalizePayload>,
) -> impl IntoResponse {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(e) => return error_response(e),
    };

    match finalize::finalize_recording(
        &state.pool,
        state.store.as_ref(),
        &state.bucket,
        &session_id,
        &owner_id,
        &body,
    )
    .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

async fn abort_handler(
    State(state): State<StdArc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AbortBody>,
) -> impl IntoResponse {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(e) => return error_response(e),
    };

    let session = match sessions::require_session(&state.pool, &session_id).await {
        Ok(session) => session,
        Err(e) => return error_response(e),
    };
    if let Err(e) = sessions::ensure_owner(&session, &owner_id) {
        return error_response(e);
    }

    let deleted_keys = match chunks::delete_chunks(
        &state.pool,
        state.store.as_ref(),
        &state.bucket,
        &session_id,
    )
    .await
    {
        Ok(keys) => keys,
        Err(e) => return error_response(e),
    };

    match sessions::mark_aborted(&state.pool, &session_id, body.reason.as_deref()).await {
        Ok(_) => Json(serde_json::json!({"ok": true, "deletedKeys": deleted_keys})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn manifest_handler(
    State(state): State<StdArc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match finalize::get_manifest(&state.pool, &session_id).await {
        Ok(manifest) => Json(manifest).into_response(),
        Err(e) => error_response(e),
    }
}

async fn storage_put_handler(
    State(state): State<StdArc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<UploadTokenQuery>,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(e) =
        state
            .store
            .consume_upload_token(&query.token, &bucket, &key, body.len() as i64)
    {
        return storage_error_response(e);
    }
    match state.store.put_object(&bucket, &key, &body) {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(e) => storage_error_response(e),
    }
}

async fn storage_get_handler(
    State(state): State<StdArc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_object(&bucket, &key) {
        Ok(data) => {
            let content_type = if key.ends_with(".json") {
                "application/json"
            } else {
                "application/octet-stream"
            };
            (StatusCode::OK, [("content-type", content_type)], data).into_response()
        }
        Err(e) => storage_error_response(e),
    }
}

pub fn build_router(state: StdArc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions/{session_id}/start", post(start_session_handler))
        .route(
            "/api/sessions/{session_id}/chunks/sign",
            post(sign_chunk_handler),
        )
        .route(
            "/api/sessions/{session_id}/chunks/{chunk_id}/complete",
            post(complete_chunk_handler),
        )
        .route(
            "/api/sessions/{session_id}/finalize",
            post(finalize_handler),
        )
        .route("/api/sessions/{session_id}/abort", post(abort_handler))
        .route(
            "/api/sessions/{session_id}/manifest",
            get(manifest_handler),
        )
        .route(
            "/storage/{bucket}/{*key}",
            put(storage_put_handler).get(storage_get_handler),
        )
        .layer(cors)
        .with_state(state)
}

/// Run the coordinator server until interrupted
pub fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create data directory: {}", e))?;
    }

    println!("Starting exam media coordinator");
    println!("Database: {}", db_path.display());
    println!("Listening on: http://[::]:{} (IPv4 + IPv6)", config.port);
    println!("Endpoints:");
    println!("  GET  /health  - Health check");
    println!("  POST /api/sessions/:id/start  - Begin or refresh a session");
    println!("  POST /api/sessions/:id/chunks/sign  - Request a chunk upload target");
    println!("  POST /api/sessions/:id/chunks/:chunkId/complete  - Confirm a chunk upload");
    println!("  POST /api/sessions/:id/finalize  - Freeze the recording manifest");
    println!("  POST /api/sessions/:id/abort  - Abort and delete chunk objects");
    println!("  GET  /api/sessions/:id/manifest  - Fetch the persisted manifest");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind(format!("[::]:{}", config.port))
            .await
            .map_err(|e| format!("Failed to bind to port {}: {}", config.port, e))?;
        let base_url = config
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", config.port));

        let pool = db::open_database_pool(&db_path).await?;
        db::init_database_schema(&pool).await?;

        let storage_config = config.storage.clone().unwrap_or(StorageConfig {
            backend: StorageBackend::Filesystem,
            root: None,
        });
        let store: StdArc<dyn ObjectStore> = match storage_config.backend {
            StorageBackend::Memory => StdArc::new(MemoryStore::new(base_url)),
            StorageBackend::Filesystem => {
                let root = storage_config
                    .root
                    .unwrap_or_else(|| std::path::PathBuf::from("tmp/objects"));
                std::fs::create_dir_all(&root)
                    .map_err(|e| format!("Failed to create storage root: {}", e))?;
                StdArc::new(FsStore::new(base_url, root))
            }
        };

        let state = StdArc::new(AppState {
            pool,
            store,
            limiter: SlidingWindowLimiter::new(
                config.rate_limit_max_requests(),
                config.rate_limit_window_ms(),
            ),
            bucket: config.bucket(),
            chunk_duration_ms: config.chunk_duration_ms(),
            max_retries: config.max_retries(),
        });

        let app = build_router(state);
        axum::serve(listener, app)
            .await
            .map_err(|e| format!("Server error: {}", e))?;

        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    })
    .map_err(|e| -> Box<dyn std::error::Error> { e.to_string().into() })?;

    Ok(())
}
