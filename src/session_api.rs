//! Blocking HTTP client for the coordinator API.
//!
//! Used by the recording client from plain threads; every mutating request
//! carries the owner identity header the server checks against the
//! session's recorded owner.

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::chunks::{SignChunkRequest, SignedChunk};
use crate::finalize::{FinalizeOutcome, FinalizePayload};
use crate::manifest::RecordingManifest;

#[derive(Debug)]
pub enum ApiCallError {
    /// Request never reached the server or the connection dropped
    Network(reqwest::Error),
    /// Server rejected the request with a distinguishable reason
    Rejected { status: u16, message: String },
}

impl fmt::Display for ApiCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiCallError::Network(e) => write!(f, "Network error: {}", e),
            ApiCallError::Rejected { status, message } => {
                write!(f, "Server rejected request ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for ApiCallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiCallError::Network(e) => Some(e),
            ApiCallError::Rejected { .. } => None,
        }
    }
}

impl ApiCallError {
    /// Whether retrying the same request can reasonably succeed.
    /// Client errors (4xx) are rejections the caller must act on instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiCallError::Network(_) => true,
            ApiCallError::Rejected { status, .. } => *status >= 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSettings {
    pub chunk_duration_ms: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionResponse {
    pub recording: RecordingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortResponse {
    pub ok: bool,
    pub deleted_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct SessionApi {
    client: Client,
    base_url: String,
    session_id: String,
    owner_id: String,
}

impl SessionApi {
    pub fn new(
        base_url: &str,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: session_id.to_string(),
            owner_id: owner_id.to_string(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, path: &str) -> String {
        format!("{}/api/sessions/{}{}", self.base_url, self.session_id, path)
    }

    fn decode<T: DeserializeOwned>(
        response: reqwest::blocking::Response,
    ) -> Result<T, ApiCallError> {
        let status = response.status();
        if status.is_success() {
            return response.json().map_err(ApiCallError::Network);
        }
        let message = response
            .json::<ErrorBody>()
            .map(|body| body.error)
            .unwrap_or_else(|_| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        Err(ApiCallError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    pub fn start_session(
        &self,
        include_screen: bool,
    ) -> Result<StartSessionResponse, ApiCallError> {
        let response = self
            .client
            .post(self.session_url("/start"))
            .header("x-owner-id", &self.owner_id)
            .json(&serde_json::json!({"includeScreen": include_screen}))
            .send()
            .map_err(ApiCallError::Network)?;
        Self::decode(response)
    }

    pub fn sign_chunk(&self, req: &SignChunkRequest) -> Result<SignedChunk, ApiCallError> {
        let response = self
            .client
            .post(self.session_url("/chunks/sign"))
            .header("x-owner-id", &self.owner_id)
            .json(req)
            .send()
            .map_err(ApiCallError::Network)?;
        Self::decode(response)
    }

    /// PUT the chunk bytes to a presigned upload target
    pub fn upload_chunk(
        &self,
        upload_url: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), ApiCallError> {
        let response = self
            .client
            .put(upload_url)
            .header("content-type", content_type)
            .body(data.to_vec())
            .send()
            .map_err(ApiCallError::Network)?;
        Self::decode::<serde_json::Value>(response).map(|_| ())
    }

    pub fn complete_chunk(
        &self,
        chunk_id: &str,
        checksum: &str,
        byte_size: i64,
    ) -> Result<(), ApiCallError> {
        let response = self
            .client
            .post(self.session_url(&format!("/chunks/{}/complete", chunk_id)))
            .header("x-owner-id", &self.owner_id)
            .json(&serde_json::json!({"checksum": checksum, "byteSize": byte_size}))
            .send()
            .map_err(ApiCallError::Network)?;
        Self::decode::<serde_json::Value>(response).map(|_| ())
    }

    pub fn finalize(&self, payload: &FinalizePayload) -> Result<FinalizeOutcome, ApiCallError> {
        let response = self
            .client
            .post(self.session_url("/finalize"))
            .header("x-owner-id", &self.owner_id)
            .json(payload)
            .send()
            .map_err(ApiCallError::Network)?;
        Self::decode(response)
    }

    pub fn abort(&self, reason: Option<&str>) -> Result<AbortResponse, ApiCallError> {
        let response = self
            .client
            .post(self.session_url("/abort"))
            .header("x-owner-id", &self.owner_id)
            .json(&serde_json::json!({"reason": reason}))
            .send()
            .map_err(ApiCallError::Network)?;
        Self::decode(response)
    }

    pub fn fetch_manifest(&self) -> Result<RecordingManifest, ApiCallError> {
        let response = self
            .client
            .get(self.session_url("/manifest"))
            .send()
            .map_err(ApiCallError::Network)?;
        Self::decode(response)
    }
}
