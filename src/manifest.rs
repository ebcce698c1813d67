//! Recording manifest wire format.
//!
//! A manifest is an ordered, immutable description of a recording's chunks
//! per stream. It is assembled once at finalize time from confirmed chunk
//! rows and never mutated afterwards; playback reconstructs the recording
//! from it without consulting any other state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which logical capture source a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Primary capture device stream (camera + microphone)
    Webcam,
    /// Secondary screen-share stream
    Screen,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Webcam => "webcam",
            StreamKind::Screen => "screen",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webcam" => Ok(StreamKind::Webcam),
            "screen" => Ok(StreamKind::Screen),
            other => Err(format!("Unknown stream kind '{}'", other)),
        }
    }
}

/// One chunk reference within a manifest stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestChunkEntry {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub storage_key: String,
    pub checksum: String,
    pub byte_size: i64,
}

/// Ordered chunk list for a single stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStream {
    pub stream_kind: StreamKind,
    pub duration_ms: i64,
    pub chunks: Vec<ManifestChunkEntry>,
}

/// Persisted manifest for a finalized session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingManifest {
    pub session_id: String,
    pub created_at_ms: i64,
    pub total_duration_ms: i64,
    pub streams: Vec<ManifestStream>,
}

impl RecordingManifest {
    /// Select a stream for playback: the preferred kind when present,
    /// otherwise the first stream in the manifest
    pub fn select_stream(&self, preferred: Option<StreamKind>) -> Option<&ManifestStream> {
        if let Some(kind) = preferred {
            if let Some(stream) = self.streams.iter().find(|s| s.stream_kind == kind) {
                return Some(stream);
            }
        }
        self.streams.first()
    }
}
