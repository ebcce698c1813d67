//! Playback reconstruction from a recording manifest.
//!
//! Fetches the manifest, selects one stream, then rebuilds a playable byte
//! stream either incrementally (fetch each chunk in index order, append,
//! wait, repeat) or by eager concatenation when the sink cannot accept
//! incremental appends.

use log::debug;
use reqwest::blocking::Client;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::manifest::{RecordingManifest, StreamKind};

/// Destination for reconstructed media bytes
pub trait MediaSink {
    /// Whether the sink accepts incremental appends (preferred strategy)
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Append one buffer; returns once the append has completed
    fn append(&mut self, data: &[u8]) -> Result<(), Box<dyn std::error::Error>>;

    /// Signal end-of-stream after the last append
    fn finish(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        Ok(())
    }
}

/// In-memory sink collecting the reconstructed stream
pub struct BufferSink {
    data: Vec<u8>,
    streaming: bool,
    finished: bool,
}

impl BufferSink {
    pub fn new_streaming() -> Self {
        Self {
            data: Vec::new(),
            streaming: true,
            finished: false,
        }
    }

    pub fn new_buffered() -> Self {
        Self {
            data: Vec::new(),
            streaming: false,
            finished: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl MediaSink for BufferSink {
    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn append(&mut self, data: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.finished = true;
        Ok(())
    }
}

/// Summary of a completed reconstruction
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSummary {
    pub stream_kind: StreamKind,
    pub chunk_count: usize,
    pub total_bytes: usize,
    pub duration_ms: i64,
}

/// Resolve a chunk location: storage keys that are already absolute URLs
/// pass through; anything else resolves relative to the manifest's own URL
pub fn resolve_chunk_url(
    manifest_url: &str,
    storage_key: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    if storage_key.starts_with("http://") || storage_key.starts_with("https://") {
        return Ok(storage_key.to_string());
    }
    let base = Url::parse(manifest_url)?;
    Ok(base.join(storage_key)?.to_string())
}

pub struct ManifestPlayer {
    client: Client,
    manifest_url: String,
    preferred_stream: Option<StreamKind>,
}

impl ManifestPlayer {
    pub fn new(
        manifest_url: &str,
        preferred_stream: Option<StreamKind>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            manifest_url: manifest_url.to_string(),
            preferred_stream,
        })
    }

    /// Fetch the manifest and reconstruct one stream into the sink
    pub fn load(
        &self,
        sink: &mut dyn MediaSink,
    ) -> Result<PlaybackSummary, Box<dyn std::error::Error>> {
        let response = self.client.get(&self.manifest_url).send()?;
        if !response.status().is_success() {
            return Err(format!("Unable to load manifest: {}", response.status()).into());
        }
        let manifest: RecordingManifest = response.json()?;

        let stream = manifest
            .select_stream(self.preferred_stream)
            .ok_or("Manifest does not contain any streams")?;

        let mut total_bytes = 0usize;
        if sink.supports_streaming() {
            // Incremental append: fetch in index order, wait for each append
            for chunk in &stream.chunks {
                let bytes = self.fetch_chunk(&chunk.storage_key)?;
                debug!(
                    "Appending chunk {} ({} bytes)",
                    chunk.chunk_index,
                    bytes.len()
                );
                total_bytes += bytes.len();
                sink.append(&bytes)?;
            }
        } else {
            // Fallback: fetch everything eagerly, hand over one buffer
            let mut merged = Vec::new();
            for chunk in &stream.chunks {
                let bytes = self.fetch_chunk(&chunk.storage_key)?;
                merged.extend_from_slice(&bytes);
            }
            total_bytes = merged.len();
            sink.append(&merged)?;
        }
        sink.finish()?;

        Ok(PlaybackSummary {
            stream_kind: stream.stream_kind,
            chunk_count: stream.chunks.len(),
            total_bytes,
            duration_ms: stream.duration_ms,
        })
    }

    fn fetch_chunk(&self, storage_key: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        let url = resolve_chunk_url(&self.manifest_url, storage_key)?;
        let response = self.client.get(&url).send()?;
        if !response.status().is_success() {
            return Err(format!("Failed to fetch chunk {}: {}", storage_key, response.status()).into());
        }
        Ok(response.bytes()?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_key_against_manifest_location() {
        let url = resolve_chunk_url(
            "http://127.0.0.1:3000/storage/exam-media/sess-1.manifest.json",
            "sessions/sess-1/webcam/chunk-0.webm",
        )
        .unwrap();
        assert_eq!(
            url,
            "http://127.0.0.1:3000/storage/exam-media/sessions/sess-1/webcam/chunk-0.webm"
        );
    }

    #[test]
    fn test_resolve_absolute_key_passes_through() {
        let url = resolve_chunk_url(
            "http://127.0.0.1:3000/storage/exam-media/sess-1.manifest.json",
            "https://cdn.example.com/chunk-0.webm",
        )
        .unwrap();
        assert_eq!(url, "https://cdn.example.com/chunk-0.webm");
    }

    #[test]
    fn test_buffer_sink_collects_appends() {
        let mut sink = BufferSink::new_streaming();
        sink.append(b"ab").unwrap();
        sink.append(b"cd").unwrap();
        sink.finish().unwrap();
        assert_eq!(sink.data(), b"abcd");
        assert!(sink.is_finished());
    }
}
