//! Capture-device abstractions for the recording client.
//!
//! A `ChunkSource` stands in for a segmenting media recorder: it emits one
//! complete chunk of bytes per fixed interval until the underlying source
//! ends. Device acquisition happens through `CaptureDevices` so permission
//! failures surface before a session goes active, and the screen source is
//! wrapped in an explicit decorator that observes stream end instead of
//! patching any global acquisition hook.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

/// One time-bounded segment of captured bytes
#[derive(Debug, Clone)]
pub struct CapturedChunk {
    pub bytes: Vec<u8>,
    pub duration_ms: u64,
}

/// A segmenting recorder for one stream
pub trait ChunkSource: Send {
    /// Next complete chunk, or None once the stream has ended
    fn next_chunk(&mut self) -> io::Result<Option<CapturedChunk>>;
}

/// Cuts a byte stream into fixed-duration chunks using a nominal byte rate.
/// The final partial chunk gets a prorated duration.
pub struct ByteRateSource<R: Read + Send> {
    reader: R,
    chunk_bytes: usize,
    chunk_duration_ms: u64,
    finished: bool,
}

impl<R: Read + Send> ByteRateSource<R> {
    pub fn new(reader: R, byte_rate: u64, chunk_duration_ms: u64) -> Self {
        let chunk_bytes = ((byte_rate * chunk_duration_ms) / 1000).max(1) as usize;
        Self {
            reader,
            chunk_bytes,
            chunk_duration_ms,
            finished: false,
        }
    }
}

impl<R: Read + Send> ChunkSource for ByteRateSource<R> {
    fn next_chunk(&mut self) -> io::Result<Option<CapturedChunk>> {
        if self.finished {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.chunk_bytes];
        let mut filled = 0usize;
        while filled < self.chunk_bytes {
            match self.reader.read(&mut buffer[filled..]) {
                Ok(0) => {
                    self.finished = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if filled == 0 {
            return Ok(None);
        }

        buffer.truncate(filled);
        let duration_ms = if filled == self.chunk_bytes {
            self.chunk_duration_ms
        } else {
            (self.chunk_duration_ms * filled as u64) / self.chunk_bytes as u64
        };
        Ok(Some(CapturedChunk {
            bytes: buffer,
            duration_ms,
        }))
    }
}

/// Decorator around the screen source that reports end-of-stream exactly
/// once. The orchestrator owns and composes this wrapper; no global
/// capability is patched to observe the share ending.
pub struct ScreenCaptureSource {
    inner: Box<dyn ChunkSource>,
    on_ended: Option<Box<dyn FnOnce() + Send>>,
}

impl ScreenCaptureSource {
    pub fn new(inner: Box<dyn ChunkSource>, on_ended: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            inner,
            on_ended: Some(on_ended),
        }
    }
}

impl ChunkSource for ScreenCaptureSource {
    fn next_chunk(&mut self) -> io::Result<Option<CapturedChunk>> {
        let chunk = self.inner.next_chunk()?;
        if chunk.is_none() {
            if let Some(callback) = self.on_ended.take() {
                callback();
            }
        }
        Ok(chunk)
    }
}

/// Opens capture sources for a recording session.
/// Failures (device missing, permission denied) surface before the session
/// reaches active.
pub trait CaptureDevices: Send {
    fn open_primary(&self, chunk_duration_ms: u64) -> io::Result<Box<dyn ChunkSource>>;
    fn open_screen(&self, chunk_duration_ms: u64) -> io::Result<Box<dyn ChunkSource>>;
}

/// File-backed capture sources for headless recording
pub struct FileDevices {
    pub primary: PathBuf,
    pub screen: Option<PathBuf>,
    pub byte_rate: u64,
}

impl CaptureDevices for FileDevices {
    fn open_primary(&self, chunk_duration_ms: u64) -> io::Result<Box<dyn ChunkSource>> {
        let file = File::open(&self.primary)?;
        Ok(Box::new(ByteRateSource::new(
            file,
            self.byte_rate,
            chunk_duration_ms,
        )))
    }

    fn open_screen(&self, chunk_duration_ms: u64) -> io::Result<Box<dyn ChunkSource>> {
        let path = self.screen.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "Screen capture source not configured",
            )
        })?;
        let file = File::open(path)?;
        Ok(Box::new(ByteRateSource::new(
            file,
            self.byte_rate,
            chunk_duration_ms,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_byte_rate_source_cuts_fixed_chunks() {
        // 100 bytes/sec at 1s chunks = 100-byte chunks
        let data = vec![7u8; 250];
        let mut source = ByteRateSource::new(Cursor::new(data), 100, 1_000);

        let first = source.next_chunk().unwrap().unwrap();
        assert_eq!(first.bytes.len(), 100);
        assert_eq!(first.duration_ms, 1_000);

        let second = source.next_chunk().unwrap().unwrap();
        assert_eq!(second.bytes.len(), 100);

        let last = source.next_chunk().unwrap().unwrap();
        assert_eq!(last.bytes.len(), 50);
        assert_eq!(last.duration_ms, 500);

        assert!(source.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_byte_rate_source_empty_input() {
        let mut source = ByteRateSource::new(Cursor::new(Vec::new()), 100, 1_000);
        assert!(source.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_screen_source_reports_end_once() {
        let ended = Arc::new(AtomicUsize::new(0));
        let ended_clone = Arc::clone(&ended);
        let inner = ByteRateSource::new(Cursor::new(vec![1u8; 10]), 10, 1_000);
        let mut source = ScreenCaptureSource::new(
            Box::new(inner),
            Box::new(move || {
                ended_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(source.next_chunk().unwrap().is_some());
        assert_eq!(ended.load(Ordering::SeqCst), 0);

        assert!(source.next_chunk().unwrap().is_none());
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        assert!(source.next_chunk().unwrap().is_none());
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_devices_missing_screen_source() {
        let devices = FileDevices {
            primary: PathBuf::from("/nonexistent"),
            screen: None,
            byte_rate: 100,
        };
        match devices.open_screen(1_000) {
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
            Ok(_) => panic!("expected an error"),
        }
    }
}
