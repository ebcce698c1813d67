use base64::Engine;
use rand::RngCore;

/// Chunk duration recommended to recording clients (10 seconds)
pub const DEFAULT_CHUNK_DURATION_MS: u64 = 10_000;

/// Maximum upload attempts per chunk before the queue halts
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Lifetime of a presigned upload target
pub const UPLOAD_URL_TTL_SECS: i64 = 900;

/// Signing requests allowed per (session, stream) within one window
pub const RATE_LIMIT_MAX_REQUESTS: usize = 60;

/// Sliding rate-limit window length
pub const RATE_LIMIT_WINDOW_MS: i64 = 60_000;

/// Content type recorded for chunks when the client does not specify one
pub const DEFAULT_CONTENT_TYPE: &str = "video/webm";

/// Generate a single-use upload token for a presigned target
/// URL-safe so it can be carried as a query parameter without escaping
pub fn generate_upload_token() -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_tokens_are_unique_and_url_safe() {
        let a = generate_upload_token();
        let b = generate_upload_token();
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
