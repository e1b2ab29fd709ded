//! Boundary Input Validation
//! =========================
//! Length and shape checks applied to every value crossing the core's API
//! boundary. All inputs originate in a sandboxed renderer and are hostile.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use thiserror::Error;
use tracing::warn;

/// Generic string cap applied at IPC boundaries.
pub const MAX_STRING_BYTES: usize = 10 * 1024 * 1024;
/// Generic vector-length cap applied at IPC boundaries.
pub const MAX_VEC_LEN: usize = 10_000;
/// Cap for URLs arriving from the renderer.
pub const MAX_URL_LEN: usize = 10_000;
/// Cap for URLs stored in policy and quarantine metadata.
pub const MAX_POLICY_URL_LEN: usize = 2048;
/// Filenames must be 1..=255 characters.
pub const MAX_FILENAME_LEN: usize = 255;
/// A SHA-256 digest is exactly 64 lowercase hex characters.
pub const SHA256_HEX_LEN: usize = 64;

/// A value failed a boundary validator. Carries the field so audit logs can
/// name exactly what was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

fn reject(field: &'static str, reason: String) -> ValidationError {
    warn!(field, %reason, "Security: rejected invalid input");
    ValidationError { field, reason }
}

/// Generic boundary check for renderer-supplied strings.
pub fn check_string(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_STRING_BYTES {
        return Err(reject(
            field,
            format!("{} bytes exceeds the {} byte cap", value.len(), MAX_STRING_BYTES),
        ));
    }
    Ok(())
}

/// Generic boundary check for renderer-supplied sequences.
pub fn check_vec_len(field: &'static str, len: usize) -> Result<(), ValidationError> {
    if len > MAX_VEC_LEN {
        return Err(reject(
            field,
            format!("{} entries exceeds the {} entry cap", len, MAX_VEC_LEN),
        ));
    }
    Ok(())
}

/// URLs are capped per boundary: `MAX_URL_LEN` at the renderer surface,
/// `MAX_POLICY_URL_LEN` when persisted into policy or quarantine metadata.
pub fn check_url(field: &'static str, url: &str, cap: usize) -> Result<(), ValidationError> {
    if url.is_empty() {
        return Err(reject(field, "empty URL".to_string()));
    }
    if url.len() > cap {
        return Err(reject(
            field,
            format!("{} characters exceeds the {} character cap", url.len(), cap),
        ));
    }
    Ok(())
}

/// Filenames are renderer-supplied and untrusted: 1..=255 characters.
pub fn check_filename(filename: &str) -> Result<(), ValidationError> {
    if filename.is_empty() {
        return Err(reject("filename", "empty filename".to_string()));
    }
    if filename.chars().count() > MAX_FILENAME_LEN {
        return Err(reject(
            "filename",
            format!("longer than {} characters", MAX_FILENAME_LEN),
        ));
    }
    Ok(())
}

/// A content digest must be exactly 64 lowercase hex characters.
pub fn check_sha256(digest: &str) -> Result<(), ValidationError> {
    if digest.len() != SHA256_HEX_LEN {
        return Err(reject(
            "sha256",
            format!("expected {} characters, got {}", SHA256_HEX_LEN, digest.len()),
        ));
    }
    if !digest.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(reject("sha256", "not lowercase hex".to_string()));
    }
    Ok(())
}

/// Content sizes must be non-zero.
pub fn check_size(size: u64) -> Result<(), ValidationError> {
    if size == 0 {
        return Err(reject("file_size", "zero-length content".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_bounds() {
        assert!(check_filename("a.txt").is_ok());
        assert!(check_filename("").is_err());
        assert!(check_filename(&"x".repeat(255)).is_ok());
        assert!(check_filename(&"x".repeat(256)).is_err());
    }

    #[test]
    fn sha256_shape() {
        let good = "0".repeat(64);
        assert!(check_sha256(&good).is_ok());
        assert!(check_sha256(&"0".repeat(63)).is_err());
        assert!(check_sha256(&"0".repeat(65)).is_err());
        assert!(check_sha256(&"G".repeat(64)).is_err());
        // Uppercase hex is rejected; the grammar is lowercase only.
        assert!(check_sha256(&"A".repeat(64)).is_err());
    }

    #[test]
    fn url_caps_per_boundary() {
        assert!(check_url("url", "http://example.com", MAX_URL_LEN).is_ok());
        assert!(check_url("url", "", MAX_URL_LEN).is_err());
        let long = format!("http://e.com/{}", "a".repeat(MAX_POLICY_URL_LEN));
        assert!(check_url("url", &long, MAX_URL_LEN).is_ok());
        assert!(check_url("original_url", &long, MAX_POLICY_URL_LEN).is_err());
    }

    #[test]
    fn size_must_be_nonzero() {
        assert!(check_size(0).is_err());
        assert!(check_size(1).is_ok());
    }
}
