//! Content addressing for downloaded files. Only metadata is kept; bytes are never stored.

use sha2::{Digest, Sha256};

/// Metadata of a downloaded file, keyed by the SHA-256 of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedContent {
    pub sha256: String,
    pub mimetype: String,
    pub extension: String,
    pub file_size: i64,
    pub sample_size: Option<i64>,
    pub thumbnail_size: Option<i64>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

impl DownloadedContent {
    /// Hash the bytes and sniff their type. Unknown content is `application/octet-stream`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let (mimetype, extension) = infer::get(bytes)
            .map(|t| (t.mime_type().to_string(), t.extension().to_string()))
            .unwrap_or_else(|| ("application/octet-stream".into(), "bin".into()));
        Self {
            sha256: sha256_hex(bytes),
            mimetype,
            extension,
            file_size: bytes.len() as i64,
            sample_size: None,
            thumbnail_size: None,
        }
    }

    pub fn with_sample_size(mut self, size: i64) -> Self {
        self.sample_size = Some(size);
        self
    }

    pub fn with_thumbnail_size(mut self, size: i64) -> Self {
        self.thumbnail_size = Some(size);
        self
    }
}

/// True for a 64 character lowercase hex digest.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
