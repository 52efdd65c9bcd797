use bytes::Bytes;
use futures_core::Stream;
use sha2::{Digest, Sha256};
use std::pin::Pin;

/// Stream of bytes for object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Raw SHA-256 digest.
pub type Sha256Digest = [u8; 32];

/// Hash a buffer in one shot.
pub fn sha256(data: &[u8]) -> Sha256Digest {
    Sha256::digest(data).into()
}

/// Lowercase hex rendering of a SHA-256 over `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Byte range for partial content requests (inclusive `end`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>, // None means "to end of object"
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Clamp to an object of `total_size` bytes, returning the half-open
    /// `[start, end)` window. Empty when the range starts past the end.
    pub fn resolve(&self, total_size: u64) -> (u64, u64) {
        let start = self.start.min(total_size);
        let end = match self.end {
            Some(end) => end.saturating_add(1).min(total_size),
            None => total_size,
        };
        (start, end.max(start))
    }

    /// Header form used by S3-compatible backends.
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_resolution_clamps_to_object() {
        assert_eq!(ByteRange::new(2, Some(4)).resolve(10), (2, 5));
        assert_eq!(ByteRange::from_start(7).resolve(10), (7, 10));
        assert_eq!(ByteRange::new(8, Some(100)).resolve(10), (8, 10));
        assert_eq!(ByteRange::from_start(12).resolve(10), (10, 10));
        assert_eq!(ByteRange::new(0, Some(9)).to_header(), "bytes=0-9");
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(sha256(b"").len(), 32);
    }
}
