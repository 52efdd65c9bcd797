use thiserror::Error;

/// Result type for blob operations
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during object storage operations
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    /// The backend rejected a write because the payload did not hash to the
    /// declared SHA-256.
    #[error("Checksum mismatch writing {key}")]
    ChecksumMismatch { key: String },

    /// The multipart transaction no longer exists on the backend.
    #[error("Multipart upload {upload_id} for {key} does not exist")]
    NoSuchUpload { key: String, upload_id: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<BlobError>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl BlobError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(key: S) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn checksum_mismatch<S: Into<String>>(key: S) -> Self {
        Self::ChecksumMismatch { key: key.into() }
    }

    pub fn no_such_upload<K: Into<String>, U: Into<String>>(key: K, upload_id: U) -> Self {
        Self::NoSuchUpload {
            key: key.into(),
            upload_id: upload_id.into(),
        }
    }

    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }

    pub fn is_no_such_upload(&self) -> bool {
        matches!(self, Self::NoSuchUpload { .. })
    }
}
