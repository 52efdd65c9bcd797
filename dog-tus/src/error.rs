use dog_blob::BlobError;
use serde_json::{json, Value};
use thiserror::Error;

/// Result type for upload engine operations
pub type TusResult<T> = Result<T, TusError>;

/// Whether a client may repeat the same request unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Terminal,
}

/// Every way an upload request can be rejected
#[derive(Error, Debug)]
pub enum TusError {
    #[error("Unsupported content type {content_type:?}, expected application/offset+octet-stream")]
    UnsupportedMediaType { content_type: Option<String> },

    #[error("Exactly one of Upload-Length or Upload-Defer-Length is required")]
    MissingLength,

    #[error("Invalid length headers: {message}")]
    InvalidLength { message: String },

    #[error("Invalid Upload-Metadata: {message}")]
    BadMetadata { message: String },

    #[error("Invalid checksum header: {message}")]
    BadChecksum { message: String },

    #[error("Upload-Offset {received:?} does not match current offset {expected} for {key}")]
    OffsetMismatch {
        key: String,
        expected: u64,
        received: Option<u64>,
    },

    #[error("Upload {key} already has {offset} bytes")]
    DuplicateUpload { key: String, offset: u64 },

    #[error("Upload-Length {received} does not match declared length {expected} for {key}")]
    LengthMismatch { key: String, expected: u64, received: u64 },

    #[error("Request body required for {key}")]
    EmptyBody { key: String },

    #[error("Upload {key} would reach {offset} bytes, past its declared length {length}")]
    ExceedsUploadLength { key: String, offset: u64, length: u64 },

    #[error("Upload {key} would reach {offset} bytes, past the {max} byte limit")]
    ExceedsMaxLength { key: String, offset: u64, max: u64 },

    #[error("SHA-256 checksum mismatch for {key}")]
    ChecksumMismatch { key: String },

    #[error("Upload {key} not found")]
    NotFound { key: String },

    #[error("Storage request for {key} failed: {source}")]
    Upstream {
        key: String,
        #[source]
        source: BlobError,
    },

    #[error("Upload {key} cannot continue: {reason}")]
    Unrecoverable { key: String, reason: String },

    #[error("Session store error: {message}")]
    Session { message: String },
}

impl TusError {
    pub fn invalid_length(message: impl Into<String>) -> Self {
        Self::InvalidLength {
            message: message.into(),
        }
    }

    pub fn bad_metadata(message: impl Into<String>) -> Self {
        Self::BadMetadata {
            message: message.into(),
        }
    }

    pub fn bad_checksum(message: impl Into<String>) -> Self {
        Self::BadChecksum {
            message: message.into(),
        }
    }

    pub fn unrecoverable(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unrecoverable {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn session(err: impl std::fmt::Display) -> Self {
        Self::Session {
            message: err.to_string(),
        }
    }

    /// Classify a storage failure for `key`. A vanished multipart
    /// transaction is unrecoverable and a backend checksum rejection is the
    /// client's fault; everything else is an upstream failure.
    pub fn storage(key: impl Into<String>, err: BlobError) -> Self {
        let key = key.into();
        match err {
            BlobError::NoSuchUpload { upload_id, .. } => Self::Unrecoverable {
                key,
                reason: format!("multipart upload {upload_id} does not exist"),
            },
            BlobError::ChecksumMismatch { .. } => Self::ChecksumMismatch { key },
            source => Self::Upstream { key, source },
        }
    }

    /// HTTP status for this rejection.
    pub fn status(&self) -> u16 {
        match self {
            Self::UnsupportedMediaType { .. } | Self::ChecksumMismatch { .. } => 415,
            Self::MissingLength
            | Self::InvalidLength { .. }
            | Self::BadMetadata { .. }
            | Self::BadChecksum { .. }
            | Self::LengthMismatch { .. }
            | Self::EmptyBody { .. } => 400,
            Self::OffsetMismatch { .. } | Self::DuplicateUpload { .. } => 409,
            Self::ExceedsUploadLength { .. } | Self::ExceedsMaxLength { .. } => 413,
            Self::NotFound { .. } => 404,
            Self::Upstream { .. } => 502,
            Self::Unrecoverable { .. } | Self::Session { .. } => 500,
        }
    }

    /// Stable machine-readable kind.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnsupportedMediaType { .. } => "unsupported-media-type",
            Self::MissingLength => "missing-length",
            Self::InvalidLength { .. } => "invalid-length",
            Self::BadMetadata { .. } => "bad-metadata",
            Self::BadChecksum { .. } => "bad-checksum",
            Self::OffsetMismatch { .. } => "offset-mismatch",
            Self::DuplicateUpload { .. } => "duplicate-upload",
            Self::LengthMismatch { .. } => "length-mismatch",
            Self::EmptyBody { .. } => "empty-body",
            Self::ExceedsUploadLength { .. } => "exceeds-upload-length",
            Self::ExceedsMaxLength { .. } => "exceeds-max-length",
            Self::ChecksumMismatch { .. } => "checksum-mismatch",
            Self::NotFound { .. } => "not-found",
            Self::Upstream { .. } => "upstream",
            Self::Unrecoverable { .. } => "unrecoverable",
            Self::Session { .. } => "session-store",
        }
    }

    pub fn classification(&self) -> Classification {
        match self {
            Self::Upstream { .. } | Self::Session { .. } => Classification::Retryable,
            _ => Classification::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == Classification::Retryable
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }

    /// Structured context for clients: the reason plus whatever keys,
    /// offsets and lengths the variant carries.
    pub fn details(&self) -> Value {
        let mut data = json!({ "reason": self.reason(), "retryable": self.is_retryable() });
        let extra = match self {
            Self::UnsupportedMediaType { content_type } => json!({ "contentType": content_type }),
            Self::OffsetMismatch { key, expected, received } => {
                json!({ "key": key, "expectedOffset": expected, "receivedOffset": received })
            }
            Self::DuplicateUpload { key, offset } => json!({ "key": key, "offset": offset }),
            Self::LengthMismatch { key, expected, received } => {
                json!({ "key": key, "expectedLength": expected, "receivedLength": received })
            }
            Self::ExceedsUploadLength { key, offset, length } => {
                json!({ "key": key, "offset": offset, "uploadLength": length })
            }
            Self::ExceedsMaxLength { key, offset, max } => {
                json!({ "key": key, "offset": offset, "maxLength": max })
            }
            Self::EmptyBody { key }
            | Self::ChecksumMismatch { key }
            | Self::NotFound { key }
            | Self::Upstream { key, .. }
            | Self::Unrecoverable { key, .. } => json!({ "key": key }),
            _ => Value::Null,
        };
        if let (Some(target), Value::Object(extra)) = (data.as_object_mut(), extra) {
            target.extend(extra);
        }
        data
    }
}
