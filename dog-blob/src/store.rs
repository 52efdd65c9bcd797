use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::{BlobResult, ByteRange, ByteStream, Sha256Digest};

/// Object storage primitives used by the upload engine.
///
/// Implementations must be safe to call concurrently for different keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Object metadata, `None` when the key does not exist.
    async fn head(&self, key: &str) -> BlobResult<Option<ObjectHead>>;

    /// Read an object, optionally a sub-range. `None` when missing.
    async fn get(&self, key: &str, range: Option<ByteRange>) -> BlobResult<Option<GetResult>>;

    /// Single-shot write. When `checksum` is given the backend must reject
    /// the write with `BlobError::ChecksumMismatch` if the payload differs.
    async fn put(&self, key: &str, data: Bytes, checksum: Option<Sha256Digest>) -> BlobResult<PutResult>;

    /// Remove an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Open a multipart transaction for `key`.
    async fn create_multipart_upload(
        &self,
        key: &str,
        options: MultipartOptions,
    ) -> BlobResult<Box<dyn MultipartUpload>>;

    /// Re-attach to an existing transaction by id. Performs no I/O; a stale id
    /// surfaces as `BlobError::NoSuchUpload` on the next call.
    fn resume_multipart_upload(&self, key: &str, upload_id: &str) -> Box<dyn MultipartUpload>;
}

/// Handle to an open multipart transaction.
#[async_trait]
pub trait MultipartUpload: Send + Sync {
    fn key(&self) -> &str;

    fn upload_id(&self) -> &str;

    /// Upload part `part_number` (1-based).
    async fn upload_part(&self, part_number: u32, data: Bytes) -> BlobResult<UploadedPart>;

    /// Assemble the listed parts, in order, into the final object.
    async fn complete(&self, parts: Vec<UploadedPart>) -> BlobResult<PutResult>;

    async fn abort(&self) -> BlobResult<()>;
}

/// Options for opening a multipart transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartOptions {
    pub custom_metadata: BTreeMap<String, String>,
}

impl MultipartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.custom_metadata.insert(key.into(), value.into());
        self
    }
}

/// Acknowledgement for one uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Result of a successful write
#[derive(Debug, Clone)]
pub struct PutResult {
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// Result of a get operation
pub struct GetResult {
    pub stream: ByteStream,
    pub size_bytes: u64,
    pub etag: Option<String>,
}

impl GetResult {
    /// Drain the body into one contiguous buffer.
    pub async fn into_bytes(self) -> BlobResult<Bytes> {
        let mut stream = self.stream;
        let mut out = BytesMut::with_capacity(self.size_bytes as usize);
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

impl std::fmt::Debug for GetResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetResult")
            .field("size_bytes", &self.size_bytes)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

/// Metadata about an object
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub custom_metadata: BTreeMap<String, String>,
}
