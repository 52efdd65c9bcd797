//! Public entry point of the upload engine.
//!
//! `TusCoordinator` owns one handler per live key. Every operation on a key
//! holds that key's lock for its whole duration, so operations on one key
//! run in arrival order while different keys proceed in parallel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dog_blob::{ByteStream, ObjectStore, RetryStore, Sha256Digest};
use tracing::instrument;

use crate::handler::{NewUpload, Shared, UploadHandler};
use crate::metadata::{encode_checksum, encode_filename, parse_checksum, parse_upload_metadata};
use crate::session::SessionStore;
use crate::{TusConfig, TusError, TusResult};

/// The only body content type accepted
pub const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Custom metadata key carrying the declared checksum on multipart uploads
pub const CHECKSUM_METADATA_KEY: &str = "x-checksum-sha256";

/// Exact match; parameters and other spellings are rejected.
pub fn is_offset_content_type(value: &str) -> bool {
    value.trim() == OFFSET_CONTENT_TYPE
}

/// Headers of a creation request, already decoded from the wire
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub upload_length: Option<u64>,
    pub upload_defer_length: Option<u64>,
    pub content_type: Option<String>,
    pub upload_metadata: Option<String>,
    /// Base64 SHA-256 of the whole object
    pub checksum: Option<String>,
}

impl CreateRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request whose metadata names `key` as the filename.
    pub fn for_key(key: &str) -> Self {
        Self {
            upload_metadata: Some(encode_filename(key)),
            ..Self::default()
        }
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.upload_length = Some(length);
        self
    }

    pub fn with_deferred_length(mut self) -> Self {
        self.upload_defer_length = Some(1);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Mark the request as carrying upload bytes.
    pub fn with_body(self) -> Self {
        self.with_content_type(OFFSET_CONTENT_TYPE)
    }

    pub fn with_checksum(mut self, digest: &Sha256Digest) -> Self {
        self.checksum = Some(encode_checksum(digest));
        self
    }
}

/// Headers of an append request
#[derive(Debug, Clone, Default)]
pub struct PatchRequest {
    pub upload_offset: Option<u64>,
    pub upload_length: Option<u64>,
    pub content_type: Option<String>,
}

impl PatchRequest {
    /// An append of offset-stream bytes at `offset`.
    pub fn at(offset: u64) -> Self {
        Self {
            upload_offset: Some(offset),
            upload_length: None,
            content_type: Some(OFFSET_CONTENT_TYPE.to_string()),
        }
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.upload_length = Some(length);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub key: String,
    pub upload_offset: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub upload_offset: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub upload_offset: u64,
    /// `None` while the length is deferred
    pub upload_length: Option<u64>,
    pub expires_at: DateTime<Utc>,
}

/// The operations an HTTP surface needs from the engine.
#[async_trait]
pub trait ResumableUploads: Send + Sync {
    fn config(&self) -> &TusConfig;

    async fn create(&self, request: CreateRequest, body: Option<ByteStream>) -> TusResult<Created>;

    async fn head(&self, key: &str) -> TusResult<UploadStatus>;

    async fn patch(&self, key: &str, request: PatchRequest, body: Option<ByteStream>) -> TusResult<Patched>;

    /// Abort any open transaction and forget the session.
    async fn cleanup(&self, key: &str) -> TusResult<()>;

    /// Clean up `key` if its deadline is at or before `now`. Returns whether
    /// it did.
    async fn expire(&self, key: &str, now: DateTime<Utc>) -> TusResult<bool>;
}

struct Inner {
    shared: Shared,
    handlers: DashMap<String, Arc<UploadHandler>>,
}

/// Coordinates resumable uploads over an object store and a session store
#[derive(Clone)]
pub struct TusCoordinator {
    inner: Arc<Inner>,
}

impl TusCoordinator {
    /// Wrap `store` in the retry policy from `config`.
    pub fn new(store: Arc<dyn ObjectStore>, sessions: Arc<dyn SessionStore>, config: TusConfig) -> Self {
        let store = RetryStore::new(store, config.retry);
        Self {
            inner: Arc::new(Inner {
                shared: Shared {
                    store,
                    sessions,
                    config,
                },
                handlers: DashMap::new(),
            }),
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.inner.shared.sessions
    }

    /// Handlers currently registered, live or busy.
    pub fn active_handlers(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Keys whose sessions are past their deadline.
    pub async fn expired_keys(&self, now: DateTime<Utc>) -> TusResult<Vec<String>> {
        self.inner.shared.sessions.expired(now).await
    }

    fn handler(&self, key: &str) -> Arc<UploadHandler> {
        self.inner
            .handlers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(UploadHandler::new(key)))
            .clone()
    }

    /// Drop our reference and unregister the handler once nothing else holds
    /// it and it has no session.
    fn release(&self, handler: Arc<UploadHandler>) {
        let key = handler.key().to_string();
        drop(handler);
        self.inner
            .handlers
            .remove_if(&key, |_, h| Arc::strong_count(h) == 1 && h.is_idle());
    }

    fn validate_create(&self, request: &CreateRequest, has_body: bool) -> TusResult<NewUpload> {
        let header = request
            .upload_metadata
            .as_deref()
            .ok_or_else(|| TusError::bad_metadata("a filename is required"))?;
        let metadata = parse_upload_metadata(header)?;
        let key = metadata
            .filename()
            .ok_or_else(|| TusError::bad_metadata("a filename is required"))?
            .to_string();

        match &request.content_type {
            Some(content_type) if !is_offset_content_type(content_type) => {
                return Err(TusError::UnsupportedMediaType {
                    content_type: Some(content_type.clone()),
                })
            }
            None if has_body => return Err(TusError::UnsupportedMediaType { content_type: None }),
            _ => {}
        }

        let upload_length = match (request.upload_length, request.upload_defer_length) {
            (Some(_), Some(_)) => {
                return Err(TusError::invalid_length(
                    "Upload-Length and Upload-Defer-Length are mutually exclusive",
                ))
            }
            (Some(length), None) => Some(length),
            (None, Some(1)) => None,
            (None, Some(other)) => {
                return Err(TusError::invalid_length(format!(
                    "Upload-Defer-Length must be 1, got {other}"
                )))
            }
            (None, None) => return Err(TusError::MissingLength),
        };

        let max = self.inner.shared.config.max_upload_length;
        if let Some(length) = upload_length {
            if length > max {
                return Err(TusError::ExceedsMaxLength {
                    key,
                    offset: length,
                    max,
                });
            }
        }

        let checksum = request.checksum.as_deref().map(parse_checksum).transpose()?;
        Ok(NewUpload {
            key,
            upload_length,
            checksum,
        })
    }
}

#[async_trait]
impl ResumableUploads for TusCoordinator {
    fn config(&self) -> &TusConfig {
        &self.inner.shared.config
    }

    #[instrument(skip_all)]
    async fn create(&self, request: CreateRequest, body: Option<ByteStream>) -> TusResult<Created> {
        let upload = self.validate_create(&request, body.is_some())?;
        // Bytes only count when they are declared as offset-stream content.
        let body = body.filter(|_| request.content_type.is_some());

        let handler = self.handler(&upload.key);
        let result = {
            let mut locked = handler.lock(&self.inner.shared).await;
            let result = locked.create(upload, body, Utc::now()).await;
            locked.settle(result).await
        };
        self.release(handler);
        result
    }

    #[instrument(skip(self))]
    async fn head(&self, key: &str) -> TusResult<UploadStatus> {
        let handler = self.handler(key);
        let result = {
            let mut locked = handler.lock(&self.inner.shared).await;
            locked.head(Utc::now()).await
        };
        self.release(handler);
        result
    }

    #[instrument(skip(self, request, body), fields(offset = ?request.upload_offset))]
    async fn patch(&self, key: &str, request: PatchRequest, body: Option<ByteStream>) -> TusResult<Patched> {
        let handler = self.handler(key);
        let result = {
            let mut locked = handler.lock(&self.inner.shared).await;
            let result = locked.patch(request, body, Utc::now()).await;
            locked.settle(result).await
        };
        self.release(handler);
        result
    }

    #[instrument(skip(self))]
    async fn cleanup(&self, key: &str) -> TusResult<()> {
        let handler = self.handler(key);
        {
            let mut locked = handler.lock(&self.inner.shared).await;
            locked.cleanup(true).await;
        }
        self.release(handler);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expire(&self, key: &str, now: DateTime<Utc>) -> TusResult<bool> {
        let handler = self.handler(key);
        let result = {
            let mut locked = handler.lock(&self.inner.shared).await;
            locked.expire(now).await
        };
        self.release(handler);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySessionStore;
    use dog_blob::MemoryObjectStore;

    fn coordinator() -> TusCoordinator {
        TusCoordinator::new(
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemorySessionStore::new()),
            TusConfig::default().with_max_upload_length(100),
        )
    }

    #[test]
    fn content_type_must_match_exactly() {
        assert!(is_offset_content_type("application/offset+octet-stream"));
        assert!(is_offset_content_type(" application/offset+octet-stream "));
        assert!(!is_offset_content_type("Application/Offset+Octet-Stream"));
        assert!(!is_offset_content_type("application/offset+octet-stream; charset=utf-8"));
        assert!(!is_offset_content_type("application/octet-stream"));
    }

    #[test]
    fn create_validation_rules() {
        let c = coordinator();

        let missing_name = CreateRequest::new().with_length(1);
        assert!(matches!(c.validate_create(&missing_name, false), Err(TusError::BadMetadata { .. })));

        let no_length = CreateRequest::for_key("a");
        assert!(matches!(c.validate_create(&no_length, false), Err(TusError::MissingLength)));

        let both = CreateRequest::for_key("a").with_length(1).with_deferred_length();
        assert!(matches!(c.validate_create(&both, false), Err(TusError::InvalidLength { .. })));

        let mut bad_defer = CreateRequest::for_key("a");
        bad_defer.upload_defer_length = Some(2);
        assert!(matches!(c.validate_create(&bad_defer, false), Err(TusError::InvalidLength { .. })));

        let untyped_body = CreateRequest::for_key("a").with_length(1);
        assert!(matches!(
            c.validate_create(&untyped_body, true),
            Err(TusError::UnsupportedMediaType { content_type: None })
        ));

        let too_big = CreateRequest::for_key("a").with_length(101);
        assert_eq!(c.validate_create(&too_big, false).unwrap_err().status(), 413);

        let mut bad_sum = CreateRequest::for_key("a").with_length(1);
        bad_sum.checksum = Some("short".into());
        assert!(matches!(c.validate_create(&bad_sum, false), Err(TusError::BadChecksum { .. })));

        let ok = c
            .validate_create(&CreateRequest::for_key("dir/a.bin").with_deferred_length(), false)
            .unwrap();
        assert_eq!(ok.key, "dir/a.bin");
        assert_eq!(ok.upload_length, None);
    }

    #[tokio::test]
    async fn idle_handlers_are_released() {
        let c = coordinator();
        assert!(c.head("nothing").await.is_err());
        assert_eq!(c.active_handlers(), 0);

        c.create(CreateRequest::for_key("k").with_length(10), None).await.unwrap();
        assert_eq!(c.active_handlers(), 1);

        c.cleanup("k").await.unwrap();
        assert_eq!(c.active_handlers(), 0);
    }
}
