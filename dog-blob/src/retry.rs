//! Bounded exponential backoff around every backend call.
//!
//! Failed attempt `n` (0-based) sleeps `base_delay * 2^n` before the next
//! one. Some errors are never worth repeating: a checksum rejection on a
//! single-shot write will fail identically, and a vanished multipart
//! transaction cannot come back. Those short-circuit immediately so the
//! caller can classify them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    BlobError, BlobResult, ByteRange, GetResult, MultipartOptions, MultipartUpload, ObjectHead,
    ObjectStore, PutResult, Sha256Digest, UploadedPart,
};

/// Retry budget for storage calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryParams {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryParams {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Sleep before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the
/// budget is spent. Exhaustion wraps the last error in
/// `BlobError::Exhausted`.
pub async fn retry<T, F, Fut, P>(
    operation: &'static str,
    params: &RetryParams,
    should_retry: P,
    mut op: F,
) -> BlobResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BlobResult<T>>,
    P: Fn(&BlobError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => {
                debug!(operation, attempt, error = %e, "Not retrying storage error");
                return Err(e);
            }
            Err(e) if attempt >= params.max_retries => {
                warn!(operation, attempts = attempt + 1, error = %e, "Storage retries exhausted");
                return Err(BlobError::Exhausted {
                    operation,
                    attempts: attempt + 1,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                let delay = params.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Storage call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn always(_: &BlobError) -> bool {
    true
}

/// `ObjectStore` decorator applying the per-operation retry policy.
#[derive(Clone)]
pub struct RetryStore {
    inner: Arc<dyn ObjectStore>,
    params: RetryParams,
}

impl RetryStore {
    pub fn new(inner: Arc<dyn ObjectStore>, params: RetryParams) -> Self {
        Self { inner, params }
    }
}

#[async_trait]
impl ObjectStore for RetryStore {
    async fn head(&self, key: &str) -> BlobResult<Option<ObjectHead>> {
        retry("head", &self.params, always, || self.inner.head(key)).await
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> BlobResult<Option<GetResult>> {
        retry("get", &self.params, always, || self.inner.get(key, range.clone())).await
    }

    async fn put(&self, key: &str, data: Bytes, checksum: Option<Sha256Digest>) -> BlobResult<PutResult> {
        retry(
            "put",
            &self.params,
            |e| !e.is_checksum_mismatch(),
            || self.inner.put(key, data.clone(), checksum),
        )
        .await
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        retry("delete", &self.params, always, || self.inner.delete(key)).await
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        options: MultipartOptions,
    ) -> BlobResult<Box<dyn MultipartUpload>> {
        let upload = retry("create_multipart_upload", &self.params, always, || {
            self.inner.create_multipart_upload(key, options.clone())
        })
        .await?;
        Ok(Box::new(RetryMultipartUpload::new(upload, self.params)))
    }

    fn resume_multipart_upload(&self, key: &str, upload_id: &str) -> Box<dyn MultipartUpload> {
        Box::new(RetryMultipartUpload::new(
            self.inner.resume_multipart_upload(key, upload_id),
            self.params,
        ))
    }
}

/// `MultipartUpload` decorator. A missing transaction is never retried and
/// `abort` is a single best-effort attempt.
pub struct RetryMultipartUpload {
    inner: Box<dyn MultipartUpload>,
    params: RetryParams,
}

impl RetryMultipartUpload {
    pub fn new(inner: Box<dyn MultipartUpload>, params: RetryParams) -> Self {
        Self { inner, params }
    }
}

#[async_trait]
impl MultipartUpload for RetryMultipartUpload {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn upload_id(&self) -> &str {
        self.inner.upload_id()
    }

    async fn upload_part(&self, part_number: u32, data: Bytes) -> BlobResult<UploadedPart> {
        retry(
            "upload_part",
            &self.params,
            |e| !e.is_no_such_upload(),
            || self.inner.upload_part(part_number, data.clone()),
        )
        .await
    }

    async fn complete(&self, parts: Vec<UploadedPart>) -> BlobResult<PutResult> {
        retry(
            "complete_multipart_upload",
            &self.params,
            |e| !e.is_no_such_upload(),
            || self.inner.complete(parts.clone()),
        )
        .await
    }

    async fn abort(&self) -> BlobResult<()> {
        self.inner.abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryObjectStore, StoreOp};
    use crate::sha256;
    use tokio::time::Instant;

    fn store_pair(params: RetryParams) -> (MemoryObjectStore, RetryStore) {
        let memory = MemoryObjectStore::new();
        let retrying = RetryStore::new(Arc::new(memory.clone()), params);
        (memory, retrying)
    }

    #[test]
    fn delays_double_from_base() {
        let params = RetryParams::default();
        let delays: Vec<u64> = (0..5).map(|n| params.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_succeed() {
        let (memory, store) = store_pair(RetryParams::default());
        memory.fail_next(StoreOp::Put, 3);

        let started = Instant::now();
        store.put("a", Bytes::from_static(b"abc"), None).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_millis(100 + 200 + 400));
        assert_eq!(memory.calls(StoreOp::Put), 4);
        assert_eq!(memory.object("a").unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts() {
        let (memory, store) = store_pair(RetryParams::default());
        memory.fail_next(StoreOp::Head, 10);

        let started = Instant::now();
        let err = store.head("a").await.unwrap_err();

        assert_eq!(started.elapsed(), Duration::from_millis(3100));
        match err {
            BlobError::Exhausted { operation, attempts, .. } => {
                assert_eq!(operation, "head");
                assert_eq!(attempts, 6);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(memory.calls(StoreOp::Head), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn checksum_rejection_is_not_retried() {
        let (memory, store) = store_pair(RetryParams::default());
        let wrong = sha256(b"something else");

        let err = store.put("a", Bytes::from_static(b"abc"), Some(wrong)).await.unwrap_err();

        assert!(err.is_checksum_mismatch());
        assert_eq!(memory.calls(StoreOp::Put), 1);
        assert!(memory.object("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_transaction_is_not_retried() {
        let (memory, store) = store_pair(RetryParams::default());
        let upload = store
            .create_multipart_upload("big", MultipartOptions::new())
            .await
            .unwrap();
        memory.drop_multipart(upload.upload_id());

        let err = upload.upload_part(1, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(err.is_no_such_upload());
        assert_eq!(memory.calls(StoreOp::UploadPart), 1);

        let err = upload.complete(Vec::new()).await.unwrap_err();
        assert!(err.is_no_such_upload());
        assert_eq!(memory.calls(StoreOp::Complete), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_gets_a_single_attempt() {
        let (memory, store) = store_pair(RetryParams::default());
        let upload = store
            .create_multipart_upload("big", MultipartOptions::new())
            .await
            .unwrap();
        memory.fail_next(StoreOp::Abort, 1);

        assert!(upload.abort().await.is_err());
        assert_eq!(memory.calls(StoreOp::Abort), 1);
    }
}
