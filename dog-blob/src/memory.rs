//! In-process `ObjectStore` used for tests and single-node deployments.
//!
//! Besides storing objects it can inject transient failures per operation
//! and forget multipart transactions, which is how the retry and recovery
//! paths are exercised without a real backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    sha256, sha256_hex, BlobError, BlobResult, ByteRange, GetResult, MultipartOptions, MultipartUpload,
    ObjectHead, ObjectStore, PutResult, Sha256Digest, UploadedPart,
};

/// Operations that can be counted and failed on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Head,
    Get,
    Put,
    Delete,
    CreateMultipart,
    UploadPart,
    Complete,
    Abort,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    custom_metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct PendingMultipart {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
    custom_metadata: BTreeMap<String, String>,
}

#[derive(Default)]
struct MemoryInner {
    objects: RwLock<HashMap<String, StoredObject>>,
    multipart: RwLock<HashMap<String, PendingMultipart>>,
    failures: Mutex<HashMap<StoreOp, usize>>,
    calls: Mutex<HashMap<StoreOp, usize>>,
}

impl MemoryInner {
    /// Count the call and consume one injected failure if armed.
    fn enter(&self, op: StoreOp) -> BlobResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BlobError::backend(std::io::Error::other(format!(
                    "injected {op:?} failure"
                ))));
            }
        }
        Ok(())
    }
}

/// Thread-safe in-memory object store
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<MemoryInner>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with a transient backend error.
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        self.inner.failures.lock().insert(op, times);
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.inner.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Forget an open multipart transaction, as a backend would after its
    /// own expiry.
    pub fn drop_multipart(&self, upload_id: &str) {
        self.inner.multipart.write().remove(upload_id);
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.inner.objects.read().get(key).map(|o| o.data.clone())
    }

    pub fn object_metadata(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.inner
            .objects
            .read()
            .get(key)
            .map(|o| o.custom_metadata.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Ids of transactions that are still open.
    pub fn open_multipart_uploads(&self) -> Vec<String> {
        self.inner.multipart.read().keys().cloned().collect()
    }

    /// Custom metadata recorded when a transaction was opened.
    pub fn multipart_metadata(&self, upload_id: &str) -> Option<BTreeMap<String, String>> {
        self.inner
            .multipart
            .read()
            .get(upload_id)
            .map(|m| m.custom_metadata.clone())
    }

    /// Parts uploaded so far to an open transaction.
    pub fn multipart_part_count(&self, upload_id: &str) -> usize {
        self.inner
            .multipart
            .read()
            .get(upload_id)
            .map(|m| m.parts.len())
            .unwrap_or(0)
    }

    /// Write an object directly, bypassing counters and failure injection.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let object = StoredObject {
            etag: sha256_hex(&data),
            data,
            custom_metadata: BTreeMap::new(),
        };
        self.inner.objects.write().insert(key.to_string(), object);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self, key: &str) -> BlobResult<Option<ObjectHead>> {
        self.inner.enter(StoreOp::Head)?;
        Ok(self.inner.objects.read().get(key).map(|o| ObjectHead {
            size_bytes: o.data.len() as u64,
            etag: Some(o.etag.clone()),
            custom_metadata: o.custom_metadata.clone(),
        }))
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> BlobResult<Option<GetResult>> {
        self.inner.enter(StoreOp::Get)?;
        let Some(object) = self.inner.objects.read().get(key).cloned() else {
            return Ok(None);
        };

        let data = match range {
            Some(range) => {
                let (start, end) = range.resolve(object.data.len() as u64);
                object.data.slice(start as usize..end as usize)
            }
            None => object.data,
        };
        let size_bytes = data.len() as u64;
        let stream = futures_util::stream::iter(std::iter::once(Ok(data)));

        Ok(Some(GetResult {
            stream: Box::pin(stream),
            size_bytes,
            etag: Some(object.etag),
        }))
    }

    async fn put(&self, key: &str, data: Bytes, checksum: Option<Sha256Digest>) -> BlobResult<PutResult> {
        self.inner.enter(StoreOp::Put)?;
        if let Some(expected) = checksum {
            if sha256(&data) != expected {
                return Err(BlobError::checksum_mismatch(key));
            }
        }

        let size_bytes = data.len() as u64;
        let etag = sha256_hex(&data);
        self.inner.objects.write().insert(
            key.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
                custom_metadata: BTreeMap::new(),
            },
        );
        Ok(PutResult {
            etag: Some(etag),
            size_bytes,
        })
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.inner.enter(StoreOp::Delete)?;
        self.inner.objects.write().remove(key);
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        options: MultipartOptions,
    ) -> BlobResult<Box<dyn MultipartUpload>> {
        self.inner.enter(StoreOp::CreateMultipart)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        self.inner.multipart.write().insert(
            upload_id.clone(),
            PendingMultipart {
                key: key.to_string(),
                parts: BTreeMap::new(),
                custom_metadata: options.custom_metadata,
            },
        );
        Ok(self.resume_multipart_upload(key, &upload_id))
    }

    fn resume_multipart_upload(&self, key: &str, upload_id: &str) -> Box<dyn MultipartUpload> {
        Box::new(MemoryMultipartUpload {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }
}

struct MemoryMultipartUpload {
    inner: Arc<MemoryInner>,
    key: String,
    upload_id: String,
}

impl MemoryMultipartUpload {
    fn missing(&self) -> BlobError {
        BlobError::no_such_upload(&self.key, &self.upload_id)
    }
}

#[async_trait]
impl MultipartUpload for MemoryMultipartUpload {
    fn key(&self) -> &str {
        &self.key
    }

    fn upload_id(&self) -> &str {
        &self.upload_id
    }

    async fn upload_part(&self, part_number: u32, data: Bytes) -> BlobResult<UploadedPart> {
        self.inner.enter(StoreOp::UploadPart)?;
        if part_number == 0 {
            return Err(BlobError::invalid("part numbers start at 1"));
        }
        let mut multipart = self.inner.multipart.write();
        let pending = multipart
            .get_mut(&self.upload_id)
            .filter(|p| p.key == self.key)
            .ok_or_else(|| self.missing())?;

        let etag = sha256_hex(&data);
        pending.parts.insert(part_number, (etag.clone(), data));
        Ok(UploadedPart { part_number, etag })
    }

    async fn complete(&self, parts: Vec<UploadedPart>) -> BlobResult<PutResult> {
        self.inner.enter(StoreOp::Complete)?;
        let pending = {
            let multipart = self.inner.multipart.read();
            let pending = multipart
                .get(&self.upload_id)
                .filter(|p| p.key == self.key)
                .ok_or_else(|| self.missing())?;

            let mut assembled = BytesMut::new();
            for part in &parts {
                match pending.parts.get(&part.part_number) {
                    Some((etag, data)) if *etag == part.etag => assembled.extend_from_slice(data),
                    _ => {
                        return Err(BlobError::invalid(format!(
                            "part {} of {} was not uploaded",
                            part.part_number, self.upload_id
                        )))
                    }
                }
            }
            (assembled.freeze(), pending.custom_metadata.clone())
        };

        self.inner.multipart.write().remove(&self.upload_id);

        let (data, custom_metadata) = pending;
        let size_bytes = data.len() as u64;
        let etag = format!("{}-{}", sha256_hex(&data), parts.len());
        self.inner.objects.write().insert(
            self.key.clone(),
            StoredObject {
                data,
                etag: etag.clone(),
                custom_metadata,
            },
        );
        Ok(PutResult {
            etag: Some(etag),
            size_bytes,
        })
    }

    async fn abort(&self) -> BlobResult<()> {
        self.inner.enter(StoreOp::Abort)?;
        self.inner
            .multipart
            .write()
            .remove(&self.upload_id)
            .map(|_| ())
            .ok_or_else(|| self.missing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_assembles_in_part_order() {
        let store = MemoryObjectStore::new();
        let upload = store
            .create_multipart_upload("obj", MultipartOptions::new().with_metadata("x-checksum-sha256", "abc"))
            .await
            .unwrap();

        let second = upload.upload_part(2, Bytes::from_static(b"world")).await.unwrap();
        let first = upload.upload_part(1, Bytes::from_static(b"hello ")).await.unwrap();
        let result = upload.complete(vec![first, second]).await.unwrap();

        assert_eq!(result.size_bytes, 11);
        assert_eq!(store.object("obj").unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(
            store.object_metadata("obj").unwrap().get("x-checksum-sha256").map(String::as_str),
            Some("abc")
        );
        assert!(store.open_multipart_uploads().is_empty());
    }

    #[tokio::test]
    async fn resumed_handle_sees_existing_transaction() {
        let store = MemoryObjectStore::new();
        let upload = store
            .create_multipart_upload("obj", MultipartOptions::new())
            .await
            .unwrap();
        let first = upload.upload_part(1, Bytes::from_static(b"ab")).await.unwrap();

        let resumed = store.resume_multipart_upload("obj", upload.upload_id());
        let second = resumed.upload_part(2, Bytes::from_static(b"cd")).await.unwrap();
        resumed.complete(vec![first, second]).await.unwrap();

        assert_eq!(store.object("obj").unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn aborted_transaction_is_gone() {
        let store = MemoryObjectStore::new();
        let upload = store
            .create_multipart_upload("obj", MultipartOptions::new())
            .await
            .unwrap();
        upload.abort().await.unwrap();

        assert!(upload.abort().await.unwrap_err().is_no_such_upload());
        assert!(upload
            .upload_part(1, Bytes::from_static(b"x"))
            .await
            .unwrap_err()
            .is_no_such_upload());
        assert!(store.object("obj").is_none());
    }

    #[tokio::test]
    async fn ranged_get_and_missing_keys() {
        let store = MemoryObjectStore::new();
        store.insert("obj", Bytes::from_static(b"0123456789"));

        let got = store.get("obj", Some(ByteRange::new(2, Some(4)))).await.unwrap().unwrap();
        assert_eq!(got.into_bytes().await.unwrap(), Bytes::from_static(b"234"));

        assert!(store.get("nope", None).await.unwrap().is_none());
        assert!(store.head("nope").await.unwrap().is_none());
        store.delete("nope").await.unwrap();
        assert_eq!(store.head("obj").await.unwrap().unwrap().size_bytes, 10);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryObjectStore::new();
        store.fail_next(StoreOp::Delete, 1);

        assert!(store.delete("obj").await.is_err());
        store.delete("obj").await.unwrap();
        assert_eq!(store.calls(StoreOp::Delete), 2);
    }
}
