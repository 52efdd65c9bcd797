//! Per-key upload state machine. Everything here runs with the key's lock
//! held; the registry in `coordinator` hands out the locks.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dog_blob::{
    sha256, sha256_hex, BlobError, ByteStream, MultipartOptions, MultipartUpload, ObjectStore, RetryStore,
    Sha256Digest, UploadedPart,
};
use futures_util::StreamExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::coordinator::{Created, Patched, PatchRequest, UploadStatus, CHECKSUM_METADATA_KEY};
use crate::metadata::encode_checksum;
use crate::parts::{Part, PartBuffer, PartReader};
use crate::session::{SessionStore, StoredPart, UploadSession};
use crate::{Digester, TusConfig, TusError, TusResult};

/// Collaborators shared by every handler
pub(crate) struct Shared {
    pub store: RetryStore,
    pub sessions: Arc<dyn SessionStore>,
    pub config: TusConfig,
}

/// A validated create request
#[derive(Debug, Clone)]
pub(crate) struct NewUpload {
    pub key: String,
    pub upload_length: Option<u64>,
    pub checksum: Option<Sha256Digest>,
}

#[derive(Default)]
pub(crate) struct HandlerState {
    /// Cached transaction handle, only trusted when its id matches the
    /// persisted one.
    multipart: Option<Box<dyn MultipartUpload>>,
    /// A session exists for this key.
    live: bool,
}

pub(crate) struct UploadHandler {
    key: String,
    state: Mutex<HandlerState>,
}

impl UploadHandler {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(HandlerState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn lock<'a>(&'a self, shared: &'a Shared) -> Locked<'a> {
        Locked {
            shared,
            key: &self.key,
            state: self.state.lock().await,
        }
    }

    /// Unlocked and without a session.
    pub fn is_idle(&self) -> bool {
        self.state.try_lock().map(|s| !s.live).unwrap_or(false)
    }
}

pub(crate) struct Locked<'a> {
    shared: &'a Shared,
    key: &'a str,
    state: MutexGuard<'a, HandlerState>,
}

impl Locked<'_> {
    /// Clean up before surfacing an unrecoverable error, so the next
    /// request for this key sees no session.
    pub async fn settle<T>(&mut self, result: TusResult<T>) -> TusResult<T> {
        if let Err(e) = &result {
            if e.is_unrecoverable() {
                error!(key = %self.key, error = %e, "Upload failed with unrecoverable error");
                self.cleanup(true).await;
            }
        }
        result
    }

    pub async fn create(
        &mut self,
        upload: NewUpload,
        body: Option<ByteStream>,
        now: DateTime<Utc>,
    ) -> TusResult<Created> {
        let shared = self.shared;
        if let Some(existing) = shared.sessions.load(self.key).await? {
            let offset = existing.upload_offset;
            self.cleanup(true).await;
            if offset > 0 {
                warn!(key = %self.key, offset, "Rejecting create over an upload in progress");
                return Err(TusError::DuplicateUpload {
                    key: self.key.to_string(),
                    offset,
                });
            }
        }

        let expires_at = shared.config.expires_from(now);
        let mut session = UploadSession::new(self.key, now, expires_at);
        session.upload_length = upload.upload_length;
        session.checksum = upload.checksum;
        shared.sessions.save(&session).await?;
        self.state.multipart = None;
        self.state.live = true;
        info!(key = %self.key, upload_length = ?session.upload_length, "Upload created");

        // A declared empty object is complete as soon as it exists.
        let body = match (body, session.upload_length) {
            (Some(body), _) => Some(body),
            (None, Some(0)) => Some(empty_body()),
            (None, _) => None,
        };
        let upload_offset = match body {
            Some(body) => self.append_body(session, body).await?,
            None => 0,
        };

        Ok(Created {
            key: self.key.to_string(),
            upload_offset,
            expires_at,
        })
    }

    pub async fn head(&mut self, now: DateTime<Utc>) -> TusResult<UploadStatus> {
        if let Some(session) = self.shared.sessions.load(self.key).await? {
            return Ok(UploadStatus {
                upload_offset: session.upload_offset,
                upload_length: session.upload_length,
                expires_at: session.expires_at,
            });
        }

        match self.shared.store.head(self.key).await {
            Ok(Some(head)) => Ok(UploadStatus {
                upload_offset: head.size_bytes,
                upload_length: Some(head.size_bytes),
                expires_at: now,
            }),
            Ok(None) => Err(TusError::NotFound {
                key: self.key.to_string(),
            }),
            Err(e) => Err(self.storage_err(e)),
        }
    }

    pub async fn patch(
        &mut self,
        request: PatchRequest,
        body: Option<ByteStream>,
        now: DateTime<Utc>,
    ) -> TusResult<Patched> {
        let shared = self.shared;
        let Some(mut session) = shared.sessions.load(self.key).await? else {
            return Err(TusError::NotFound {
                key: self.key.to_string(),
            });
        };
        self.state.live = true;

        if let Some(content_type) = &request.content_type {
            if !crate::coordinator::is_offset_content_type(content_type) {
                return Err(TusError::UnsupportedMediaType {
                    content_type: Some(content_type.clone()),
                });
            }
        }

        if request.upload_offset != Some(session.upload_offset) {
            return Err(TusError::OffsetMismatch {
                key: self.key.to_string(),
                expected: session.upload_offset,
                received: request.upload_offset,
            });
        }

        if let Some(length) = request.upload_length {
            match session.upload_length {
                Some(expected) if expected != length => {
                    return Err(TusError::LengthMismatch {
                        key: self.key.to_string(),
                        expected,
                        received: length,
                    })
                }
                Some(_) => {}
                None => session.upload_length = Some(length),
            }
        }

        let Some(body) = body else {
            return Err(TusError::EmptyBody {
                key: self.key.to_string(),
            });
        };

        session.expires_at = shared.config.expires_from(now);
        let expires_at = session.expires_at;
        shared.sessions.save(&session).await?;

        let upload_offset = self.append_body(session, body).await?;
        Ok(Patched {
            upload_offset,
            expires_at,
        })
    }

    /// Destroy the session if its deadline is still due. A patch may have
    /// re-armed it since the caller looked.
    pub async fn expire(&mut self, now: DateTime<Utc>) -> TusResult<bool> {
        match self.shared.sessions.load(self.key).await? {
            Some(session) if session.expires_at <= now => {
                info!(key = %self.key, offset = session.upload_offset, "Upload expired");
                self.cleanup(true).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Best-effort removal of backend leftovers, then unconditional removal
    /// of the session. With `with_key`, any open multipart transaction is
    /// re-attached from the persisted id and aborted.
    pub async fn cleanup(&mut self, with_key: bool) {
        let shared = self.shared;
        if let Err(e) = shared.store.delete(&self.spill_key()).await {
            warn!(key = %self.key, error = %e, "Failed to delete spill object");
        }

        if with_key {
            match shared.sessions.load(self.key).await {
                Ok(Some(session)) => {
                    if let Some(upload_id) = session.multipart_upload_id.as_deref() {
                        self.attach_multipart(upload_id);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key = %self.key, error = %e, "Failed to load session during cleanup"),
            }
            if let Some(upload) = self.state.multipart.as_ref() {
                if let Err(e) = upload.abort().await {
                    warn!(key = %self.key, upload_id = upload.upload_id(), error = %e, "Failed to abort multipart upload");
                }
            }
        }

        self.state.multipart = None;
        self.state.live = false;
        if let Err(e) = shared.sessions.remove(self.key).await {
            error!(key = %self.key, error = %e, "Failed to remove upload session");
        }
    }

    /// Stream `body` into storage starting at the session's offset. Returns
    /// the new offset.
    async fn append_body(&mut self, mut session: UploadSession, body: ByteStream) -> TusResult<u64> {
        let config = &self.shared.config;
        let (max, buffer_size) = (config.max_upload_length, config.buffer_size);
        if let Some(length) = session.upload_length {
            if length > max {
                self.cleanup(true).await;
                return Err(TusError::ExceedsMaxLength {
                    key: self.key.to_string(),
                    offset: length,
                    max,
                });
            }
        }

        let mut buffer = PartBuffer::new(buffer_size);
        let mut offset = self.resume(&session, &mut buffer).await?;

        // The streamed digest only covers the object when this buffer starts it.
        let mut digester = match session.checksum {
            Some(_) if offset == 0 => Digester::sha256(),
            _ => Digester::Noop,
        };

        let mut reader = PartReader::new(body, buffer);
        while let Some(part) = reader.next_part().await {
            let new_offset = offset + part.len();
            if let Some(length) = session.upload_length {
                if new_offset > length {
                    self.cleanup(true).await;
                    return Err(TusError::ExceedsUploadLength {
                        key: self.key.to_string(),
                        offset: new_offset,
                        length,
                    });
                }
            }
            if new_offset > max {
                self.cleanup(true).await;
                return Err(TusError::ExceedsMaxLength {
                    key: self.key.to_string(),
                    offset: new_offset,
                    max,
                });
            }
            digester.update(part.bytes());

            match part {
                Part::Intermediate(bytes) => {
                    self.upload_intermediate(&mut session, bytes, new_offset).await?;
                }
                Part::Final(bytes) => {
                    self.finish(&mut session, bytes, new_offset, &mut digester).await?;
                }
                Part::Error { bytes, error } => {
                    warn!(key = %self.key, offset = new_offset, error = %error, "Request body failed mid-read");
                    self.finish(&mut session, bytes, new_offset, &mut digester).await?;
                }
            }
            offset = new_offset;
        }

        Ok(offset)
    }

    /// Rebuild the part list and spill buffer from persisted state. Returns
    /// the object offset of the buffer's first byte.
    async fn resume(&mut self, session: &UploadSession, buffer: &mut PartBuffer) -> TusResult<u64> {
        let stored = session.upload_offset;
        if stored == 0 && session.parts.is_empty() {
            return Ok(0);
        }

        for (index, part) in session.parts.iter().enumerate() {
            if part.part_number as usize != index + 1 {
                return Err(self.unrecoverable(format!(
                    "stored part {} found at position {}",
                    part.part_number,
                    index + 1
                )));
            }
        }
        if !session.parts.is_empty() {
            let upload_id = session.multipart_upload_id.as_deref().ok_or_else(|| {
                self.unrecoverable(format!(
                    "had {} stored parts but no stored multipart upload id",
                    session.parts.len()
                ))
            })?;
            self.attach_multipart(upload_id);
        }

        let part_offset = session.part_offset();
        if part_offset > stored {
            return Err(self.unrecoverable(format!(
                "parts cover {part_offset} bytes but the offset is {stored}"
            )));
        }
        if part_offset == stored {
            return Ok(part_offset);
        }

        let spill = self
            .shared
            .store
            .get(&self.spill_key(), None)
            .await
            .map_err(|e| self.storage_err(e))?
            .ok_or_else(|| self.unrecoverable(format!("we claimed to have {stored} bytes, only had {part_offset}")))?;
        if spill.size_bytes > buffer.capacity() as u64 {
            return Err(self.unrecoverable(format!("spill object of length {} exceeds the buffer", spill.size_bytes)));
        }

        let data = spill.into_bytes().await.map_err(|e| self.storage_err(e))?;
        if part_offset + data.len() as u64 != stored || data.len() > buffer.capacity() {
            return Err(self.unrecoverable(format!(
                "we claimed to have {stored} bytes, had {}",
                part_offset + data.len() as u64
            )));
        }

        buffer.fill(&data);
        debug!(key = %self.key, part_offset, spilled = data.len(), "Resumed upload from spill object");
        Ok(part_offset)
    }

    async fn upload_intermediate(&mut self, session: &mut UploadSession, bytes: Bytes, new_offset: u64) -> TusResult<()> {
        self.ensure_multipart(session).await?;
        let part_number = session.parts.len() as u32 + 1;
        let length = bytes.len() as u64;

        let uploaded = self
            .multipart()?
            .upload_part(part_number, bytes)
            .await
            .map_err(|e| self.storage_err(e))?;

        let part = StoredPart {
            part_number,
            length,
            etag: uploaded.etag,
        };
        self.shared.sessions.commit_part(self.key, part.clone(), new_offset).await?;
        session.parts.push(part);
        session.upload_offset = new_offset;
        debug!(key = %self.key, part_number, offset = new_offset, "Committed part");
        Ok(())
    }

    /// Handle the last part of a request body: spill it when the upload is
    /// still short, otherwise complete the object.
    async fn finish(
        &mut self,
        session: &mut UploadSession,
        bytes: Bytes,
        new_offset: u64,
        digester: &mut Digester,
    ) -> TusResult<()> {
        if session.upload_length != Some(new_offset) {
            if !bytes.is_empty() {
                self.shared
                    .store
                    .put(&self.spill_key(), bytes, None)
                    .await
                    .map_err(|e| self.storage_err(e))?;
            }
            if new_offset != session.upload_offset {
                self.shared.sessions.set_offset(self.key, new_offset).await?;
                session.upload_offset = new_offset;
            }
            debug!(key = %self.key, offset = new_offset, "Spilled partial buffer");
            return Ok(());
        }

        if session.multipart_upload_id.is_none() {
            self.put_whole(session, bytes).await?;
        } else {
            self.complete_multipart(session, bytes, std::mem::take(digester)).await?;
        }

        info!(key = %self.key, length = new_offset, parts = session.parts.len(), "Upload complete");
        self.cleanup(false).await;
        Ok(())
    }

    /// The whole object fits in one buffer starting at offset 0.
    async fn put_whole(&mut self, session: &UploadSession, bytes: Bytes) -> TusResult<()> {
        if let Some(expected) = session.checksum {
            if sha256(&bytes) != expected {
                return Err(self.reject_checksum().await);
            }
        }

        match self.shared.store.put(self.key, bytes, session.checksum).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_checksum_mismatch() => Err(self.reject_checksum().await),
            Err(e) => Err(self.storage_err(e)),
        }
    }

    async fn complete_multipart(&mut self, session: &mut UploadSession, bytes: Bytes, digester: Digester) -> TusResult<()> {
        self.ensure_multipart(session).await?;
        let mut parts: Vec<UploadedPart> = session.parts.iter().map(StoredPart::uploaded).collect();

        // A body ending on a buffer boundary leaves nothing for the last part.
        if !bytes.is_empty() || parts.is_empty() {
            let part_number = parts.len() as u32 + 1;
            let last = self
                .multipart()?
                .upload_part(part_number, bytes)
                .await
                .map_err(|e| self.storage_err(e))?;
            parts.push(last);
        }

        let streamed = digester.finish();
        if let (Some(expected), Some(actual)) = (session.checksum, streamed) {
            if expected != actual {
                return Err(self.reject_checksum().await);
            }
        }

        self.multipart()?
            .complete(parts)
            .await
            .map_err(|e| self.storage_err(e))?;

        if let (Some(expected), None) = (session.checksum, streamed) {
            if self.readback_digest().await? != expected {
                if let Err(e) = self.shared.store.delete(self.key).await {
                    warn!(key = %self.key, error = %e, "Failed to delete object with bad checksum");
                }
                return Err(self.reject_checksum().await);
            }
        }
        Ok(())
    }

    /// SHA-256 of the assembled object as stored.
    async fn readback_digest(&self) -> TusResult<Sha256Digest> {
        let object = self
            .shared
            .store
            .get(self.key, None)
            .await
            .map_err(|e| self.storage_err(e))?
            .ok_or_else(|| self.unrecoverable(format!("object {} not found directly after uploading", self.key)))?;

        let mut digester = Digester::sha256();
        let mut stream = object.stream;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.storage_err(BlobError::from(e)))?;
            digester.update(&chunk);
        }
        digester
            .finish()
            .ok_or_else(|| self.unrecoverable("digest unavailable after readback"))
    }

    async fn reject_checksum(&mut self) -> TusError {
        warn!(key = %self.key, "Checksum mismatch, discarding upload");
        self.cleanup(true).await;
        TusError::ChecksumMismatch {
            key: self.key.to_string(),
        }
    }

    /// Make sure a transaction handle is attached, opening and persisting a
    /// new transaction when the session has none.
    async fn ensure_multipart(&mut self, session: &mut UploadSession) -> TusResult<()> {
        if let Some(upload_id) = session.multipart_upload_id.clone() {
            self.attach_multipart(&upload_id);
            return Ok(());
        }

        let mut options = MultipartOptions::new();
        if let Some(checksum) = &session.checksum {
            options = options.with_metadata(CHECKSUM_METADATA_KEY, encode_checksum(checksum));
        }
        let upload = self
            .shared
            .store
            .create_multipart_upload(self.key, options)
            .await
            .map_err(|e| self.storage_err(e))?;

        session.multipart_upload_id = Some(upload.upload_id().to_string());
        self.shared.sessions.save(session).await?;
        info!(key = %self.key, upload_id = upload.upload_id(), "Opened multipart upload");
        self.state.multipart = Some(upload);
        Ok(())
    }

    fn attach_multipart(&mut self, upload_id: &str) {
        let cached = self
            .state
            .multipart
            .as_ref()
            .is_some_and(|m| m.upload_id() == upload_id);
        if !cached {
            self.state.multipart = Some(self.shared.store.resume_multipart_upload(self.key, upload_id));
        }
    }

    fn multipart(&self) -> TusResult<&dyn MultipartUpload> {
        self.state
            .multipart
            .as_deref()
            .ok_or_else(|| self.unrecoverable("no multipart upload attached"))
    }

    fn spill_key(&self) -> String {
        format!("{}{}", self.shared.config.spill_prefix, sha256_hex(self.key.as_bytes()))
    }

    fn storage_err(&self, err: BlobError) -> TusError {
        TusError::storage(self.key, err)
    }

    fn unrecoverable(&self, reason: impl Into<String>) -> TusError {
        TusError::unrecoverable(self.key, reason)
    }
}

fn empty_body() -> ByteStream {
    Box::pin(futures_util::stream::empty::<std::io::Result<Bytes>>())
}
