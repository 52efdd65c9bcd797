//! Persistent per-key upload state.
//!
//! The engine only trusts what is in a `SessionStore`; anything cached in
//! memory is rebuilt from it before bytes are consumed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dog_blob::{sha256_hex, Sha256Digest, UploadedPart};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{TusError, TusResult};

/// One acknowledged multipart part. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPart {
    pub part_number: u32,
    pub length: u64,
    pub etag: String,
}

impl StoredPart {
    pub fn uploaded(&self) -> UploadedPart {
        UploadedPart {
            part_number: self.part_number,
            etag: self.etag.clone(),
        }
    }
}

/// Durable state of one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub key: String,
    pub upload_offset: u64,
    pub upload_length: Option<u64>,
    pub checksum: Option<Sha256Digest>,
    pub multipart_upload_id: Option<String>,
    #[serde(default)]
    pub parts: Vec<StoredPart>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(key: impl Into<String>, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            upload_offset: 0,
            upload_length: None,
            checksum: None,
            multipart_upload_id: None,
            parts: Vec::new(),
            created_at: now,
            expires_at,
        }
    }

    /// Bytes covered by committed parts.
    pub fn part_offset(&self) -> u64 {
        self.parts.iter().map(|p| p.length).sum()
    }
}

/// Storage for upload sessions, keyed by upload key.
///
/// `commit_part` and `set_offset` must land as a single write so a crash
/// never separates a part from the offset that accounts for it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, key: &str) -> TusResult<Option<UploadSession>>;

    async fn save(&self, session: &UploadSession) -> TusResult<()>;

    async fn remove(&self, key: &str) -> TusResult<()>;

    /// Keys whose deadline is at or before `now`.
    async fn expired(&self, now: DateTime<Utc>) -> TusResult<Vec<String>>;

    async fn set_offset(&self, key: &str, offset: u64) -> TusResult<()> {
        let mut session = self.require(key).await?;
        session.upload_offset = offset;
        self.save(&session).await
    }

    async fn commit_part(&self, key: &str, part: StoredPart, offset: u64) -> TusResult<()> {
        let mut session = self.require(key).await?;
        session.parts.push(part);
        session.upload_offset = offset;
        self.save(&session).await
    }

    async fn require(&self, key: &str) -> TusResult<UploadSession> {
        self.load(key)
            .await?
            .ok_or_else(|| TusError::session(format!("no session for {key}")))
    }
}

/// In-memory session store
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, UploadSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn with_session_mut<F>(&self, key: &str, f: F) -> TusResult<()>
    where
        F: FnOnce(&mut UploadSession),
    {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| TusError::session(format!("no session for {key}")))?;
        f(session);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, key: &str) -> TusResult<Option<UploadSession>> {
        Ok(self.sessions.read().get(key).cloned())
    }

    async fn save(&self, session: &UploadSession) -> TusResult<()> {
        self.sessions.write().insert(session.key.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> TusResult<()> {
        self.sessions.write().remove(key);
        Ok(())
    }

    async fn expired(&self, now: DateTime<Utc>) -> TusResult<Vec<String>> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.expires_at <= now)
            .map(|s| s.key.clone())
            .collect())
    }

    async fn set_offset(&self, key: &str, offset: u64) -> TusResult<()> {
        self.with_session_mut(key, |session| session.upload_offset = offset)
    }

    async fn commit_part(&self, key: &str, part: StoredPart, offset: u64) -> TusResult<()> {
        self.with_session_mut(key, |session| {
            session.parts.push(part);
            session.upload_offset = offset;
        })
    }
}

/// One JSON document per session under a directory. Writes go to a
/// temporary file that is renamed into place.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub async fn open(dir: impl AsRef<Path>) -> TusResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(TusError::session)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sha256_hex(key.as_bytes())))
    }

    async fn read(path: &Path) -> TusResult<Option<UploadSession>> {
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw).map(Some).map_err(TusError::session),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TusError::session(e)),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, key: &str) -> TusResult<Option<UploadSession>> {
        Self::read(&self.path_for(key)).await
    }

    async fn save(&self, session: &UploadSession) -> TusResult<()> {
        let path = self.path_for(&session.key);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec(session).map_err(TusError::session)?;
        tokio::fs::write(&tmp, raw).await.map_err(TusError::session)?;
        tokio::fs::rename(&tmp, &path).await.map_err(TusError::session)
    }

    async fn remove(&self, key: &str) -> TusResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TusError::session(e)),
        }
    }

    async fn expired(&self, now: DateTime<Utc>) -> TusResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(TusError::session)?;
        while let Some(entry) = entries.next_entry().await.map_err(TusError::session)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(session)) if session.expires_at <= now => keys.push(session.key),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session"),
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn session(key: &str, expires_in: i64) -> UploadSession {
        let now = Utc::now();
        let mut s = UploadSession::new(key, now, now + TimeDelta::seconds(expires_in));
        s.upload_length = Some(100);
        s.checksum = Some(dog_blob::sha256(b"x"));
        s
    }

    async fn exercise(store: &dyn SessionStore) {
        assert!(store.load("a").await.unwrap().is_none());
        store.save(&session("a", 60)).await.unwrap();
        store.save(&session("b", -60)).await.unwrap();

        let part = StoredPart {
            part_number: 1,
            length: 40,
            etag: "e1".into(),
        };
        store.commit_part("a", part.clone(), 40).await.unwrap();
        store.set_offset("a", 55).await.unwrap();

        let loaded = store.load("a").await.unwrap().unwrap();
        assert_eq!(loaded.parts, vec![part]);
        assert_eq!(loaded.upload_offset, 55);
        assert_eq!(loaded.part_offset(), 40);
        assert_eq!(loaded.checksum, Some(dog_blob::sha256(b"x")));

        assert_eq!(store.expired(Utc::now()).await.unwrap(), vec!["b".to_string()]);

        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert!(store.load("a").await.unwrap().is_none());
        assert!(store.set_offset("a", 1).await.is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        exercise(&MemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path().join("sessions")).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        store.save(&session("apps/1/file.zip", 60)).await.unwrap();

        let reopened = FileSessionStore::open(dir.path()).await.unwrap();
        let loaded = reopened.load("apps/1/file.zip").await.unwrap().unwrap();
        assert_eq!(loaded.key, "apps/1/file.zip");
        assert_eq!(loaded.upload_length, Some(100));
    }
}
