//! # dog-tus
//!
//! Resumable upload engine speaking the semantics of the tus 1.0 protocol
//! over any [`dog_blob::ObjectStore`].
//!
//! Uploads are addressed by object key. Bytes are buffered into fixed-size
//! parts; full parts go to a multipart transaction and a trailing short part
//! is parked in a spill object until the next append. All progress lives in
//! a [`SessionStore`], so a fresh process picks up where the last one left
//! off.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_blob::MemoryObjectStore;
//! use dog_tus::{CreateRequest, MemorySessionStore, ResumableUploads, TusConfig, TusCoordinator};
//!
//! # async fn run() -> dog_tus::TusResult<()> {
//! let uploads = TusCoordinator::new(
//!     Arc::new(MemoryObjectStore::new()),
//!     Arc::new(MemorySessionStore::new()),
//!     TusConfig::default(),
//! );
//! let created = uploads
//!     .create(CreateRequest::for_key("apps/1/bundle.zip").with_length(1024), None)
//!     .await?;
//! assert_eq!(created.upload_offset, 0);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
mod digest;
mod error;
mod handler;
pub mod metadata;
pub mod parts;
pub mod reaper;
pub mod session;

pub use config::TusConfig;
pub use coordinator::{
    is_offset_content_type, CreateRequest, Created, PatchRequest, Patched, ResumableUploads, TusCoordinator,
    UploadStatus, CHECKSUM_METADATA_KEY, OFFSET_CONTENT_TYPE,
};
pub use digest::Digester;
pub use error::{Classification, TusError, TusResult};
pub use metadata::{encode_checksum, encode_filename, parse_checksum, parse_upload_metadata, UploadMetadata};
pub use reaper::ExpirationReaper;
pub use session::{FileSessionStore, MemorySessionStore, SessionStore, StoredPart, UploadSession};
