//! # dog-blob: object storage capability for DogRS
//!
//! `dog-blob` is the storage seam under the resumable upload engine. It
//! exposes the handful of primitives the engine needs and nothing more:
//!
//! - single-shot writes with an optional SHA-256 the backend must enforce
//! - multipart transactions that can be re-attached by id after a restart
//! - ranged reads, heads and deletes
//!
//! Every backend call is expected to go through [`RetryStore`], which adds
//! bounded exponential backoff with per-operation retry rules.
//!
//! ```text
//! ┌─────────────────┐
//! │  Upload engine  │  ← protocol state machine
//! ├─────────────────┤
//! │   RetryStore    │  ← backoff + retry policy
//! ├─────────────────┤
//! │   ObjectStore   │  ← S3 / memory
//! └─────────────────┘
//! ```
//!
//! ```rust
//! use std::sync::Arc;
//! use dog_blob::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> BlobResult<()> {
//! let store = RetryStore::new(Arc::new(MemoryObjectStore::new()), RetryParams::default());
//! store.put("hello.txt", bytes::Bytes::from_static(b"hi"), None).await?;
//! assert_eq!(store.head("hello.txt").await?.map(|h| h.size_bytes), Some(2));
//! # Ok(())
//! # }
//! ```

mod error;
mod types;

pub mod memory;
pub mod retry;
pub mod s3_store;
pub mod store;

pub use error::{BlobError, BlobResult};
pub use memory::{MemoryObjectStore, StoreOp};
pub use retry::{retry, RetryMultipartUpload, RetryParams, RetryStore};
pub use s3_store::{S3Config, S3ObjectStore};
pub use store::{GetResult, MultipartOptions, MultipartUpload, ObjectHead, ObjectStore, PutResult, UploadedPart};
pub use types::{sha256, sha256_hex, ByteRange, ByteStream, Sha256Digest};

/// Convenience re-exports for common usage
pub mod prelude {
    pub use crate::{
        BlobError, BlobResult, ByteRange, ByteStream, MemoryObjectStore, MultipartOptions, MultipartUpload,
        ObjectStore, RetryParams, RetryStore, Sha256Digest, UploadedPart,
    };
}
