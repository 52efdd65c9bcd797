//! Library template created with FerrisUp

//! dog-axum: Axum adapter for DogRS resumable uploads.
//!
//! Exposes the tus routes over any `dog_tus::ResumableUploads` engine and
//! a small server wrapper that mounts them under a base path.

pub mod app;
pub mod headers;
pub mod tus;
mod error;
pub use error::DogAxumError;

pub use app::{ServerConfig, TusApp};
pub use tus::{tus_router, TusState};
