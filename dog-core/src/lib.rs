//! Library template created with FerrisUp

//! dog-core: transport-agnostic errors and configuration shared by the
//! DogRS upload crates.

pub mod config;
pub mod errors;

pub use config::{DogConfig, DogConfigSnapshot};
pub use errors::{DogError, DogResult, ErrorKind};
