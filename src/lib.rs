//! bleepload library: resumable, concurrent multipart uploads to
//! S3-compatible object storage.
//!
//! A file is planned into parts ([`plan`]), read with positioned reads
//! ([`reader`]), uploaded by a bounded worker pool ([`scheduler`],
//! [`uploader`]) into a multipart session ([`session`]), and completed.
//! Interrupted transfers resume from the server's part listing
//! ([`resume`]).  [`engine::Uploader`] is the entry point.

pub mod config;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod plan;
pub mod progress;
pub mod reader;
pub mod resume;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod storage;
pub mod uploader;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{ObjectIdentity, ResumeStrategy, UploadFailure, UploadHandle, UploadRequest, Uploader};
pub use errors::{ErrorKind, UploadError};
pub use scheduler::CancelMode;
