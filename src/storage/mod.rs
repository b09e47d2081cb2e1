//! Object storage clients.
//!
//! The [`backend::MultipartStore`] trait abstracts over the S3-compatible
//! service the engine talks to.  Implementations include the AWS SDK
//! client and an in-memory store used for tests and dry runs.

use base64::Engine as _;
use md5::{Digest, Md5};

pub mod aws;
pub mod backend;
pub mod memory;

/// Base64-encoded MD5 of `data`, as sent in the `Content-MD5` header.
pub fn content_md5(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Md5::digest(data))
}
