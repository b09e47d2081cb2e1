//! Abstract multipart storage trait.
//!
//! Every object store client must implement [`MultipartStore`].  The trait
//! covers exactly the S3 operations the upload engine depends on and
//! returns classified [`UploadError`]s so the engine can decide what to
//! retry without knowing the transport.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::errors::UploadError;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UploadError>> + Send + 'a>>;

/// Where an object lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    /// Bucket (container) name.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

impl ObjectLocation {
    /// Create a new location.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Metadata attached to a new object.
#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    /// MIME type, if known.
    pub content_type: Option<String>,
    /// User metadata (`x-amz-meta-*` without the prefix).
    pub user: HashMap<String, String>,
}

/// Server acknowledgement of a finished object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObjectInfo {
    /// ETag of the final object.
    pub etag: String,
    /// Version id, when the bucket is versioned.
    pub version_id: Option<String>,
}

/// A part the server has durably received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedPart {
    /// 1-based part number.
    pub number: u32,
    /// ETag issued when the part was uploaded.
    pub etag: String,
    /// Size in bytes.
    pub size: u64,
}

/// An open multipart session found by listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    /// Server-assigned session id.
    pub upload_id: String,
    /// Object key the session targets.
    pub key: String,
    /// When the session was initiated.
    pub initiated: Option<DateTime<Utc>>,
}

/// Async multipart object storage contract.
pub trait MultipartStore: Send + Sync + 'static {
    /// Open a multipart session, returning its id.
    fn create_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        metadata: &'a ObjectMetadata,
    ) -> StoreFuture<'a, String>;

    /// Upload one part, returning its ETag.  `content_md5` is the base64
    /// MD5 of `data`; the server rejects the body if it does not match.
    fn upload_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        part_number: u32,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StoreFuture<'a, String>;

    /// List every part the server holds for a session, in part order.
    fn list_parts<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StoreFuture<'a, Vec<ListedPart>>;

    /// Combine the given parts, in ascending part order, into the final
    /// object.
    fn complete_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        parts: &'a [(u32, String)],
    ) -> StoreFuture<'a, StoredObjectInfo>;

    /// Release the storage held by an unfinished session.
    fn abort_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// List open sessions in `bucket` whose key starts with `prefix`.
    fn list_multipart_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StoreFuture<'a, Vec<UploadSummary>>;

    /// Upload a whole object in a single request.
    fn put_object<'a>(
        &'a self,
        location: &'a ObjectLocation,
        data: Bytes,
        content_md5: Option<String>,
        metadata: &'a ObjectMetadata,
    ) -> StoreFuture<'a, StoredObjectInfo>;
}
