//! In-memory S3-compatible multipart store.
//!
//! Objects, open sessions and completed sessions are held in
//! `tokio::sync::RwLock<HashMap<...>>` maps.  Part and object ETags are
//! quoted MD5 hex digests and completed multipart objects get the S3
//! composite ETag (`md5(concat(part md5s))-N`), so identities match what
//! a real S3 endpoint returns for the same bytes.
//!
//! Used by tests and by the `memory` backend for dry runs.

use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::backend::{
    ListedPart, MultipartStore, ObjectLocation, ObjectMetadata, StoreFuture, StoredObjectInfo,
    UploadSummary,
};
use crate::errors::UploadError;

/// A stored object.
#[derive(Debug, Clone)]
pub struct MemoryObject {
    /// Object bytes.
    pub data: Bytes,
    /// Quoted ETag.
    pub etag: String,
    /// Metadata supplied at creation.
    pub content_type: Option<String>,
    /// User metadata supplied at creation.
    pub user_metadata: HashMap<String, String>,
}

/// An open multipart session.
#[derive(Debug)]
struct PendingUpload {
    location: ObjectLocation,
    metadata: ObjectMetadata,
    initiated: DateTime<Utc>,
    parts: BTreeMap<u32, (Bytes, String)>,
}

/// In-memory storage backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// "bucket/key" -> object.
    objects: RwLock<HashMap<String, MemoryObject>>,
    /// upload_id -> open session.
    uploads: RwLock<HashMap<String, PendingUpload>>,
    /// upload_id -> identity returned when it completed.
    completed: RwLock<HashMap<String, StoredObjectInfo>>,
    /// Minimum size for every part but the last (S3 uses 5 MiB).
    min_part_size: u64,
    /// Count of objects written, for duplicate detection in tests.
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store with no minimum part size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store enforcing `min_part_size` on all but the last part.
    pub fn with_min_part_size(min_part_size: u64) -> Self {
        Self {
            min_part_size,
            ..Self::default()
        }
    }

    /// Fetch a stored object.
    pub async fn get_object(&self, bucket: &str, key: &str) -> Option<MemoryObject> {
        self.objects
            .read()
            .await
            .get(&storage_key(bucket, key))
            .cloned()
    }

    /// Number of objects currently stored.
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Number of object writes (PutObject + successful first completes).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of parts held for an open session.
    pub async fn part_count(&self, upload_id: &str) -> Option<usize> {
        self.uploads
            .read()
            .await
            .get(upload_id)
            .map(|u| u.parts.len())
    }

    /// Compute the quoted MD5-hex ETag for a byte slice.
    pub fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    /// Compute the composite ETag of a multipart object from its part ETags.
    pub fn composite_etag(part_etags: &[&str]) -> String {
        let mut combined = Vec::with_capacity(part_etags.len() * 16);
        for etag in part_etags {
            if let Ok(bytes) = hex::decode(etag.trim_matches('"')) {
                combined.extend_from_slice(&bytes);
            }
        }
        let mut hasher = Md5::new();
        hasher.update(&combined);
        format!("\"{}-{}\"", hex::encode(hasher.finalize()), part_etags.len())
    }

    fn check_digest(
        operation: &'static str,
        data: &[u8],
        content_md5: Option<&str>,
    ) -> Result<(), UploadError> {
        let Some(expected) = content_md5 else {
            return Ok(());
        };
        let actual = base64::engine::general_purpose::STANDARD.encode(Md5::digest(data));
        if actual != expected {
            return Err(UploadError::ChecksumMismatch {
                operation,
                message: format!("Content-MD5 {expected} does not match body digest {actual}"),
            });
        }
        Ok(())
    }

    async fn store_object(&self, location: &ObjectLocation, object: MemoryObject) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.objects
            .write()
            .await
            .insert(storage_key(&location.bucket, &location.key), object);
    }
}

fn storage_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

fn no_such_upload(upload_id: &str) -> UploadError {
    UploadError::SessionExpired {
        session_id: upload_id.to_string(),
    }
}

impl MultipartStore for MemoryStore {
    fn create_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        metadata: &'a ObjectMetadata,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let upload_id = uuid::Uuid::new_v4().simple().to_string();
            self.uploads.write().await.insert(
                upload_id.clone(),
                PendingUpload {
                    location: location.clone(),
                    metadata: metadata.clone(),
                    initiated: Utc::now(),
                    parts: BTreeMap::new(),
                },
            );
            tracing::debug!(%location, upload_id, "memory: created multipart upload");
            Ok(upload_id)
        })
    }

    fn upload_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        part_number: u32,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            if !(1..=10_000).contains(&part_number) {
                return Err(UploadError::Rejected {
                    operation: "upload_part",
                    message: format!("part number {part_number} is out of range"),
                });
            }
            Self::check_digest("upload_part", &data, content_md5.as_deref())?;

            let mut uploads = self.uploads.write().await;
            let upload = uploads
                .get_mut(upload_id)
                .filter(|u| u.location == *location)
                .ok_or_else(|| no_such_upload(upload_id))?;
            let etag = Self::compute_etag(&data);
            upload.parts.insert(part_number, (data, etag.clone()));
            Ok(etag)
        })
    }

    fn list_parts<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StoreFuture<'a, Vec<ListedPart>> {
        Box::pin(async move {
            let uploads = self.uploads.read().await;
            let upload = uploads
                .get(upload_id)
                .filter(|u| u.location == *location)
                .ok_or_else(|| no_such_upload(upload_id))?;
            Ok(upload
                .parts
                .iter()
                .map(|(number, (data, etag))| ListedPart {
                    number: *number,
                    etag: etag.clone(),
                    size: data.len() as u64,
                })
                .collect())
        })
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        parts: &'a [(u32, String)],
    ) -> StoreFuture<'a, StoredObjectInfo> {
        Box::pin(async move {
            // Completing an already-completed session returns the same identity.
            if let Some(info) = self.completed.read().await.get(upload_id) {
                return Ok(info.clone());
            }

            let rejected = |message: String| UploadError::CompleteRejected {
                session_id: upload_id.to_string(),
                message,
            };

            let mut uploads = self.uploads.write().await;
            let upload = uploads
                .get(upload_id)
                .filter(|u| u.location == *location)
                .ok_or_else(|| no_such_upload(upload_id))?;

            if parts.is_empty() {
                return Err(rejected("at least one part must be specified".into()));
            }
            if parts.windows(2).any(|w| w[0].0 >= w[1].0) {
                return Err(rejected(
                    "the list of parts was not in ascending order".into(),
                ));
            }

            let mut body = BytesMut::new();
            let mut etags = Vec::with_capacity(parts.len());
            for (idx, (number, etag)) in parts.iter().enumerate() {
                let (data, stored_etag) = upload
                    .parts
                    .get(number)
                    .ok_or_else(|| rejected(format!("part {number} was never uploaded")))?;
                if stored_etag.trim_matches('"') != etag.trim_matches('"') {
                    return Err(rejected(format!("part {number} has a different ETag")));
                }
                if idx + 1 < parts.len() && (data.len() as u64) < self.min_part_size {
                    return Err(UploadError::Rejected {
                        operation: "complete_multipart_upload",
                        message: format!("part {number} is smaller than the minimum part size"),
                    });
                }
                body.extend_from_slice(data);
                etags.push(stored_etag.as_str());
            }

            let info = StoredObjectInfo {
                etag: Self::composite_etag(&etags),
                version_id: None,
            };
            let object = MemoryObject {
                data: body.freeze(),
                etag: info.etag.clone(),
                content_type: upload.metadata.content_type.clone(),
                user_metadata: upload.metadata.user.clone(),
            };
            uploads.remove(upload_id);
            drop(uploads);

            self.store_object(location, object).await;
            self.completed
                .write()
                .await
                .insert(upload_id.to_string(), info.clone());
            Ok(info)
        })
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut uploads = self.uploads.write().await;
            match uploads.get(upload_id) {
                Some(upload) if upload.location == *location => {
                    uploads.remove(upload_id);
                    Ok(())
                }
                _ => Err(no_such_upload(upload_id)),
            }
        })
    }

    fn list_multipart_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StoreFuture<'a, Vec<UploadSummary>> {
        Box::pin(async move {
            let uploads = self.uploads.read().await;
            let mut listed: Vec<UploadSummary> = uploads
                .iter()
                .filter(|(_, u)| u.location.bucket == bucket && u.location.key.starts_with(prefix))
                .map(|(id, u)| UploadSummary {
                    upload_id: id.clone(),
                    key: u.location.key.clone(),
                    initiated: Some(u.initiated),
                })
                .collect();
            listed.sort_by(|a, b| a.key.cmp(&b.key).then(a.initiated.cmp(&b.initiated)));
            Ok(listed)
        })
    }

    fn put_object<'a>(
        &'a self,
        location: &'a ObjectLocation,
        data: Bytes,
        content_md5: Option<String>,
        metadata: &'a ObjectMetadata,
    ) -> StoreFuture<'a, StoredObjectInfo> {
        Box::pin(async move {
            Self::check_digest("put_object", &data, content_md5.as_deref())?;
            let etag = Self::compute_etag(&data);
            self.store_object(
                location,
                MemoryObject {
                    data,
                    etag: etag.clone(),
                    content_type: metadata.content_type.clone(),
                    user_metadata: metadata.user.clone(),
                },
            )
            .await;
            Ok(StoredObjectInfo {
                etag,
                version_id: None,
            })
        })
    }
}

// -- Tests -------------------------------------------------------------------
