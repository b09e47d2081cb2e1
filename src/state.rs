//! Local session records.
//!
//! When a multipart transfer stops with its session still open, the
//! session id, sizes and known-done parts are written to a small JSON
//! file so a later run can resume.  One file per (bucket, key), named by
//! the SHA-256 of `bucket/key`.  Writes go to a temp file and are renamed
//! into place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::UploadError;

/// Persisted view of an open multipart session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Server-assigned upload id.
    pub session_id: String,
    /// Target bucket.
    pub bucket: String,
    /// Target key.
    pub key: String,
    /// Size of the source when the session was opened.
    pub total_size: u64,
    /// Part size of the plan the session was opened with.
    pub part_size: u64,
    /// Part number -> ETag for parts known to be acknowledged.
    #[serde(default)]
    pub completed: BTreeMap<u32, String>,
    /// Last time the record was written.
    pub updated_at: DateTime<Utc>,
}

/// Directory of session records.
#[derive(Debug, Clone)]
pub struct SessionStateStore {
    dir: PathBuf,
}

impl SessionStateStore {
    /// Use `dir` for records; it is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(bucket.as_bytes());
        hasher.update(b"/");
        hasher.update(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(hasher.finalize())))
    }

    /// Load the record for `bucket/key`, if any.
    ///
    /// A corrupt record is logged and treated as absent.
    pub async fn load(&self, bucket: &str, key: &str) -> Result<Option<SessionRecord>, UploadError> {
        let path = self.record_path(bucket, key);
        let contents = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<SessionRecord>(&contents) {
            Ok(record) if record.bucket == bucket && record.key == key => Ok(Some(record)),
            Ok(_) => {
                warn!(path = %path.display(), "Session record belongs to another object, ignoring");
                Ok(None)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt session record, ignoring");
                Ok(None)
            }
        }
    }

    /// Write `record`, replacing any previous one for the same object.
    pub async fn save(&self, record: &SessionRecord) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(&record.bucket, &record.key);
        let tmp_path = path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| UploadError::Internal(anyhow::anyhow!("serialize session record: {e}")))?;
        tokio::fs::write(&tmp_path, body).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        debug!(
            session_id = %record.session_id,
            parts = record.completed.len(),
            path = %path.display(),
            "Saved session record"
        );
        Ok(())
    }

    /// Remove the record for `bucket/key`.  Missing records are fine.
    pub async fn remove(&self, bucket: &str, key: &str) -> Result<(), UploadError> {
        match tokio::fs::remove_file(self.record_path(bucket, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// -- Tests -------------------------------------------------------------------
