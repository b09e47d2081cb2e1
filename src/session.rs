//! Multipart session state and lifecycle.
//!
//! [`UploadSession`] is the in-memory record of one multipart transfer:
//! the server-assigned id, the part map, and a status that moves through
//!
//! ```text
//! Planning -> InProgress -> Completing -> Completed
//!                 |             |
//!                 v             v
//!              Aborted <---- Failed ---> InProgress (re-upload) / Completing (retry)
//! ```
//!
//! [`SessionManager`] issues the session-level calls (initiate, complete,
//! abort) and keeps the local resume record in step.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::errors::{ErrorKind, UploadError};
use crate::plan::PartSpec;
use crate::resume::ResumeResolver;
use crate::state::{SessionRecord, SessionStateStore};
use crate::storage::backend::{MultipartStore, ObjectLocation, ObjectMetadata, StoredObjectInfo};
use crate::uploader::RetryPolicy;

/// Lifecycle status of a multipart session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Planning,
    InProgress,
    Completing,
    Completed,
    Aborted,
    Failed,
}

impl SessionStatus {
    fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Planning, InProgress)
                | (Planning, Aborted)
                | (InProgress, Completing)
                | (InProgress, Aborted)
                | (Completing, Completed)
                | (Completing, Failed)
                | (Failed, Completing)
                | (Failed, InProgress)
                | (Failed, Aborted)
        )
    }
}

/// Status of one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    Pending,
    Uploading,
    Done,
    Failed,
}

/// State of one part.  `status == Done` exactly when an ETag is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartState {
    number: u32,
    offset: u64,
    size: u64,
    etag: Option<String>,
    attempts: u32,
    last_error: Option<ErrorKind>,
    status: PartStatus,
}

impl PartState {
    fn new(spec: &PartSpec) -> Self {
        Self {
            number: spec.number,
            offset: spec.offset,
            size: spec.size,
            etag: None,
            attempts: 0,
            last_error: None,
            status: PartStatus::Pending,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// ETag, set only once the server acknowledged the part.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Upload attempts made for this part.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn status(&self) -> PartStatus {
        self.status
    }

    /// Byte range of this part.
    pub fn spec(&self) -> PartSpec {
        PartSpec {
            number: self.number,
            offset: self.offset,
            size: self.size,
        }
    }

    pub(crate) fn mark_uploading(&mut self) {
        self.status = PartStatus::Uploading;
    }

    pub(crate) fn mark_done(&mut self, etag: String) {
        self.etag = Some(etag);
        self.last_error = None;
        self.status = PartStatus::Done;
    }

    pub(crate) fn mark_failed(&mut self, kind: ErrorKind) {
        self.etag = None;
        self.last_error = Some(kind);
        self.status = PartStatus::Failed;
    }

    pub(crate) fn reset_pending(&mut self) {
        self.etag = None;
        self.status = PartStatus::Pending;
    }

    pub(crate) fn add_attempts(&mut self, attempts: u32) {
        self.attempts += attempts;
    }

    pub(crate) fn set_last_error(&mut self, kind: ErrorKind) {
        self.last_error = Some(kind);
    }
}

/// One multipart transfer.
#[derive(Debug, Clone)]
pub struct UploadSession {
    session_id: String,
    location: ObjectLocation,
    total_size: u64,
    part_size: u64,
    parts: BTreeMap<u32, PartState>,
    status: SessionStatus,
    identity: Option<StoredObjectInfo>,
}

impl UploadSession {
    /// Create a session in `Planning` with every part pending.
    pub fn new(
        session_id: impl Into<String>,
        location: ObjectLocation,
        total_size: u64,
        part_size: u64,
        parts: &[PartSpec],
    ) -> Self {
        Self {
            session_id: session_id.into(),
            location,
            total_size,
            part_size,
            parts: parts.iter().map(|p| (p.number, PartState::new(p))).collect(),
            status: SessionStatus::Planning,
            identity: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn location(&self) -> &ObjectLocation {
        &self.location
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Final object identity once completed.
    pub fn identity(&self) -> Option<&StoredObjectInfo> {
        self.identity.as_ref()
    }

    /// Parts in ascending number order.
    pub fn parts(&self) -> impl Iterator<Item = &PartState> {
        self.parts.values()
    }

    pub fn part(&self, number: u32) -> Option<&PartState> {
        self.parts.get(&number)
    }

    pub(crate) fn part_mut(&mut self, number: u32) -> Option<&mut PartState> {
        self.parts.get_mut(&number)
    }

    pub fn total_parts(&self) -> usize {
        self.parts.len()
    }

    /// Number of acknowledged parts.
    pub fn completed_parts(&self) -> usize {
        self.parts
            .values()
            .filter(|p| p.status == PartStatus::Done)
            .count()
    }

    /// Bytes in acknowledged parts.
    pub fn bytes_completed(&self) -> u64 {
        self.parts
            .values()
            .filter(|p| p.status == PartStatus::Done)
            .map(|p| p.size)
            .sum()
    }

    /// Parts still needing upload (pending or failed), in number order.
    pub fn remaining_parts(&self) -> Vec<PartSpec> {
        self.parts
            .values()
            .filter(|p| matches!(p.status, PartStatus::Pending | PartStatus::Failed))
            .map(PartState::spec)
            .collect()
    }

    /// Whether every part is acknowledged.
    pub fn all_done(&self) -> bool {
        self.parts.values().all(|p| p.status == PartStatus::Done)
    }

    /// Ordered `(number, etag)` list for `complete`.
    pub fn completion_list(&self) -> Result<Vec<(u32, String)>, UploadError> {
        let missing: Vec<u32> = self
            .parts
            .values()
            .filter(|p| p.etag.is_none())
            .map(|p| p.number)
            .collect();
        if !missing.is_empty() {
            return Err(UploadError::IncompleteUpload { missing });
        }
        Ok(self
            .parts
            .values()
            .filter_map(|p| p.etag.clone().map(|etag| (p.number, etag)))
            .collect())
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow.
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), UploadError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(UploadError::Internal(anyhow::anyhow!(
                "session {} cannot move from {:?} to {:?}",
                self.session_id,
                self.status,
                next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Snapshot for the local resume record.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            bucket: self.location.bucket.clone(),
            key: self.location.key.clone(),
            total_size: self.total_size,
            part_size: self.part_size,
            completed: self
                .parts
                .values()
                .filter_map(|p| p.etag.clone().map(|etag| (p.number, etag)))
                .collect(),
            updated_at: Utc::now(),
        }
    }
}

/// Issues session-level calls and keeps local resume records.
pub struct SessionManager {
    store: Arc<dyn MultipartStore>,
    state: SessionStateStore,
    policy: RetryPolicy,
}

impl SessionManager {
    pub fn new(store: Arc<dyn MultipartStore>, state: SessionStateStore, policy: RetryPolicy) -> Self {
        Self {
            store,
            state,
            policy,
        }
    }

    /// Local record directory.
    pub fn state(&self) -> &SessionStateStore {
        &self.state
    }

    /// Open a session for `location`.
    ///
    /// If a local record names a resumable session for the same object
    /// and geometry, that session is resumed.  Otherwise, or if the
    /// recorded session has expired, a new one is allocated.
    pub async fn open(
        &self,
        location: &ObjectLocation,
        metadata: &ObjectMetadata,
        total_size: u64,
        part_size: u64,
        parts: &[PartSpec],
    ) -> Result<UploadSession, UploadError> {
        if let Some(record) = self.state.load(&location.bucket, &location.key).await? {
            if record.total_size == total_size && record.part_size == part_size {
                match self
                    .resume(location, Some(&record.session_id), total_size, part_size, parts)
                    .await
                {
                    Ok(session) => return Ok(session),
                    Err(UploadError::SessionExpired { session_id }) => {
                        warn!(
                            %location,
                            session_id = %session_id,
                            "Recorded session is gone, starting a new one"
                        );
                    }
                    Err(e) => return Err(e),
                }
            } else {
                warn!(
                    %location,
                    session_id = %record.session_id,
                    recorded_size = record.total_size,
                    recorded_part_size = record.part_size,
                    "Recorded session does not match the current plan, starting a new one"
                );
            }
            self.state.remove(&location.bucket, &location.key).await?;
        }
        self.create(location, metadata, total_size, part_size, parts)
            .await
    }

    /// Allocate a brand-new session.
    pub async fn create(
        &self,
        location: &ObjectLocation,
        metadata: &ObjectMetadata,
        total_size: u64,
        part_size: u64,
        parts: &[PartSpec],
    ) -> Result<UploadSession, UploadError> {
        let (result, _) = self
            .policy
            .run("create_multipart_upload", |_| {
                self.store.create_multipart_upload(location, metadata)
            })
            .await;
        let session_id = result?;

        let mut session =
            UploadSession::new(session_id, location.clone(), total_size, part_size, parts);
        session.transition(SessionStatus::InProgress)?;
        self.persist(&session).await;
        info!(
            %location,
            session_id = %session.session_id,
            total_size,
            part_size,
            parts = parts.len(),
            "Opened multipart session"
        );
        Ok(session)
    }

    /// Rebuild a session from the server's part listing.
    pub async fn resume(
        &self,
        location: &ObjectLocation,
        session_id: Option<&str>,
        total_size: u64,
        part_size: u64,
        parts: &[PartSpec],
    ) -> Result<UploadSession, UploadError> {
        let resolver = ResumeResolver::new(Arc::clone(&self.store), self.policy.clone());
        let session = resolver
            .resolve(location, session_id, total_size, part_size, parts)
            .await?;
        self.persist(&session).await;
        Ok(session)
    }

    /// Finalize the object.  Every part must hold an ETag.
    ///
    /// Completing an already-completed session returns the recorded
    /// identity without another network call.
    pub async fn complete(&self, session: &mut UploadSession) -> Result<StoredObjectInfo, UploadError> {
        if session.status == SessionStatus::Completed {
            if let Some(identity) = &session.identity {
                return Ok(identity.clone());
            }
        }
        let parts = session.completion_list()?;
        session.transition(SessionStatus::Completing)?;

        let (result, _) = self
            .policy
            .run("complete_multipart_upload", |_| {
                self.store
                    .complete_multipart_upload(&session.location, &session.session_id, &parts)
            })
            .await;

        match result {
            Ok(identity) => {
                session.transition(SessionStatus::Completed)?;
                session.identity = Some(identity.clone());
                if let Err(e) = self
                    .state
                    .remove(&session.location.bucket, &session.location.key)
                    .await
                {
                    warn!(error = %e, "Failed to remove session record");
                }
                info!(
                    location = %session.location,
                    session_id = %session.session_id,
                    etag = %identity.etag,
                    parts = parts.len(),
                    "Completed multipart session"
                );
                Ok(identity)
            }
            Err(e) => {
                session.transition(SessionStatus::Failed)?;
                warn!(
                    location = %session.location,
                    session_id = %session.session_id,
                    error = %e,
                    "Complete failed"
                );
                self.persist(session).await;
                Err(e)
            }
        }
    }

    /// Release server-side storage for the session.  Aborting a session
    /// that is already completed, aborted, or unknown to the server is a
    /// no-op.
    pub async fn abort(&self, session: &mut UploadSession) -> Result<(), UploadError> {
        if matches!(
            session.status,
            SessionStatus::Completed | SessionStatus::Aborted
        ) {
            return Ok(());
        }
        self.abort_by_id(&session.location, &session.session_id)
            .await?;
        session.transition(SessionStatus::Aborted)?;
        Ok(())
    }

    /// Abort a session known only by id.
    pub async fn abort_by_id(&self, location: &ObjectLocation, session_id: &str) -> Result<(), UploadError> {
        let (result, _) = self
            .policy
            .run("abort_multipart_upload", |_| {
                self.store.abort_multipart_upload(location, session_id)
            })
            .await;
        match result {
            Ok(()) => info!(%location, session_id, "Aborted multipart session"),
            Err(UploadError::SessionExpired { .. }) => {
                info!(%location, session_id, "Session already gone, nothing to abort")
            }
            Err(e) => return Err(e),
        }

        if let Some(record) = self.state.load(&location.bucket, &location.key).await? {
            if record.session_id == session_id {
                self.state.remove(&location.bucket, &location.key).await?;
            }
        }
        Ok(())
    }

    /// Write the local resume record for an open session.  Failures are
    /// logged; the server listing stays authoritative for resume.
    pub async fn persist(&self, session: &UploadSession) {
        if matches!(
            session.status,
            SessionStatus::Completed | SessionStatus::Aborted
        ) {
            return;
        }
        if let Err(e) = self.state.save(&session.to_record()).await {
            warn!(session_id = %session.session_id, error = %e, "Failed to save session record");
        }
    }
}

// -- Tests -------------------------------------------------------------------
