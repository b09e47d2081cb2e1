//! Upload orchestration.
//!
//! [`Uploader`] ties the pieces together for one file:
//!
//! 1. open the source and plan the transfer,
//! 2. small sources go out in a single PutObject,
//! 3. otherwise open (or resume) a multipart session, run the scheduler
//!    over the remaining parts, and complete the session.
//!
//! On failure the remote session is left open and its id is returned in
//! the [`UploadFailure`], so the caller can resume or abort explicitly.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::UploadConfig;
use crate::errors::{ErrorKind, UploadError};
use crate::metrics;
use crate::plan::{plan_upload, PartSpec, UploadPlan};
use crate::progress::{ProgressAggregator, ProgressCallback, ProgressReceiver, ProgressSnapshot};
use crate::reader::ChunkReader;
use crate::resume::ResumeResolver;
use crate::scheduler::{effective_concurrency, CancelHandle, CancelMode, ScheduleOptions, Scheduler};
use crate::session::{SessionManager, SessionStatus, UploadSession};
use crate::state::SessionStateStore;
use crate::storage::backend::{
    MultipartStore, ObjectLocation, ObjectMetadata, StoredObjectInfo, UploadSummary,
};
use crate::storage::content_md5;
use crate::uploader::{read_with_retry, PartUploader, RetryPolicy};

/// How to pick the multipart session for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumeStrategy {
    /// Resume the locally recorded session if the server still has it,
    /// otherwise open a new one.
    #[default]
    Auto,
    /// Resume this session id; fail if the server no longer has it.
    Session(String),
    /// Resume the newest open session the server lists for the key.
    Discover,
    /// Always open a new session.
    Fresh,
}

/// Identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectIdentity {
    pub bucket: String,
    pub key: String,
    /// ETag reported by the server.
    pub etag: String,
    /// Object size in bytes.
    pub size: u64,
    pub version_id: Option<String>,
    /// Multipart session id, `None` for single-shot uploads.
    pub session_id: Option<String>,
    /// Number of parts the object was assembled from.
    pub parts: usize,
}

/// A failed transfer, with enough state to resume it.
#[derive(Debug, Error)]
#[error("upload to {location} failed after {completed_parts}/{total_parts} parts: {error}")]
pub struct UploadFailure {
    pub kind: ErrorKind,
    #[source]
    pub error: UploadError,
    pub location: ObjectLocation,
    /// Open session to resume, if one was created.
    pub session_id: Option<String>,
    pub completed_parts: usize,
    pub total_parts: usize,
}

impl UploadFailure {
    fn new(location: &ObjectLocation, error: UploadError, session: Option<&UploadSession>) -> Self {
        Self {
            kind: error.kind(),
            error,
            location: location.clone(),
            session_id: session.map(|s| s.session_id().to_string()),
            completed_parts: session.map_or(0, UploadSession::completed_parts),
            total_parts: session.map_or(0, UploadSession::total_parts),
        }
    }
}

/// One file to upload.
pub struct UploadRequest {
    pub path: PathBuf,
    pub location: ObjectLocation,
    pub metadata: ObjectMetadata,
    pub resume: ResumeStrategy,
    /// Overrides `fail_fast` from the configuration.
    pub fail_fast: Option<bool>,
    callbacks: Vec<ProgressCallback>,
}

impl UploadRequest {
    pub fn new(path: impl Into<PathBuf>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            location: ObjectLocation::new(bucket, key),
            metadata: ObjectMetadata::default(),
            resume: ResumeStrategy::default(),
            fail_fast: None,
            callbacks: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_resume(mut self, resume: ResumeStrategy) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    /// Call `callback` with every progress snapshot.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressSnapshot) + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
        self
    }
}

/// A running transfer.
pub struct UploadHandle {
    location: ObjectLocation,
    progress: ProgressReceiver,
    cancel: CancelHandle,
    task: JoinHandle<Result<ObjectIdentity, UploadFailure>>,
}

impl UploadHandle {
    /// A new progress reader starting from the latest snapshot.
    pub fn progress(&self) -> ProgressReceiver {
        self.progress.clone()
    }

    pub fn cancel(&self, mode: CancelMode) {
        self.cancel.cancel(mode);
    }

    /// Cancellation handle that can be moved elsewhere (e.g. a signal task).
    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the transfer to finish.
    pub async fn wait(self) -> Result<ObjectIdentity, UploadFailure> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(UploadFailure::new(
                &self.location,
                UploadError::Internal(anyhow::anyhow!("upload task failed: {e}")),
                None,
            )),
        }
    }
}

/// Uploads files into one store.
///
/// The store is passed in, not global; clones share it.
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn MultipartStore>,
    config: UploadConfig,
    policy: RetryPolicy,
}

impl Uploader {
    /// Create an uploader; fails if `config` does not validate.
    pub fn new(store: Arc<dyn MultipartStore>, config: UploadConfig) -> Result<Self, UploadError> {
        config.validate()?;
        let policy = RetryPolicy::from_config(&config);
        Ok(Self {
            store,
            config,
            policy,
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Replace the retry policy derived from the configuration.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn sessions(&self) -> SessionManager {
        SessionManager::new(
            Arc::clone(&self.store),
            SessionStateStore::new(&self.config.state_dir),
            self.policy.clone(),
        )
    }

    /// Start a transfer in the background.
    pub fn start(&self, request: UploadRequest) -> UploadHandle {
        let mut progress = ProgressAggregator::new(0, 0);
        let receiver = progress.subscribe();
        let cancel = CancelHandle::new();
        let location = request.location.clone();

        let this = self.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut request = request;
            for callback in std::mem::take(&mut request.callbacks) {
                progress.on_progress(callback);
            }
            this.run(request, &mut progress, &task_cancel).await
        });

        UploadHandle {
            location,
            progress: receiver,
            cancel,
            task,
        }
    }

    /// Upload a file and wait for the result.
    pub async fn upload_file(&self, request: UploadRequest) -> Result<ObjectIdentity, UploadFailure> {
        self.start(request).wait().await
    }

    /// Open multipart sessions under `bucket/prefix`.
    pub async fn list_sessions(&self, bucket: &str, prefix: &str) -> Result<Vec<UploadSummary>, UploadError> {
        let (result, _) = self
            .policy
            .run("list_multipart_uploads", |_| {
                self.store.list_multipart_uploads(bucket, prefix)
            })
            .await;
        result
    }

    /// Abort an open session and drop its local record.
    pub async fn abort_session(&self, bucket: &str, key: &str, session_id: &str) -> Result<(), UploadError> {
        self.sessions()
            .abort_by_id(&ObjectLocation::new(bucket, key), session_id)
            .await
    }

    async fn run(
        &self,
        request: UploadRequest,
        progress: &mut ProgressAggregator,
        cancel: &CancelHandle,
    ) -> Result<ObjectIdentity, UploadFailure> {
        let location = &request.location;
        let result = self.transfer(&request, progress, cancel).await;
        match &result {
            Ok(identity) => {
                metrics::record_upload_finished("completed");
                info!(
                    %location,
                    etag = %identity.etag,
                    size = identity.size,
                    parts = identity.parts,
                    "Upload finished"
                );
            }
            Err(failure) => {
                metrics::record_upload_finished(failure.kind.code());
                warn!(
                    %location,
                    kind = %failure.kind,
                    session_id = ?failure.session_id,
                    completed_parts = failure.completed_parts,
                    total_parts = failure.total_parts,
                    error = %failure.error,
                    "Upload failed"
                );
            }
        }
        result
    }

    async fn transfer(
        &self,
        request: &UploadRequest,
        progress: &mut ProgressAggregator,
        cancel: &CancelHandle,
    ) -> Result<ObjectIdentity, UploadFailure> {
        let location = &request.location;
        let fail = |e: UploadError| UploadFailure::new(location, e, None);

        let reader = ChunkReader::open(&request.path).await.map_err(fail)?;
        let plan = plan_upload(
            reader.len(),
            self.config.multipart_threshold,
            self.config.part_size,
            self.config.max_parts,
        )
        .map_err(fail)?;
        info!(
            %location,
            path = %request.path.display(),
            size = reader.len(),
            parts = plan.part_count(),
            "Starting upload"
        );

        match plan {
            UploadPlan::SingleShot { size } => {
                progress.reset(size, 1);
                self.put_single(request, &reader, size, progress, cancel)
                    .await
                    .map_err(|e| UploadFailure {
                        total_parts: 1,
                        ..fail(e)
                    })
            }
            UploadPlan::Multipart {
                total_size,
                part_size,
                parts,
            } => {
                progress.reset(total_size, parts.len());
                self.put_multipart(request, reader, total_size, part_size, &parts, progress, cancel)
                    .await
            }
        }
    }

    async fn put_single(
        &self,
        request: &UploadRequest,
        reader: &ChunkReader,
        size: u64,
        progress: &mut ProgressAggregator,
        cancel: &CancelHandle,
    ) -> Result<ObjectIdentity, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let whole = PartSpec {
            number: 1,
            offset: 0,
            size,
        };
        let data = read_with_retry(reader, &whole).await?;
        let md5 = content_md5(&data);
        let (result, _) = self
            .policy
            .run("put_object", |_| {
                self.store.put_object(
                    &request.location,
                    data.clone(),
                    Some(md5.clone()),
                    &request.metadata,
                )
            })
            .await;
        let stored = result?;
        progress.record_part(1, size);
        metrics::record_object_uploaded(size);

        Ok(ObjectIdentity {
            bucket: request.location.bucket.clone(),
            key: request.location.key.clone(),
            etag: stored.etag,
            size,
            version_id: stored.version_id,
            session_id: None,
            parts: 1,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_multipart(
        &self,
        request: &UploadRequest,
        reader: ChunkReader,
        total_size: u64,
        part_size: u64,
        parts: &[PartSpec],
        progress: &mut ProgressAggregator,
        cancel: &CancelHandle,
    ) -> Result<ObjectIdentity, UploadFailure> {
        let location = &request.location;
        let sessions = self.sessions();
        let deadline = self
            .config
            .session_deadline()
            .map(|d| tokio::time::Instant::now() + d);

        let opened = match &request.resume {
            ResumeStrategy::Auto => {
                sessions
                    .open(location, &request.metadata, total_size, part_size, parts)
                    .await
            }
            ResumeStrategy::Session(id) => {
                sessions
                    .resume(location, Some(id), total_size, part_size, parts)
                    .await
            }
            ResumeStrategy::Discover => {
                sessions
                    .resume(location, None, total_size, part_size, parts)
                    .await
            }
            ResumeStrategy::Fresh => {
                sessions
                    .create(location, &request.metadata, total_size, part_size, parts)
                    .await
            }
        };
        let mut session = match opened {
            Ok(session) => session,
            Err(e) => {
                let mut failure = UploadFailure::new(location, e, None);
                failure.total_parts = parts.len();
                if let ResumeStrategy::Session(id) = &request.resume {
                    failure.session_id = Some(id.clone());
                }
                return Err(failure);
            }
        };
        progress.record_existing(
            session
                .parts()
                .filter(|p| p.etag().is_some())
                .map(|p| (p.number(), p.size())),
        );

        let options = ScheduleOptions {
            concurrency: effective_concurrency(
                self.config.max_concurrency,
                self.config.max_concurrency_ceiling,
                parts.len(),
            ),
            fail_fast: request.fail_fast.unwrap_or(self.config.fail_fast),
            deadline,
        };
        let uploader = Arc::new(PartUploader::new(
            Arc::clone(&self.store),
            location.clone(),
            session.session_id(),
            self.policy.clone(),
        ));
        let scheduler = Scheduler::new(options, uploader, reader);

        if let Err(e) = scheduler.run(&mut session, progress, cancel).await {
            sessions.persist(&session).await;
            return Err(UploadFailure::new(location, e, Some(&session)));
        }

        let stored = match sessions.complete(&mut session).await {
            Ok(stored) => stored,
            Err(UploadError::CompleteRejected { message, .. }) => {
                warn!(
                    %location,
                    session_id = %session.session_id(),
                    reason = %message,
                    "Complete rejected, refreshing parts from the server"
                );
                self.recover_rejected_complete(&sessions, &scheduler, &mut session, progress, cancel)
                    .await
                    .map_err(|e| UploadFailure::new(location, e, Some(&session)))?
            }
            Err(e) => return Err(UploadFailure::new(location, e, Some(&session))),
        };

        Ok(ObjectIdentity {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            etag: stored.etag,
            size: total_size,
            version_id: stored.version_id,
            session_id: Some(session.session_id().to_string()),
            parts: session.total_parts(),
        })
    }

    /// Re-list the session, re-upload parts the server does not confirm,
    /// and try `complete` once more.
    async fn recover_rejected_complete(
        &self,
        sessions: &SessionManager,
        scheduler: &Scheduler,
        session: &mut UploadSession,
        progress: &mut ProgressAggregator,
        cancel: &CancelHandle,
    ) -> Result<StoredObjectInfo, UploadError> {
        let resolver = ResumeResolver::new(Arc::clone(&self.store), self.policy.clone());
        let pending = resolver.refresh(session).await?;
        if !pending.is_empty() {
            session.transition(SessionStatus::InProgress)?;
            let result = scheduler.run(session, progress, cancel).await;
            if let Err(e) = result {
                sessions.persist(session).await;
                return Err(e);
            }
        }
        sessions.complete(session).await
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::testing::{faulty, Fault};
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    fn config(threshold: u64, part_size: u64, concurrency: usize, state_dir: &std::path::Path) -> UploadConfig {
        UploadConfig {
            multipart_threshold: threshold,
            part_size,
            max_concurrency: concurrency,
            max_concurrency_ceiling: concurrency.max(32),
            max_retries: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            state_dir: state_dir.to_string_lossy().into_owned(),
            ..UploadConfig::default()
        }
    }

    fn source(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        (file, data)
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        let ps = 16u64;
        for size in [1, ps - 1, ps, ps + 1, 10 * ps + 1] {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(MemoryStore::new());
            let uploader = Uploader::new(store.clone(), config(ps, ps, 4, dir.path())).unwrap();
            let (file, data) = source(size as usize);

            let identity = uploader
                .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
                .await
                .unwrap();
            assert_eq!(identity.size, size);
            let stored = store.get_object("bucket", "obj").await.unwrap();
            assert_eq!(stored.data.as_ref(), data.as_slice(), "size {size}");
            assert_eq!(stored.etag, identity.etag);
        }
    }

    #[tokio::test]
    async fn test_empty_source_rejected_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = faulty();
        let uploader = Uploader::new(store.clone(), config(16, 16, 4, dir.path())).unwrap();
        let (file, _) = source(0);
        let failure = uploader
            .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::EmptyInput);
        assert!(failure.session_id.is_none());
        assert_eq!(store.inner().write_count(), 0);
        assert!(store.list_multipart_uploads("bucket", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store.clone(), config(64, 16, 4, dir.path())).unwrap();

        let (at, _) = source(64);
        let single = uploader
            .upload_file(UploadRequest::new(at.path(), "bucket", "at"))
            .await
            .unwrap();
        assert!(single.session_id.is_none());
        assert_eq!(single.parts, 1);

        let (above, _) = source(65);
        let multi = uploader
            .upload_file(UploadRequest::new(above.path(), "bucket", "above"))
            .await
            .unwrap();
        assert!(multi.session_id.is_some());
        assert_eq!(multi.parts, 5);
        assert!(multi.etag.ends_with("-5\""));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_total() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store, config(10, 10, 8, dir.path())).unwrap();
        let (file, _) = source(1005);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let request = UploadRequest::new(file.path(), "bucket", "obj")
            .on_progress(move |snap| sink.lock().unwrap().push(snap.bytes_completed));
        let handle = uploader.start(request);
        let receiver = handle.progress();
        handle.wait().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 101);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 1005);
        let last = receiver.latest();
        assert_eq!(last.bytes_completed, last.total_bytes);
        assert_eq!(last.parts_completed, 101);
    }

    #[tokio::test]
    async fn test_concurrency_does_not_change_identity() {
        let (file, _) = source(40 * 8 + 3);
        let mut etags = Vec::new();
        for concurrency in [1, 32] {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(MemoryStore::new());
            let uploader = Uploader::new(store.clone(), config(8, 8, concurrency, dir.path())).unwrap();
            let identity = uploader
                .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
                .await
                .unwrap();
            etags.push(identity.etag);
        }
        assert_eq!(etags[0], etags[1]);
    }

    #[tokio::test]
    async fn test_resume_uploads_only_missing_parts() {
        let dir = tempfile::tempdir().unwrap();
        let (file, data) = source(100);
        let location = ObjectLocation::new("bucket", "obj");

        // Reference identity from an uninterrupted upload.
        let reference = {
            let ref_dir = tempfile::tempdir().unwrap();
            let uploader =
                Uploader::new(Arc::new(MemoryStore::new()), config(10, 10, 4, ref_dir.path())).unwrap();
            uploader
                .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
                .await
                .unwrap()
        };

        let store = faulty();
        let id = store
            .inner()
            .create_multipart_upload(&location, &ObjectMetadata::default())
            .await
            .unwrap();
        for n in [1u32, 2, 5, 9] {
            let start = (n as usize - 1) * 10;
            store
                .inner()
                .upload_part(&location, &id, n, bytes::Bytes::copy_from_slice(&data[start..start + 10]), None)
                .await
                .unwrap();
        }

        let uploader = Uploader::new(store.clone(), config(10, 10, 4, dir.path())).unwrap();
        let identity = uploader
            .upload_file(
                UploadRequest::new(file.path(), "bucket", "obj")
                    .with_resume(ResumeStrategy::Session(id.clone())),
            )
            .await
            .unwrap();
        assert_eq!(store.total_part_calls(), 6);
        for n in [1u32, 2, 5, 9] {
            assert_eq!(store.part_calls(n), 0);
        }
        assert_eq!(identity.session_id.as_deref(), Some(id.as_str()));
        assert_eq!(identity.etag, reference.etag);
        let stored = store.inner().get_object("bucket", "obj").await.unwrap();
        assert_eq!(stored.data.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_failure_leaves_session_for_auto_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (file, data) = source(100);
        let store = faulty();
        store.fail_part(4, Fault::Auth, 1);

        let uploader = Uploader::new(store.clone(), config(10, 10, 1, dir.path())).unwrap();
        let failure = uploader
            .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::AuthError);
        assert_eq!(failure.completed_parts, 3);
        assert_eq!(failure.total_parts, 10);
        let session_id = failure.session_id.clone().unwrap();
        assert_eq!(store.inner().part_count(&session_id).await, Some(3));

        // A later run picks the recorded session back up.
        let before = store.total_part_calls();
        let identity = uploader
            .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
            .await
            .unwrap();
        assert_eq!(identity.session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(store.total_part_calls() - before, 7);
        let stored = store.inner().get_object("bucket", "obj").await.unwrap();
        assert_eq!(stored.data.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_retry_bound_reported_in_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (file, _) = source(50);
        let store = faulty();
        store.fail_part(2, Fault::Transient, u32::MAX);
        let uploader = Uploader::new(store.clone(), config(10, 10, 2, dir.path())).unwrap();

        let failure = uploader
            .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::TransientNetworkError);
        assert_eq!(store.part_calls(2), 3);
        assert_eq!(failure.completed_parts, 4);
        assert!(failure.session_id.is_some());
    }

    #[tokio::test]
    async fn test_explicit_session_expired() {
        let dir = tempfile::tempdir().unwrap();
        let (file, _) = source(100);
        let uploader = Uploader::new(Arc::new(MemoryStore::new()), config(10, 10, 2, dir.path())).unwrap();
        let failure = uploader
            .upload_file(
                UploadRequest::new(file.path(), "bucket", "obj")
                    .with_resume(ResumeStrategy::Session("gone".into())),
            )
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::SessionExpired);
        assert_eq!(failure.session_id.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn test_rejected_complete_is_recovered_once() {
        let dir = tempfile::tempdir().unwrap();
        let (file, data) = source(50);
        let store = faulty();
        store.fail_complete(Fault::CompleteRejected, 1);
        let uploader = Uploader::new(store.clone(), config(10, 10, 2, dir.path())).unwrap();

        uploader
            .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
            .await
            .unwrap();
        assert_eq!(store.complete_calls(), 2);
        let stored = store.inner().get_object("bucket", "obj").await.unwrap();
        assert_eq!(stored.data.as_ref(), data.as_slice());

        // A second rejection is surfaced.
        let store = faulty();
        store.fail_complete(Fault::CompleteRejected, 2);
        let uploader = Uploader::new(store.clone(), config(10, 10, 2, dir.path())).unwrap();
        let failure = uploader
            .upload_file(UploadRequest::new(file.path(), "bucket", "obj").with_resume(ResumeStrategy::Fresh))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::CompleteRejected);
        assert_eq!(failure.completed_parts, 5);
    }

    #[tokio::test]
    async fn test_rejected_complete_reuploads_unconfirmed_part() {
        let dir = tempfile::tempdir().unwrap();
        let (file, data) = source(50);
        let store = faulty();
        store.fail_complete(Fault::CompleteRejected, 1);
        store.hide_listed_part(2, 1);
        let uploader = Uploader::new(store.clone(), config(10, 10, 2, dir.path())).unwrap();

        let identity = uploader
            .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
            .await
            .unwrap();
        assert_eq!(identity.parts, 5);
        assert_eq!(store.part_calls(2), 2);
        assert_eq!(store.part_calls(1), 1);
        assert_eq!(store.complete_calls(), 2);
        let stored = store.inner().get_object("bucket", "obj").await.unwrap();
        assert_eq!(stored.data.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_panicking_store_surfaces_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (file, _) = source(50);
        let store = faulty();
        store.fail_part(3, Fault::Panic, 1);
        let uploader = Uploader::new(store.clone(), config(10, 10, 2, dir.path())).unwrap();

        let failure = tokio::time::timeout(
            Duration::from_secs(5),
            uploader.upload_file(UploadRequest::new(file.path(), "bucket", "obj")),
        )
        .await
        .expect("upload finished")
        .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Internal);
        assert_eq!(failure.completed_parts, 4);
        assert!(failure.session_id.is_some());
    }

    #[tokio::test]
    async fn test_cancel_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (file, data) = source(100);
        let store = faulty();
        for n in 1..=2 {
            store.fail_part(n, Fault::Delay(Duration::from_millis(100)), 1);
        }
        let uploader = Uploader::new(store.clone(), config(10, 10, 2, dir.path())).unwrap();

        let handle = uploader.start(UploadRequest::new(file.path(), "bucket", "obj"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel(CancelMode::Graceful);
        let failure = handle.wait().await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Cancelled);
        assert_eq!(failure.completed_parts, 2);

        let identity = uploader
            .upload_file(UploadRequest::new(file.path(), "bucket", "obj"))
            .await
            .unwrap();
        assert_eq!(identity.session_id, failure.session_id);
        let stored = store.inner().get_object("bucket", "obj").await.unwrap();
        assert_eq!(stored.data.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_discover_and_abort_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (file, _) = source(100);
        let store = faulty();
        store.fail_part(3, Fault::SessionExpired, 1);
        let uploader = Uploader::new(store.clone(), config(10, 10, 1, dir.path())).unwrap();
        let failure = uploader
            .upload_file(UploadRequest::new(file.path(), "bucket", "dir/obj"))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::SessionExpired);
        let session_id = failure.session_id.unwrap();

        let listed = uploader.list_sessions("bucket", "dir/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].upload_id, session_id);

        let identity = uploader
            .upload_file(
                UploadRequest::new(file.path(), "bucket", "dir/obj").with_resume(ResumeStrategy::Discover),
            )
            .await
            .unwrap();
        assert_eq!(identity.session_id.as_deref(), Some(session_id.as_str()));

        // Nothing left to abort; aborting is still fine.
        uploader
            .abort_session("bucket", "dir/obj", &session_id)
            .await
            .unwrap();
        assert!(uploader.list_sessions("bucket", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store.clone(), config(10, 10, 2, dir.path())).unwrap();
        let metadata = ObjectMetadata {
            content_type: Some("video/mp4".into()),
            ..ObjectMetadata::default()
        };
        for (len, key) in [(5usize, "small"), (50, "large")] {
            let (file, _) = source(len);
            uploader
                .upload_file(UploadRequest::new(file.path(), "bucket", key).with_metadata(metadata.clone()))
                .await
                .unwrap();
            let stored = store.get_object("bucket", key).await.unwrap();
            assert_eq!(stored.content_type.as_deref(), Some("video/mp4"));
        }
    }

    #[tokio::test]
    async fn test_scaled_reference_scenario() {
        // 250 MiB / 8 MiB parts / 64 MiB threshold, scaled by 1/1024.
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store.clone(), config(64 * 1024, 8 * 1024, 10, dir.path())).unwrap();
        let (file, data) = source(250 * 1024);

        let handle = uploader.start(UploadRequest::new(file.path(), "bucket", "scenario"));
        let receiver = handle.progress();
        let identity = handle.wait().await.unwrap();
        assert_eq!(identity.parts, 32);
        assert_eq!(identity.size, 250 * 1024);
        assert!(identity.etag.ends_with("-32\""));
        assert_eq!(receiver.latest().parts_completed, 32);
        let stored = store.get_object("bucket", "scenario").await.unwrap();
        assert_eq!(stored.data.len(), 250 * 1024);
        assert_eq!(stored.data.as_ref(), data.as_slice());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(10, 10, 2, dir.path());
        cfg.max_concurrency = 0;
        let err = Uploader::new(Arc::new(MemoryStore::new()), cfg).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
