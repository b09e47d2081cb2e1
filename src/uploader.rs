//! Single-part transfer with retry.
//!
//! [`PartUploader`] reads one part from the source and sends it to the
//! store.  Read failures are retried a small fixed number of times;
//! transient network failures are retried with exponential backoff under
//! an explicit [`RetryPolicy`].  Non-retryable failures return at once.
//!
//! The uploader never touches shared session state.  It reports what
//! happened in a [`PartOutcome`] and the scheduler applies it.

use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::UploadConfig;
use crate::errors::UploadError;
use crate::metrics;
use crate::plan::PartSpec;
use crate::reader::ChunkReader;
use crate::storage::backend::{MultipartStore, ObjectLocation};
use crate::storage::content_md5;

/// Attempts allowed for reading one part from disk.
pub const IO_READ_ATTEMPTS: u32 = 3;

/// Retry and backoff settings for network calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, first try included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay (before jitter).
    pub max_delay: Duration,
    /// Add up to 50% random jitter on top of each delay.
    pub jitter: bool,
    /// Timeout for each individual call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

impl RetryPolicy {
    /// Build the policy described by the upload configuration.
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: true,
            call_timeout: config.call_timeout(),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay`, plus jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
        delay + Duration::from_millis(extra)
    }

    /// Run `call` until it succeeds, fails non-retryably, or the attempt
    /// budget is spent.  Each attempt is bounded by `call_timeout`.
    ///
    /// Returns the result together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> (Result<T, UploadError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.call_timeout, call(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(UploadError::transient(
                    operation,
                    format!("timed out after {:?}", self.call_timeout),
                )),
            };

            match result {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    metrics::record_retry(operation);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

/// Result of one part's upload, reported back to the scheduler.
#[derive(Debug)]
pub struct PartOutcome {
    /// Part number.
    pub number: u32,
    /// Attempts made: failed source reads plus network calls.
    pub attempts: u32,
    /// ETag on success.
    pub result: Result<String, UploadError>,
}

/// Uploads single parts into an existing multipart session.
pub struct PartUploader {
    store: Arc<dyn MultipartStore>,
    location: ObjectLocation,
    upload_id: String,
    policy: RetryPolicy,
}

impl PartUploader {
    /// Create an uploader bound to one session.
    pub fn new(
        store: Arc<dyn MultipartStore>,
        location: ObjectLocation,
        upload_id: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            location,
            upload_id: upload_id.into(),
            policy,
        }
    }

    /// The retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Session this uploader writes into.
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Upload `data` as part `part.number`.  Returns the ETag and the
    /// number of attempts made.
    pub async fn upload(&self, part: &PartSpec, data: Bytes) -> (Result<String, UploadError>, u32) {
        let attempts = AtomicU32::new(0);
        let result = self.upload_counted(part, data, &attempts).await;
        (result, attempts.load(Ordering::SeqCst))
    }

    /// Read part `part` from `reader` and upload it.
    ///
    /// `attempts` is bumped as each attempt starts, so the caller can still
    /// account for attempts made by a task it abandons.
    pub async fn read_and_upload(
        &self,
        reader: &ChunkReader,
        part: PartSpec,
        attempts: &AtomicU32,
    ) -> PartOutcome {
        let result = match read_counted(reader, &part, attempts).await {
            Ok(data) => self.upload_counted(&part, data, attempts).await,
            Err(e) => Err(e),
        };
        PartOutcome {
            number: part.number,
            attempts: attempts.load(Ordering::SeqCst),
            result,
        }
    }

    async fn upload_counted(
        &self,
        part: &PartSpec,
        data: Bytes,
        attempts: &AtomicU32,
    ) -> Result<String, UploadError> {
        let md5 = content_md5(&data);
        let started = Instant::now();
        let (result, calls) = self
            .policy
            .run("upload_part", |attempt| {
                attempts.fetch_add(1, Ordering::SeqCst);
                debug!(
                    upload_id = %self.upload_id,
                    part = part.number,
                    attempt,
                    bytes = data.len(),
                    "Uploading part"
                );
                self.store.upload_part(
                    &self.location,
                    &self.upload_id,
                    part.number,
                    data.clone(),
                    Some(md5.clone()),
                )
            })
            .await;

        metrics::record_part_attempts(calls);
        if result.is_ok() {
            metrics::record_part_uploaded(part.size, started.elapsed());
        }
        result
    }
}

/// Read a part, retrying local I/O failures a fixed number of times.
pub async fn read_with_retry(reader: &ChunkReader, part: &PartSpec) -> Result<Bytes, UploadError> {
    read_counted(reader, part, &AtomicU32::new(0)).await
}

/// Like [`read_with_retry`], counting each failed read in `attempts`.
async fn read_counted(
    reader: &ChunkReader,
    part: &PartSpec,
    attempts: &AtomicU32,
) -> Result<Bytes, UploadError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match reader.read_range(part.offset, part.size).await {
            Ok(data) => return Ok(data),
            Err(e) => {
                attempts.fetch_add(1, Ordering::SeqCst);
                if !matches!(e, UploadError::Io(_)) || attempt >= IO_READ_ATTEMPTS {
                    return Err(e);
                }
                warn!(part = part.number, attempt, error = %e, "Retrying source read");
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
        }
    }
}

// -- Tests -------------------------------------------------------------------
