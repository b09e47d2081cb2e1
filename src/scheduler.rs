//! Bounded worker pool for part uploads.
//!
//! The scheduler drains a queue of pending parts into at most `K`
//! concurrently running tasks held in a [`JoinSet`].  Each task reads and
//! uploads one part and returns a [`PartOutcome`]; the scheduler loop is
//! the only code that mutates the session's part map and the progress
//! aggregator.  A task that panics fails its part with an internal error.
//!
//! Dispatch stops when
//! - the caller cancels (in-flight parts finish, or are dropped when the
//!   mode is [`CancelMode::Immediate`]),
//! - the session deadline passes (graceful),
//! - a session-level error arrives (auth failure, session gone),
//! - any part fails and fail-fast was requested.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ErrorKind, UploadError};
use crate::progress::ProgressAggregator;
use crate::reader::ChunkReader;
use crate::session::UploadSession;
use crate::uploader::{PartOutcome, PartUploader};

/// Part counts at or above `base * SCALE_UP_FACTOR` raise the worker
/// count to `parts / SCALE_UP_FACTOR`, up to the configured ceiling.
pub const SCALE_UP_FACTOR: usize = 64;

/// What happens to in-flight parts on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Stop dispatching; let in-flight parts finish.
    Graceful,
    /// Stop dispatching and drop in-flight parts.
    Immediate,
}

/// Cancellation signal shared between the caller and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    dispatch: CancellationToken,
    in_flight: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.  Escalating from graceful to immediate is
    /// allowed; the reverse has no effect.
    pub fn cancel(&self, mode: CancelMode) {
        self.dispatch.cancel();
        if mode == CancelMode::Immediate {
            self.in_flight.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.dispatch.is_cancelled()
    }
}

/// Worker count for a transfer of `total_parts` parts.
///
/// Never more workers than parts; grows past `base` toward `ceiling` only
/// for very large part counts.
pub fn effective_concurrency(base: usize, ceiling: usize, total_parts: usize) -> usize {
    let base = base.max(1);
    let scaled = if total_parts >= base.saturating_mul(SCALE_UP_FACTOR) {
        (total_parts / SCALE_UP_FACTOR).clamp(base, ceiling.max(base))
    } else {
        base
    };
    scaled.min(total_parts).max(1)
}

/// Scheduler settings for one run.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Upper bound on concurrently running part uploads.
    pub concurrency: usize,
    /// Stop dispatching after the first failed part.
    pub fail_fast: bool,
    /// Instant after which dispatch stops gracefully.  Shared by every
    /// run over the same session.
    pub deadline: Option<Instant>,
}

/// Runs the part uploads of one session.
pub struct Scheduler {
    options: ScheduleOptions,
    uploader: Arc<PartUploader>,
    reader: ChunkReader,
}

impl Scheduler {
    pub fn new(options: ScheduleOptions, uploader: Arc<PartUploader>, reader: ChunkReader) -> Self {
        Self {
            options,
            uploader,
            reader,
        }
    }

    /// Upload every pending or failed part of `session`.
    ///
    /// Returns `Ok` once every part is done.  Otherwise returns the most
    /// severe error seen: a session-level error, then the first part
    /// failure, then `Cancelled`.  Parts left undispatched stay pending
    /// and dropped in-flight parts go back to pending.
    pub async fn run(
        &self,
        session: &mut UploadSession,
        progress: &mut ProgressAggregator,
        cancel: &CancelHandle,
    ) -> Result<(), UploadError> {
        let mut queue: VecDeque<_> = session.remaining_parts().into();
        let concurrency = self.options.concurrency.max(1);
        let mut tasks: JoinSet<PartOutcome> = JoinSet::new();
        let mut running: HashMap<Id, (u32, Arc<AtomicU32>)> = HashMap::new();
        let mut stopped = false;
        let mut failure: Option<UploadError> = None;

        info!(
            session_id = %session.session_id(),
            parts = queue.len(),
            concurrency,
            fail_fast = self.options.fail_fast,
            "Dispatching parts"
        );

        let deadline = self.options.deadline;
        let deadline_timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline_timer);

        loop {
            if !stopped && cancel.is_cancelled() {
                stopped = true;
                failure.get_or_insert(UploadError::Cancelled);
            }
            if !stopped && deadline.is_some_and(|at| Instant::now() >= at) {
                warn!(session_id = %session.session_id(), "Session deadline passed");
                stopped = true;
                failure.get_or_insert(UploadError::Cancelled);
            }
            while !stopped && tasks.len() < concurrency {
                let Some(spec) = queue.pop_front() else {
                    break;
                };
                if let Some(part) = session.part_mut(spec.number) {
                    part.mark_uploading();
                }

                let number = spec.number;
                let attempts = Arc::new(AtomicU32::new(0));
                let uploader = Arc::clone(&self.uploader);
                let reader = self.reader.clone();
                let counter = Arc::clone(&attempts);
                let task = tasks.spawn(async move {
                    uploader.read_and_upload(&reader, spec, &counter).await
                });
                running.insert(task.id(), (number, attempts));
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.in_flight.cancelled() => {
                    warn!(
                        session_id = %session.session_id(),
                        abandoned = tasks.len(),
                        "Cancelled, abandoning in-flight parts"
                    );
                    tasks.abort_all();
                    for (number, attempts) in running.into_values() {
                        if let Some(part) = session.part_mut(number) {
                            part.add_attempts(attempts.load(Ordering::SeqCst));
                            part.reset_pending();
                        }
                    }
                    return Err(UploadError::Cancelled);
                }
                _ = cancel.dispatch.cancelled(), if !stopped => {
                    info!(
                        session_id = %session.session_id(),
                        in_flight = tasks.len(),
                        "Cancelled, waiting for in-flight parts"
                    );
                    stopped = true;
                    failure.get_or_insert(UploadError::Cancelled);
                }
                _ = &mut deadline_timer, if !stopped => {
                    warn!(
                        session_id = %session.session_id(),
                        in_flight = tasks.len(),
                        "Session deadline passed, waiting for in-flight parts"
                    );
                    stopped = true;
                    failure.get_or_insert(UploadError::Cancelled);
                }
                Some(joined) = tasks.join_next_with_id() => {
                    let outcome = match joined {
                        Ok((id, outcome)) => {
                            running.remove(&id);
                            outcome
                        }
                        Err(e) => crashed_outcome(running.remove(&e.id()), e),
                    };
                    if let Err(e) = self.apply(session, progress, outcome) {
                        let kind = e.kind();
                        if kind.is_session_fatal() {
                            stopped = true;
                            if !failure.as_ref().is_some_and(|f| f.kind().is_session_fatal()) {
                                failure = Some(e);
                            }
                        } else {
                            if self.options.fail_fast {
                                stopped = true;
                            }
                            if failure.as_ref().map_or(true, |f| f.kind() == ErrorKind::Cancelled) {
                                failure = Some(e);
                            }
                        }
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None if session.all_done() => Ok(()),
            None => Err(UploadError::IncompleteUpload {
                missing: session.remaining_parts().iter().map(|p| p.number).collect(),
            }),
        }
    }

    /// Fold one outcome into the session.  Returns the part's error, if any.
    fn apply(
        &self,
        session: &mut UploadSession,
        progress: &mut ProgressAggregator,
        outcome: PartOutcome,
    ) -> Result<(), UploadError> {
        let Some(part) = session.part_mut(outcome.number) else {
            return Err(UploadError::Internal(anyhow::anyhow!(
                "outcome for unknown part {}",
                outcome.number
            )));
        };
        part.add_attempts(outcome.attempts);
        match outcome.result {
            Ok(etag) => {
                debug!(part = outcome.number, attempts = outcome.attempts, %etag, "Part done");
                let size = part.size();
                part.mark_done(etag);
                progress.record_part(outcome.number, size);
                Ok(())
            }
            Err(e) => {
                warn!(
                    part = outcome.number,
                    attempts = part.attempts(),
                    kind = %e.kind(),
                    error = %e,
                    "Part failed"
                );
                part.mark_failed(e.kind());
                Err(e)
            }
        }
    }
}

/// Outcome for a part whose task panicked or was aborted.
fn crashed_outcome(entry: Option<(u32, Arc<AtomicU32>)>, err: JoinError) -> PartOutcome {
    let (number, attempts) = match entry {
        Some((number, attempts)) => (number, attempts.load(Ordering::SeqCst)),
        None => (0, 0),
    };
    PartOutcome {
        number,
        attempts,
        result: Err(UploadError::Internal(anyhow::anyhow!(
            "upload task for part {number} failed: {err}"
        ))),
    }
}

// -- Tests -------------------------------------------------------------------
