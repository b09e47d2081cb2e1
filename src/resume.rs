//! Resume resolution.
//!
//! Rebuilds an [`UploadSession`] from what the server reports.  The
//! server's part listing is authoritative: a part counts as done only if
//! the listing has it with the size the current plan expects.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::UploadError;
use crate::plan::PartSpec;
use crate::session::{PartStatus, SessionStatus, UploadSession};
use crate::storage::backend::{ListedPart, MultipartStore, ObjectLocation};
use crate::uploader::RetryPolicy;

/// Finds and reconciles existing multipart sessions.
pub struct ResumeResolver {
    store: Arc<dyn MultipartStore>,
    policy: RetryPolicy,
}

impl ResumeResolver {
    pub fn new(store: Arc<dyn MultipartStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Newest open session for exactly `location`.
    pub async fn discover(&self, location: &ObjectLocation) -> Result<Option<String>, UploadError> {
        let (result, _) = self
            .policy
            .run("list_multipart_uploads", |_| {
                self.store
                    .list_multipart_uploads(&location.bucket, &location.key)
            })
            .await;
        let newest = result?
            .into_iter()
            .filter(|u| u.key == location.key)
            .max_by_key(|u| u.initiated)
            .map(|u| u.upload_id);
        debug!(%location, found = ?newest, "Discovered open sessions");
        Ok(newest)
    }

    /// Resume `session_id`, or the newest open session for `location`
    /// when no id is given.
    ///
    /// Fails with `SessionExpired` when no session exists or when the
    /// server's parts do not fit the current plan (part size changed).
    pub async fn resolve(
        &self,
        location: &ObjectLocation,
        session_id: Option<&str>,
        total_size: u64,
        part_size: u64,
        parts: &[PartSpec],
    ) -> Result<UploadSession, UploadError> {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => self
                .discover(location)
                .await?
                .ok_or_else(|| UploadError::SessionExpired {
                    session_id: format!("(none open for {location})"),
                })?,
        };

        let listed = self.list(location, &session_id).await?;
        let mut session = UploadSession::new(&session_id, location.clone(), total_size, part_size, parts);
        apply_listing(&mut session, &listed)?;
        session.transition(SessionStatus::InProgress)?;
        info!(
            %location,
            session_id = %session_id,
            done = session.completed_parts(),
            remaining = session.remaining_parts().len(),
            "Resumed multipart session"
        );
        Ok(session)
    }

    /// Re-list an open session and reconcile part state with it.  Parts
    /// the server no longer holds, or holds with a different ETag, go
    /// back to pending.  Returns the part numbers needing re-upload.
    pub async fn refresh(&self, session: &mut UploadSession) -> Result<Vec<u32>, UploadError> {
        let listed = self.list(session.location(), session.session_id()).await?;
        apply_listing(session, &listed)?;
        let pending: Vec<u32> = session.remaining_parts().iter().map(|p| p.number).collect();
        if !pending.is_empty() {
            warn!(
                session_id = %session.session_id(),
                parts = ?pending,
                "Server is missing acknowledged parts"
            );
        }
        Ok(pending)
    }

    async fn list(&self, location: &ObjectLocation, session_id: &str) -> Result<Vec<ListedPart>, UploadError> {
        let (result, _) = self
            .policy
            .run("list_parts", |_| self.store.list_parts(location, session_id))
            .await;
        result
    }
}

/// Mark parts the server holds as done and everything else as pending.
fn apply_listing(session: &mut UploadSession, listed: &[ListedPart]) -> Result<(), UploadError> {
    let expired = |session: &UploadSession, reason: String| {
        warn!(session_id = %session.session_id(), reason = %reason, "Session does not match the plan");
        UploadError::SessionExpired {
            session_id: session.session_id().to_string(),
        }
    };

    for part in listed {
        let Some(planned) = session.part(part.number) else {
            let reason = format!("server holds part {} beyond the plan", part.number);
            return Err(expired(session, reason));
        };
        if planned.size() != part.size {
            let reason = format!(
                "part {} is {} bytes on the server, plan expects {}",
                part.number,
                part.size,
                planned.size()
            );
            return Err(expired(session, reason));
        }
    }

    let numbers: Vec<u32> = session.parts().map(|p| p.number()).collect();
    for number in numbers {
        let listed_etag = listed
            .iter()
            .find(|p| p.number == number)
            .map(|p| p.etag.clone());
        let Some(part) = session.part_mut(number) else {
            continue;
        };
        match listed_etag {
            Some(etag) => {
                if part.etag() != Some(etag.as_str()) {
                    part.mark_done(etag);
                }
            }
            None if part.status() == PartStatus::Done => part.reset_pending(),
            None => {}
        }
    }
    Ok(())
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::plan::split_parts;
    use crate::storage::backend::ObjectMetadata;
    use crate::storage::memory::MemoryStore;
    use bytes::Bytes;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            jitter: false,
            call_timeout: Duration::from_secs(5),
        }
    }

    fn loc() -> ObjectLocation {
        ObjectLocation::new("bucket", "big.bin")
    }

    async fn open_with_parts(store: &MemoryStore, data: &[u8], part_size: usize, numbers: &[u32]) -> String {
        let id = store
            .create_multipart_upload(&loc(), &ObjectMetadata::default())
            .await
            .unwrap();
        for &n in numbers {
            let start = (n as usize - 1) * part_size;
            let end = (start + part_size).min(data.len());
            store
                .upload_part(&loc(), &id, n, Bytes::copy_from_slice(&data[start..end]), None)
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn test_resolve_marks_listed_parts_done() {
        let store = Arc::new(MemoryStore::new());
        let data = vec![7u8; 100];
        let id = open_with_parts(&store, &data, 10, &[1, 4, 10]).await;
        let resolver = ResumeResolver::new(store.clone(), policy());

        let parts = split_parts(100, 10);
        let session = resolver
            .resolve(&loc(), Some(&id), 100, 10, &parts)
            .await
            .unwrap();
        assert_eq!(session.status(), SessionStatus::InProgress);
        assert_eq!(session.completed_parts(), 3);
        assert_eq!(session.remaining_parts().len(), 7);
        assert_eq!(session.bytes_completed(), 30);
        assert!(session.part(4).unwrap().etag().is_some());
    }

    #[tokio::test]
    async fn test_resolve_discovers_newest_session() {
        let store = Arc::new(MemoryStore::new());
        let data = vec![1u8; 30];
        let _older = open_with_parts(&store, &data, 10, &[1]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = open_with_parts(&store, &data, 10, &[1, 2]).await;
        let resolver = ResumeResolver::new(store.clone(), policy());

        let session = resolver
            .resolve(&loc(), None, 30, 10, &split_parts(30, 10))
            .await
            .unwrap();
        assert_eq!(session.session_id(), newer);
        assert_eq!(session.completed_parts(), 2);
    }

    #[tokio::test]
    async fn test_resolve_without_session_is_expired() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ResumeResolver::new(store, policy());
        let err = resolver
            .resolve(&loc(), None, 30, 10, &split_parts(30, 10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionExpired);

        let err = resolver
            .resolve(&loc(), Some("no-such-id"), 30, 10, &split_parts(30, 10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionExpired);
    }

    #[tokio::test]
    async fn test_part_size_change_is_expired() {
        let store = Arc::new(MemoryStore::new());
        let data = vec![3u8; 100];
        let id = open_with_parts(&store, &data, 10, &[1, 2]).await;
        let resolver = ResumeResolver::new(store, policy());

        let err = resolver
            .resolve(&loc(), Some(&id), 100, 20, &split_parts(100, 20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionExpired);
    }

    #[tokio::test]
    async fn test_refresh_resets_parts_server_lost() {
        let store = Arc::new(MemoryStore::new());
        let data = vec![5u8; 30];
        let id = open_with_parts(&store, &data, 10, &[1, 2]).await;
        let resolver = ResumeResolver::new(store.clone(), policy());

        let mut session = UploadSession::new(&id, loc(), 30, 10, &split_parts(30, 10));
        session.part_mut(1).unwrap().mark_done(MemoryStore::compute_etag(&data[..10]));
        session.part_mut(2).unwrap().mark_done("\"stale\"".into());
        session.part_mut(3).unwrap().mark_done("\"never-sent\"".into());

        let pending = resolver.refresh(&mut session).await.unwrap();
        assert_eq!(pending, vec![3]);
        assert_eq!(
            session.part(2).unwrap().etag(),
            Some(MemoryStore::compute_etag(&data[10..20]).as_str())
        );
    }
}
